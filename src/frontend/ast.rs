use crate::frontend::lexer::Span;

#[derive(Debug)]
pub struct Module {
    pub items: Vec<Item>,
}

#[derive(Debug)]
pub enum Item {
    Function(FunctionDefinition),
    Struct(StructDefinition),
    Statement(Statement),
}

#[derive(Debug)]
pub struct FunctionDefinition {
    pub span: Span,
    pub name: Identifier,
    pub parameters: Vec<Identifier>,
    pub body: Block,
}

#[derive(Debug)]
pub struct StructDefinition {
    pub span: Span,
    pub name: Identifier,
    pub fields: Vec<Identifier>,
    pub methods: Vec<FunctionDefinition>,
}

#[derive(Debug)]
pub struct Block {
    pub span: Span,
    pub statements: Vec<Statement>,
}

#[derive(Debug)]
pub struct Statement {
    pub span: Span,
    pub kind: StatementKind,
}

#[derive(Debug)]
pub enum StatementKind {
    Assign {
        target: Identifier,
        value: Expression,
    },
    Expression(Expression),
    If(If),
    While {
        test: Expression,
        body: Block,
    },
    For {
        target: Identifier,
        start: Expression,
        end: Expression,
        body: Block,
    },
    Return(Option<Expression>),
    Break,
    Continue,
}

#[derive(Debug)]
pub struct If {
    pub test: Expression,
    pub body: Block,
    pub orelse: Option<Else>,
}

#[derive(Debug)]
pub enum Else {
    // `else if` chains nest as another If
    If(Box<If>),
    Block(Block),
}

#[derive(Debug)]
pub struct Identifier {
    pub span: Span,
    pub name: String,
}

#[derive(Debug)]
pub struct Expression {
    pub span: Span,
    pub kind: ExpressionKind,
}

#[derive(Debug)]
pub enum ExpressionKind {
    IntegerLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    BooleanLiteral(bool),
    List(Vec<Expression>),
    Name(String),
    Call {
        callee: Identifier,
        arguments: Vec<Expression>,
    },
    MethodCall {
        receiver: Box<Expression>,
        method: Identifier,
        arguments: Vec<Expression>,
    },
    Attribute {
        receiver: Box<Expression>,
        attribute: Identifier,
    },
    Unary {
        operator: UnaryOperatorKind,
        operand: Box<Expression>,
    },
    Binary {
        operator: BinaryOperatorKind,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// Short-circuiting `and` / `or`
    Logical {
        operator: LogicalOperatorKind,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    /// Chained comparison: `left ops[0] comparators[0] ops[1] comparators[1] ...`
    Compare {
        left: Box<Expression>,
        operators: Vec<ComparisonOperatorKind>,
        comparators: Vec<Expression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperatorKind {
    Negate, // -
    Not,    // not
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperatorKind {
    Add,      // +
    Subtract, // -
    Multiply, // *
    Divide,   // /
    Power,    // ^
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperatorKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperatorKind {
    Equals,               // ==
    NotEquals,            // !=
    LessThan,             // <
    GreaterThan,          // >
    LessThanOrEqualTo,    // <=
    GreaterThanOrEqualTo, // >=
}
