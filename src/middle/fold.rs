//! Pre-lowering constant folding. Literal subexpressions are evaluated with
//! the same arithmetic the VM uses, and an `if` with a literal test is
//! replaced by the taken branch, so folding never changes behaviour.

use crate::{
    frontend::ast::{
        BinaryOperatorKind, Block, ComparisonOperatorKind, Else, Expression, ExpressionKind,
        FunctionDefinition, If, Item, LogicalOperatorKind, Module, Statement, StatementKind,
        UnaryOperatorKind,
    },
    runtime::value::{self, Value},
};

pub fn fold_module(module: Module) -> Module {
    Module {
        items: module
            .items
            .into_iter()
            .flat_map(|item| match item {
                Item::Function(function) => {
                    vec![Item::Function(fold_function(function))]
                }
                Item::Struct(mut definition) => {
                    definition.methods =
                        definition.methods.into_iter().map(fold_function).collect();
                    vec![Item::Struct(definition)]
                }
                Item::Statement(statement) => fold_statement(statement)
                    .into_iter()
                    .map(Item::Statement)
                    .collect(),
            })
            .collect(),
    }
}

fn fold_function(mut function: FunctionDefinition) -> FunctionDefinition {
    function.body = fold_block(function.body);
    function
}

fn fold_block(block: Block) -> Block {
    Block {
        span: block.span,
        statements: block
            .statements
            .into_iter()
            .flat_map(fold_statement)
            .collect(),
    }
}

// A statement may fold away entirely (literal-test `if`), so this returns
// the replacement list rather than a single node
fn fold_statement(statement: Statement) -> Vec<Statement> {
    let span = statement.span;

    let kind = match statement.kind {
        StatementKind::Assign { target, value } => StatementKind::Assign {
            target,
            value: fold_expression(value),
        },
        StatementKind::Expression(expression) => {
            StatementKind::Expression(fold_expression(expression))
        }
        StatementKind::If(if_statement) => return fold_if(if_statement, span),
        StatementKind::While { test, body } => StatementKind::While {
            test: fold_expression(test),
            body: fold_block(body),
        },
        StatementKind::For {
            target,
            start,
            end,
            body,
        } => StatementKind::For {
            target,
            start: fold_expression(start),
            end: fold_expression(end),
            body: fold_block(body),
        },
        StatementKind::Return(value) => StatementKind::Return(value.map(fold_expression)),
        kind @ (StatementKind::Break | StatementKind::Continue) => kind,
    };

    vec![Statement { span, kind }]
}

fn fold_if(if_statement: If, span: crate::frontend::lexer::Span) -> Vec<Statement> {
    let test = fold_expression(if_statement.test);

    if let Some(value) = literal_value(&test) {
        return if value.truthy() {
            fold_block(if_statement.body).statements
        } else {
            match if_statement.orelse {
                Some(Else::If(nested)) => fold_if(*nested, span),
                Some(Else::Block(block)) => fold_block(block).statements,
                None => Vec::new(),
            }
        };
    }

    let orelse = if_statement.orelse.map(|orelse| match orelse {
        Else::If(nested) => {
            // The nested if may itself fold to a plain statement list; wrap
            // it back into a block in that case
            let mut folded = fold_if(*nested, span);

            if folded.len() == 1
                && matches!(folded[0].kind, StatementKind::If(_))
            {
                let Some(Statement {
                    kind: StatementKind::If(inner),
                    ..
                }) = folded.pop()
                else {
                    unreachable!()
                };

                Else::If(Box::new(inner))
            } else {
                Else::Block(Block {
                    span,
                    statements: folded,
                })
            }
        }
        Else::Block(block) => Else::Block(fold_block(block)),
    });

    vec![Statement {
        span,
        kind: StatementKind::If(If {
            test,
            body: fold_block(if_statement.body),
            orelse,
        }),
    }]
}

fn fold_expression(expression: Expression) -> Expression {
    let span = expression.span;

    let kind = match expression.kind {
        ExpressionKind::Binary { operator, lhs, rhs } => {
            let lhs = fold_expression(*lhs);
            let rhs = fold_expression(*rhs);

            if let (Some(a), Some(b)) = (literal_value(&lhs), literal_value(&rhs)) {
                let result = match operator {
                    BinaryOperatorKind::Add => value::add(&a, &b),
                    BinaryOperatorKind::Subtract => value::sub(&a, &b),
                    BinaryOperatorKind::Multiply => value::mul(&a, &b),
                    BinaryOperatorKind::Divide => value::div(&a, &b),
                    BinaryOperatorKind::Power => value::pow(&a, &b),
                };

                // Anything the runtime would fault on (division by zero,
                // type mismatch) is left in place to fault at run time
                if let Some(kind) = result.ok().and_then(literal_kind) {
                    return Expression { span, kind };
                }
            }

            ExpressionKind::Binary {
                operator,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }
        }
        ExpressionKind::Unary { operator, operand } => {
            let operand = fold_expression(*operand);

            if let Some(value) = literal_value(&operand) {
                let result = match operator {
                    UnaryOperatorKind::Negate => value::neg(&value).ok(),
                    UnaryOperatorKind::Not => Some(value::not(&value)),
                };

                if let Some(kind) = result.and_then(literal_kind) {
                    return Expression { span, kind };
                }
            }

            ExpressionKind::Unary {
                operator,
                operand: Box::new(operand),
            }
        }
        ExpressionKind::Logical { operator, lhs, rhs } => {
            let lhs = fold_expression(*lhs);
            let rhs = fold_expression(*rhs);

            // `and`/`or` evaluate to one of their operands, so a literal
            // pair folds to whichever operand the truthiness picks
            if let (Some(a), Some(_)) = (literal_value(&lhs), literal_value(&rhs)) {
                let picked = match operator {
                    LogicalOperatorKind::And if !a.truthy() => &lhs,
                    LogicalOperatorKind::And => &rhs,
                    LogicalOperatorKind::Or if a.truthy() => &lhs,
                    LogicalOperatorKind::Or => &rhs,
                };

                if let Some(kind) = literal_value(picked).and_then(literal_kind) {
                    return Expression { span, kind };
                }
            }

            ExpressionKind::Logical {
                operator,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }
        }
        ExpressionKind::Compare {
            left,
            operators,
            comparators,
        } => {
            let left = fold_expression(*left);
            let comparators: Vec<_> = comparators.into_iter().map(fold_expression).collect();

            let literals: Option<Vec<_>> = std::iter::once(&left)
                .chain(comparators.iter())
                .map(literal_value)
                .collect();

            if let Some(literals) = literals {
                if let Some(result) = evaluate_comparison_chain(&operators, &literals) {
                    return Expression {
                        span,
                        kind: ExpressionKind::BooleanLiteral(result),
                    };
                }
            }

            ExpressionKind::Compare {
                left: Box::new(left),
                operators,
                comparators,
            }
        }
        ExpressionKind::List(elements) => {
            ExpressionKind::List(elements.into_iter().map(fold_expression).collect())
        }
        ExpressionKind::Call { callee, arguments } => ExpressionKind::Call {
            callee,
            arguments: arguments.into_iter().map(fold_expression).collect(),
        },
        ExpressionKind::MethodCall {
            receiver,
            method,
            arguments,
        } => ExpressionKind::MethodCall {
            receiver: Box::new(fold_expression(*receiver)),
            method,
            arguments: arguments.into_iter().map(fold_expression).collect(),
        },
        ExpressionKind::Attribute {
            receiver,
            attribute,
        } => ExpressionKind::Attribute {
            receiver: Box::new(fold_expression(*receiver)),
            attribute,
        },
        kind => kind,
    };

    Expression { span, kind }
}

fn evaluate_comparison_chain(
    operators: &[ComparisonOperatorKind],
    operands: &[Value],
) -> Option<bool> {
    use std::cmp::Ordering;

    for (i, operator) in operators.iter().enumerate() {
        let (lhs, rhs) = (&operands[i], &operands[i + 1]);

        let holds = match operator {
            ComparisonOperatorKind::Equals => lhs == rhs,
            ComparisonOperatorKind::NotEquals => lhs != rhs,
            ComparisonOperatorKind::LessThan => {
                value::ordering("<", lhs, rhs).ok()? == Ordering::Less
            }
            ComparisonOperatorKind::GreaterThan => {
                value::ordering(">", lhs, rhs).ok()? == Ordering::Greater
            }
            ComparisonOperatorKind::LessThanOrEqualTo => {
                value::ordering("<=", lhs, rhs).ok()? != Ordering::Greater
            }
            ComparisonOperatorKind::GreaterThanOrEqualTo => {
                value::ordering(">=", lhs, rhs).ok()? != Ordering::Less
            }
        };

        if !holds {
            return Some(false);
        }
    }

    Some(true)
}

fn literal_value(expression: &Expression) -> Option<Value> {
    match &expression.kind {
        ExpressionKind::IntegerLiteral(i) => Some(Value::Int(*i)),
        ExpressionKind::FloatLiteral(f) => Some(Value::Float(*f)),
        ExpressionKind::StringLiteral(s) => Some(Value::Str(s.clone())),
        ExpressionKind::BooleanLiteral(b) => Some(Value::Bool(*b)),
        _ => None,
    }
}

fn literal_kind(value: Value) -> Option<ExpressionKind> {
    match value {
        Value::Int(i) => Some(ExpressionKind::IntegerLiteral(i)),
        Value::Float(f) => Some(ExpressionKind::FloatLiteral(f)),
        Value::Str(s) => Some(ExpressionKind::StringLiteral(s)),
        Value::Bool(b) => Some(ExpressionKind::BooleanLiteral(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parser::Parser, SourceFile};

    fn fold(text: &str) -> Module {
        let source = SourceFile::from_memory(text);
        fold_module(Parser::parse_module(&source))
    }

    fn first_assigned_value(module: &Module) -> &Expression {
        for item in &module.items {
            if let Item::Statement(Statement {
                kind: StatementKind::Assign { value, .. },
                ..
            }) = item
            {
                return value;
            }
        }

        panic!("no assignment in module")
    }

    #[test]
    fn arithmetic_folds_to_a_literal() {
        let module = fold("x = 1 + 2 * 3");
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::IntegerLiteral(7)
        ));
    }

    #[test]
    fn division_by_zero_is_left_for_runtime() {
        let module = fold("x = 1 / 0");
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::Binary { .. }
        ));
    }

    #[test]
    fn comparison_chain_folds() {
        let module = fold("x = 1 < 2 < 3");
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::BooleanLiteral(true)
        ));

        let module = fold("x = 1 < 2 < 2");
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::BooleanLiteral(false)
        ));
    }

    #[test]
    fn literal_if_folds_to_taken_branch() {
        let module = fold("if true { x = 1 } else { x = 2 }");
        assert_eq!(module.items.len(), 1);
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::IntegerLiteral(1)
        ));
    }

    #[test]
    fn false_if_without_else_folds_away() {
        let module = fold("if 1 > 2 { x = 1 }");
        assert!(module.items.is_empty());
    }

    #[test]
    fn logical_operators_fold_to_an_operand() {
        let module = fold("x = 0 or 5");
        assert!(matches!(
            first_assigned_value(&module).kind,
            ExpressionKind::IntegerLiteral(5)
        ));
    }
}
