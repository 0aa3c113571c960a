use crate::frontend::{
    ast::{
        BinaryOperatorKind, Block, ComparisonOperatorKind, Else, Expression, ExpressionKind,
        FunctionDefinition, Identifier, If, Item, LogicalOperatorKind, Module, Statement,
        StatementKind, StructDefinition, UnaryOperatorKind,
    },
    lexer::{Keyword, Lexer, Span, Token, TokenKind},
    SourceFile,
};

#[derive(Debug)]
pub struct Parser<'source> {
    lexer: Lexer<'source>,
}

impl<'source> Parser<'source> {
    pub fn parse_module(source_file: &'source SourceFile) -> Module {
        let mut parser = Self {
            lexer: Lexer::new(source_file),
        };

        let mut module = Module { items: Vec::new() };

        while parser.lexer.peek().is_some() {
            module.items.push(parser.parse_module_item());
        }

        module
    }

    fn report_fatal_error(&self, offending_span: Span, message: &str) -> ! {
        eprintln!(
            "{} ({}:{}:{})",
            message,
            self.lexer.source().origin,
            self.lexer.source().row_for_position(offending_span.start),
            self.lexer
                .source()
                .column_for_position(offending_span.start)
        );
        self.lexer.source().highlight_span(offending_span);
        std::process::exit(1);
    }

    fn expect_peek(&mut self, expecting: &str) -> Token {
        let Some(token) = self.lexer.peek() else {
            let end = self.lexer.source().contents.len();
            self.report_fatal_error(
                Span::new(end.saturating_sub(1), end),
                &format!("Expected {expecting} but reached end of file"),
            )
        };

        token
    }

    fn expect_next(&mut self, expecting: &str) -> Token {
        self.expect_peek(expecting);
        self.lexer.next().unwrap()
    }

    fn expect_next_to_be(&mut self, kind: TokenKind) -> Token {
        let token = self.expect_next(&format!("{kind:?}"));

        if token.kind != kind {
            self.report_fatal_error(
                token.span,
                &format!(
                    "Expected {:?} but found {:?} ({})",
                    kind,
                    token.kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            )
        }

        token
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Token {
        self.expect_next_to_be(TokenKind::Keyword(keyword))
    }

    fn next_is(&mut self, kind: TokenKind) -> bool {
        self.lexer.peek().is_some_and(|t| t.kind == kind)
    }

    fn parse_module_item(&mut self) -> Item {
        let peeked = self.expect_peek("function, struct, or statement");

        match peeked.kind {
            TokenKind::Keyword(Keyword::Fn) => Item::Function(self.parse_function_definition()),
            TokenKind::Keyword(Keyword::Struct) => Item::Struct(self.parse_struct_definition()),
            _ => Item::Statement(self.parse_statement()),
        }
    }

    /// fn name(param, param) {}
    fn parse_function_definition(&mut self) -> FunctionDefinition {
        let fn_keyword = self.expect_keyword(Keyword::Fn);

        let name = self.parse_identifier();
        let parameters = self.parse_parameter_list();
        let body = self.parse_block();

        FunctionDefinition {
            span: Span::new(fn_keyword.span.start, body.span.end),
            name,
            parameters,
            body,
        }
    }

    /// struct Name { field, field  fn method(param) {} }
    fn parse_struct_definition(&mut self) -> StructDefinition {
        let struct_keyword = self.expect_keyword(Keyword::Struct);

        let name = self.parse_identifier();
        self.expect_next_to_be(TokenKind::OpenBrace);

        let mut fields = Vec::new();

        if self.next_is(TokenKind::Identifier) {
            fields.push(self.parse_identifier());

            while self.next_is(TokenKind::Comma) {
                self.expect_next_to_be(TokenKind::Comma);
                fields.push(self.parse_identifier());
            }
        }

        let mut methods = Vec::new();

        while self.next_is(TokenKind::Keyword(Keyword::Fn)) {
            methods.push(self.parse_function_definition());
        }

        let close_brace = self.expect_next_to_be(TokenKind::CloseBrace);

        StructDefinition {
            span: Span::new(struct_keyword.span.start, close_brace.span.end),
            name,
            fields,
            methods,
        }
    }

    fn parse_identifier(&mut self) -> Identifier {
        let token = self.expect_next_to_be(TokenKind::Identifier);

        Identifier {
            span: token.span,
            name: self.lexer.source().value_of_span(token.span).to_owned(),
        }
    }

    /// (param, param)
    fn parse_parameter_list(&mut self) -> Vec<Identifier> {
        let mut parameters = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen);

        if self.expect_peek("parameter or closing paren").kind != TokenKind::CloseParen {
            parameters.push(self.parse_identifier());

            while self.next_is(TokenKind::Comma) {
                self.expect_next_to_be(TokenKind::Comma);
                parameters.push(self.parse_identifier());
            }
        }

        self.expect_next_to_be(TokenKind::CloseParen);

        parameters
    }

    /// "{" ( statement )* "}"
    fn parse_block(&mut self) -> Block {
        let open_brace = self.expect_next_to_be(TokenKind::OpenBrace);

        let mut statements = Vec::new();

        while self.expect_peek("statement or closing brace").kind != TokenKind::CloseBrace {
            statements.push(self.parse_statement());
        }

        let close_brace = self.expect_next_to_be(TokenKind::CloseBrace);

        Block {
            span: Span::new(open_brace.span.start, close_brace.span.end),
            statements,
        }
    }

    fn parse_statement(&mut self) -> Statement {
        let peeked = self.expect_peek("statement");

        match peeked.kind {
            TokenKind::Keyword(Keyword::If) => {
                let if_statement = self.parse_if();

                Statement {
                    span: peeked.span,
                    kind: StatementKind::If(if_statement),
                }
            }
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Break) => {
                let token = self.expect_keyword(Keyword::Break);

                Statement {
                    span: token.span,
                    kind: StatementKind::Break,
                }
            }
            TokenKind::Keyword(Keyword::Continue) => {
                let token = self.expect_keyword(Keyword::Continue);

                Statement {
                    span: token.span,
                    kind: StatementKind::Continue,
                }
            }
            TokenKind::Identifier
                if self
                    .lexer
                    .peek_nth(1)
                    .is_some_and(|t| t.kind == TokenKind::Equals) =>
            {
                self.parse_assignment()
            }
            _ => {
                let expression = self.parse_expression();

                Statement {
                    span: expression.span,
                    kind: StatementKind::Expression(expression),
                }
            }
        }
    }

    /// name = expression
    fn parse_assignment(&mut self) -> Statement {
        let target = self.parse_identifier();
        self.expect_next_to_be(TokenKind::Equals);
        let value = self.parse_expression();

        Statement {
            span: Span::new(target.span.start, value.span.end),
            kind: StatementKind::Assign { target, value },
        }
    }

    /// if test {} ( else ( if ... | {} ) )?
    fn parse_if(&mut self) -> If {
        self.expect_keyword(Keyword::If);

        let test = self.parse_expression();
        let body = self.parse_block();

        let orelse = self
            .next_is(TokenKind::Keyword(Keyword::Else))
            .then(|| {
                self.expect_keyword(Keyword::Else);

                if self.next_is(TokenKind::Keyword(Keyword::If)) {
                    Else::If(Box::new(self.parse_if()))
                } else {
                    Else::Block(self.parse_block())
                }
            });

        If { test, body, orelse }
    }

    /// while test {}
    fn parse_while(&mut self) -> Statement {
        let while_keyword = self.expect_keyword(Keyword::While);

        let test = self.parse_expression();
        let body = self.parse_block();

        Statement {
            span: Span::new(while_keyword.span.start, body.span.end),
            kind: StatementKind::While { test, body },
        }
    }

    /// for name in start..end {}
    fn parse_for(&mut self) -> Statement {
        let for_keyword = self.expect_keyword(Keyword::For);

        let target = self.parse_identifier();
        self.expect_keyword(Keyword::In);

        let start = self.parse_expression();
        self.expect_next_to_be(TokenKind::DotDot);
        let end = self.parse_expression();

        let body = self.parse_block();

        Statement {
            span: Span::new(for_keyword.span.start, body.span.end),
            kind: StatementKind::For {
                target,
                start,
                end,
                body,
            },
        }
    }

    /// return ( expression )?
    fn parse_return(&mut self) -> Statement {
        let return_keyword = self.expect_keyword(Keyword::Return);

        // A return directly followed by a block close carries no value
        let value = (self.expect_peek("expression or closing brace").kind
            != TokenKind::CloseBrace)
            .then(|| self.parse_expression());

        Statement {
            span: Span::new(
                return_keyword.span.start,
                value
                    .as_ref()
                    .map(|v| v.span.end)
                    .unwrap_or(return_keyword.span.end),
            ),
            kind: StatementKind::Return(value),
        }
    }

    /// expression  -> logical_or
    /// logical_or  -> logical_and ( "or" logical_and )*
    /// logical_and -> comparison ( "and" comparison )*
    /// comparison  -> term ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) term )*
    /// term        -> factor ( ( "+" | "-" ) factor )*
    /// factor      -> power ( ( "*" | "/" ) power )*
    /// power       -> unary ( "^" unary )*
    /// unary       -> ( "-" | "not" ) unary | postfix
    /// postfix     -> primary ( "." NAME ( "(" arguments? ")" )? )*
    fn parse_expression(&mut self) -> Expression {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> Expression {
        let mut lhs = self.parse_logical_and();

        while self.next_is(TokenKind::Keyword(Keyword::Or)) {
            self.expect_keyword(Keyword::Or);
            let rhs = self.parse_logical_and();

            lhs = Expression {
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Logical {
                    operator: LogicalOperatorKind::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    fn parse_logical_and(&mut self) -> Expression {
        let mut lhs = self.parse_comparison();

        while self.next_is(TokenKind::Keyword(Keyword::And)) {
            self.expect_keyword(Keyword::And);
            let rhs = self.parse_comparison();

            lhs = Expression {
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Logical {
                    operator: LogicalOperatorKind::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    // A run of comparison operators collects into one chained node so that
    // `a < b < c` evaluates each operand once, like the conjunction
    // `a < b and b < c`
    fn parse_comparison(&mut self) -> Expression {
        let left = self.parse_term();

        let mut operators = Vec::new();
        let mut comparators = Vec::new();

        while self
            .lexer
            .peek()
            .is_some_and(|t| t.kind.is_comparison_operator())
        {
            let token = self.expect_next("comparison operator");

            operators.push(match token.kind {
                TokenKind::DoubleEquals => ComparisonOperatorKind::Equals,
                TokenKind::NotEquals => ComparisonOperatorKind::NotEquals,
                TokenKind::LessThan => ComparisonOperatorKind::LessThan,
                TokenKind::GreaterThan => ComparisonOperatorKind::GreaterThan,
                TokenKind::LessThanOrEqualTo => ComparisonOperatorKind::LessThanOrEqualTo,
                TokenKind::GreaterThanOrEqualTo => ComparisonOperatorKind::GreaterThanOrEqualTo,
                _ => unreachable!(),
            });

            comparators.push(self.parse_term());
        }

        if operators.is_empty() {
            return left;
        }

        Expression {
            span: Span::new(left.span.start, comparators.last().unwrap().span.end),
            kind: ExpressionKind::Compare {
                left: Box::new(left),
                operators,
                comparators,
            },
        }
    }

    fn parse_term(&mut self) -> Expression {
        let mut lhs = self.parse_factor();

        while self.lexer.peek().is_some_and(|t| t.kind.is_term_operator()) {
            let token = self.expect_next("term operator");

            let operator = match token.kind {
                TokenKind::Plus => BinaryOperatorKind::Add,
                TokenKind::Minus => BinaryOperatorKind::Subtract,
                _ => unreachable!(),
            };

            let rhs = self.parse_factor();

            lhs = Expression {
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    fn parse_factor(&mut self) -> Expression {
        let mut lhs = self.parse_power();

        while self
            .lexer
            .peek()
            .is_some_and(|t| t.kind.is_factor_operator())
        {
            let token = self.expect_next("factor operator");

            let operator = match token.kind {
                TokenKind::Asterisk => BinaryOperatorKind::Multiply,
                TokenKind::Divide => BinaryOperatorKind::Divide,
                _ => unreachable!(),
            };

            let rhs = self.parse_power();

            lhs = Expression {
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Binary {
                    operator,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    fn parse_power(&mut self) -> Expression {
        let mut lhs = self.parse_unary();

        while self.next_is(TokenKind::Caret) {
            self.expect_next_to_be(TokenKind::Caret);
            let rhs = self.parse_unary();

            lhs = Expression {
                span: Span::new(lhs.span.start, rhs.span.end),
                kind: ExpressionKind::Binary {
                    operator: BinaryOperatorKind::Power,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        lhs
    }

    fn parse_unary(&mut self) -> Expression {
        let peeked = self.expect_peek("expression");

        let operator = match peeked.kind {
            TokenKind::Minus => UnaryOperatorKind::Negate,
            TokenKind::Keyword(Keyword::Not) => UnaryOperatorKind::Not,
            _ => return self.parse_postfix(),
        };

        self.expect_next("unary operator");
        let operand = self.parse_unary();

        Expression {
            span: Span::new(peeked.span.start, operand.span.end),
            kind: ExpressionKind::Unary {
                operator,
                operand: Box::new(operand),
            },
        }
    }

    // Attribute access and method calls chain off any primary:
    // `p.x`, `xs.len()`, `s.upper().reverse()`
    fn parse_postfix(&mut self) -> Expression {
        let mut expression = self.parse_primary();

        while self.next_is(TokenKind::Dot) {
            self.expect_next_to_be(TokenKind::Dot);
            let name = self.parse_identifier();

            expression = if self.next_is(TokenKind::OpenParen) {
                let arguments = self.parse_argument_list();

                Expression {
                    span: Span::new(expression.span.start, name.span.end),
                    kind: ExpressionKind::MethodCall {
                        receiver: Box::new(expression),
                        method: name,
                        arguments,
                    },
                }
            } else {
                Expression {
                    span: Span::new(expression.span.start, name.span.end),
                    kind: ExpressionKind::Attribute {
                        receiver: Box::new(expression),
                        attribute: name,
                    },
                }
            };
        }

        expression
    }

    /// "(" ( expression ( "," expression )* )? ")"
    fn parse_argument_list(&mut self) -> Vec<Expression> {
        let mut arguments = Vec::new();

        self.expect_next_to_be(TokenKind::OpenParen);

        if self.expect_peek("argument or closing paren").kind != TokenKind::CloseParen {
            arguments.push(self.parse_expression());

            while self.next_is(TokenKind::Comma) {
                self.expect_next_to_be(TokenKind::Comma);
                arguments.push(self.parse_expression());
            }
        }

        self.expect_next_to_be(TokenKind::CloseParen);

        arguments
    }

    fn parse_primary(&mut self) -> Expression {
        let token = self.expect_peek("expression");

        match token.kind {
            TokenKind::IntegerLiteral => {
                self.expect_next_to_be(TokenKind::IntegerLiteral);
                let text = self.lexer.source().value_of_span(token.span);

                let Ok(value) = text.parse() else {
                    self.report_fatal_error(
                        token.span,
                        &format!("Integer literal out of range: {text}"),
                    )
                };

                Expression {
                    span: token.span,
                    kind: ExpressionKind::IntegerLiteral(value),
                }
            }
            TokenKind::FloatLiteral => {
                self.expect_next_to_be(TokenKind::FloatLiteral);
                let text = self.lexer.source().value_of_span(token.span);

                let Ok(value) = text.parse() else {
                    self.report_fatal_error(token.span, &format!("Invalid float literal: {text}"))
                };

                Expression {
                    span: token.span,
                    kind: ExpressionKind::FloatLiteral(value),
                }
            }
            TokenKind::StringLiteral => {
                self.expect_next_to_be(TokenKind::StringLiteral);
                let text = self.lexer.source().value_of_span(token.span);

                Expression {
                    span: token.span,
                    kind: ExpressionKind::StringLiteral(text[1..text.len() - 1].to_owned()),
                }
            }
            TokenKind::BooleanLiteral => {
                self.expect_next_to_be(TokenKind::BooleanLiteral);
                let value = self.lexer.source().value_of_span(token.span) == "true";

                Expression {
                    span: token.span,
                    kind: ExpressionKind::BooleanLiteral(value),
                }
            }
            TokenKind::OpenBracket => self.parse_list_literal(),
            TokenKind::OpenParen => {
                self.expect_next_to_be(TokenKind::OpenParen);
                let expression = self.parse_expression();
                self.expect_next_to_be(TokenKind::CloseParen);

                expression
            }
            TokenKind::Identifier => {
                let name = self.parse_identifier();

                if self.next_is(TokenKind::OpenParen) {
                    let arguments = self.parse_argument_list();

                    return Expression {
                        span: name.span,
                        kind: ExpressionKind::Call {
                            callee: name,
                            arguments,
                        },
                    };
                }

                Expression {
                    span: name.span,
                    kind: ExpressionKind::Name(name.name),
                }
            }
            _ => self.report_fatal_error(
                token.span,
                &format!(
                    "Expected expression but found {:?} ({})",
                    token.kind,
                    self.lexer.source().value_of_span(token.span)
                ),
            ),
        }
    }

    /// "[" ( expression ( "," expression )* )? "]"
    fn parse_list_literal(&mut self) -> Expression {
        let open_bracket = self.expect_next_to_be(TokenKind::OpenBracket);

        let mut elements = Vec::new();

        if self.expect_peek("element or closing bracket").kind != TokenKind::CloseBracket {
            elements.push(self.parse_expression());

            while self.next_is(TokenKind::Comma) {
                self.expect_next_to_be(TokenKind::Comma);
                elements.push(self.parse_expression());
            }
        }

        let close_bracket = self.expect_next_to_be(TokenKind::CloseBracket);

        Expression {
            span: Span::new(open_bracket.span.start, close_bracket.span.end),
            kind: ExpressionKind::List(elements),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Module {
        let source = SourceFile::from_memory(text);
        Parser::parse_module(&source)
    }

    #[test]
    fn assignment_vs_expression_statement() {
        let module = parse("x = 1 x");
        assert_eq!(module.items.len(), 2);

        let Item::Statement(first) = &module.items[0] else {
            panic!("expected statement")
        };
        assert!(matches!(first.kind, StatementKind::Assign { .. }));

        let Item::Statement(second) = &module.items[1] else {
            panic!("expected statement")
        };
        assert!(matches!(second.kind, StatementKind::Expression(_)));
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let module = parse("x = 1 + 2 * 3");

        let Item::Statement(statement) = &module.items[0] else {
            panic!("expected statement")
        };
        let StatementKind::Assign { value, .. } = &statement.kind else {
            panic!("expected assignment")
        };
        let ExpressionKind::Binary { operator, rhs, .. } = &value.kind else {
            panic!("expected binary expression")
        };

        assert_eq!(*operator, BinaryOperatorKind::Add);
        assert!(matches!(
            rhs.kind,
            ExpressionKind::Binary {
                operator: BinaryOperatorKind::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn chained_comparison_collects_comparators() {
        let module = parse("x = 1 < 2 < 3");

        let Item::Statement(statement) = &module.items[0] else {
            panic!("expected statement")
        };
        let StatementKind::Assign { value, .. } = &statement.kind else {
            panic!("expected assignment")
        };
        let ExpressionKind::Compare {
            operators,
            comparators,
            ..
        } = &value.kind
        else {
            panic!("expected comparison chain")
        };

        assert_eq!(operators.len(), 2);
        assert_eq!(comparators.len(), 2);
    }

    #[test]
    fn else_if_nests() {
        let module = parse("if a { x = 1 } else if b { x = 2 } else { x = 3 }");

        let Item::Statement(statement) = &module.items[0] else {
            panic!("expected statement")
        };
        let StatementKind::If(if_statement) = &statement.kind else {
            panic!("expected if")
        };
        let Some(Else::If(nested)) = &if_statement.orelse else {
            panic!("expected else-if")
        };

        assert!(matches!(nested.orelse, Some(Else::Block(_))));
    }

    #[test]
    fn struct_with_fields_and_method() {
        let module = parse("struct Point { x, y fn mag(self) { return 0 } }");

        let Item::Struct(definition) = &module.items[0] else {
            panic!("expected struct")
        };

        assert_eq!(definition.fields.len(), 2);
        assert_eq!(definition.methods.len(), 1);
        assert_eq!(definition.methods[0].name.name, "mag");
    }

    #[test]
    fn method_call_chains() {
        let module = parse("s.upper().reverse()");

        let Item::Statement(statement) = &module.items[0] else {
            panic!("expected statement")
        };
        let StatementKind::Expression(expression) = &statement.kind else {
            panic!("expected expression statement")
        };
        let ExpressionKind::MethodCall {
            receiver, method, ..
        } = &expression.kind
        else {
            panic!("expected method call")
        };

        assert_eq!(method.name, "reverse");
        assert!(matches!(receiver.kind, ExpressionKind::MethodCall { .. }));
    }
}
