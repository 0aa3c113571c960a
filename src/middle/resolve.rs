use std::collections::BTreeMap;

use hashbrown::HashSet;

use crate::{
    frontend::{
        ast::{
            Block, Else, Expression, ExpressionKind, FunctionDefinition, Identifier, If, Item,
            Module, Statement, StatementKind, StructDefinition,
        },
        lexer::Span,
        SourceFile,
    },
    middle::SemanticError,
    runtime::builtins::Registry,
};

/// Module-level facts collected during resolution that lowering consults:
/// which names construct structs, and the declared shape of each struct.
#[derive(Debug, Default)]
pub struct ModuleResolutions {
    pub structs: BTreeMap<String, StructShape>,
    pub functions: BTreeMap<String, usize>,
}

#[derive(Debug)]
pub struct StructShape {
    pub fields: Vec<String>,
    pub methods: BTreeMap<String, usize>,
}

/// AST semantic checker
///
/// Validates the structural invariants lowering assumes: every name read
/// resolves to a prior definition, break/continue only appear inside loops,
/// and every call site matches its callee's arity.
pub struct Resolver<'module> {
    source: &'module SourceFile,
    builtins: &'module Registry,
    resolutions: ModuleResolutions,
    /// Innermost scope last; module scope at index 0
    scopes: Vec<HashSet<String>>,
    loop_depth: usize,
}

impl<'module> Resolver<'module> {
    /// Checks a module in 2 steps.
    ///
    /// The first step collects all function and struct definitions so that
    /// calls may reference definitions appearing later in the file. The
    /// second walks every statement validating reads, placements, and
    /// arities.
    pub fn resolve_module(
        module: &Module,
        source: &'module SourceFile,
        builtins: &'module Registry,
    ) -> Result<ModuleResolutions, SemanticError> {
        let mut resolver = Self {
            source,
            builtins,
            resolutions: ModuleResolutions::default(),
            scopes: vec![HashSet::new()],
            loop_depth: 0,
        };

        resolver.collect_definitions(module)?;

        for item in &module.items {
            match item {
                Item::Function(function) => resolver.check_function(function, false)?,
                Item::Struct(definition) => {
                    for method in &definition.methods {
                        resolver.check_function(method, true)?;
                    }
                }
                Item::Statement(statement) => resolver.check_statement(statement)?,
            }
        }

        Ok(resolver.resolutions)
    }

    fn error(&self, span: Span, message: impl Into<String>) -> SemanticError {
        SemanticError {
            message: message.into(),
            line: self.source.row_for_position(span.start),
            column: self.source.column_for_position(span.start),
        }
    }

    fn collect_definitions(&mut self, module: &Module) -> Result<(), SemanticError> {
        for item in &module.items {
            match item {
                Item::Function(function) => {
                    let name = &function.name.name;

                    if self.builtins.contains(name) {
                        return Err(self.error(
                            function.name.span,
                            format!("Function '{name}' shadows a builtin"),
                        ));
                    }

                    if self
                        .resolutions
                        .functions
                        .insert(name.clone(), function.parameters.len())
                        .is_some()
                    {
                        return Err(self
                            .error(function.name.span, format!("Duplicate function '{name}'")));
                    }
                }
                Item::Struct(definition) => self.collect_struct(definition)?,
                Item::Statement(_) => {}
            }
        }

        Ok(())
    }

    fn collect_struct(&mut self, definition: &StructDefinition) -> Result<(), SemanticError> {
        let name = &definition.name.name;

        let mut fields = Vec::new();

        for field in &definition.fields {
            if fields.contains(&field.name) {
                return Err(self.error(
                    field.span,
                    format!("Duplicate field '{}' in struct '{name}'", field.name),
                ));
            }

            fields.push(field.name.clone());
        }

        let mut methods = BTreeMap::new();

        for method in &definition.methods {
            if methods
                .insert(method.name.name.clone(), method.parameters.len())
                .is_some()
            {
                return Err(self.error(
                    method.name.span,
                    format!("Duplicate method '{}' on struct '{name}'", method.name.name),
                ));
            }
        }

        let shape = StructShape { fields, methods };

        if self
            .resolutions
            .structs
            .insert(name.clone(), shape)
            .is_some()
        {
            return Err(self.error(definition.name.span, format!("Duplicate struct '{name}'")));
        }

        Ok(())
    }

    /// Function bodies see their parameters and their own assignments, not
    /// the caller's variables: the VM swaps in a fresh environment on call
    fn check_function(
        &mut self,
        function: &FunctionDefinition,
        is_method: bool,
    ) -> Result<(), SemanticError> {
        if is_method
            && function.parameters.first().map(|p| p.name.as_str()) != Some("self")
        {
            return Err(self.error(
                function.name.span,
                format!(
                    "Method '{}' must take 'self' as its first parameter",
                    function.name.name
                ),
            ));
        }

        let mut scope = HashSet::new();

        for parameter in &function.parameters {
            if !scope.insert(parameter.name.clone()) {
                return Err(self.error(
                    parameter.span,
                    format!("Duplicate parameter '{}'", parameter.name),
                ));
            }
        }

        self.scopes.push(scope);
        let enclosing_loop_depth = std::mem::replace(&mut self.loop_depth, 0);

        let result = self.check_block(&function.body);

        self.loop_depth = enclosing_loop_depth;
        self.scopes.pop();

        result
    }

    fn check_block(&mut self, block: &Block) -> Result<(), SemanticError> {
        for statement in &block.statements {
            self.check_statement(statement)?;
        }

        Ok(())
    }

    fn check_statement(&mut self, statement: &Statement) -> Result<(), SemanticError> {
        match &statement.kind {
            StatementKind::Assign { target, value } => {
                self.check_expression(value)?;
                self.define(&target.name);
            }
            StatementKind::Expression(expression) => self.check_expression(expression)?,
            StatementKind::If(if_statement) => self.check_if(if_statement)?,
            StatementKind::While { test, body } => {
                self.check_expression(test)?;

                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;

                result?
            }
            StatementKind::For {
                target,
                start,
                end,
                body,
            } => {
                self.check_expression(start)?;
                self.check_expression(end)?;
                self.define(&target.name);

                self.loop_depth += 1;
                let result = self.check_block(body);
                self.loop_depth -= 1;

                result?
            }
            StatementKind::Return(value) => {
                if let Some(value) = value {
                    self.check_expression(value)?;
                }
            }
            StatementKind::Break => {
                if self.loop_depth == 0 {
                    return Err(self.error(statement.span, "'break' outside of a loop"));
                }
            }
            StatementKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.error(statement.span, "'continue' outside of a loop"));
                }
            }
        }

        Ok(())
    }

    fn check_if(&mut self, if_statement: &If) -> Result<(), SemanticError> {
        self.check_expression(&if_statement.test)?;
        self.check_block(&if_statement.body)?;

        match &if_statement.orelse {
            Some(Else::If(nested)) => self.check_if(nested),
            Some(Else::Block(block)) => self.check_block(block),
            None => Ok(()),
        }
    }

    fn check_expression(&mut self, expression: &Expression) -> Result<(), SemanticError> {
        match &expression.kind {
            ExpressionKind::IntegerLiteral(_)
            | ExpressionKind::FloatLiteral(_)
            | ExpressionKind::StringLiteral(_)
            | ExpressionKind::BooleanLiteral(_) => Ok(()),
            ExpressionKind::List(elements) => {
                for element in elements {
                    self.check_expression(element)?;
                }

                Ok(())
            }
            ExpressionKind::Name(name) => {
                if !self.is_defined(name) {
                    return Err(
                        self.error(expression.span, format!("Undefined variable '{name}'"))
                    );
                }

                Ok(())
            }
            ExpressionKind::Call { callee, arguments } => {
                for argument in arguments {
                    self.check_expression(argument)?;
                }

                self.check_call_arity(callee, arguments.len())
            }
            ExpressionKind::MethodCall {
                receiver,
                arguments,
                ..
            } => {
                self.check_expression(receiver)?;

                for argument in arguments {
                    self.check_expression(argument)?;
                }

                // Which method table applies depends on the receiver's
                // runtime type; the VM checks membership at dispatch
                Ok(())
            }
            ExpressionKind::Attribute { receiver, .. } => self.check_expression(receiver),
            ExpressionKind::Unary { operand, .. } => self.check_expression(operand),
            ExpressionKind::Binary { lhs, rhs, .. }
            | ExpressionKind::Logical { lhs, rhs, .. } => {
                self.check_expression(lhs)?;
                self.check_expression(rhs)
            }
            ExpressionKind::Compare {
                left, comparators, ..
            } => {
                self.check_expression(left)?;

                for comparator in comparators {
                    self.check_expression(comparator)?;
                }

                Ok(())
            }
        }
    }

    fn check_call_arity(
        &self,
        callee: &Identifier,
        argument_count: usize,
    ) -> Result<(), SemanticError> {
        let name = &callee.name;

        if let Some(shape) = self.resolutions.structs.get(name) {
            if argument_count != shape.fields.len() {
                return Err(self.error(
                    callee.span,
                    format!(
                        "Struct '{name}' has {} field(s) but {argument_count} value(s) were given",
                        shape.fields.len()
                    ),
                ));
            }

            return Ok(());
        }

        if let Some(builtin) = self.builtins.get(name) {
            if argument_count < builtin.min_args || argument_count > builtin.max_args {
                return Err(self.error(
                    callee.span,
                    format!(
                        "Builtin '{name}' expected {}-{} argument(s), got {argument_count}",
                        builtin.min_args, builtin.max_args
                    ),
                ));
            }

            return Ok(());
        }

        if let Some(parameter_count) = self.resolutions.functions.get(name) {
            if argument_count != *parameter_count {
                return Err(self.error(
                    callee.span,
                    format!(
                        "Function '{name}' takes {parameter_count} argument(s), got {argument_count}"
                    ),
                ));
            }

            return Ok(());
        }

        Err(self.error(callee.span, format!("Call to undefined function '{name}'")))
    }

    fn define(&mut self, name: &str) {
        self.scopes.last_mut().unwrap().insert(name.to_owned());
    }

    fn is_defined(&self, name: &str) -> bool {
        self.scopes.last().unwrap().contains(name)
            || self.resolutions.functions.contains_key(name)
            || self.resolutions.structs.contains_key(name)
    }
}
