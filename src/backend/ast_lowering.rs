//! AST to IR lowering. Expression trees flatten into three-address
//! instructions; control structures become conditional jumps whose targets
//! are backpatched once the destination index is known.

use crate::{
    backend::{Instruction, Ir, Opcode, Operand, Reg},
    frontend::ast::{
        BinaryOperatorKind, Block, ComparisonOperatorKind, Else, Expression, ExpressionKind,
        FunctionDefinition, If, Item, LogicalOperatorKind, Module, Statement, StatementKind,
        UnaryOperatorKind,
    },
    middle::resolve::ModuleResolutions,
    runtime::{builtins::Registry, value::Value},
};

/// Label marking the program's entry point
pub const ENTRY_LABEL: &str = "__main__";

pub struct LoweringContext<'a> {
    ir: Ir,
    resolutions: &'a ModuleResolutions,
    builtins: &'a Registry,
    /// One frame per enclosing loop; `break`/`continue` record their
    /// placeholder jumps here for patching when the loop closes
    loop_stack: Vec<LoopFrame>,
    range_counter: usize,
}

#[derive(Default)]
struct LoopFrame {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

impl<'a> LoweringContext<'a> {
    /// Lowers a whole module: the entry label and top-level statements
    /// first, then a forward jump over the function and method regions so
    /// execution doesn't fall into them.
    pub fn lower_module(
        module: &Module,
        resolutions: &'a ModuleResolutions,
        builtins: &'a Registry,
    ) -> Ir {
        let mut context = Self {
            ir: Ir::new(),
            resolutions,
            builtins,
            loop_stack: Vec::new(),
            range_counter: 0,
        };

        context
            .ir
            .emit(Opcode::Label, Some(Operand::Sym(ENTRY_LABEL.into())), None, None);

        for item in &module.items {
            if let Item::Statement(statement) = item {
                context.lower_statement(statement);
            }
        }

        let skip = context.ir.emit(Opcode::Jump, None, None, None);

        for item in &module.items {
            match item {
                Item::Function(function) => {
                    context.lower_function(function, function.name.name.clone())
                }
                Item::Struct(definition) => {
                    let shape = &resolutions.structs[&definition.name.name];

                    context.ir.push(
                        Instruction::new(
                            Opcode::StructDef,
                            Some(Operand::Sym(definition.name.name.clone())),
                            None,
                            None,
                        )
                        .with_fields(shape.fields.clone())
                        .with_methods(shape.methods.keys().cloned().collect()),
                    );

                    for method in &definition.methods {
                        let label = format!("{}.{}", definition.name.name, method.name.name);
                        context.lower_function(method, label);
                    }
                }
                Item::Statement(_) => {}
            }
        }

        let end = context.ir.here();
        context.ir.patch_a(skip, end);

        context.ir
    }

    // Methods arrive here too; their declared `self` is just the first
    // parameter, bound by the VM to the receiver at dispatch
    fn lower_function(&mut self, function: &FunctionDefinition, label: String) {
        let params = function.parameters.iter().map(|p| p.name.clone()).collect();

        self.ir.push(
            Instruction::new(Opcode::Label, Some(Operand::Sym(label)), None, None)
                .with_params(params),
        );

        for statement in &function.body.statements {
            self.lower_statement(statement);
        }

        // Falling off the end returns 0
        let default = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadConst,
            Some(Operand::Reg(default)),
            Some(Operand::Imm(Value::Int(0))),
            None,
        );
        self.ir
            .emit(Opcode::Return, Some(Operand::Reg(default)), None, None);
    }

    fn lower_block(&mut self, block: &Block) {
        for statement in &block.statements {
            self.lower_statement(statement);
        }
    }

    fn lower_statement(&mut self, statement: &Statement) {
        match &statement.kind {
            StatementKind::Assign { target, value } => {
                let value_reg = self.lower_expression(value);
                self.ir.emit(
                    Opcode::StoreVar,
                    Some(Operand::Sym(target.name.clone())),
                    Some(Operand::Reg(value_reg)),
                    None,
                );
            }
            StatementKind::Expression(expression) => {
                self.lower_expression(expression);
            }
            StatementKind::If(if_statement) => self.lower_if(if_statement),
            StatementKind::While { test, body } => self.lower_while(test, body),
            StatementKind::For {
                target,
                start,
                end,
                body,
            } => self.lower_for(&target.name, start, end, body),
            StatementKind::Return(value) => {
                let value_reg = match value {
                    Some(value) => self.lower_expression(value),
                    None => {
                        let reg = self.ir.new_reg();
                        self.ir.emit(
                            Opcode::LoadConst,
                            Some(Operand::Reg(reg)),
                            Some(Operand::Imm(Value::Int(0))),
                            None,
                        );
                        reg
                    }
                };

                self.ir
                    .emit(Opcode::Return, Some(Operand::Reg(value_reg)), None, None);
            }
            StatementKind::Break => {
                let jump = self.ir.emit(Opcode::Jump, None, None, None);
                self.loop_stack
                    .last_mut()
                    .expect("break outside of a loop survived semantic analysis")
                    .breaks
                    .push(jump);
            }
            StatementKind::Continue => {
                let jump = self.ir.emit(Opcode::Jump, None, None, None);
                self.loop_stack
                    .last_mut()
                    .expect("continue outside of a loop survived semantic analysis")
                    .continues
                    .push(jump);
            }
        }
    }

    fn lower_if(&mut self, if_statement: &If) {
        let test_reg = self.lower_expression(&if_statement.test);

        let jump_false = self.ir.emit(
            Opcode::JumpIfFalse,
            Some(Operand::Reg(test_reg)),
            None,
            None,
        );

        self.lower_block(&if_statement.body);

        match &if_statement.orelse {
            Some(orelse) => {
                let jump_end = self.ir.emit(Opcode::Jump, None, None, None);

                let else_start = self.ir.here();
                self.ir.patch_b(jump_false, else_start);

                match orelse {
                    Else::If(nested) => self.lower_if(nested),
                    Else::Block(block) => self.lower_block(block),
                }

                let join = self.ir.here();
                self.ir.patch_a(jump_end, join);
            }
            None => {
                let join = self.ir.here();
                self.ir.patch_b(jump_false, join);
            }
        }
    }

    fn lower_while(&mut self, test: &Expression, body: &Block) {
        let loop_start = self.ir.here();
        let test_reg = self.lower_expression(test);

        let jump_exit = self.ir.emit(
            Opcode::JumpIfFalse,
            Some(Operand::Reg(test_reg)),
            None,
            None,
        );

        self.loop_stack.push(LoopFrame::default());
        self.lower_block(body);
        let frame = self.loop_stack.pop().unwrap();

        self.ir
            .emit(Opcode::Jump, Some(Operand::index(loop_start)), None, None);

        let exit = self.ir.here();
        self.ir.patch_b(jump_exit, exit);

        for jump in frame.breaks {
            self.ir.patch_a(jump, exit);
        }

        // `continue` re-runs the test
        for jump in frame.continues {
            self.ir.patch_a(jump, loop_start);
        }
    }

    /// `for x in start..end` counts upward by one. The end bound is
    /// evaluated once and parked in a hidden variable so that it survives
    /// the trip around the back-edge.
    fn lower_for(&mut self, target: &str, start: &Expression, end: &Expression, body: &Block) {
        let end_var = format!("__range_end_{}", self.range_counter);
        self.range_counter += 1;

        let start_reg = self.lower_expression(start);
        let end_reg = self.lower_expression(end);

        self.ir.emit(
            Opcode::StoreVar,
            Some(Operand::Sym(end_var.clone())),
            Some(Operand::Reg(end_reg)),
            None,
        );

        let var_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::Move,
            Some(Operand::Reg(var_reg)),
            Some(Operand::Reg(start_reg)),
            None,
        );
        self.ir.emit(
            Opcode::StoreVar,
            Some(Operand::Sym(target.to_owned())),
            Some(Operand::Reg(var_reg)),
            None,
        );

        let loop_start = self.ir.here();

        let loop_var_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadVar,
            Some(Operand::Reg(loop_var_reg)),
            Some(Operand::Sym(target.to_owned())),
            None,
        );

        let end_load_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadVar,
            Some(Operand::Reg(end_load_reg)),
            Some(Operand::Sym(end_var)),
            None,
        );

        let cmp_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::Lt,
            Some(Operand::Reg(cmp_reg)),
            Some(Operand::Reg(loop_var_reg)),
            Some(Operand::Reg(end_load_reg)),
        );

        let jump_exit = self
            .ir
            .emit(Opcode::JumpIfFalse, Some(Operand::Reg(cmp_reg)), None, None);

        self.loop_stack.push(LoopFrame::default());
        self.lower_block(body);
        let frame = self.loop_stack.pop().unwrap();

        // Increment section; `continue` lands here
        let increment = self.ir.here();

        self.ir.emit(
            Opcode::LoadVar,
            Some(Operand::Reg(var_reg)),
            Some(Operand::Sym(target.to_owned())),
            None,
        );

        let one_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadConst,
            Some(Operand::Reg(one_reg)),
            Some(Operand::Imm(Value::Int(1))),
            None,
        );
        self.ir.emit(
            Opcode::Add,
            Some(Operand::Reg(var_reg)),
            Some(Operand::Reg(var_reg)),
            Some(Operand::Reg(one_reg)),
        );
        self.ir.emit(
            Opcode::StoreVar,
            Some(Operand::Sym(target.to_owned())),
            Some(Operand::Reg(var_reg)),
            None,
        );

        self.ir
            .emit(Opcode::Jump, Some(Operand::index(loop_start)), None, None);

        let exit = self.ir.here();
        self.ir.patch_b(jump_exit, exit);

        for jump in frame.breaks {
            self.ir.patch_a(jump, exit);
        }

        for jump in frame.continues {
            self.ir.patch_a(jump, increment);
        }
    }

    /// Lowers an expression, returning the virtual register holding its
    /// result
    fn lower_expression(&mut self, expression: &Expression) -> Reg {
        match &expression.kind {
            ExpressionKind::IntegerLiteral(i) => self.lower_constant(Value::Int(*i)),
            ExpressionKind::FloatLiteral(f) => self.lower_constant(Value::Float(*f)),
            ExpressionKind::StringLiteral(s) => self.lower_constant(Value::Str(s.clone())),
            ExpressionKind::BooleanLiteral(b) => self.lower_constant(Value::Bool(*b)),
            ExpressionKind::List(elements) => {
                let element_regs = elements
                    .iter()
                    .map(|element| self.lower_expression(element))
                    .collect();

                let dest = self.ir.new_reg();
                self.ir.push(
                    Instruction::new(Opcode::BuildList, Some(Operand::Reg(dest)), None, None)
                        .with_args(element_regs),
                );

                dest
            }
            ExpressionKind::Name(name) => {
                let dest = self.ir.new_reg();
                self.ir.emit(
                    Opcode::LoadVar,
                    Some(Operand::Reg(dest)),
                    Some(Operand::Sym(name.clone())),
                    None,
                );

                dest
            }
            ExpressionKind::Call { callee, arguments } => self.lower_call(&callee.name, arguments),
            ExpressionKind::MethodCall {
                receiver,
                method,
                arguments,
            } => {
                let receiver_reg = self.lower_expression(receiver);
                let argument_regs = arguments
                    .iter()
                    .map(|argument| self.lower_expression(argument))
                    .collect();

                let dest = self.ir.new_reg();
                self.ir.push(
                    Instruction::new(
                        Opcode::CallMethod,
                        Some(Operand::Reg(dest)),
                        Some(Operand::Reg(receiver_reg)),
                        Some(Operand::Sym(method.name.clone())),
                    )
                    .with_args(argument_regs),
                );

                dest
            }
            ExpressionKind::Attribute {
                receiver,
                attribute,
            } => {
                let receiver_reg = self.lower_expression(receiver);

                let dest = self.ir.new_reg();
                self.ir.emit(
                    Opcode::GetAttr,
                    Some(Operand::Reg(dest)),
                    Some(Operand::Reg(receiver_reg)),
                    Some(Operand::Sym(attribute.name.clone())),
                );

                dest
            }
            ExpressionKind::Unary { operator, operand } => {
                let operand_reg = self.lower_expression(operand);
                let dest = self.ir.new_reg();

                let op = match operator {
                    UnaryOperatorKind::Negate => Opcode::Neg,
                    UnaryOperatorKind::Not => Opcode::Not,
                };

                self.ir.emit(
                    op,
                    Some(Operand::Reg(dest)),
                    Some(Operand::Reg(operand_reg)),
                    None,
                );

                dest
            }
            ExpressionKind::Binary { operator, lhs, rhs } => {
                let lhs_reg = self.lower_expression(lhs);
                let rhs_reg = self.lower_expression(rhs);

                let op = match operator {
                    BinaryOperatorKind::Add => Opcode::Add,
                    BinaryOperatorKind::Subtract => Opcode::Sub,
                    BinaryOperatorKind::Multiply => Opcode::Mul,
                    BinaryOperatorKind::Divide => Opcode::Div,
                    BinaryOperatorKind::Power => Opcode::Pow,
                };

                let dest = self.ir.new_reg();
                self.ir.emit(
                    op,
                    Some(Operand::Reg(dest)),
                    Some(Operand::Reg(lhs_reg)),
                    Some(Operand::Reg(rhs_reg)),
                );

                dest
            }
            ExpressionKind::Logical { operator, lhs, rhs } => {
                self.lower_logical(*operator, lhs, rhs)
            }
            ExpressionKind::Compare {
                left,
                operators,
                comparators,
            } => self.lower_comparison(left, operators, comparators),
        }
    }

    fn lower_constant(&mut self, value: Value) -> Reg {
        let dest = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadConst,
            Some(Operand::Reg(dest)),
            Some(Operand::Imm(value)),
            None,
        );

        dest
    }

    fn lower_call(&mut self, callee: &str, arguments: &[Expression]) -> Reg {
        let argument_regs: Vec<Reg> = arguments
            .iter()
            .map(|argument| self.lower_expression(argument))
            .collect();

        let dest = self.ir.new_reg();

        if self.resolutions.structs.contains_key(callee) {
            // Struct construction: arguments bind positionally to the
            // declared field order at run time
            self.ir.push(
                Instruction::new(
                    Opcode::BuildStruct,
                    Some(Operand::Reg(dest)),
                    Some(Operand::Sym(callee.to_owned())),
                    None,
                )
                .with_args(argument_regs),
            );
        } else if self.builtins.contains(callee) {
            self.ir.push(
                Instruction::new(
                    Opcode::CallBuiltin,
                    Some(Operand::Sym(callee.to_owned())),
                    Some(Operand::Reg(dest)),
                    None,
                )
                .with_args(argument_regs),
            );
        } else {
            // The label resolves to an address at VM load time
            self.ir.push(
                Instruction::new(
                    Opcode::Call,
                    Some(Operand::Sym(callee.to_owned())),
                    Some(Operand::Reg(dest)),
                    None,
                )
                .with_args(argument_regs),
            );
        }

        dest
    }

    /// Short-circuit `and`/`or`: the left value is copied into the
    /// destination, and a conditional jump skips the right-hand evaluation
    /// when the left already decides the result
    fn lower_logical(
        &mut self,
        operator: LogicalOperatorKind,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Reg {
        let lhs_reg = self.lower_expression(lhs);
        let dest = self.ir.new_reg();

        self.ir.emit(
            Opcode::Move,
            Some(Operand::Reg(dest)),
            Some(Operand::Reg(lhs_reg)),
            None,
        );

        let short_circuit = match operator {
            LogicalOperatorKind::And => Opcode::JumpIfFalse,
            LogicalOperatorKind::Or => Opcode::JumpIfTrue,
        };

        let jump = self
            .ir
            .emit(short_circuit, Some(Operand::Reg(dest)), None, None);

        let rhs_reg = self.lower_expression(rhs);
        self.ir.emit(
            Opcode::Move,
            Some(Operand::Reg(dest)),
            Some(Operand::Reg(rhs_reg)),
            None,
        );

        let join = self.ir.here();
        self.ir.patch_b(jump, join);

        dest
    }

    /// `a < b < c` evaluates each operand once and ANDs the pairwise
    /// results: `result = true AND (a < b) AND (b < c)`
    fn lower_comparison(
        &mut self,
        left: &Expression,
        operators: &[ComparisonOperatorKind],
        comparators: &[Expression],
    ) -> Reg {
        let left_reg = self.lower_expression(left);

        let result_reg = self.ir.new_reg();
        self.ir.emit(
            Opcode::LoadConst,
            Some(Operand::Reg(result_reg)),
            Some(Operand::Imm(Value::Bool(true))),
            None,
        );

        let mut current_left = left_reg;

        for (operator, comparator) in operators.iter().zip(comparators) {
            let right_reg = self.lower_expression(comparator);

            let op = match operator {
                ComparisonOperatorKind::Equals => Opcode::Eq,
                ComparisonOperatorKind::NotEquals => Opcode::Ne,
                ComparisonOperatorKind::LessThan => Opcode::Lt,
                ComparisonOperatorKind::GreaterThan => Opcode::Gt,
                ComparisonOperatorKind::LessThanOrEqualTo => Opcode::Le,
                ComparisonOperatorKind::GreaterThanOrEqualTo => Opcode::Ge,
            };

            let cmp_reg = self.ir.new_reg();
            self.ir.emit(
                op,
                Some(Operand::Reg(cmp_reg)),
                Some(Operand::Reg(current_left)),
                Some(Operand::Reg(right_reg)),
            );

            self.ir.emit(
                Opcode::And,
                Some(Operand::Reg(result_reg)),
                Some(Operand::Reg(result_reg)),
                Some(Operand::Reg(cmp_reg)),
            );

            current_left = right_reg;
        }

        result_reg
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;
    use crate::{
        frontend::{parser::Parser, SourceFile},
        middle::resolve::Resolver,
    };

    fn lower(text: &str) -> Ir {
        let source = SourceFile::from_memory(text);
        let module = Parser::parse_module(&source);
        let builtins = Registry::new();
        let resolutions = Resolver::resolve_module(&module, &source, &builtins).unwrap();
        LoweringContext::lower_module(&module, &resolutions, &builtins)
    }

    fn opcodes(ir: &Ir) -> Vec<Opcode> {
        ir.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn module_starts_at_the_entry_label() {
        let ir = lower("x = 1");

        assert_eq!(ir.code[0].op, Opcode::Label);
        assert_eq!(ir.code[0].a.as_ref().unwrap().as_sym(), Some(ENTRY_LABEL));
    }

    #[test]
    fn skip_jump_lands_after_the_last_function_region() {
        let ir = lower("x = f() fn f() { return 1 }");

        let skip = ir
            .code
            .iter()
            .position(|i| i.op == Opcode::Jump)
            .expect("no skip jump emitted");

        assert_eq!(
            ir.code[skip].a.as_ref().unwrap().as_index(),
            Some(ir.code.len())
        );
    }

    #[test]
    fn no_unresolved_jump_targets_leave_the_generator() {
        let ir = lower(
            "i = 0
             while i < 10 {
                 i = i + 1
                 if i == 3 { continue }
                 if i == 7 { break }
             }",
        );

        for instruction in &ir.code {
            match instruction.op {
                Opcode::Jump => {
                    let target = instruction.a.as_ref().and_then(Operand::as_index);
                    assert!(target.is_some_and(|t| t <= ir.code.len()));
                }
                Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                    let target = instruction.b.as_ref().and_then(Operand::as_index);
                    assert!(target.is_some_and(|t| t <= ir.code.len()));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn while_exit_branch_lands_after_the_back_edge() {
        let ir = lower("i = 0 while i < 3 { i = i + 1 }");

        let exit_branch = ir
            .code
            .iter()
            .position(|i| i.op == Opcode::JumpIfFalse)
            .unwrap();

        let back_edge = ir
            .code
            .iter()
            .rposition(|i| {
                i.op == Opcode::Jump
                    && i.a.as_ref().and_then(Operand::as_index) < Some(exit_branch)
            })
            .unwrap();

        assert_eq!(
            ir.code[exit_branch].b.as_ref().unwrap().as_index(),
            Some(back_edge + 1)
        );
    }

    #[test]
    fn short_circuit_and_jumps_over_the_right_side() {
        let ir = lower("x = true y = x and false");

        let jump = ir
            .code
            .iter()
            .position(|i| i.op == Opcode::JumpIfFalse)
            .unwrap();

        // The branch lands after the right-hand evaluation and its move
        let join = ir.code[jump].b.as_ref().unwrap().as_index().unwrap();
        assert!(join > jump + 1);
        assert_eq!(ir.code[join - 1].op, Opcode::Move);
    }

    #[test]
    fn chained_comparison_ands_pairwise_results() {
        let ir = lower("x = 1 < 2 < 3");
        let ops = opcodes(&ir);

        assert_eq!(ops.iter().filter(|op| **op == Opcode::Lt).count(), 2);
        assert_eq!(ops.iter().filter(|op| **op == Opcode::And).count(), 2);
    }

    #[test]
    fn builtin_and_user_calls_use_distinct_opcodes() {
        let ir = lower("print(f()) fn f() { return 1 }");
        let ops = opcodes(&ir);

        assert!(ops.contains(&Opcode::Call));
        assert!(ops.contains(&Opcode::CallBuiltin));
    }

    #[test]
    fn struct_construction_lowers_to_build_struct() {
        let ir = lower("struct Point { x, y } p = Point(1, 2)");

        let build = ir
            .code
            .iter()
            .find(|i| i.op == Opcode::BuildStruct)
            .unwrap();
        assert_eq!(build.b.as_ref().unwrap().as_sym(), Some("Point"));
        assert_eq!(build.args.len(), 2);

        let definition = ir.code.iter().find(|i| i.op == Opcode::StructDef).unwrap();
        assert_eq!(definition.fields, vec!["x", "y"]);
    }

    #[test]
    fn method_regions_are_labeled_by_struct_and_name() {
        let ir = lower("struct Point { x fn shifted(self, d) { return Point(self.x + d) } }");

        let label = ir
            .code
            .iter()
            .find(|i| {
                i.op == Opcode::Label
                    && i.a.as_ref().and_then(Operand::as_sym) == Some("Point.shifted")
            })
            .unwrap();

        assert_eq!(label.params, vec!["self", "d"]);
    }

    #[test]
    fn first_definition_precedes_first_use_for_every_register() {
        let ir = lower(
            "total = 0
             for i in 0..5 {
                 if i == 2 and total < 10 { total = total + i }
             }
             print(total)",
        );

        let mut first_def: HashMap<Reg, usize> = HashMap::new();
        let mut first_use: HashMap<Reg, usize> = HashMap::new();

        for (index, instruction) in ir.code.iter().enumerate() {
            for reg in instruction.defs() {
                first_def.entry(reg).or_insert(index);
            }
            for reg in instruction.uses() {
                first_use.entry(reg).or_insert(index);
            }
        }

        for (reg, use_index) in first_use {
            let def_index = first_def
                .get(&reg)
                .unwrap_or_else(|| panic!("{reg:?} used but never defined"));
            assert!(def_index <= &use_index);
        }
    }
}
