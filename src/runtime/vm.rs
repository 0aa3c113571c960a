//! The register virtual machine. Executes a flat instruction stream:
//! fetch at `ip`, dispatch on opcode, default-increment unless the
//! instruction transfers control explicitly.
//!
//! Labels and struct definitions are scanned once up front into lookup
//! tables; `CALL`/`CALL_METHOD` resolve their targets against them at
//! dispatch time.

use std::io::Write;

use hashbrown::HashMap;

use crate::{
    backend::{ast_lowering::ENTRY_LABEL, Instruction, Opcode, Operand, Reg},
    index::Index,
    runtime::{
        builtins::Registry,
        methods, value,
        value::{StructInstance, Value},
        Fault, FaultKind,
    },
};

/// Saved caller state, pushed on `CALL`/`CALL_METHOD` and popped on
/// `RETURN`. The register file and spill store are snapshotted along with
/// the variable environment: the callee shares the physical file (and,
/// under recursion, the very same instruction region), so the caller's
/// live registers must be restored on return.
struct Frame {
    return_ip: usize,
    saved_variables: HashMap<String, Value>,
    saved_registers: Vec<Value>,
    saved_spill_slots: Vec<Value>,
    destination: Option<usize>,
}

struct StructLayout {
    fields: Vec<String>,
    methods: Vec<String>,
}

enum Transfer {
    Next,
    Goto(usize),
    Halt,
}

pub struct Vm<'a> {
    num_regs: usize,
    registers: Vec<Value>,
    pub variables: HashMap<String, Value>,
    spill_slots: Vec<Value>,
    call_stack: Vec<Frame>,
    labels: HashMap<String, usize>,
    structs: HashMap<String, StructLayout>,
    builtins: &'a Registry,
    output: Box<dyn Write + 'a>,
}

impl<'a> Vm<'a> {
    pub fn new(num_regs: usize, builtins: &'a Registry) -> Self {
        Self::with_output(num_regs, builtins, Box::new(std::io::stdout()))
    }

    pub fn with_output(
        num_regs: usize,
        builtins: &'a Registry,
        output: Box<dyn Write + 'a>,
    ) -> Self {
        Self {
            num_regs,
            registers: Vec::new(),
            variables: HashMap::new(),
            spill_slots: Vec::new(),
            call_stack: Vec::new(),
            labels: HashMap::new(),
            structs: HashMap::new(),
            builtins,
            output,
        }
    }

    pub fn run(&mut self, code: &[Instruction]) -> Result<(), Fault> {
        self.scan_definitions(code);

        // The allocator may address scratch registers above the bank; size
        // the file to whatever the stream actually touches
        let file_size = code
            .iter()
            .flat_map(|i| i.defs().into_iter().chain(i.uses()))
            .map(|reg| reg.index() + 1)
            .max()
            .unwrap_or(0)
            .max(self.num_regs);

        self.registers = vec![Value::Null; file_size];

        let Some(&entry) = self.labels.get(ENTRY_LABEL) else {
            return Err(Fault::new(
                FaultKind::LabelNotFound,
                format!("Entry label '{ENTRY_LABEL}' not found"),
            ));
        };

        let mut ip = entry;

        while ip < code.len() {
            match self.step(code, ip) {
                Ok(Transfer::Next) => ip += 1,
                Ok(Transfer::Goto(target)) => ip = target,
                Ok(Transfer::Halt) => break,
                Err(fault) => return Err(fault.at(ip)),
            }
        }

        Ok(())
    }

    fn scan_definitions(&mut self, code: &[Instruction]) {
        for (index, instruction) in code.iter().enumerate() {
            match instruction.op {
                Opcode::Label => {
                    if let Some(name) = instruction.a.as_ref().and_then(Operand::as_sym) {
                        self.labels.insert(name.to_owned(), index);
                    }
                }
                Opcode::StructDef => {
                    if let Some(name) = instruction.a.as_ref().and_then(Operand::as_sym) {
                        self.structs.insert(
                            name.to_owned(),
                            StructLayout {
                                fields: instruction.fields.clone(),
                                methods: instruction.methods.clone(),
                            },
                        );
                    }
                }
                _ => {}
            }
        }
    }

    fn step(&mut self, code: &[Instruction], ip: usize) -> Result<Transfer, Fault> {
        let instruction = &code[ip];

        match instruction.op {
            Opcode::LoadConst => {
                let value = imm_operand(&instruction.b)?;
                self.set(reg_operand(&instruction.a)?, value)?;
            }
            Opcode::LoadVar => {
                let name = sym_operand(&instruction.b)?;

                let Some(value) = self.variables.get(name).cloned() else {
                    return Err(Fault::new(
                        FaultKind::UndefinedVariable,
                        format!("Undefined variable '{name}'"),
                    ));
                };

                self.set(reg_operand(&instruction.a)?, value)?;
            }
            Opcode::StoreVar => {
                let name = sym_operand(&instruction.a)?;
                let value = self.get(reg_operand(&instruction.b)?)?;
                self.variables.insert(name.to_owned(), value);
            }
            Opcode::Move => {
                let value = self.get(reg_operand(&instruction.b)?)?;
                self.set(reg_operand(&instruction.a)?, value)?;
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Pow
            | Opcode::And
            | Opcode::Or
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Gt
            | Opcode::Le
            | Opcode::Ge => {
                let lhs = self.get(reg_operand(&instruction.b)?)?;
                let rhs = self.get(reg_operand(&instruction.c)?)?;
                let result = binary_operation(instruction.op, &lhs, &rhs)?;
                self.set(reg_operand(&instruction.a)?, result)?;
            }

            Opcode::Neg => {
                let operand = self.get(reg_operand(&instruction.b)?)?;
                self.set(reg_operand(&instruction.a)?, value::neg(&operand)?)?;
            }
            Opcode::Not => {
                let operand = self.get(reg_operand(&instruction.b)?)?;
                self.set(reg_operand(&instruction.a)?, value::not(&operand))?;
            }

            Opcode::Jump => {
                return Ok(Transfer::Goto(target_operand(&instruction.a)?));
            }
            Opcode::JumpIfTrue => {
                if self.get(reg_operand(&instruction.a)?)?.truthy() {
                    return Ok(Transfer::Goto(target_operand(&instruction.b)?));
                }
            }
            Opcode::JumpIfFalse => {
                if !self.get(reg_operand(&instruction.a)?)?.truthy() {
                    return Ok(Transfer::Goto(target_operand(&instruction.b)?));
                }
            }

            // Inert at execution time; resolved by the load-time scan
            Opcode::Label | Opcode::StructDef => {}

            Opcode::Call => {
                let name = sym_operand(&instruction.a)?;
                let destination = reg_operand(&instruction.b)?;

                let Some(&target) = self.labels.get(name) else {
                    return Err(Fault::new(
                        FaultKind::LabelNotFound,
                        format!("Label '{name}' not found"),
                    ));
                };

                let arguments = self.argument_values(instruction)?;
                return self.enter(code, ip, target, arguments, Some(destination));
            }
            Opcode::CallMethod => {
                return self.call_method(code, ip, instruction);
            }
            Opcode::CallBuiltin => {
                let name = sym_operand(&instruction.a)?;
                let destination = reg_operand(&instruction.b)?;

                let Some(builtin) = self.builtins.get(name) else {
                    return Err(Fault::new(
                        FaultKind::UnknownBuiltin,
                        format!("Unknown builtin '{name}'"),
                    ));
                };

                let arguments = self.argument_values(instruction)?;
                let result = builtin.call(&mut *self.output, &arguments)?;
                self.set(destination, result)?;
            }
            Opcode::Return => {
                let value = self.get(reg_operand(&instruction.a)?)?;

                let Some(frame) = self.call_stack.pop() else {
                    // Empty call stack: the program's final return
                    return Ok(Transfer::Halt);
                };

                self.variables = frame.saved_variables;
                self.registers = frame.saved_registers;
                self.spill_slots = frame.saved_spill_slots;

                if let Some(destination) = frame.destination {
                    self.set(destination, value)?;
                }

                return Ok(Transfer::Goto(frame.return_ip));
            }

            Opcode::GetAttr => {
                let receiver = self.get(reg_operand(&instruction.b)?)?;
                let name = sym_operand(&instruction.c)?;

                let result = match &receiver {
                    Value::Struct(instance) => instance
                        .fields
                        .borrow()
                        .iter()
                        .find(|(field, _)| field == name)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| {
                            Fault::new(
                                FaultKind::AttributeNotFound,
                                format!(
                                    "'{}' has no field '{name}'",
                                    instance.type_name
                                ),
                            )
                        })?,
                    // `.len` and friends work uniformly as zero-argument
                    // members
                    other => methods::resolve_member(other, name, &[])?,
                };

                self.set(reg_operand(&instruction.a)?, result)?;
            }
            Opcode::BuildList => {
                let values = self.argument_values(instruction)?;
                self.set(reg_operand(&instruction.a)?, Value::list(values))?;
            }
            Opcode::BuildStruct => {
                let name = sym_operand(&instruction.b)?;

                let Some(layout) = self.structs.get(name) else {
                    return Err(Fault::new(
                        FaultKind::UnknownStruct,
                        format!("Unknown struct '{name}'"),
                    ));
                };

                if layout.fields.len() != instruction.args.len() {
                    return Err(Fault::new(
                        FaultKind::ArityMismatch,
                        format!(
                            "Struct '{name}' has {} field(s), got {} value(s)",
                            layout.fields.len(),
                            instruction.args.len()
                        ),
                    ));
                }

                let field_names = layout.fields.clone();
                let values = self.argument_values(instruction)?;

                let instance = StructInstance {
                    type_name: name.to_owned(),
                    fields: std::cell::RefCell::new(
                        field_names.into_iter().zip(values).collect(),
                    ),
                };

                self.set(
                    reg_operand(&instruction.a)?,
                    Value::Struct(std::rc::Rc::new(instance)),
                )?;
            }

            Opcode::SpillStore => {
                let slot = target_operand(&instruction.a)?;
                let value = self.get(reg_operand(&instruction.b)?)?;

                if self.spill_slots.len() <= slot {
                    self.spill_slots.resize(slot + 1, Value::Null);
                }

                self.spill_slots[slot] = value;
            }
            Opcode::SpillLoad => {
                let slot = target_operand(&instruction.a)?;

                let Some(value) = self.spill_slots.get(slot).cloned() else {
                    return Err(Fault::new(
                        FaultKind::Internal,
                        format!("Spill slot {slot} read before any store"),
                    ));
                };

                self.set(reg_operand(&instruction.b)?, value)?;
            }
        }

        Ok(Transfer::Next)
    }

    /// Struct-method dispatch when the receiver's type declares the method
    /// and its labeled region exists; builtin member dispatch otherwise
    fn call_method(
        &mut self,
        code: &[Instruction],
        ip: usize,
        instruction: &Instruction,
    ) -> Result<Transfer, Fault> {
        let destination = reg_operand(&instruction.a)?;
        let receiver = self.get(reg_operand(&instruction.b)?)?;
        let name = sym_operand(&instruction.c)?;

        let mut arguments = self.argument_values(instruction)?;

        if let Value::Struct(instance) = &receiver {
            let declared = self
                .structs
                .get(&instance.type_name)
                .is_some_and(|layout| layout.methods.iter().any(|m| m == name));

            let qualified = format!("{}.{name}", instance.type_name);

            if declared {
                let Some(&target) = self.labels.get(&qualified) else {
                    return Err(Fault::new(
                        FaultKind::LabelNotFound,
                        format!("Label '{qualified}' not found"),
                    ));
                };

                // The receiver binds as the implicit first parameter
                arguments.insert(0, receiver.clone());
                return self.enter(code, ip, target, arguments, Some(destination));
            }
        }

        let result = methods::resolve_member(&receiver, name, &arguments)?;
        self.set(destination, result)?;

        Ok(Transfer::Next)
    }

    /// Pushes a call frame and jumps to a callable label, binding its
    /// parameter names positionally in a fresh variable environment
    fn enter(
        &mut self,
        code: &[Instruction],
        ip: usize,
        target: usize,
        arguments: Vec<Value>,
        destination: Option<usize>,
    ) -> Result<Transfer, Fault> {
        let params = &code[target].params;

        if params.len() != arguments.len() {
            let label = code[target]
                .a
                .as_ref()
                .and_then(Operand::as_sym)
                .unwrap_or("?");

            return Err(Fault::new(
                FaultKind::ArityMismatch,
                format!(
                    "'{label}' takes {} argument(s), got {}",
                    params.len(),
                    arguments.len()
                ),
            ));
        }

        let frame = Frame {
            return_ip: ip + 1,
            saved_variables: std::mem::take(&mut self.variables),
            saved_registers: self.registers.clone(),
            saved_spill_slots: self.spill_slots.clone(),
            destination,
        };

        self.call_stack.push(frame);

        for (param, value) in params.iter().zip(arguments) {
            self.variables.insert(param.clone(), value);
        }

        Ok(Transfer::Goto(target))
    }

    fn argument_values(&self, instruction: &Instruction) -> Result<Vec<Value>, Fault> {
        instruction
            .args
            .iter()
            .map(|reg| self.get(reg.index()))
            .collect()
    }

    fn get(&self, register: usize) -> Result<Value, Fault> {
        self.registers
            .get(register)
            .cloned()
            .ok_or_else(|| out_of_range(register))
    }

    fn set(&mut self, register: usize, value: Value) -> Result<(), Fault> {
        let Some(slot) = self.registers.get_mut(register) else {
            return Err(out_of_range(register));
        };

        *slot = value;
        Ok(())
    }
}

fn out_of_range(register: usize) -> Fault {
    Fault::new(
        FaultKind::Internal,
        format!("Register r{register} out of range"),
    )
}

fn reg_operand(operand: &Option<Operand>) -> Result<usize, Fault> {
    operand
        .as_ref()
        .and_then(Operand::as_reg)
        .map(Reg::index)
        .ok_or_else(|| Fault::new(FaultKind::Internal, "Operand is not a register"))
}

fn sym_operand(operand: &Option<Operand>) -> Result<&str, Fault> {
    operand
        .as_ref()
        .and_then(Operand::as_sym)
        .ok_or_else(|| Fault::new(FaultKind::Internal, "Operand is not a symbol"))
}

fn imm_operand(operand: &Option<Operand>) -> Result<Value, Fault> {
    match operand {
        Some(Operand::Imm(value)) => Ok(value.clone()),
        _ => Err(Fault::new(FaultKind::Internal, "Operand is not immediate")),
    }
}

fn target_operand(operand: &Option<Operand>) -> Result<usize, Fault> {
    operand
        .as_ref()
        .and_then(Operand::as_index)
        .ok_or_else(|| Fault::new(FaultKind::Internal, "Unpatched jump target"))
}

fn binary_operation(op: Opcode, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    use std::cmp::Ordering;

    match op {
        Opcode::Add => value::add(lhs, rhs),
        Opcode::Sub => value::sub(lhs, rhs),
        Opcode::Mul => value::mul(lhs, rhs),
        Opcode::Div => value::div(lhs, rhs),
        Opcode::Pow => value::pow(lhs, rhs),
        Opcode::And => Ok(Value::Bool(lhs.truthy() && rhs.truthy())),
        Opcode::Or => Ok(Value::Bool(lhs.truthy() || rhs.truthy())),
        Opcode::Eq => Ok(Value::Bool(lhs == rhs)),
        Opcode::Ne => Ok(Value::Bool(lhs != rhs)),
        Opcode::Lt => Ok(Value::Bool(
            value::ordering("<", lhs, rhs)? == Ordering::Less,
        )),
        Opcode::Gt => Ok(Value::Bool(
            value::ordering(">", lhs, rhs)? == Ordering::Greater,
        )),
        Opcode::Le => Ok(Value::Bool(
            value::ordering("<=", lhs, rhs)? != Ordering::Greater,
        )),
        Opcode::Ge => Ok(Value::Bool(
            value::ordering(">=", lhs, rhs)? != Ordering::Less,
        )),
        _ => Err(Fault::new(FaultKind::Internal, "Not a binary opcode")),
    }
}
