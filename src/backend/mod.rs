//! The backend lowers the checked AST to a linear three-address IR, views
//! it as a control-flow graph for liveness-driven cleanup, and maps its
//! virtual registers onto a fixed physical bank before execution.
//!
//! The flat instruction stream is the common currency: the CFG is a
//! transient view used only by the optimization stage, and is flattened
//! back (in program order) before allocation.

use strum::IntoStaticStr;

use crate::{index::simple_index, runtime::value::Value};

pub mod ast_lowering;
pub mod cfg;
pub mod liveness;
pub mod pretty_print;
pub mod regalloc;

simple_index! {
    /// A register id. The generator hands out monotonically increasing
    /// virtual ids (never reused); after allocation the same operand slots
    /// carry physical register indices.
    pub struct Reg;
}

/// The closed opcode set. Exhaustive matches in the def/use table and the
/// VM dispatch loop make an unknown opcode unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    LoadConst,
    LoadVar,
    StoreVar,
    Move,

    /* Arithmetic and logic */
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Not,
    And,
    Or,

    /* Comparisons */
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    /* Control transfer */
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    Label,
    Call,
    CallBuiltin,
    CallMethod,
    Return,

    /* Aggregates */
    GetAttr,
    BuildList,
    BuildStruct,
    StructDef,

    /* Inserted by the allocator only */
    SpillStore,
    SpillLoad,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }

    /// Ends a basic block
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::Return
        )
    }
}

/// One operand slot: a register, an immediate value, or a raw symbol
/// (label, variable, or member name). Jump targets are immediate integer
/// instruction indices once backpatched.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Reg(Reg),
    Imm(Value),
    Sym(String),
}

impl Operand {
    pub fn index(index: usize) -> Self {
        Operand::Imm(Value::Int(index as i64))
    }

    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn as_sym(&self) -> Option<&str> {
        match self {
            Operand::Sym(name) => Some(name),
            _ => None,
        }
    }

    /// A backpatched jump target, when this operand holds one
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Operand::Imm(Value::Int(i)) if *i >= 0 => Some(*i as usize),
            _ => None,
        }
    }
}

/// An instruction: an opcode plus three generic operand slots. Call-like
/// opcodes carry a variable-length argument-register list, callable labels
/// a parameter-name list, and struct definitions their field/method names;
/// those live beside the slots since they don't fit in three operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: Option<Operand>,
    pub b: Option<Operand>,
    pub c: Option<Operand>,
    pub args: Vec<Reg>,
    pub params: Vec<String>,
    pub fields: Vec<String>,
    pub methods: Vec<String>,
}

impl Instruction {
    pub fn new(op: Opcode, a: Option<Operand>, b: Option<Operand>, c: Option<Operand>) -> Self {
        Self {
            op,
            a,
            b,
            c,
            args: Vec::new(),
            params: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Reg>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.methods = methods;
        self
    }

    /// Registers this instruction writes, per the fixed opcode table
    pub fn defs(&self) -> Vec<Reg> {
        let slot = |operand: &Option<Operand>| operand.as_ref().and_then(Operand::as_reg);

        match self.op {
            Opcode::LoadConst
            | Opcode::LoadVar
            | Opcode::Move
            | Opcode::Neg
            | Opcode::Not
            | Opcode::Add
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
            | Opcode::Ge
            | Opcode::CallMethod
            | Opcode::GetAttr
            | Opcode::BuildList
            | Opcode::BuildStruct => slot(&self.a).into_iter().collect(),
            Opcode::Call | Opcode::CallBuiltin => slot(&self.b).into_iter().collect(),
            Opcode::SpillLoad => slot(&self.b).into_iter().collect(),
            Opcode::StoreVar
            | Opcode::Jump
            | Opcode::JumpIfTrue
            | Opcode::JumpIfFalse
            | Opcode::Label
            | Opcode::Return
            | Opcode::StructDef
            | Opcode::SpillStore => Vec::new(),
        }
    }

    /// Registers this instruction reads, per the fixed opcode table
    pub fn uses(&self) -> Vec<Reg> {
        let slot = |operand: &Option<Operand>| operand.as_ref().and_then(Operand::as_reg);

        let mut uses = match self.op {
            Opcode::Move | Opcode::Neg | Opcode::Not | Opcode::StoreVar | Opcode::SpillStore => {
                slot(&self.b).into_iter().collect()
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
            | Opcode::Ge => slot(&self.b).into_iter().chain(slot(&self.c)).collect(),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::Return => {
                slot(&self.a).into_iter().collect()
            }
            Opcode::CallMethod => slot(&self.b).into_iter().collect(),
            Opcode::GetAttr => slot(&self.b).into_iter().collect(),
            Opcode::LoadConst
            | Opcode::LoadVar
            | Opcode::Jump
            | Opcode::Label
            | Opcode::Call
            | Opcode::CallBuiltin
            | Opcode::BuildList
            | Opcode::BuildStruct
            | Opcode::StructDef
            | Opcode::SpillLoad => Vec::new(),
        };

        uses.extend(&self.args);
        uses
    }

    /// Rewrites every register reference (operand slots and the argument
    /// list) through `map`. Symbol and immediate operands are never
    /// touched: a label or field name is not a register.
    pub fn rewrite_registers(&mut self, mut map: impl FnMut(Reg) -> Reg) {
        for operand in [&mut self.a, &mut self.b, &mut self.c].into_iter().flatten() {
            if let Operand::Reg(reg) = operand {
                *reg = map(*reg);
            }
        }

        for reg in &mut self.args {
            *reg = map(*reg);
        }
    }
}

/// The flat instruction stream under construction, with the virtual
/// register counter. Jumps are emitted with a placeholder target and
/// patched once the destination index is known.
#[derive(Debug, Default)]
pub struct Ir {
    pub code: Vec<Instruction>,
    next_reg: u32,
}

impl Ir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_reg(&mut self) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        reg
    }

    /// Appends an instruction, returning its index (used for backpatching)
    pub fn emit(
        &mut self,
        op: Opcode,
        a: Option<Operand>,
        b: Option<Operand>,
        c: Option<Operand>,
    ) -> usize {
        self.push(Instruction::new(op, a, b, c))
    }

    pub fn push(&mut self, instruction: Instruction) -> usize {
        let position = self.code.len();
        self.code.push(instruction);
        position
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Fills the `a` slot of an emitted-but-incomplete jump
    pub fn patch_a(&mut self, at: usize, target: usize) {
        self.code[at].a = Some(Operand::index(target));
    }

    /// Fills the `b` slot of an emitted-but-incomplete conditional jump
    pub fn patch_b(&mut self, at: usize, target: usize) {
        self.code[at].b = Some(Operand::index(target));
    }
}
