//! Human-readable listings of each stage's output: the flat IR, the CFG
//! with its edges, and the register-assigned stream. Diagnostic surface
//! only, not a stable format.

use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    backend::{cfg::Cfg, Instruction, Opcode, Operand, Reg},
    index::Index,
};

impl core::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("r{}", self.index()).yellow())
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{reg}"),
            Operand::Imm(value) => write!(f, "{}", value.to_string().purple()),
            Operand::Sym(name) => write!(f, "{}", name.blue()),
        }
    }
}

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op.mnemonic().cyan())?;

        for operand in [&self.a, &self.b, &self.c].into_iter().flatten() {
            write!(f, " {operand}")?;
        }

        if !self.args.is_empty() {
            write!(
                f,
                " [{}]",
                self.args.iter().map(|reg| reg.to_string()).join(", ")
            )?;
        }

        if !self.params.is_empty() {
            write!(f, " ({})", self.params.join(", ").white())?;
        }

        if !self.fields.is_empty() {
            write!(f, " {{{}}}", self.fields.join(", ").white())?;
        }

        if self.op == Opcode::StructDef && !self.methods.is_empty() {
            write!(f, " <{}>", self.methods.join(", ").white())?;
        }

        Ok(())
    }
}

/// Numbered listing of a flat instruction stream
pub fn ir_listing(code: &[Instruction]) -> String {
    let mut listing = String::new();

    for (index, instruction) in code.iter().enumerate() {
        let _ = writeln!(listing, "{index:>4} {instruction}");
    }

    listing
}

/// Per-block listing with successor edges and live-out sets
pub fn cfg_listing(cfg: &Cfg) -> String {
    let mut listing = String::new();

    for block in &cfg.blocks {
        let _ = writeln!(
            listing,
            "{} {}",
            format!("bb{}:", block.id.index()).bright_red(),
            format!("(start {})", block.start).white()
        );

        for instruction in &block.instructions {
            let _ = writeln!(listing, "    {instruction}");
        }

        let successors = block
            .successors
            .iter()
            .map(|id| format!("bb{}", id.index()))
            .join(", ");

        let _ = writeln!(
            listing,
            "    {} {}",
            "->".white(),
            if successors.is_empty() {
                "(none)".to_owned()
            } else {
                successors
            }
        );

        if !block.live_out.is_empty() {
            let _ = writeln!(
                listing,
                "    {} {}",
                "live-out:".white(),
                block
                    .live_out
                    .iter()
                    .sorted()
                    .map(|reg| reg.to_string())
                    .join(", ")
            );
        }
    }

    listing
}
