//! Compiler and register VM for the Rill language.
//!
//! Source text is lexed, parsed, semantically checked, constant-folded,
//! lowered to a flat three-address IR, optionally optimized through a CFG
//! (unreachable-block pruning and liveness-driven dead-store elimination),
//! register-allocated by linear scan with spilling, and executed.

pub mod backend;
pub mod frontend;
pub mod index;
pub mod middle;
pub mod runtime;

use crate::{
    backend::{
        ast_lowering::LoweringContext, cfg::build_cfg, liveness, regalloc::linear_scan_allocate,
        Instruction,
    },
    frontend::{parser::Parser, SourceFile},
    middle::{fold::fold_module, resolve::Resolver, SemanticError},
    runtime::builtins::Registry,
};

pub struct CompileOptions {
    /// Size of the physical register bank. Small banks spill more but
    /// never fail allocation.
    pub num_regs: usize,
    /// Whether to run the CFG optimization stage
    pub optimize: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            num_regs: 16,
            optimize: true,
        }
    }
}

/// Runs the whole compilation pipeline, producing the register-assigned
/// instruction stream ready for [`runtime::vm::Vm::run`].
pub fn compile(
    source: &SourceFile,
    builtins: &Registry,
    options: &CompileOptions,
) -> Result<Vec<Instruction>, SemanticError> {
    let module = Parser::parse_module(source);
    let resolutions = Resolver::resolve_module(&module, source, builtins)?;
    let module = fold_module(module);

    let ir = LoweringContext::lower_module(&module, &resolutions, builtins);

    let code = if options.optimize {
        let mut cfg = build_cfg(&ir.code);
        liveness::optimize(&mut cfg);
        cfg.flatten()
    } else {
        ir.code
    };

    Ok(linear_scan_allocate(&code, options.num_regs))
}
