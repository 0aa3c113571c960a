//! Liveness-driven cleanup over the CFG: unreachable blocks are dropped,
//! a backward dataflow fixpoint computes per-block live-in/live-out sets,
//! and each block is then scanned in reverse to discard stores no later
//! instruction can observe.

use std::collections::VecDeque;

use hashbrown::HashSet;

use crate::backend::{
    cfg::{BlockId, Cfg},
    Opcode, Operand,
};

/// Runs the whole optimization stage in order. Unreachable blocks go first
/// so they don't pollute the live sets.
pub fn optimize(cfg: &mut Cfg) {
    remove_unreachable(cfg);
    compute_liveness(cfg);
    eliminate_dead_stores(cfg);
}

/// Breadth-first reachability over successor edges. Function and method
/// regions are only entered through `CALL`, which names its target by
/// symbol rather than by edge, so any block carrying a `LABEL` (or a
/// `STRUCT_DEF`, which the VM's load-time scan must see) counts as a root
/// alongside the entry.
pub fn remove_unreachable(cfg: &mut Cfg) {
    let mut queue: VecDeque<BlockId> = cfg
        .blocks
        .iter()
        .filter(|block| {
            block.id == cfg.entry
                || block
                    .instructions
                    .iter()
                    .any(|i| matches!(i.op, Opcode::Label | Opcode::StructDef))
        })
        .map(|block| block.id)
        .collect();

    let mut visited: HashSet<BlockId> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }

        if let Some(block) = cfg.block(id) {
            queue.extend(&block.successors);
        }
    }

    cfg.blocks.retain(|block| visited.contains(&block.id));

    for block in &mut cfg.blocks {
        block.successors.retain(|id| visited.contains(id));
        block.predecessors.retain(|id| visited.contains(id));
    }
}

/// Standard backward dataflow to a fixpoint:
///
/// ```text
/// live_out[B] = union(live_in[S] for S in succs[B])
/// live_in[B]  = ue_vars[B] | (live_out[B] - defs[B])
/// ```
pub fn compute_liveness(cfg: &mut Cfg) {
    for block in &mut cfg.blocks {
        block.live_in.clear();
        block.live_out.clear();
        block.ue_vars.clear();
        block.defs.clear();

        for instruction in &block.instructions {
            for reg in instruction.uses() {
                if !block.defs.contains(&reg) {
                    block.ue_vars.insert(reg);
                }
            }

            for reg in instruction.defs() {
                block.defs.insert(reg);
            }
        }
    }

    let mut changed = true;

    while changed {
        changed = false;

        for index in (0..cfg.blocks.len()).rev() {
            let mut new_out: HashSet<_> = HashSet::new();

            for successor in cfg.blocks[index].successors.clone() {
                if let Some(position) = cfg.position_of(successor) {
                    new_out.extend(cfg.blocks[position].live_in.iter().copied());
                }
            }

            let block = &mut cfg.blocks[index];

            let new_in: HashSet<_> = block
                .ue_vars
                .iter()
                .chain(new_out.difference(&block.defs))
                .copied()
                .collect();

            if new_in != block.live_in || new_out != block.live_out {
                block.live_in = new_in;
                block.live_out = new_out;
                changed = true;
            }
        }
    }
}

/// Reverse scan per block, keeping an instruction when it has inherent
/// side effects or defines a register some later instruction (or a
/// successor block) still needs. Purely local: the inter-block facts come
/// in through the already-computed `live_out` sets.
pub fn eliminate_dead_stores(cfg: &mut Cfg) {
    // A variable store only matters if the variable is read somewhere in
    // the program
    let mut read_vars: HashSet<String> = HashSet::new();

    for block in &cfg.blocks {
        for instruction in &block.instructions {
            if instruction.op == Opcode::LoadVar {
                if let Some(name) = instruction.b.as_ref().and_then(Operand::as_sym) {
                    read_vars.insert(name.to_owned());
                }
            }
        }
    }

    for block in &mut cfg.blocks {
        let mut needed = block.live_out.clone();
        let mut kept = Vec::with_capacity(block.instructions.len());

        for instruction in block.instructions.drain(..).rev() {
            let defs = instruction.defs();

            let has_side_effect = match instruction.op {
                Opcode::Call
                | Opcode::CallBuiltin
                | Opcode::CallMethod
                | Opcode::Return
                | Opcode::Jump
                | Opcode::JumpIfTrue
                | Opcode::JumpIfFalse
                | Opcode::Label
                | Opcode::StructDef
                | Opcode::SpillStore
                | Opcode::SpillLoad => true,
                Opcode::StoreVar => instruction
                    .a
                    .as_ref()
                    .and_then(Operand::as_sym)
                    .is_some_and(|name| read_vars.contains(name)),
                _ => false,
            };

            if has_side_effect || defs.iter().any(|reg| needed.contains(reg)) {
                // A definition satisfies, and resets, the need; it comes
                // off before the uses go on so an instruction reading its
                // own destination (`AND r, r, c`) keeps that input alive
                for reg in defs {
                    needed.remove(&reg);
                }

                for reg in instruction.uses() {
                    needed.insert(reg);
                }

                kept.push(instruction);
            }
        }

        kept.reverse();
        block.instructions = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ast_lowering::LoweringContext, cfg::build_cfg, Instruction};
    use crate::{
        frontend::{parser::Parser, SourceFile},
        middle::resolve::Resolver,
        runtime::builtins::Registry,
    };

    fn lower(text: &str) -> Vec<Instruction> {
        let source = SourceFile::from_memory(text);
        let module = Parser::parse_module(&source);
        let builtins = Registry::new();
        let resolutions = Resolver::resolve_module(&module, &source, &builtins).unwrap();
        LoweringContext::lower_module(&module, &resolutions, &builtins).code
    }

    fn optimized(text: &str) -> Cfg {
        let code = lower(text);
        let mut cfg = build_cfg(&code);
        optimize(&mut cfg);
        cfg
    }

    #[test]
    fn entry_block_has_no_live_ins() {
        // Every register is defined before use, so nothing flows into the
        // entry from nowhere
        let cfg = optimized("x = 1 y = x + 2 print(y)");
        let entry = cfg.block(cfg.entry).unwrap();

        assert!(entry.live_in.is_empty());
    }

    #[test]
    fn short_circuit_destinations_cross_block_boundaries() {
        // `or` copies the left value into its destination before the
        // branch and reads it at the join, so the register is live-out
        // of the branching block
        let cfg = optimized("a = true b = a or false print(b)");

        let has_nonempty_out = cfg.blocks.iter().any(|b| !b.live_out.is_empty());
        assert!(has_nonempty_out);
    }

    #[test]
    fn loops_converge_to_a_fixpoint() {
        let cfg = optimized("i = 0 while i < 3 { i = i + 1 } print(i)");

        // Loop state travels through the variable environment, so the
        // cyclic blocks settle with in/out sets consistent with the
        // transfer equations
        for block in &cfg.blocks {
            for reg in &block.live_in {
                assert!(block.ue_vars.contains(reg) || !block.defs.contains(reg));
            }
        }
    }

    #[test]
    fn dead_stores_are_removed() {
        // `y` is never read: its store and the load feeding it both go
        let code = lower("x = 1 y = 2 print(x)");
        let mut cfg = build_cfg(&code);
        optimize(&mut cfg);

        let remaining = cfg.flatten();

        let stores: Vec<_> = remaining
            .iter()
            .filter(|i| i.op == Opcode::StoreVar)
            .filter_map(|i| i.a.as_ref().and_then(Operand::as_sym))
            .collect();

        assert_eq!(stores, vec!["x"]);
        assert!(remaining.len() < code.len());
    }

    #[test]
    fn stores_to_read_variables_survive() {
        let cfg = optimized("x = 1 print(x)");
        let remaining = cfg.flatten();

        assert!(remaining
            .iter()
            .any(|i| i.op == Opcode::StoreVar
                && i.a.as_ref().and_then(Operand::as_sym) == Some("x")));
    }

    #[test]
    fn dead_store_elimination_is_idempotent() {
        let code = lower("x = 1 y = 2 z = x + 1 while z < 5 { z = z + 1 } print(z)");

        let mut once = build_cfg(&code);
        optimize(&mut once);
        let once = once.flatten();

        let mut twice = build_cfg(&code);
        optimize(&mut twice);
        eliminate_dead_stores(&mut twice);
        let twice = twice.flatten();

        assert_eq!(once, twice);
    }

    #[test]
    fn function_regions_survive_reachability() {
        // `f` is only reachable through its CALL symbol, not a CFG edge
        let cfg = optimized("x = f() print(x) fn f() { return 7 }");
        let remaining = cfg.flatten();

        assert!(remaining
            .iter()
            .any(|i| i.op == Opcode::Label
                && i.a.as_ref().and_then(Operand::as_sym) == Some("f")));
    }

    #[test]
    fn code_after_a_return_is_unreachable() {
        let code = lower("fn f() { return 1 } x = f() print(x)");

        let mut cfg = build_cfg(&code);
        let before = cfg.blocks.len();
        remove_unreachable(&mut cfg);

        // Every remaining block is reachable from a root
        assert!(cfg.blocks.len() <= before);

        let mut visited = HashSet::new();
        let mut queue: VecDeque<BlockId> = cfg
            .blocks
            .iter()
            .filter(|b| {
                b.id == cfg.entry
                    || b.instructions
                        .iter()
                        .any(|i| matches!(i.op, Opcode::Label | Opcode::StructDef))
            })
            .map(|b| b.id)
            .collect();

        while let Some(id) = queue.pop_front() {
            if visited.insert(id) {
                if let Some(block) = cfg.block(id) {
                    queue.extend(&block.successors);
                }
            }
        }

        for block in &cfg.blocks {
            assert!(visited.contains(&block.id));
        }
    }

}
