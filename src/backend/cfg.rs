//! Partitions a flat instruction stream into basic blocks and wires the
//! control-flow edges between them. Two passes: the first computes the
//! leader set (stream start, jump targets, and the instruction after each
//! terminator), the second slices the stream at leader boundaries and
//! connects the edges.

use std::collections::BTreeSet;

use hashbrown::{HashMap, HashSet};

use crate::{
    backend::{Instruction, Opcode, Operand, Reg},
    index::simple_index,
};

simple_index! {
    /// Identifies a basic block. Ids stay stable across unreachable-block
    /// removal, so they are not positions into the block list.
    pub struct BlockId;
}

#[derive(Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Index of this block's leader in the stream the CFG was built from;
    /// used to remap jump targets when flattening back
    pub start: usize,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,

    /* Liveness facts, filled in by the optimization stage */
    pub live_in: HashSet<Reg>,
    pub live_out: HashSet<Reg>,
    pub(crate) ue_vars: HashSet<Reg>,
    pub(crate) defs: HashSet<Reg>,
}

impl BasicBlock {
    fn new(id: BlockId, start: usize, instructions: Vec<Instruction>) -> Self {
        Self {
            id,
            start,
            instructions,
            successors: Vec::new(),
            predecessors: Vec::new(),
            live_in: HashSet::new(),
            live_out: HashSet::new(),
            ue_vars: HashSet::new(),
            defs: HashSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct Cfg {
    /// Blocks in original program order; a total partition of the stream
    /// at construction time
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
}

/// The backpatched target of a jump instruction, if it carries one
pub(crate) fn jump_target(instruction: &Instruction) -> Option<usize> {
    match instruction.op {
        Opcode::Jump => instruction.a.as_ref().and_then(Operand::as_index),
        Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
            instruction.b.as_ref().and_then(Operand::as_index)
        }
        _ => None,
    }
}

pub fn build_cfg(code: &[Instruction]) -> Cfg {
    /* Pass 1: leaders */

    let mut leaders = BTreeSet::from([0]);

    for (i, instruction) in code.iter().enumerate() {
        if instruction.op.is_terminator() && i + 1 < code.len() {
            leaders.insert(i + 1);
        }

        // Out-of-range targets are silently skipped; the generator never
        // produces them
        if let Some(target) = jump_target(instruction) {
            if target < code.len() {
                leaders.insert(target);
            }
        }
    }

    /* Pass 2: slice into blocks and wire edges */

    let leaders: Vec<usize> = leaders.into_iter().collect();
    let mut blocks = Vec::with_capacity(leaders.len());
    let mut block_at: HashMap<usize, BlockId> = HashMap::new();

    for (index, &start) in leaders.iter().enumerate() {
        let end = leaders.get(index + 1).copied().unwrap_or(code.len());
        let id = BlockId(index as u32);

        blocks.push(BasicBlock::new(id, start, code[start..end].to_vec()));
        block_at.insert(start, id);
    }

    let mut cfg = Cfg {
        blocks,
        entry: BlockId(0),
    };

    for index in 0..leaders.len() {
        let end = leaders.get(index + 1).copied().unwrap_or(code.len());

        let Some(last) = cfg.blocks[index].instructions.last() else {
            continue;
        };

        let last_op = last.op;
        let target = jump_target(last);

        match last_op {
            Opcode::Jump => {
                if let Some(&destination) = target.and_then(|t| block_at.get(&t)) {
                    cfg.add_edge(BlockId(index as u32), destination);
                }
            }
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                // Fall-through edge first, then the branch target
                if let Some(&fallthrough) = block_at.get(&end) {
                    cfg.add_edge(BlockId(index as u32), fallthrough);
                }

                if let Some(&destination) = target.and_then(|t| block_at.get(&t)) {
                    cfg.add_edge(BlockId(index as u32), destination);
                }
            }
            Opcode::Return => {}
            _ => {
                if let Some(&fallthrough) = block_at.get(&end) {
                    cfg.add_edge(BlockId(index as u32), fallthrough);
                }
            }
        }
    }

    cfg
}

impl Cfg {
    fn add_edge(&mut self, source: BlockId, destination: BlockId) {
        if let Some(i) = self.position_of(source) {
            self.blocks[i].successors.push(destination);
        }

        if let Some(i) = self.position_of(destination) {
            self.blocks[i].predecessors.push(source);
        }
    }

    /// Position of a block in the list. Blocks stay sorted by id even after
    /// unreachable ones are removed.
    pub(crate) fn position_of(&self, id: BlockId) -> Option<usize> {
        self.blocks.binary_search_by_key(&id, |block| block.id).ok()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.position_of(id).map(|index| &self.blocks[index])
    }

    /// Flattens the blocks back into a flat stream in program order.
    ///
    /// Optimization may have deleted instructions, so absolute jump targets
    /// are remapped: a target is always some block's leader, and becomes
    /// that block's new start index. A target whose block was removed is
    /// only reachable from removed code and is left as-is.
    pub fn flatten(self) -> Vec<Instruction> {
        let mut new_start = HashMap::new();
        let mut length = 0;

        for block in &self.blocks {
            new_start.insert(block.start, length);
            length += block.instructions.len();
        }

        let mut code = Vec::with_capacity(length);

        for block in self.blocks {
            for mut instruction in block.instructions {
                if let Some(target) = jump_target(&instruction) {
                    if let Some(&mapped) = new_start.get(&target) {
                        match instruction.op {
                            Opcode::Jump => instruction.a = Some(Operand::index(mapped)),
                            _ => instruction.b = Some(Operand::index(mapped)),
                        }
                    }
                }

                code.push(instruction);
            }
        }

        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::ast_lowering::LoweringContext,
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

    #[test]
    fn blocks_partition_the_stream_exactly() {
        let code = lower("x = 1 if x > 0 { y = 1 } else { y = 2 } z = 3");
        let cfg = build_cfg(&code);

        let total: usize = cfg.blocks.iter().map(|b| b.instructions.len()).sum();
        assert_eq!(total, code.len());

        // Block starts are contiguous: each begins where the previous ended
        let mut expected_start = 0;
        for block in &cfg.blocks {
            assert_eq!(block.start, expected_start);
            expected_start += block.instructions.len();
        }
    }

    #[test]
    fn conditional_block_gets_fallthrough_then_branch_edge() {
        let code = lower("x = 1 if x > 0 { y = 1 }");
        let cfg = build_cfg(&code);

        let branch_block = cfg
            .blocks
            .iter()
            .find(|b| {
                b.instructions
                    .last()
                    .is_some_and(|i| i.op == Opcode::JumpIfFalse)
            })
            .unwrap();

        assert_eq!(branch_block.successors.len(), 2);

        // Fall-through is the next block in program order
        let fallthrough = cfg.block(branch_block.successors[0]).unwrap();
        assert_eq!(
            fallthrough.start,
            branch_block.start + branch_block.instructions.len()
        );
    }

    #[test]
    fn return_blocks_have_no_successors() {
        let code = lower("fn f() { return 1 } x = f()");
        let cfg = build_cfg(&code);

        for block in &cfg.blocks {
            if block
                .instructions
                .last()
                .is_some_and(|i| i.op == Opcode::Return)
            {
                assert!(block.successors.is_empty());
            }
        }
    }

    #[test]
    fn while_loop_forms_a_back_edge() {
        let code = lower("i = 0 while i < 3 { i = i + 1 }");
        let cfg = build_cfg(&code);

        // Some block's successor precedes it in program order
        let has_back_edge = cfg.blocks.iter().any(|block| {
            block
                .successors
                .iter()
                .any(|succ| cfg.block(*succ).unwrap().start <= block.start)
        });

        assert!(has_back_edge);
    }

    #[test]
    fn flatten_preserves_an_unoptimized_stream() {
        let code = lower("x = 1 if x > 0 { y = 1 } else { y = 2 }");
        let flattened = build_cfg(&code).flatten();

        assert_eq!(flattened, code);
    }
}
