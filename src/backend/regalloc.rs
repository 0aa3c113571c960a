//! Linear-scan register allocation over textual live ranges, with
//! spill-to-memory fallback. One range per virtual register (first to last
//! def/use index); ranges are walked in start order against a free pool of
//! `num_regs` physical registers, and when the pool runs dry the range
//! with the furthest end (the current one included) is spilled to a slot.
//!
//! The rewrite pass then materializes spilled registers through scratch
//! registers numbered from `num_regs` upward: every use is preceded by a
//! `SPILL_LOAD (slot, scratch)` and every definition followed by a
//! `SPILL_STORE (slot, scratch)`. Allocation therefore never fails; a tiny
//! bank just spills more.

use hashbrown::HashMap;

use crate::{
    backend::{cfg::jump_target, Instruction, Opcode, Operand, Reg},
    index::Index,
};

#[derive(Debug)]
pub struct LiveRange {
    pub reg: Reg,
    /// First instruction index where the register is defined or used
    pub start: usize,
    /// Last instruction index where the register is defined or used
    pub end: usize,
    pub phys: Option<Reg>,
    pub slot: Option<usize>,
}

/// Derives one live range per virtual register from the def/use table
pub fn compute_live_ranges(code: &[Instruction]) -> Vec<LiveRange> {
    let mut first: HashMap<Reg, usize> = HashMap::new();
    let mut last: HashMap<Reg, usize> = HashMap::new();

    for (i, instruction) in code.iter().enumerate() {
        for reg in instruction.defs().into_iter().chain(instruction.uses()) {
            first.entry(reg).or_insert(i);
            last.insert(reg, i);
        }
    }

    let mut ranges: Vec<LiveRange> = first
        .into_iter()
        .map(|(reg, start)| LiveRange {
            reg,
            start,
            end: last[&reg],
            phys: None,
            slot: None,
        })
        .collect();

    ranges.sort_by_key(|range| (range.start, range.reg));
    ranges
}

/// Walks the ranges in start order, assigning physical registers from the
/// free pool and spilling with the furthest-end heuristic when it runs
/// dry. Spill slots are handed out in spill order and never reused.
fn assign_locations(ranges: &mut [LiveRange], num_regs: usize) {
    // Indices into `ranges`, kept sorted by range end
    let mut active: Vec<usize> = Vec::new();
    let mut free_regs: Vec<Reg> = (0..num_regs).rev().map(Reg::new).collect();
    let mut next_slot = 0;

    for current in 0..ranges.len() {
        let start = ranges[current].start;

        // Expire ranges that ended before this one starts
        active.retain(|&index| {
            if ranges[index].end >= start {
                true
            } else {
                free_regs.push(ranges[index].phys.unwrap());
                false
            }
        });

        if let Some(reg) = free_regs.pop() {
            ranges[current].phys = Some(reg);

            let end = ranges[current].end;
            let position = active.partition_point(|&index| ranges[index].end <= end);
            active.insert(position, current);
            continue;
        }

        // No free register: spill whichever of active + current ends
        // furthest away
        let furthest = active.last().copied();

        match furthest {
            Some(victim) if ranges[victim].end > ranges[current].end => {
                let reg = ranges[victim].phys.take().unwrap();
                ranges[victim].slot = Some(next_slot);
                next_slot += 1;

                active.pop();
                ranges[current].phys = Some(reg);

                let end = ranges[current].end;
                let position = active.partition_point(|&index| ranges[index].end <= end);
                active.insert(position, current);
            }
            _ => {
                // The current range itself is the furthest (or nothing is
                // active): it never occupies a register
                ranges[current].slot = Some(next_slot);
                next_slot += 1;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Location {
    Phys(Reg),
    Slot(usize),
}

/// Allocates and rewrites the stream. Every virtual-register reference in
/// the result resolves to a concrete physical register index; spilled
/// registers travel through scratch registers above the allocatable bank.
pub fn linear_scan_allocate(code: &[Instruction], num_regs: usize) -> Vec<Instruction> {
    let mut ranges = compute_live_ranges(code);
    assign_locations(&mut ranges, num_regs);

    let locations: HashMap<Reg, Location> = ranges
        .iter()
        .map(|range| {
            let location = match (range.phys, range.slot) {
                (Some(reg), None) => Location::Phys(reg),
                (None, Some(slot)) => Location::Slot(slot),
                _ => unreachable!("live range left unassigned"),
            };

            (range.reg, location)
        })
        .collect();

    // Spilled operands grow an instruction into a group of
    // loads + instruction + stores; jump targets must land on the group
    // start so a branched-to instruction still sees its reloads
    let mut group_start = Vec::with_capacity(code.len());
    let mut next_index = 0;

    for instruction in code {
        let (loads, stores) = spill_traffic(instruction, &locations);
        group_start.push(next_index);
        next_index += loads + 1 + stores;
    }

    let mut rewritten = Vec::with_capacity(next_index);

    for instruction in code {
        let spilled_uses = distinct_spilled(instruction.uses(), &locations);
        let spilled_defs = distinct_spilled(instruction.defs(), &locations);

        // One scratch per distinct spilled register in this instruction;
        // a register both used and defined shares its scratch
        let mut scratch: HashMap<Reg, Reg> = HashMap::new();

        for reg in spilled_uses.iter().chain(&spilled_defs) {
            let next = Reg::new(num_regs + scratch.len());
            scratch.entry(*reg).or_insert(next);
        }

        for reg in &spilled_uses {
            let Location::Slot(slot) = locations[reg] else {
                unreachable!()
            };

            rewritten.push(Instruction::new(
                Opcode::SpillLoad,
                Some(Operand::index(slot)),
                Some(Operand::Reg(scratch[reg])),
                None,
            ));
        }

        let mut instruction = instruction.clone();

        if let Some(target) = jump_target(&instruction) {
            // A target at or past the end of the stream means "halt";
            // keep it past the end of the grown stream too
            let mapped = group_start.get(target).copied().unwrap_or(next_index);

            match instruction.op {
                Opcode::Jump => instruction.a = Some(Operand::index(mapped)),
                _ => instruction.b = Some(Operand::index(mapped)),
            }
        }

        instruction.rewrite_registers(|reg| match scratch.get(&reg) {
            Some(scratch_reg) => *scratch_reg,
            None => match locations[&reg] {
                Location::Phys(phys) => phys,
                Location::Slot(_) => unreachable!("spilled register missed a scratch"),
            },
        });

        rewritten.push(instruction);

        for reg in &spilled_defs {
            let Location::Slot(slot) = locations[reg] else {
                unreachable!()
            };

            rewritten.push(Instruction::new(
                Opcode::SpillStore,
                Some(Operand::index(slot)),
                Some(Operand::Reg(scratch[reg])),
                None,
            ));
        }
    }

    rewritten
}

fn distinct_spilled(regs: Vec<Reg>, locations: &HashMap<Reg, Location>) -> Vec<Reg> {
    let mut distinct = Vec::new();

    for reg in regs {
        if matches!(locations.get(&reg), Some(Location::Slot(_))) && !distinct.contains(&reg) {
            distinct.push(reg);
        }
    }

    distinct
}

fn spill_traffic(
    instruction: &Instruction,
    locations: &HashMap<Reg, Location>,
) -> (usize, usize) {
    (
        distinct_spilled(instruction.uses(), locations).len(),
        distinct_spilled(instruction.defs(), locations).len(),
    )
}
