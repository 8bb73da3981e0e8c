//! Liveness analysis and live-interval construction. Local gen/kill sets
//! per block, a backward fixed point for the global sets, then one reverse
//! walk that turns positions into sorted, disjoint ranges per interval.

use log::trace;

use crate::lir::{IntervalId, Lir, UseKind};

pub fn compute_local_live_sets(lir: &mut Lir) {
    for oi in 0..lir.order.len() {
        let block = lir.order[oi];

        for ii in 0..lir.block(block).instructions.len() {
            let instr = lir.block(block).instructions[ii];

            // Inputs to live_gen, unless something earlier killed them
            for i in 0..lir.instr(instr).inputs.len() {
                let interval = lir.use_(lir.instr(instr).inputs[i]).interval;
                if !lir.block(block).live_kill.contains(&interval) {
                    lir.block_mut(block).live_gen.insert(interval);
                }
            }

            // Scratches to live_kill
            for i in 0..lir.instr(instr).scratches.len() {
                let interval = lir.use_(lir.instr(instr).scratches[i]).interval;
                lir.block_mut(block).live_kill.insert(interval);
            }

            // Result to live_kill
            if let Some(result) = lir.instr(instr).result {
                let interval = lir.use_(result).interval;
                lir.block_mut(block).live_kill.insert(interval);
            }
        }
    }
}

pub fn compute_global_live_sets(lir: &mut Lir) {
    let mut change = true;
    while change {
        change = false;

        // Traverse blocks in reverse order
        for oi in (0..lir.order.len()).rev() {
            let block = lir.order[oi];

            // Every successor's live_in adds to this block's live_out
            let mut incoming: Vec<IntervalId> = Vec::new();
            for si in 0..lir.block(block).succs.len() {
                let succ = lir.block(block).succs[si];
                incoming.extend(lir.block(succ).live_in.iter().copied());
            }
            for interval in incoming {
                if lir.block_mut(block).live_out.insert(interval) {
                    change = true;
                }
            }

            // live_in = live_gen + (live_out - live_kill)
            let gen: Vec<IntervalId> = lir.block(block).live_gen.iter().copied().collect();
            for interval in gen {
                if lir.block_mut(block).live_in.insert(interval) {
                    change = true;
                }
            }

            let out: Vec<IntervalId> = lir.block(block).live_out.iter().copied().collect();
            for interval in out {
                if !lir.block(block).live_kill.contains(&interval)
                    && lir.block_mut(block).live_in.insert(interval)
                {
                    change = true;
                }
            }
        }
    }
}

/// Walks blocks in reverse emission order building ranges: whole-block
/// ranges for live-out intervals first, then per-instruction adjustments
/// walking tail-first (call clobbers, result shortening, scratch slivers,
/// input extension to block start).
pub fn build_intervals(lir: &mut Lir) {
    for oi in (0..lir.order.len()).rev() {
        let block = lir.order[oi];

        // Set the block's start and end instruction ids
        let first = *lir.block(block).instructions.first().unwrap();
        let last = *lir.block(block).instructions.last().unwrap();
        lir.block_mut(block).start_id = lir.instr(first).id;
        lir.block_mut(block).end_id = lir.instr(last).id;

        let start_id = lir.block(block).start_id;
        let end_id = lir.block(block).end_id;

        // Add the full block range to intervals that live out of this
        // block; it is shortened later if a definition turns up
        let live_out: Vec<IntervalId> = lir.block(block).live_out.iter().copied().collect();
        for interval in live_out {
            lir.interval_mut(interval).add_range(start_id, end_id + 2);
        }

        for ii in (0..lir.block(block).instructions.len()).rev() {
            let instr = lir.block(block).instructions[ii];
            let id = lir.instr(instr).id;

            if lir.instr(instr).has_call {
                for r in 0..crate::lir::NUM_REGISTERS {
                    let reg = lir.registers[r];
                    if lir.interval(reg).covers(id) {
                        continue;
                    }
                    lir.interval_mut(reg).add_range(id, id + 1);
                    lir.add_use(reg, UseKind::Register, instr);
                }
            }

            if let Some(result) = lir.instr(instr).result {
                let res = lir.use_(result).interval;

                // The result lives only at the instruction itself unless
                // later uses extended it already
                if lir.interval(res).ranges.is_empty() {
                    lir.interval_mut(res).add_range(id, id + 1);
                } else if !lir.block(block).live_in.contains(&res) {
                    // Shorten the first range down to the definition
                    lir.interval_mut(res).ranges[0].start = id;
                }
            }

            // Scratches are live only right before the instruction, so
            // fixed intervals won't spill them
            for i in 0..lir.instr(instr).scratches.len() {
                let interval = lir.use_(lir.instr(instr).scratches[i]).interval;
                lir.interval_mut(interval).add_range(id - 1, id);
            }

            // Inputs are initially live from the block start up to the
            // instruction; covered inputs were extended by later code
            for i in 0..lir.instr(instr).inputs.len() {
                let interval = lir.use_(lir.instr(instr).inputs[i]).interval;
                if !lir.interval(interval).covers(id - 1) {
                    lir.interval_mut(interval).add_range(start_id, id);
                }
            }
        }
    }

    trace!(
        "liveness: {} intervals built over {} positions",
        lir.intervals.len(),
        lir.order
            .last()
            .map(|b| lir.block(*b).end_id + 2)
            .unwrap_or(0)
    );
}
