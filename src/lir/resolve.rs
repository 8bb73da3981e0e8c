//! Data-flow resolution and spill-slot coloring. After splitting, the
//! location of a value can differ between the two ends of a CFG edge;
//! resolution inserts the bridging move in a gap on the right side of the
//! edge, drops gotos onto fall-through successors, and wires every other
//! control instruction to its target labels. Spilled intervals then get
//! stack slots from a second, much simpler linear scan.

use hashbrown::HashMap;
use log::debug;

use crate::lir::{
    linear_scan::{shuffle_intervals, Allocator},
    IntervalId, LOpcode, Lir, UseKind,
};

pub fn resolve_data_flow(alloc: &mut Allocator, lir: &mut Lir) {
    let mut moves = 0usize;

    for oi in 0..lir.order.len() {
        let block = lir.order[oi];
        let succs = lir.block(block).succs.clone();
        let succ_count = succs.len();

        for succ in succs {
            let mut gap = None;

            // Create movements for non-matching parts of split intervals
            let live_in: Vec<IntervalId> = lir.block(succ).live_in.iter().copied().collect();
            for interval in live_in {
                let parent = lir.interval(interval).split_parent.unwrap_or(interval);

                // Intervals that were never split resolve themselves
                if lir.interval(parent).split_children.is_empty() {
                    continue;
                }

                let left = lir.child_at(parent, lir.block(block).end_id);
                let right = lir.child_at(parent, lir.block(succ).start_id);

                if left != right {
                    let gap = *gap.get_or_insert_with(|| {
                        let pos = if succ_count == 2 {
                            // The move belongs to the branch edge, so it
                            // goes into the successor
                            lir.block(succ).start_id + 1
                        } else {
                            // Or right before the join
                            lir.block(block).end_id - 1
                        };
                        alloc.get_gap(lir, pos)
                    });

                    let from = lir.add_use(left, UseKind::Any, gap);
                    let to = lir.add_use(right, UseKind::Any, gap);
                    lir.instr_mut(gap).moves.push((from, to));
                    moves += 1;
                }
            }

            // Remove gotos onto adjacent blocks, wire labels elsewhere
            let control = *lir.block(block).instructions.last().unwrap();
            assert!(
                lir.instr(control).opcode.is_control(),
                "block not ended by a control instruction"
            );

            let falls_through = lir.instr(control).opcode == LOpcode::Goto
                && lir.order.get(oi + 1) == Some(&succ);

            if falls_through {
                lir.block_mut(block).instructions.pop();
            } else {
                let label = lir.block(succ).label;
                lir.instr_mut(control).target_labels.push(label);
            }
        }
    }

    debug!("resolve: inserted {moves} edge moves");
}

/// Second linear scan: assign stack slots to everything `Allocator::spill`
/// queued, reusing released slots whenever the liveness allows it.
pub fn allocate_spills(alloc: &mut Allocator, lir: &mut Lir) {
    alloc
        .unhandled_spills
        .sort_by_key(|id| lir.interval(*id).start());

    while !alloc.unhandled_spills.is_empty() {
        let current = alloc.unhandled_spills.remove(0);
        let pos = lir.interval(current).start();

        let mut free = std::mem::take(&mut alloc.free_spills);
        shuffle_intervals(
            lir,
            &mut alloc.active_spills,
            &mut alloc.inactive_spills,
            Some(&mut free),
            pos,
        );
        alloc.free_spills = free;

        // Try the pool of released slots first
        if !alloc.free_spills.is_empty() {
            let mut found = None;
            while let Some(candidate) = alloc.free_spills.pop() {
                let mut usable = true;

                for active in &alloc.active_spills {
                    if lir.interval(*active).is_equal(lir.interval(candidate)) {
                        usable = false;
                    }
                }
                for inactive in &alloc.inactive_spills {
                    if lir.interval(*inactive).is_equal(lir.interval(candidate))
                        && lir
                            .interval(*inactive)
                            .find_intersection(lir.interval(current))
                            .is_some()
                    {
                        usable = false;
                    }
                }

                if usable {
                    found = Some(candidate);
                    break;
                }
            }

            if let Some(found) = found {
                let slot = lir.interval(found).index;
                lir.interval_mut(current).spill_to(slot);
                alloc.active_spills.push(current);
                continue;
            }
        }

        // Reuse the lowest slot nothing overlapping holds right now
        let mut blocked: HashMap<i32, IntervalId> = HashMap::new();
        let mut max_index = 0;

        for active in &alloc.active_spills {
            let index = lir.interval(*active).index;
            blocked.insert(index, *active);
            if index > max_index {
                max_index = index;
            }
        }
        for inactive in &alloc.inactive_spills {
            if lir
                .interval(*inactive)
                .find_intersection(lir.interval(current))
                .is_some()
            {
                let index = lir.interval(*inactive).index;
                blocked.insert(index, *inactive);
                if index > max_index {
                    max_index = index;
                }
            }
        }

        for i in 0..max_index {
            if !blocked.contains_key(&i) {
                lir.interval_mut(current).spill_to(i);
                alloc.active_spills.push(current);
                break;
            }
        }

        if lir.interval(current).index != -1 {
            continue;
        }

        // Allocate a brand new slot
        let slot = alloc.spill_index;
        alloc.spill_index += 1;
        lir.interval_mut(current).spill_to(slot);
        alloc.active_spills.push(current);
    }

    lir.spill_count = alloc.spill_index as usize;
    debug!("spills: {} stack slots", lir.spill_count);
}
