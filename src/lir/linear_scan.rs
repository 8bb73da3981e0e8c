//! Linear-scan register allocation with live-range splitting. Intervals
//! are walked in start order against an active/inactive partition; a free
//! register is taken when one covers enough of the interval, otherwise
//! somebody gets split and spilled. Constant intervals never occupy a
//! register: each real use gets a load rematerialized into a gap instead.

use log::{debug, trace};

use crate::lir::{
    IntervalId, LBlockId, LInstrId, LOpcode, LPayload, Lir, Range, UseId, UseKind, NUM_REGISTERS,
};

pub struct Allocator {
    active: Vec<IntervalId>,
    inactive: Vec<IntervalId>,
    unhandled: Vec<IntervalId>,

    pub(crate) unhandled_spills: Vec<IntervalId>,
    pub(crate) active_spills: Vec<IntervalId>,
    pub(crate) inactive_spills: Vec<IntervalId>,
    pub(crate) free_spills: Vec<IntervalId>,
    pub(crate) spill_index: i32,
}

impl Allocator {
    pub fn new() -> Self {
        Allocator {
            active: Vec::new(),
            inactive: Vec::new(),
            unhandled: Vec::new(),
            unhandled_spills: Vec::new(),
            active_spills: Vec::new(),
            inactive_spills: Vec::new(),
            free_spills: Vec::new(),
            spill_index: 0,
        }
    }

    pub fn walk_intervals(&mut self, lir: &mut Lir) {
        // Populate the worklists. Rematerialization appends intervals
        // while this runs, so the loop re-reads the length.
        let mut i = 0;
        while i < lir.intervals.len() {
            let id = IntervalId(i as u32);
            i += 1;

            // Skip empty intervals
            if lir.interval(id).ranges.is_empty() {
                continue;
            }

            if lir.interval(id).is_fixed() {
                self.inactive.push(id);
            } else if lir.interval(id).is_const() {
                self.rematerialize(lir, id);
            } else if lir.interval(id).is_stack_slot() {
                // Gap scratch slots, already queued for coloring
            } else {
                assert!(lir.interval(id).is_virtual());
                self.unhandled.push(id);
            }
        }

        // Sort by starting position
        self.unhandled.sort_by_key(|id| lir.interval(*id).start());
        self.inactive.sort_by_key(|id| lir.interval(*id).start());

        while !self.unhandled.is_empty() {
            let current = self.unhandled.remove(0);
            let pos = lir.interval(current).start();

            shuffle_intervals(lir, &mut self.active, &mut self.inactive, None, pos);

            // Skip intervals that got spilled while queued
            if !lir.interval(current).is_virtual() {
                continue;
            }

            self.try_allocate_free_reg(lir, current);

            // If allocation has failed, free a register by force
            if !lir.interval(current).is_register() {
                self.allocate_blocked_reg(lir, current);
            }

            let interval = lir.interval(current);
            assert!(interval.is_register() || interval.is_stack_slot());
            if lir.interval(current).is_register() {
                self.active.push(current);
            }
        }

        debug!(
            "linear-scan: {} intervals, {} spill candidates",
            lir.intervals.len(),
            self.unhandled_spills.len()
        );
    }

    /// Replaces every real use of a constant interval with a fresh virtual
    /// register loaded in the preceding gap.
    fn rematerialize(&mut self, lir: &mut Lir, interval: IntervalId) {
        let uses: Vec<UseId> = lir.interval(interval).uses.clone();

        for use_id in uses.into_iter().rev() {
            let use_instr = lir.use_(use_id).instr;

            // Skip the constant's own definition
            if lir.instr(use_instr).result == Some(use_id) {
                continue;
            }
            // Skip uses in movements that were just created
            if lir.instr(use_instr).opcode == LOpcode::Gap {
                continue;
            }

            let pos = lir.instr(use_instr).id;
            let reg = lir.create_virtual();
            let gap = self.get_gap(lir, pos - 1);

            let from = lir.add_use(interval, UseKind::Any, gap);
            let to = lir.add_use(reg, UseKind::Register, gap);
            lir.instr_mut(gap).moves.push((from, to));

            reassign_use(lir, use_id, reg);
            lir.interval_mut(reg).add_range(pos - 1, pos);
        }
    }

    fn try_allocate_free_reg(&mut self, lir: &mut Lir, current: IntervalId) {
        // Initially every register is free for any visible future
        let mut free_pos = [i32::MAX; NUM_REGISTERS];

        // Registers used by active intervals are not free at all
        for active in &self.active {
            let active = lir.interval(*active);
            assert!(active.is_register());
            free_pos[active.index as usize] = 0;
        }

        // Inactive intervals limit availability only where they intersect
        // the current interval
        for inactive in &self.inactive {
            let inactive = lir.interval(*inactive);
            assert!(inactive.is_register());

            let Some(pos) = lir.interval(current).find_intersection(inactive) else {
                continue;
            };
            if free_pos[inactive.index as usize] <= pos {
                continue;
            }
            free_pos[inactive.index as usize] = pos;
        }

        // The register that stays free for the longest wins
        let mut max = -1;
        let mut max_reg = 0;
        for (r, pos) in free_pos.iter().enumerate() {
            if *pos > max {
                max = *pos;
                max_reg = r;
            }
        }
        assert!(max >= 0);

        // Prefer the register hint when it buys enough room
        if let Some(hint) = lir.interval(current).register_hint {
            let hint_interval = lir.use_(hint).interval;
            if lir.interval(hint_interval).is_register() {
                let reg = lir.interval(hint_interval).index as usize;
                if free_pos[reg] - 2 > lir.interval(current).start() {
                    max = free_pos[reg];
                    max_reg = reg;
                }
            }
        }

        // All registers are occupied
        if max - 2 <= lir.interval(current).start() {
            return;
        }

        if max <= lir.interval(current).end() {
            // A split before `max` is needed
            let split_pos = if max % 2 == 0 { max - 1 } else { max - 2 };
            self.split(lir, current, split_pos);
        }

        // The register is available for the interval's whole lifetime
        lir.interval_mut(current).allocate(max_reg);
        trace!(
            "linear-scan: {:?} -> {}",
            current,
            crate::lir::register_name(max_reg)
        );
    }

    fn allocate_blocked_reg(&mut self, lir: &mut Lir, current: IntervalId) {
        let first_use = lir.use_after(current, 0, Some(UseKind::Register));
        let Some(first_use) = first_use else {
            // No register use anywhere, just spill the interval
            self.spill(lir, current);
            return;
        };
        let first_use_pos = lir.use_position(first_use);

        let mut use_pos = [i32::MAX; NUM_REGISTERS];
        let mut block_pos = [i32::MAX; NUM_REGISTERS];

        let current_start = lir.interval(current).start();

        for active in &self.active {
            let index = lir.interval(*active).index as usize;

            if lir.interval(*active).is_fixed() {
                // A fixed interval blocks its register outright
                block_pos[index] = 0;
                use_pos[index] = 0;
            } else {
                let Some(use_) = lir.use_after(*active, current_start, None) else {
                    continue;
                };
                let pos = lir.use_position(use_);
                if use_pos[index] > pos {
                    use_pos[index] = pos;
                }
            }
        }

        // Almost the same for inactive, counting only intersections
        for inactive in &self.inactive {
            let index = lir.interval(*inactive).index as usize;
            let Some(pos) = lir.interval(current).find_intersection(lir.interval(*inactive))
            else {
                continue;
            };

            if lir.interval(*inactive).is_fixed() {
                if block_pos[index] > pos {
                    block_pos[index] = pos;
                }
                if use_pos[index] > pos {
                    use_pos[index] = pos;
                }
            } else {
                let Some(use_) = lir.use_after(*inactive, current_start, None) else {
                    continue;
                };
                let pos = lir.use_position(use_);
                if use_pos[index] > pos {
                    use_pos[index] = pos;
                }
            }
        }

        let mut use_max = -1;
        let mut use_reg = 0;
        for (r, pos) in use_pos.iter().enumerate() {
            if *pos > use_max {
                use_max = *pos;
                use_reg = r;
            }
        }
        assert!(use_max >= 0);

        if use_max < first_use_pos || block_pos[use_reg] <= current_start {
            // Every register is used sooner than we need one: keep the
            // value in memory until right before its first register use
            self.spill(lir, current);

            if first_use_pos - 1 > current_start {
                self.split(lir, current, first_use_pos - 1);
            }
        } else {
            // The intervals holding this register get spilled instead
            lir.interval_mut(current).allocate(use_reg);

            if block_pos[use_reg] <= lir.interval(current).end() {
                // Blocked later: the current interval splits there
                let pos = block_pos[use_reg] - 1;
                self.split(lir, current, pos);
            }

            // Split and spill all intersecting intervals
            let mut split_pos = current_start;
            if split_pos % 2 == 0 {
                split_pos -= 1;
            }

            for i in 0..self.active.len() {
                let interval = self.active[i];
                if !lir.interval(interval).is_equal(lir.interval(current)) {
                    continue;
                }
                // Split before the current interval and let the allocator
                // process the child later
                self.split(lir, interval, split_pos);
            }

            let mut i = 0;
            while i < self.inactive.len() {
                let interval = self.inactive[i];
                if lir.interval(interval).is_fixed()
                    || !lir.interval(interval).is_equal(lir.interval(current))
                {
                    i += 1;
                    continue;
                }

                let Some(intersection) =
                    lir.interval(current).find_intersection(lir.interval(interval))
                else {
                    i += 1;
                    continue;
                };

                match lir.use_after(interval, current_start, Some(UseKind::Register)) {
                    None => {
                        self.split(lir, interval, split_pos);
                    }
                    Some(next_use) => {
                        let next_pos = lir.use_position(next_use);
                        if intersection >= next_pos {
                            // Used before the intersection, safe to split
                            // there (at the preceding odd position)
                            let pos = intersection - i32::from(intersection % 2 == 0);
                            self.split(lir, interval, pos);
                        } else {
                            self.split(lir, interval, next_pos - 1);
                        }
                    }
                }

                self.inactive.remove(i);
            }
        }
    }

    /// Splits `interval` at `pos`, which must fall strictly inside it.
    /// Uses and ranges at or after the position move to a fresh child.
    /// Unless the cut lands on a block boundary (where data-flow
    /// resolution takes over), a move bridges parent and child in the
    /// enclosing gap.
    pub(crate) fn split(&mut self, lir: &mut Lir, interval: IntervalId, pos: i32) -> IntervalId {
        assert!(!lir.interval(interval).is_fixed());
        assert!(
            pos > lir.interval(interval).start() && pos < lir.interval(interval).end(),
            "split position outside the interval"
        );

        let child = lir.create_virtual();

        // Move uses from parent to child; uses are sorted, so walk the
        // tail until one falls before the position
        loop {
            let Some(last) = lir.interval(interval).uses.last().copied() else {
                break;
            };
            if lir.use_position(last) < pos {
                break;
            }
            lir.interval_mut(interval).uses.pop();
            lir.interval_mut(child).uses.insert(0, last);
            lir.uses[last].interval = child;
        }

        // Move ranges, splitting the one that straddles the position
        loop {
            let Some(range) = lir.interval(interval).ranges.last().copied() else {
                break;
            };
            if range.end <= pos {
                break;
            }

            lir.interval_mut(interval).ranges.pop();
            let mut moved = range;
            if moved.start < pos {
                lir.interval_mut(interval).ranges.push(Range {
                    start: moved.start,
                    end: pos,
                });
                moved.start = pos;
            }
            lir.interval_mut(child).ranges.insert(0, moved);
        }

        let parent = lir.interval(interval).split_parent.unwrap_or(interval);
        lir.interval_mut(child).split_parent = Some(parent);
        lir.interval_mut(parent).split_children.insert(0, child);

        let at = self
            .unhandled
            .partition_point(|u| lir.interval(*u).start() <= lir.interval(child).start());
        self.unhandled.insert(at, child);

        assert!(lir.interval(interval).end() <= pos);
        assert!(lir.interval(child).start() >= pos);

        // A parent that ends on a block edge gets its move during
        // data-flow resolution instead
        if lir.block_starting_at(lir.interval(interval).end()).is_some() {
            return child;
        }

        // Insert the move right before the split position: the left side
        // is definitely live here and the right side hasn't been used yet
        let gap = self.get_gap(lir, pos);
        let from = lir.add_use(interval, UseKind::Any, gap);
        let to = lir.add_use(child, UseKind::Any, gap);
        lir.instr_mut(gap).moves.push((from, to));

        child
    }

    /// Finds or creates the gap at the odd position `pos`. A new gap also
    /// reserves a scratch spill slot for untangling its parallel moves.
    pub(crate) fn get_gap(&mut self, lir: &mut Lir, pos: i32) -> LInstrId {
        assert!(pos % 2 == 1, "gap at an even position");

        for oi in 0..lir.order.len() {
            let block: LBlockId = lir.order[oi];

            // Skip blocks that definitely can't contain the gap
            if lir.block(block).end_id <= pos {
                continue;
            }

            // Search for the slot within the block
            let mut insert_at = None;
            for ii in 0..lir.block(block).instructions.len() {
                let instr = lir.block(block).instructions[ii];
                if lir.instr(instr).id < pos {
                    continue;
                }
                if lir.instr(instr).id == pos {
                    assert!(lir.instr(instr).opcode == LOpcode::Gap);
                    return instr;
                }

                insert_at = Some(ii);
                break;
            }
            let Some(ii) = insert_at else {
                continue;
            };

            // Scratch slot for the gap's move cycles
            let tmp = lir.create_virtual();
            lir.interval_mut(tmp).add_range(pos - 1, pos + 1);
            self.spill(lir, tmp);

            let gap = lir.create_instr(LOpcode::Gap, LPayload::None);
            lir.instr_mut(gap).id = pos;
            lir.instr_mut(gap).block = block;
            lir.instr_mut(gap).gap_spill = Some(tmp);
            lir.block_mut(block).instructions.insert(ii, gap);
            return gap;
        }

        unreachable!("gap position {pos} outside every block")
    }

    pub(crate) fn spill(&mut self, lir: &mut Lir, interval: IntervalId) {
        assert!(!lir.interval(interval).is_stack_slot());

        lir.interval_mut(interval).spill_to(-1);
        self.unhandled_spills.push(interval);
    }
}

/// Migrates intervals between the active and inactive sets as the scan
/// position advances; expired intervals optionally land in `handled`.
pub(crate) fn shuffle_intervals(
    lir: &Lir,
    active: &mut Vec<IntervalId>,
    inactive: &mut Vec<IntervalId>,
    mut handled: Option<&mut Vec<IntervalId>>,
    pos: i32,
) {
    let mut i = 0;
    while i < active.len() {
        let interval = active[i];
        if lir.interval(interval).end() < pos {
            // Ended before the current position
            active.remove(i);
            if let Some(handled) = handled.as_deref_mut() {
                handled.push(interval);
            }
        } else if !lir.interval(interval).covers(pos) {
            // In a lifetime hole at the current position
            active.remove(i);
            inactive.push(interval);
        } else {
            i += 1;
        }
    }

    let mut i = 0;
    while i < inactive.len() {
        let interval = inactive[i];
        if lir.interval(interval).end() < pos {
            inactive.remove(i);
            if let Some(handled) = handled.as_deref_mut() {
                handled.push(interval);
            }
        } else if lir.interval(interval).covers(pos) {
            // Covering again, back to active
            inactive.remove(i);
            active.push(interval);
        } else {
            i += 1;
        }
    }
}

fn reassign_use(lir: &mut Lir, use_id: UseId, to: IntervalId) {
    let old = lir.uses[use_id].interval;
    let pos = lir.use_position(use_id);

    let list = &mut lir.interval_mut(old).uses;
    let idx = list
        .iter()
        .position(|u| *u == use_id)
        .expect("use missing from its interval");
    list.remove(idx);

    lir.uses[use_id].interval = to;
    let at = lir.intervals[to]
        .uses
        .partition_point(|u| lir.instrs[lir.uses[*u].instr].id <= pos);
    lir.intervals[to].uses.insert(at, use_id);
}
