//! LIR (low-level intermediate representation): the flattened, linearized
//! form the register allocator works on and the target assembler consumes.
//! Real instructions occupy even ids, gaps (parallel moves) odd ids, and a
//! block's label always has the smallest id in the block.

use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::{
    ast::BinOpKind,
    hir,
    index::{simple_index, IndexVec},
};

pub mod hir_lowering;
pub mod linear_scan;
pub mod liveness;
pub mod pretty_print;
pub mod resolve;

/// Allocatable general-purpose registers. The register *file* belongs to
/// the target assembler; the allocator only needs the count, and dumps
/// print `r0..r5`.
pub const NUM_REGISTERS: usize = 6;

pub fn register_name(index: usize) -> &'static str {
    ["r0", "r1", "r2", "r3", "r4", "r5"][index]
}

/// Fixed registers of the runtime-stub calling convention: arguments in
/// `r0..r2` left to right, result in `r0`.
pub const STUB_ARG_REGISTERS: [usize; 3] = [0, 1, 2];
pub const STUB_RESULT_REGISTER: usize = 0;

simple_index! {
    pub struct LInstrId;
}

simple_index! {
    pub struct LBlockId;
}

simple_index! {
    pub struct IntervalId;
}

simple_index! {
    pub struct UseId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LOpcode {
    Label,
    Gap,
    Move,
    Phi,
    Entry,
    LoadArg,
    LoadVarArg,
    StoreArg,
    StoreVarArg,
    AlignStack,
    Literal,
    Nil,
    Not,
    BinOp,
    Function,
    Call,
    CollectGarbage,
    GetStackTrace,
    LoadContext,
    StoreContext,
    LoadProperty,
    StoreProperty,
    DeleteProperty,
    AllocateObject,
    AllocateArray,
    Typeof,
    Sizeof,
    Keysof,
    CloneOf,
    Goto,
    Branch,
    BranchNumber,
    Return,
}

impl LOpcode {
    pub fn is_control(self) -> bool {
        matches!(
            self,
            LOpcode::Goto | LOpcode::Branch | LOpcode::BranchNumber
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LPayload {
    None,
    /// Context slots the entry allocates.
    ContextSlots(usize),
    Root(hir::RootId),
    BinOp(BinOpKind),
    ContextSlot(usize, usize),
    /// Root block (in the HIR graph) and arity of the function literal
    /// this instruction materializes a closure for.
    Function { body: hir::BlockId, argc: usize },
}

#[derive(Debug)]
pub struct LInstr {
    pub handle: LInstrId,
    /// Position: even for real instructions, odd for gaps, -1 unplaced.
    pub id: i32,
    pub opcode: LOpcode,
    pub payload: LPayload,
    pub inputs: SmallVec<[UseId; 2]>,
    pub scratches: SmallVec<[UseId; 2]>,
    pub result: Option<UseId>,
    /// Clobbers every allocatable register at its position.
    pub has_call: bool,
    pub block: LBlockId,
    /// HIR instruction this was lowered from.
    pub hir: Option<hir::InstrId>,
    pub ast_offset: i32,
    /// Parallel moves carried by a gap, in insertion order.
    pub moves: Vec<(UseId, UseId)>,
    /// Scratch spill slot backing the gap's move cycles.
    pub gap_spill: Option<IntervalId>,
    /// Branch/goto targets, filled in by data-flow resolution.
    pub target_labels: Vec<LInstrId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    Any,
    Register,
}

/// One appearance of an interval in an instruction. Splitting reassigns
/// uses between intervals, so uses live in their own table.
#[derive(Debug, Clone, Copy)]
pub struct LUse {
    pub interval: IntervalId,
    pub kind: UseKind,
    pub instr: LInstrId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Virtual,
    Register,
    StackSlot,
    Const,
}

/// Half-open position range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i32,
    pub end: i32,
}

#[derive(Debug)]
pub struct Interval {
    pub id: IntervalId,
    pub kind: IntervalKind,
    /// Physical register index or spill slot index; -1 until assigned.
    pub index: i32,
    /// Sorted by start, disjoint, never empty.
    pub ranges: Vec<Range>,
    /// Sorted by use position.
    pub uses: Vec<UseId>,
    pub split_parent: Option<IntervalId>,
    pub split_children: Vec<IntervalId>,
    pub fixed: bool,
    pub register_hint: Option<UseId>,
    /// Instruction that materializes this constant, for rematerialization.
    pub const_source: Option<LInstrId>,
}

impl Interval {
    pub fn start(&self) -> i32 {
        self.ranges.first().expect("empty interval").start
    }

    pub fn end(&self) -> i32 {
        self.ranges.last().expect("empty interval").end
    }

    pub fn covers(&self, pos: i32) -> bool {
        for range in &self.ranges {
            if range.start > pos {
                return false;
            }
            if range.end > pos {
                return true;
            }
        }
        false
    }

    /// Prepends `[start, end)`, extending the head range when they touch.
    /// Ranges only ever arrive back to front.
    pub fn add_range(&mut self, start: i32, end: i32) {
        if let Some(head) = self.ranges.first_mut() {
            if head.start == end {
                head.start = start;
                return;
            }
            assert!(end < head.start, "unsorted range insertion");
        }

        self.ranges.insert(0, Range { start, end });
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == IntervalKind::Virtual
    }

    pub fn is_register(&self) -> bool {
        self.kind == IntervalKind::Register
    }

    pub fn is_stack_slot(&self) -> bool {
        self.kind == IntervalKind::StackSlot
    }

    pub fn is_const(&self) -> bool {
        self.kind == IntervalKind::Const
    }

    pub fn allocate(&mut self, register: usize) {
        self.kind = IntervalKind::Register;
        self.index = register as i32;
    }

    pub fn spill_to(&mut self, slot: i32) {
        self.kind = IntervalKind::StackSlot;
        self.index = slot;
    }

    /// Same location: both hold the same register or the same spill slot.
    pub fn is_equal(&self, other: &Interval) -> bool {
        self.kind == other.kind && self.index == other.index && self.index != -1
    }

    /// First intersection position of two ranges, if any.
    pub fn find_intersection(&self, with: &Interval) -> Option<i32> {
        for a in &self.ranges {
            for b in &with.ranges {
                // The first intersection is one of the two starts
                if a.start >= b.start && a.start < b.end {
                    return Some(a.start);
                }
                if b.start >= a.start && b.start < a.end {
                    return Some(b.start);
                }
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct LBlock {
    pub id: LBlockId,
    pub hir: hir::BlockId,
    pub label: LInstrId,
    pub instructions: Vec<LInstrId>,
    /// Successors in LIR terms, mirroring the HIR edges.
    pub succs: SmallVec<[LBlockId; 2]>,
    pub start_id: i32,
    pub end_id: i32,
    pub live_gen: HashSet<IntervalId>,
    pub live_kill: HashSet<IntervalId>,
    pub live_in: HashSet<IntervalId>,
    pub live_out: HashSet<IntervalId>,
}

/// The LIR of one function root, before and after allocation.
pub struct Lir {
    pub instrs: IndexVec<LInstrId, LInstr>,
    pub uses: IndexVec<UseId, LUse>,
    pub intervals: IndexVec<IntervalId, Interval>,
    pub blocks: IndexVec<LBlockId, LBlock>,
    /// Flattened emission order.
    pub order: Vec<LBlockId>,
    /// Fixed intervals, one per allocatable register.
    pub registers: [IntervalId; NUM_REGISTERS],
    /// Stack slots the allocator ended up needing.
    pub spill_count: usize,
    next_instr_id: i32,
}

impl Lir {
    pub fn instr(&self, id: LInstrId) -> &LInstr {
        &self.instrs[id]
    }

    pub fn instr_mut(&mut self, id: LInstrId) -> &mut LInstr {
        &mut self.instrs[id]
    }

    pub fn interval(&self, id: IntervalId) -> &Interval {
        &self.intervals[id]
    }

    pub fn interval_mut(&mut self, id: IntervalId) -> &mut Interval {
        &mut self.intervals[id]
    }

    pub fn use_(&self, id: UseId) -> &LUse {
        &self.uses[id]
    }

    pub fn block(&self, id: LBlockId) -> &LBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: LBlockId) -> &mut LBlock {
        &mut self.blocks[id]
    }

    pub(crate) fn new() -> Self {
        let mut intervals = IndexVec::new();
        let mut registers = [IntervalId(0); NUM_REGISTERS];
        for (i, slot) in registers.iter_mut().enumerate() {
            let id = intervals.next_index();
            intervals.push(Interval {
                id,
                kind: IntervalKind::Register,
                index: i as i32,
                ranges: Vec::new(),
                uses: Vec::new(),
                split_parent: None,
                split_children: Vec::new(),
                fixed: true,
                register_hint: None,
                const_source: None,
            });
            *slot = id;
        }

        Lir {
            instrs: IndexVec::new(),
            uses: IndexVec::new(),
            intervals,
            blocks: IndexVec::new(),
            order: Vec::new(),
            registers,
            spill_count: 0,
            next_instr_id: 0,
        }
    }

    pub(crate) fn create_interval(&mut self, kind: IntervalKind) -> IntervalId {
        let id = self.intervals.next_index();
        self.intervals.push(Interval {
            id,
            kind,
            index: -1,
            ranges: Vec::new(),
            uses: Vec::new(),
            split_parent: None,
            split_children: Vec::new(),
            fixed: false,
            register_hint: None,
            const_source: None,
        });
        id
    }

    pub(crate) fn create_virtual(&mut self) -> IntervalId {
        self.create_interval(IntervalKind::Virtual)
    }

    pub(crate) fn create_instr(&mut self, opcode: LOpcode, payload: LPayload) -> LInstrId {
        let handle = self.instrs.next_index();
        self.instrs.push(LInstr {
            handle,
            id: -1,
            opcode,
            payload,
            inputs: SmallVec::new(),
            scratches: SmallVec::new(),
            result: None,
            has_call: false,
            block: LBlockId(u32::MAX),
            hir: None,
            ast_offset: crate::ast::SYNTHETIC_OFFSET,
            moves: Vec::new(),
            gap_spill: None,
            target_labels: Vec::new(),
        });
        handle
    }

    /// Appends `instr` to `block` at the next even position.
    pub(crate) fn append_instr(&mut self, block: LBlockId, instr: LInstrId) {
        let id = self.next_instr_id;
        self.next_instr_id += 2;

        let i = &mut self.instrs[instr];
        i.id = id;
        i.block = block;
        self.blocks[block].instructions.push(instr);
    }

    /// Creates a use of `interval` at `instr` and registers it in the
    /// interval's sorted use list.
    pub(crate) fn add_use(
        &mut self,
        interval: IntervalId,
        kind: UseKind,
        instr: LInstrId,
    ) -> UseId {
        let id = self.uses.push(LUse {
            interval,
            kind,
            instr,
        });

        let pos = self.instrs[instr].id;
        let at = self.intervals[interval]
            .uses
            .partition_point(|u| self.instrs[self.uses[*u].instr].id <= pos);
        self.intervals[interval].uses.insert(at, id);

        id
    }

    pub(crate) fn use_position(&self, use_id: UseId) -> i32 {
        self.instrs[self.uses[use_id].instr].id
    }

    /// First use of `interval` at or after `pos`, optionally restricted to
    /// register-kind uses.
    pub fn use_after(
        &self,
        interval: IntervalId,
        pos: i32,
        kind: Option<UseKind>,
    ) -> Option<UseId> {
        for u in &self.intervals[interval].uses {
            let use_ = &self.uses[*u];
            if self.instrs[use_.instr].id >= pos
                && (kind.is_none() || Some(use_.kind) == kind)
            {
                return Some(*u);
            }
        }
        None
    }

    pub fn use_at(&self, interval: IntervalId, pos: i32) -> Option<UseId> {
        self.intervals[interval]
            .uses
            .iter()
            .copied()
            .find(|u| self.instrs[self.uses[*u].instr].id == pos)
    }

    /// Split-family member of `interval` covering `pos`.
    pub fn child_at(&self, interval: IntervalId, pos: i32) -> IntervalId {
        let parent = self.intervals[interval]
            .split_parent
            .unwrap_or(interval);

        if self.intervals[parent].covers(pos) {
            return parent;
        }
        for child in &self.intervals[parent].split_children {
            if self.intervals[*child].covers(pos) {
                return *child;
            }
        }
        unreachable!("no split child covers position {pos}")
    }

    /// The block whose label sits exactly at `pos`, if any.
    pub fn block_starting_at(&self, pos: i32) -> Option<LBlockId> {
        self.order
            .iter()
            .copied()
            .find(|b| self.blocks[*b].start_id == pos)
    }

    /// One past the highest assigned instruction position.
    pub fn position_count(&self) -> i32 {
        self.next_instr_id
    }
}

#[cfg(test)]
mod tests {
    use super::{Interval, IntervalId, IntervalKind};

    fn interval() -> Interval {
        Interval {
            id: IntervalId(99),
            kind: IntervalKind::Virtual,
            index: -1,
            ranges: Vec::new(),
            uses: Vec::new(),
            split_parent: None,
            split_children: Vec::new(),
            fixed: false,
            register_hint: None,
            const_source: None,
        }
    }

    #[test]
    fn touching_ranges_merge_backwards() {
        let mut i = interval();
        i.add_range(4, 8);
        i.add_range(2, 4);

        assert_eq!(i.ranges.len(), 1);
        assert_eq!(i.start(), 2);
        assert_eq!(i.end(), 8);
    }

    #[test]
    fn coverage_respects_holes_and_half_open_ends() {
        let mut i = interval();
        i.add_range(6, 10);
        i.add_range(0, 2);

        assert!(i.covers(0));
        assert!(!i.covers(2));
        assert!(!i.covers(5));
        assert!(i.covers(9));
        assert!(!i.covers(10));
    }

    #[test]
    fn intersection_is_the_later_start() {
        let mut a = interval();
        a.add_range(0, 6);
        let mut b = interval();
        b.add_range(4, 8);

        assert_eq!(a.find_intersection(&b), Some(4));
        assert_eq!(b.find_intersection(&a), Some(4));

        let mut c = interval();
        c.add_range(6, 8);
        assert_eq!(a.find_intersection(&c), None);
    }
}
