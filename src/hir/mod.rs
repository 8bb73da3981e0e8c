//! HIR (high-level intermediate representation): a control-flow graph whose
//! values are in SSA form. Instructions and blocks live in index-addressed
//! tables on the [`Graph`]; every cross-reference (use<->def, pred<->succ,
//! phi<->block) is a plain id, so the graph as a whole is the arena and
//! cycles cost nothing.

use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{
    ast::{BinOpKind, ScopeSlot},
    index::{simple_index, IndexVec},
    intern::Symbol,
};

pub mod ast_lowering;
pub mod dom;
pub mod pretty_print;

simple_index! {
    /// Handle to an instruction in [`Graph::instrs`].
    pub struct InstrId;
}

simple_index! {
    /// Handle to a basic block in [`Graph::blocks`].
    pub struct BlockId;
}

simple_index! {
    /// Index into the function's literal root table.
    pub struct RootId;
}

/// dfs_id value of a block the dominator DFS has not reached.
pub const DFS_UNVISITED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Opcode {
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
    Phi,
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
    If,
    Goto,
    Return,
}

impl Opcode {
    /// Roots for dead-code elimination: anything whose removal would be
    /// observable. `LoadVarArg` writes the rest arguments into its array
    /// operand, so it counts as a store here, and `LoadProperty` invokes
    /// the property-access stub whether or not the value is read.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Opcode::Entry
                | Opcode::Return
                | Opcode::If
                | Opcode::Goto
                | Opcode::Call
                | Opcode::CollectGarbage
                | Opcode::GetStackTrace
                | Opcode::StoreArg
                | Opcode::StoreVarArg
                | Opcode::AlignStack
                | Opcode::StoreContext
                | Opcode::StoreProperty
                | Opcode::DeleteProperty
                | Opcode::LoadProperty
                | Opcode::LoadVarArg
        )
    }

    /// Instructions value numbering must never merge. Kept deliberately
    /// wider than [`Opcode::has_side_effects`]: allocations and anything
    /// that reads mutable object or context state stays out of the table.
    pub fn has_gvn_side_effects(self) -> bool {
        self.has_side_effects()
            || matches!(
                self,
                Opcode::Function
                    | Opcode::AllocateObject
                    | Opcode::AllocateArray
                    | Opcode::CloneOf
                    | Opcode::LoadProperty
                    | Opcode::LoadContext
                    | Opcode::Sizeof
                    | Opcode::Keysof
                    | Opcode::Phi
            )
    }

    /// Instructions global code motion must leave where the builder put
    /// them. Argument loads read the entry frame, every allocation must
    /// stay put so loops observe a fresh object per iteration, and
    /// property loads are stub calls that may not move across other
    /// effects.
    pub fn is_pinned(self) -> bool {
        self.has_side_effects()
            || matches!(
                self,
                Opcode::LoadArg
                    | Opcode::Phi
                    | Opcode::Function
                    | Opcode::AllocateObject
                    | Opcode::AllocateArray
                    | Opcode::CloneOf
                    | Opcode::LoadProperty
            )
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::If | Opcode::Goto | Opcode::Return)
    }
}

/// Per-opcode payload. Most instructions carry nothing beyond their args.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Payload {
    None,
    /// Number of context slots the entry must allocate.
    ContextSlots(usize),
    /// Root-table index of a literal.
    Root(RootId),
    BinOp(BinOpKind),
    /// (depth, index) of a context slot.
    ContextSlot(usize, usize),
    /// Body root block and arity of a nested function literal.
    Function { body: BlockId, argc: usize },
}

#[derive(Debug)]
pub struct Instr {
    /// Arena handle (creation order).
    pub handle: InstrId,
    /// Sequence id, assigned when the instruction enters a block; monotonic
    /// within a function and the id dumps print as `iN`.
    pub id: i32,
    pub opcode: Opcode,
    pub payload: Payload,
    pub args: SmallVec<[InstrId; 2]>,
    /// Mirror of `args`: every instruction naming this one as an argument,
    /// once per occurrence.
    pub uses: Vec<InstrId>,
    pub block: BlockId,
    /// Scope slot this value was last assigned to, for dumps and phi reuse.
    pub slot: Option<ScopeSlot>,
    pub ast_offset: i32,
    pub removed: bool,
    /// Survived dead-code elimination.
    pub is_live: bool,
    /// Visit mark for value numbering.
    pub gvn_visited: bool,
    /// Visit mark for the two effect passes (0 = fresh).
    pub alias_visited: u8,
    /// Visit mark for schedule-early / schedule-late.
    pub gcm_visited: u8,
    pub effects_in: Vec<InstrId>,
    pub effects_out: Vec<InstrId>,
}

impl Instr {
    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::Phi
    }

    pub fn input_count(&self) -> usize {
        self.args.len()
    }
}

/// Values a literal instruction can refer to. The table is per-graph and
/// deduplicated, so identical literals in one compilation share a root id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootValue {
    Number(Symbol),
    String(Symbol),
    Property(Symbol),
    True,
    False,
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    /// Sequence number printed as `Block N`; equals the arena index today
    /// but dumps must not rely on that.
    pub seq: u32,
    pub dfs_id: i32,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: SmallVec<[BlockId; 2]>,
    pub phis: Vec<InstrId>,
    pub instructions: Vec<InstrId>,
    pub env: Env,
    pub is_loop: bool,
    pub loop_depth: u32,
    /// A control instruction has been emitted; nothing may follow it.
    pub ended: bool,
    /// Function root this block belongs to.
    pub root: BlockId,

    // Lengauer-Tarjan scratch + results
    pub parent: Option<BlockId>,
    pub ancestor: Option<BlockId>,
    pub label: BlockId,
    pub semi: BlockId,
    pub dominates: Vec<BlockId>,
    pub dominator: Option<BlockId>,
    pub dominator_depth: i32,

    /// Bit `b` set: block `b` can reach this block.
    pub reachable_from: FixedBitSet,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty() && self.phis.is_empty()
    }
}

/// Per-block map from stack slot to the instruction currently holding its
/// value, with a parallel shadow map of the phi (if any) publishing the
/// slot in this block. Sized `stack_slots + 1`: the extra slot backs the
/// short-circuit lowering of `&&` / `||`.
#[derive(Debug, Clone)]
pub struct Env {
    slots: Vec<Option<InstrId>>,
    phis: Vec<Option<InstrId>>,
}

impl Env {
    pub fn new(stack_slots: usize) -> Self {
        Env {
            slots: vec![None; stack_slots + 1],
            phis: vec![None; stack_slots + 1],
        }
    }

    pub fn stack_slots(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot reserved for bool-logic lowering.
    pub fn logic_slot(&self) -> ScopeSlot {
        ScopeSlot::stack(self.slots.len() - 1)
    }

    pub fn at(&self, index: usize) -> Option<InstrId> {
        self.slots[index]
    }

    pub fn set(&mut self, index: usize, value: InstrId) {
        self.slots[index] = Some(value);
    }

    pub fn phi_at(&self, index: usize) -> Option<InstrId> {
        self.phis[index]
    }

    pub fn set_phi(&mut self, index: usize, phi: InstrId) {
        self.phis[index] = Some(phi);
    }

    pub fn copy_from(&mut self, other: &Env) {
        self.slots.copy_from_slice(&other.slots);
        self.phis.copy_from_slice(&other.phis);
    }
}

/// The SSA graph for one compilation: every function literal in the unit
/// becomes a separate root block in `roots`.
pub struct Graph {
    pub instrs: IndexVec<InstrId, Instr>,
    pub blocks: IndexVec<BlockId, Block>,
    pub roots: Vec<BlockId>,
    pub root_table: IndexVec<RootId, RootValue>,
    root_index: HashMap<RootValue, RootId>,
    next_instr_id: i32,
    next_block_seq: u32,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            instrs: IndexVec::new(),
            blocks: IndexVec::new(),
            roots: Vec::new(),
            root_table: IndexVec::new(),
            root_index: HashMap::new(),
            next_instr_id: 0,
            next_block_seq: 0,
        }
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    pub fn create_block(&mut self, stack_slots: usize, loop_depth: u32, root: BlockId) -> BlockId {
        let id = self.blocks.next_index();
        let seq = self.next_block_seq;
        self.next_block_seq += 1;

        self.blocks.push(Block {
            id,
            seq,
            dfs_id: DFS_UNVISITED,
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            phis: Vec::new(),
            instructions: Vec::new(),
            env: Env::new(stack_slots),
            is_loop: false,
            loop_depth,
            ended: false,
            root,
            parent: None,
            ancestor: None,
            label: id,
            semi: id,
            dominates: Vec::new(),
            dominator: None,
            dominator_depth: -1,
            reachable_from: FixedBitSet::new(),
        });

        id
    }

    /// Creates an instruction without placing it anywhere. The sequence id
    /// is handed out when the instruction enters a block, so in-block id
    /// order always matches in-block position order.
    pub fn create_instr(&mut self, opcode: Opcode, payload: Payload) -> InstrId {
        let handle = self.instrs.next_index();
        self.instrs.push(Instr {
            handle,
            id: -1,
            opcode,
            payload,
            args: SmallVec::new(),
            uses: Vec::new(),
            block: BlockId(u32::MAX),
            slot: None,
            ast_offset: crate::ast::SYNTHETIC_OFFSET,
            removed: false,
            is_live: false,
            gvn_visited: false,
            alias_visited: 0,
            gcm_visited: 0,
            effects_in: Vec::new(),
            effects_out: Vec::new(),
        });

        handle
    }

    /// Appends `instr` to `block` and assigns its sequence id.
    pub fn append_instr(&mut self, block: BlockId, instr: InstrId) {
        assert!(!self.blocks[block].ended, "instruction after block end");

        let id = self.next_instr_id;
        self.next_instr_id += 1;

        let i = &mut self.instrs[instr];
        i.id = id;
        i.block = block;
        self.blocks[block].instructions.push(instr);
    }

    /// Registers a phi in its block's phi list (phis never enter the main
    /// instruction list).
    pub fn append_phi(&mut self, block: BlockId, phi: InstrId) {
        let id = self.next_instr_id;
        self.next_instr_id += 1;

        let i = &mut self.instrs[phi];
        assert!(i.is_phi());
        i.id = id;
        i.block = block;
        self.blocks[block].phis.push(phi);
    }

    pub fn add_arg(&mut self, instr: InstrId, arg: InstrId) {
        self.instrs[instr].args.push(arg);
        self.instrs[arg].uses.push(instr);
    }

    /// Redirects all uses of `from` to `to`.
    pub fn replace_all_uses(&mut self, from: InstrId, to: InstrId) {
        let users = std::mem::take(&mut self.instrs[from].uses);
        for user in &users {
            for a in self.instrs[*user].args.iter_mut() {
                if *a == from {
                    *a = to;
                }
            }
            self.instrs[to].uses.push(*user);
        }
    }

    /// Unlinks `instr` from its arguments' use lists and marks it removed.
    /// The block lists are cleaned up by whoever owns the traversal.
    pub fn mark_removed(&mut self, instr: InstrId) {
        let args = std::mem::take(&mut self.instrs[instr].args);
        for arg in &args {
            if let Some(pos) = self.instrs[*arg].uses.iter().position(|u| *u == instr) {
                self.instrs[*arg].uses.remove(pos);
            }
        }
        self.instrs[instr].removed = true;
    }

    /// Removes `instr` from its block's instruction list and unlinks it.
    pub fn remove_from_block(&mut self, instr: InstrId) {
        let block = self.instrs[instr].block;
        let list = &mut self.blocks[block].instructions;
        if let Some(pos) = list.iter().position(|i| *i == instr) {
            list.remove(pos);
        }
        self.mark_removed(instr);
    }

    /// Interns a literal value in the root table.
    pub fn root_id(&mut self, value: RootValue) -> RootId {
        if let Some(id) = self.root_index.get(&value) {
            return *id;
        }

        let id = self.root_table.push(value);
        self.root_index.insert(value, id);
        id
    }

    /// Connects `from -> to` in the CFG. Environment propagation happens in
    /// the builder (`add_predecessor`); this only wires the edge.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        assert!(self.blocks[from].succs.len() < 2, "block with >2 successors");
        assert!(self.blocks[to].preds.len() < 2, "block with >2 predecessors");
        self.blocks[from].succs.push(to);
        self.blocks[to].preds.push(from);
    }

    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}
