//! HIR -> LIR lowering for one function root: flatten the block graph in a
//! loop-respecting order, then emit LIR per HIR instruction. Stub-backed
//! operations move their operands into the fixed registers of the runtime
//! calling convention and read the result back out of `r0`; phi resolution
//! becomes a move at each predecessor's tail.

use std::collections::VecDeque;

use hashbrown::HashMap;
use log::debug;

use crate::{
    ast::BinOpKind,
    hir::{self, Graph, Opcode, Payload},
    lir::{
        IntervalId, IntervalKind, LBlockId, LInstrId, LOpcode, LPayload, Lir, UseKind,
        STUB_ARG_REGISTERS, STUB_RESULT_REGISTER,
    },
};

/// Lowers the function rooted at `root` to LIR. The graph must already be
/// optimized; only live instructions are visited.
pub fn lower_to_lir(graph: &Graph, root: hir::BlockId) -> Lir {
    let mut ctx = LoweringContext {
        graph,
        lir: Lir::new(),
        block_map: HashMap::new(),
        value_map: HashMap::new(),
        phi_map: HashMap::new(),
        current_block: LBlockId(0),
    };

    ctx.flatten_blocks(root);
    ctx.generate_instructions();

    debug!(
        "lir: {} instructions in {} blocks",
        ctx.lir.instrs.len(),
        ctx.lir.order.len()
    );

    ctx.lir
}

struct LoweringContext<'g> {
    graph: &'g Graph,
    lir: Lir,
    block_map: HashMap<hir::BlockId, LBlockId>,
    /// HIR value -> interval holding it.
    value_map: HashMap<hir::InstrId, IntervalId>,
    /// HIR phi -> its (possibly not yet placed) LPhi instruction.
    phi_map: HashMap<hir::InstrId, LInstrId>,
    current_block: LBlockId,
}

impl<'g> LoweringContext<'g> {
    /// Flattens blocks into a linear order: a block is emitted once all of
    /// its predecessors are, except loop headers which are emitted on
    /// first contact.
    fn flatten_blocks(&mut self, root: hir::BlockId) {
        let mut visits: HashMap<hir::BlockId, usize> = HashMap::new();
        let mut work_queue: VecDeque<hir::BlockId> = VecDeque::new();
        work_queue.push_back(root);

        while let Some(b) = work_queue.pop_front() {
            let block = self.graph.block(b);

            let seen = {
                let v = visits.entry(b).or_insert(0);
                *v += 1;
                *v
            };

            if block.preds.is_empty() {
                // Root block
            } else if block.is_loop {
                // Loop start
                if seen != 1 {
                    continue;
                }
            } else if seen != block.preds.len() {
                // Regular block
                continue;
            }

            let id = self.lir.blocks.next_index();
            let label = self.lir.create_instr(LOpcode::Label, LPayload::None);
            self.lir.blocks.push(crate::lir::LBlock {
                id,
                hir: b,
                label,
                instructions: Vec::new(),
                succs: Default::default(),
                start_id: -1,
                end_id: -1,
                live_gen: Default::default(),
                live_kill: Default::default(),
                live_in: Default::default(),
                live_out: Default::default(),
            });
            self.block_map.insert(b, id);
            self.lir.order.push(id);

            for succ in block.succs.iter().rev() {
                work_queue.push_front(*succ);
            }
        }

        // Mirror the CFG edges now that every reachable block has an id
        for oi in 0..self.lir.order.len() {
            let lblock = self.lir.order[oi];
            let hir_block = self.lir.block(lblock).hir;
            for succ in &self.graph.block(hir_block).succs {
                let lsucc = *self
                    .block_map
                    .get(succ)
                    .expect("edge into a block the flattening never reached");
                self.lir.block_mut(lblock).succs.push(lsucc);
            }
        }
    }

    fn generate_instructions(&mut self) {
        for oi in 0..self.lir.order.len() {
            let lblock = self.lir.order[oi];
            self.current_block = lblock;

            let label = self.lir.block(lblock).label;
            self.lir.append_instr(lblock, label);

            let hir_block = self.lir.block(lblock).hir;
            let phis = self.graph.block(hir_block).phis.clone();
            for phi in phis {
                self.visit_phi(phi);
            }

            let instrs = self.graph.block(hir_block).instructions.clone();
            for instr in instrs {
                self.visit_instruction(instr);
            }
        }
    }

    /* Emission helpers */

    fn append(&mut self, opcode: LOpcode, payload: LPayload, hir: Option<hir::InstrId>) -> LInstrId {
        let instr = self.lir.create_instr(opcode, payload);
        self.lir.append_instr(self.current_block, instr);
        if let Some(h) = hir {
            self.lir.instr_mut(instr).hir = Some(h);
            self.lir.instr_mut(instr).ast_offset = self.graph.instr(h).ast_offset;
        }
        instr
    }

    fn add_input(&mut self, instr: LInstrId, interval: IntervalId, kind: UseKind) {
        let use_id = self.lir.add_use(interval, kind, instr);
        self.lir.instr_mut(instr).inputs.push(use_id);
    }

    fn set_result(&mut self, instr: LInstrId, interval: IntervalId, kind: UseKind) {
        assert!(
            self.lir.instr(instr).result.is_none(),
            "instruction with two results"
        );
        let use_id = self.lir.add_use(interval, kind, instr);
        self.lir.instr_mut(instr).result = Some(use_id);
    }

    fn add_scratch(&mut self, instr: LInstrId) {
        assert!(self.lir.instr(instr).scratches.len() < 2);
        let interval = self.lir.create_virtual();
        let use_id = self.lir.add_use(interval, UseKind::Register, instr);
        self.lir.instr_mut(instr).scratches.push(use_id);
    }

    fn value_of(&self, hir: hir::InstrId) -> IntervalId {
        *self
            .value_map
            .get(&hir)
            .expect("use of a value that was never lowered")
    }

    /// Moves `value` into the fixed register `reg` ahead of a stub call,
    /// hinting the source interval toward that register.
    fn to_fixed(&mut self, value: hir::InstrId, reg: usize) -> IntervalId {
        let fixed = self.lir.registers[reg];
        let source = self.value_of(value);

        let mv = self.append(LOpcode::Move, LPayload::None, None);
        self.add_input(mv, source, UseKind::Any);
        self.set_result(mv, fixed, UseKind::Register);

        let hint = self.lir.instr(mv).result;
        self.lir.interval_mut(source).register_hint = hint;

        fixed
    }

    /// Copies the stub result register into a fresh virtual and makes that
    /// the value of `hir`.
    fn result_from_fixed(&mut self, instr: LInstrId, hir: hir::InstrId) {
        let fixed = self.lir.registers[STUB_RESULT_REGISTER];
        self.set_result(instr, fixed, UseKind::Register);

        let res = self.lir.create_virtual();
        let mv = self.append(LOpcode::Move, LPayload::None, None);
        self.add_input(mv, fixed, UseKind::Register);
        self.set_result(mv, res, UseKind::Any);
        self.lir.interval_mut(res).register_hint = self.lir.instr(mv).inputs.first().copied();

        self.value_map.insert(hir, res);
    }

    /// Emits a stub call: operands in `r0..`, result (if any) out of `r0`.
    fn stub_call(
        &mut self,
        opcode: LOpcode,
        payload: LPayload,
        hir: hir::InstrId,
        with_result: bool,
    ) {
        let args = self.graph.instr(hir).args.clone();
        assert!(args.len() <= STUB_ARG_REGISTERS.len(), "stub arity overflow");

        let mut fixed = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            fixed.push(self.to_fixed(*arg, STUB_ARG_REGISTERS[i]));
        }

        let instr = self.append(opcode, payload, Some(hir));
        self.lir.instr_mut(instr).has_call = true;
        for f in fixed {
            self.add_input(instr, f, UseKind::Register);
        }

        if with_result {
            self.result_from_fixed(instr, hir);
        }
    }

    /// The LIR representation of a phi: a virtual interval that is both
    /// the argument and the result of an `LPhi`, created on demand because
    /// predecessors may need it before the phi's own block is reached.
    fn phi_lir(&mut self, phi: hir::InstrId) -> LInstrId {
        if let Some(existing) = self.phi_map.get(&phi) {
            return *existing;
        }

        // Argument and result uses are attached when the phi is placed;
        // the value map remembers the interval until then
        let iphi = self.lir.create_virtual();
        let lphi = self.lir.create_instr(LOpcode::Phi, LPayload::None);
        self.phi_map.insert(phi, lphi);
        self.value_map.insert(phi, iphi);
        lphi
    }

    fn visit_phi(&mut self, phi: hir::InstrId) {
        let instr = self.graph.instr(phi);
        if instr.removed || !instr.is_live {
            return;
        }

        let lphi = self.phi_lir(phi);
        let iphi = self.value_of(phi);

        self.lir.append_instr(self.current_block, lphi);
        self.add_input(lphi, iphi, UseKind::Any);
        self.set_result(lphi, iphi, UseKind::Any);
        self.lir.instr_mut(lphi).hir = Some(phi);
    }

    fn visit_instruction(&mut self, id: hir::InstrId) {
        let instr = self.graph.instr(id);
        assert!(!instr.removed, "removed instruction left in a block");

        match instr.opcode {
            Opcode::Entry => {
                let Payload::ContextSlots(slots) = instr.payload else {
                    unreachable!()
                };
                let entry = self.append(LOpcode::Entry, LPayload::ContextSlots(slots), Some(id));
                self.lir.instr_mut(entry).has_call = true;
            }

            Opcode::LoadArg => {
                let index = self.value_of(instr.args[0]);
                let load = self.append(LOpcode::LoadArg, LPayload::None, Some(id));
                self.add_input(load, index, UseKind::Any);
                let res = self.lir.create_virtual();
                self.set_result(load, res, UseKind::Any);
                self.value_map.insert(id, res);
            }

            Opcode::LoadVarArg => {
                // Writes the rest arguments into the array operand; the
                // array itself stays the value
                self.stub_call(LOpcode::LoadVarArg, LPayload::None, id, false);
            }

            Opcode::StoreArg => {
                let value = self.value_of(instr.args[0]);
                let store = self.append(LOpcode::StoreArg, LPayload::None, Some(id));
                self.add_input(store, value, UseKind::Register);
            }

            Opcode::StoreVarArg => {
                let value = self.value_of(instr.args[0]);
                let store = self.append(LOpcode::StoreVarArg, LPayload::None, Some(id));
                self.add_input(store, value, UseKind::Register);
                self.add_scratch(store);
            }

            Opcode::AlignStack => {
                let argc = self.value_of(instr.args[0]);
                let align = self.append(LOpcode::AlignStack, LPayload::None, Some(id));
                self.add_input(align, argc, UseKind::Any);
            }

            Opcode::Literal => {
                let Payload::Root(root) = instr.payload else {
                    unreachable!()
                };
                let lit = self.append(LOpcode::Literal, LPayload::Root(root), Some(id));
                let interval = self.lir.create_interval(IntervalKind::Const);
                self.lir.interval_mut(interval).const_source = Some(lit);
                self.set_result(lit, interval, UseKind::Any);
                self.value_map.insert(id, interval);
            }

            Opcode::Nil => {
                let nil = self.append(LOpcode::Nil, LPayload::None, Some(id));
                let interval = self.lir.create_interval(IntervalKind::Const);
                self.lir.interval_mut(interval).const_source = Some(nil);
                self.set_result(nil, interval, UseKind::Any);
                self.value_map.insert(id, interval);
            }

            Opcode::Not => self.stub_call(LOpcode::Not, LPayload::None, id, true),

            Opcode::BinOp => {
                let Payload::BinOp(op) = instr.payload else {
                    unreachable!()
                };
                self.stub_call(LOpcode::BinOp, LPayload::BinOp(op), id, true);
            }

            Opcode::Phi => unreachable!("phi in an instruction list"),

            Opcode::Function => {
                let Payload::Function { body, argc } = instr.payload else {
                    unreachable!()
                };
                let f = self.append(
                    LOpcode::Function,
                    LPayload::Function { body, argc },
                    Some(id),
                );
                self.lir.instr_mut(f).has_call = true;
                self.result_from_fixed(f, id);
            }

            Opcode::Call => self.stub_call(LOpcode::Call, LPayload::None, id, true),

            Opcode::CollectGarbage => {
                let gc = self.append(LOpcode::CollectGarbage, LPayload::None, Some(id));
                self.lir.instr_mut(gc).has_call = true;
            }

            Opcode::GetStackTrace => {
                let trace = self.append(LOpcode::GetStackTrace, LPayload::None, Some(id));
                self.lir.instr_mut(trace).has_call = true;
                self.result_from_fixed(trace, id);
            }

            Opcode::LoadContext => {
                let Payload::ContextSlot(depth, index) = instr.payload else {
                    unreachable!()
                };
                let load =
                    self.append(LOpcode::LoadContext, LPayload::ContextSlot(depth, index), Some(id));
                if depth > 0 {
                    // Walking the context chain needs a register
                    self.add_scratch(load);
                }
                let res = self.lir.create_virtual();
                self.set_result(load, res, UseKind::Any);
                self.value_map.insert(id, res);
            }

            Opcode::StoreContext => {
                let Payload::ContextSlot(depth, index) = instr.payload else {
                    unreachable!()
                };
                let value = self.value_of(instr.args[0]);
                let store =
                    self.append(LOpcode::StoreContext, LPayload::ContextSlot(depth, index), Some(id));
                self.add_input(store, value, UseKind::Register);
                if depth > 0 {
                    self.add_scratch(store);
                }
            }

            Opcode::LoadProperty => {
                self.stub_call(LOpcode::LoadProperty, LPayload::None, id, true)
            }
            Opcode::StoreProperty => {
                self.stub_call(LOpcode::StoreProperty, LPayload::None, id, true)
            }
            Opcode::DeleteProperty => {
                self.stub_call(LOpcode::DeleteProperty, LPayload::None, id, false)
            }
            Opcode::AllocateObject => {
                self.stub_call(LOpcode::AllocateObject, LPayload::None, id, true)
            }
            Opcode::AllocateArray => {
                self.stub_call(LOpcode::AllocateArray, LPayload::None, id, true)
            }
            Opcode::Typeof => self.stub_call(LOpcode::Typeof, LPayload::None, id, true),
            Opcode::Sizeof => self.stub_call(LOpcode::Sizeof, LPayload::None, id, true),
            Opcode::Keysof => self.stub_call(LOpcode::Keysof, LPayload::None, id, true),
            Opcode::CloneOf => self.stub_call(LOpcode::CloneOf, LPayload::None, id, true),

            Opcode::If => {
                let cond = instr.args[0];
                let interval = self.value_of(cond);

                // Numeric comparisons take the fast branch
                let opcode = match self.graph.instr(cond).payload {
                    Payload::BinOp(
                        BinOpKind::Lt | BinOpKind::Gt | BinOpKind::Le | BinOpKind::Ge,
                    ) => LOpcode::BranchNumber,
                    _ => LOpcode::Branch,
                };

                let branch = self.append(opcode, LPayload::None, Some(id));
                self.add_input(branch, interval, UseKind::Register);
            }

            Opcode::Goto => self.visit_goto(id),

            Opcode::Return => {
                let value = instr.args[0];
                let fixed = self.to_fixed(value, STUB_RESULT_REGISTER);
                let ret = self.append(LOpcode::Return, LPayload::None, Some(id));
                self.add_input(ret, fixed, UseKind::Register);
            }
        }
    }

    /// Goto lowering: emit one move per live phi of the successor, mapping
    /// this predecessor's input onto the phi's virtual, then the goto.
    fn visit_goto(&mut self, id: hir::InstrId) {
        let block = self.graph.instr(id).block;
        let succ = self.graph.block(block).succs[0];
        let parent_index = usize::from(self.graph.block(succ).preds[0] != block);

        let phis = self.graph.block(succ).phis.clone();
        for phi in phis {
            let phi_instr = self.graph.instr(phi);

            // Skip phis the dead code eliminator got rid of
            if phi_instr.removed || !phi_instr.is_live {
                continue;
            }

            self.phi_lir(phi);
            let iphi = self.value_of(phi);

            let input = phi_instr.args[parent_index];
            // Inputs may not be generated yet
            if self.graph.instr(input).is_phi() && !self.value_map.contains_key(&input) {
                assert!(!self.graph.instr(input).removed);
                self.phi_lir(input);
            }
            let input_interval = self.value_of(input);

            let mv = self.append(LOpcode::Move, LPayload::None, None);
            self.add_input(mv, input_interval, UseKind::Any);
            self.set_result(mv, iphi, UseKind::Any);
        }

        self.append(LOpcode::Goto, LPayload::None, Some(id));
    }
}
