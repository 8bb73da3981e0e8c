//! AST -> HIR lowering. One walk per function body; nested function
//! literals are queued and become separate graph roots. The walk keeps a
//! per-block environment mapping stack slots to the instruction currently
//! holding their value, materializing phis at merge points and loop
//! headers.

use std::collections::VecDeque;

use log::debug;

use crate::{
    ast::{BinOpKind, FunctionLiteral, Node, NodeKind, ScopeSlot, UnOpKind},
    hir::{dom, BlockId, Graph, InstrId, Opcode, Payload, RootValue},
    intern::Symbol,
};

/// Builds the SSA graph for `function` and everything it closes over,
/// including dominators and reachability.
pub fn lower_to_hir(function: &FunctionLiteral) -> Graph {
    let mut builder = Builder {
        graph: Graph::new(),
        current_block: BlockId(0),
        current_root: BlockId(0),
        stack_slots: 0,
        loop_depth: 0,
        break_continue: Vec::new(),
        work_queue: VecDeque::new(),
    };

    builder.work_queue.push_back(QueuedFunction {
        literal: function,
        instr: None,
    });

    while let Some(queued) = builder.work_queue.pop_front() {
        builder.stack_slots = queued.literal.stack_slots;
        builder.loop_depth = 0;
        builder.break_continue.clear();

        let root = builder
            .graph
            .create_block(queued.literal.stack_slots, 0, BlockId(0));
        builder.graph.block_mut(root).root = root;
        builder.current_block = root;
        builder.current_root = root;
        builder.graph.roots.push(root);

        // Wire the `Function` instruction of the enclosing body to its root
        if let Some(instr) = queued.instr {
            let argc = match builder.graph.instr(instr).payload {
                Payload::Function { argc, .. } => argc,
                _ => unreachable!(),
            };
            builder.graph.instr_mut(instr).payload = Payload::Function { body: root, argc };
        }

        builder.visit_function_root(queued.literal);
    }

    debug!(
        "hir: built {} blocks / {} instructions across {} roots",
        builder.graph.blocks.len(),
        builder.graph.instr_count(),
        builder.graph.roots.len()
    );

    let mut graph = builder.graph;
    dom::derive_dominators(&mut graph);
    dom::derive_reachability(&mut graph);
    graph
}

struct QueuedFunction<'ast> {
    literal: &'ast FunctionLiteral,
    /// `Function` instruction in the enclosing body whose payload still
    /// needs its root block; `None` for the outermost function.
    instr: Option<InstrId>,
}

/// Targets for `break` / `continue` inside the innermost loop. Each break
/// chains a fresh block after the previous break target so no block ever
/// collects more than two predecessors.
struct BreakContinueInfo {
    brk: BlockId,
    continue_blocks: VecDeque<BlockId>,
    /// Loop depth of the code after the loop, used for break-chain blocks.
    outer_depth: u32,
}

struct Builder<'ast> {
    graph: Graph,
    current_block: BlockId,
    current_root: BlockId,
    stack_slots: usize,
    loop_depth: u32,
    break_continue: Vec<BreakContinueInfo>,
    work_queue: VecDeque<QueuedFunction<'ast>>,
}

impl<'ast> Builder<'ast> {
    fn create_block(&mut self) -> BlockId {
        self.graph
            .create_block(self.stack_slots, self.loop_depth, self.current_root)
    }

    fn create_block_at(&mut self, depth: u32) -> BlockId {
        self.graph
            .create_block(self.stack_slots, depth, self.current_root)
    }

    /// Creates and appends an instruction to the current block.
    fn add(&mut self, opcode: Opcode, payload: Payload) -> InstrId {
        let instr = self.graph.create_instr(opcode, payload);
        self.graph.append_instr(self.current_block, instr);
        instr
    }

    fn add_with_args(&mut self, opcode: Opcode, payload: Payload, args: &[InstrId]) -> InstrId {
        let instr = self.add(opcode, payload);
        for arg in args {
            self.graph.add_arg(instr, *arg);
        }
        instr
    }

    /// Emits a number literal (the canonical path for synthesized indices).
    fn number(&mut self, value: usize) -> InstrId {
        let symbol = Symbol::new(&value.to_string());
        let root = self.graph.root_id(RootValue::Number(symbol));
        self.add(Opcode::Literal, Payload::Root(root))
    }

    /// Publishes `value` as the current holder of `slot` in `block`'s env.
    fn assign_in(&mut self, block: BlockId, slot: ScopeSlot, value: InstrId) -> InstrId {
        self.graph.instr_mut(value).slot = Some(slot);
        self.graph.block_mut(block).env.set(slot.index, value);
        value
    }

    fn assign(&mut self, slot: ScopeSlot, value: InstrId) -> InstrId {
        self.assign_in(self.current_block, slot, value)
    }

    /// Creates a phi owned by `block` for `slot` and records it in the
    /// block's phi shadow map. The caller appends it and adds inputs.
    fn create_phi(&mut self, block: BlockId, slot: ScopeSlot) -> InstrId {
        let phi = self.graph.create_instr(Opcode::Phi, Payload::None);
        self.graph.instr_mut(phi).slot = Some(slot);
        self.graph.block_mut(block).env.set_phi(slot.index, phi);
        phi
    }

    /// Ends `from` with a goto into `target`, merging environments. A block
    /// that already ended (returned, broke) contributes no edge.
    fn goto_from(&mut self, from: BlockId, target: BlockId) {
        if self.graph.block(from).ended {
            return;
        }

        let goto = self.graph.create_instr(Opcode::Goto, Payload::None);
        self.graph.append_instr(from, goto);
        self.graph.block_mut(from).ended = true;
        self.graph.add_edge(from, target);
        self.add_predecessor(target, from);
    }

    fn goto(&mut self, target: BlockId) {
        self.goto_from(self.current_block, target);
    }

    /// Ends the current block with a two-way branch on `condition`.
    fn branch(&mut self, condition: InstrId, t: BlockId, f: BlockId) -> InstrId {
        let block = self.current_block;
        assert!(!self.graph.block(block).ended, "branch in ended block");

        let instr = self.graph.create_instr(Opcode::If, Payload::None);
        self.graph.append_instr(block, instr);
        self.graph.add_arg(instr, condition);
        self.graph.block_mut(block).ended = true;

        self.graph.add_edge(block, t);
        self.add_predecessor(t, block);
        self.graph.add_edge(block, f);
        self.add_predecessor(f, block);

        instr
    }

    /// Ends the current block with a return of `value`.
    fn emit_return(&mut self, value: InstrId) -> InstrId {
        let instr = self.add_with_args(Opcode::Return, Payload::None, &[value]);
        self.graph.block_mut(self.current_block).ended = true;
        instr
    }

    fn join(&mut self, t: BlockId, f: BlockId) -> BlockId {
        let join = self.create_block();
        self.goto_from(t, join);
        self.goto_from(f, join);
        join
    }

    /// Environment propagation along a new edge. The first predecessor's
    /// environment is copied wholesale; the second materializes a phi for
    /// every slot the two sides disagree on.
    fn add_predecessor(&mut self, block: BlockId, pred: BlockId) {
        if self.graph.block(block).preds.len() == 1 {
            let env = self.graph.block(pred).env.clone();
            self.graph.block_mut(block).env.copy_from(&env);
            return;
        }

        for i in 0..self.graph.block(pred).env.stack_slots() {
            let Some(curr) = self.graph.block(pred).env.at(i) else {
                continue;
            };

            let Some(old) = self.graph.block(block).env.at(i) else {
                // Slot unseen on the other path: propagate
                self.graph.block_mut(block).env.set(i, curr);
                continue;
            };

            // In loops a value can be propagated up to the block where it
            // was declared
            if old == curr {
                continue;
            }

            let existing = self.graph.block(block).env.phi_at(i);
            let phi = match existing {
                Some(phi) if self.graph.instr(phi).block == block => phi,
                _ => {
                    let slot = self
                        .graph
                        .instr(curr)
                        .slot
                        .unwrap_or_else(|| ScopeSlot::stack(i));
                    let phi = self.create_phi(block, slot);
                    self.graph.append_phi(block, phi);
                    self.graph.add_arg(phi, old);
                    self.assign_in(block, slot, phi);
                    phi
                }
            };

            self.graph.add_arg(phi, curr);
        }
    }

    /// Gives every never-assigned slot a nil value so the loop header can
    /// build a full-width phi row.
    fn mark_pre_loop(&mut self) {
        for i in 0..self.stack_slots {
            if self
                .graph
                .block(self.current_block)
                .env
                .at(i)
                .is_some()
            {
                continue;
            }

            let nil = self.add(Opcode::Nil, Payload::None);
            self.assign(ScopeSlot::stack(i), nil);
        }
    }

    /// Marks `block` as a loop header and creates a phi per stack slot
    /// (logic slot excluded), seeded with the preheader value.
    fn mark_loop(&mut self, block: BlockId) {
        self.graph.block_mut(block).is_loop = true;

        for i in 0..self.stack_slots {
            let slot = ScopeSlot::stack(i);
            let old = self.graph.block(block).env.at(i);

            let phi = self.create_phi(block, slot);
            self.graph.append_phi(block, phi);
            if let Some(old) = old {
                self.graph.add_arg(phi, old);
            }
            self.assign_in(block, slot, phi);
        }
    }

    fn visit_function_root(&mut self, literal: &'ast FunctionLiteral) {
        self.add(Opcode::Entry, Payload::ContextSlots(literal.context_slots));

        let mut index: Option<InstrId> = None;
        let mut flat_index = 0usize;
        let mut seen_varg = false;

        if !literal.args.is_empty() {
            index = Some(self.number(0));
        }

        let argc = literal.args.len();
        for (i, arg) in literal.args.iter().enumerate() {
            let (value, varg) = match &arg.kind {
                NodeKind::VarArg(inner) => (inner.as_ref(), true),
                _ => (arg, false),
            };
            let NodeKind::Value { slot, .. } = &value.kind else {
                unreachable!("formal parameter without a resolved slot")
            };

            if varg {
                seen_varg = true;
            }

            // Result vararg array plus the count of formals following it
            let (varg_arr, varg_rest) = if varg {
                let arr = self.add(Opcode::AllocateArray, Payload::None);
                let rest = self.number(argc - i - 1);
                (Some(arr), Some(rest))
            } else {
                (None, None)
            };

            let opcode = if varg {
                Opcode::LoadVarArg
            } else {
                Opcode::LoadArg
            };
            let mut load_arg =
                self.add_with_args(opcode, Payload::None, &[index.expect("arg index")]);

            if varg {
                self.graph.add_arg(load_arg, varg_rest.unwrap());
                self.graph.add_arg(load_arg, varg_arr.unwrap());
                load_arg = varg_arr.unwrap();
            }

            if slot.is_stack() {
                // No instruction is needed
                self.assign(*slot, load_arg);
            } else {
                self.add_with_args(
                    Opcode::StoreContext,
                    Payload::ContextSlot(slot.depth, slot.index),
                    &[load_arg],
                );
            }

            // Do not generate an index if the args have ended
            if i + 1 == argc {
                continue;
            }

            index = Some(if !varg {
                if !seen_varg {
                    // Index is linear here, just generate a new literal
                    flat_index += 1;
                    self.number(flat_index)
                } else {
                    let one = self.number(1);
                    self.add_with_args(
                        Opcode::BinOp,
                        Payload::BinOp(BinOpKind::Add),
                        &[index.unwrap(), one],
                    )
                }
            } else {
                // Advance by the length of the vararg
                let length =
                    self.add_with_args(Opcode::Sizeof, Payload::None, &[load_arg]);
                self.add_with_args(
                    Opcode::BinOp,
                    Payload::BinOp(BinOpKind::Add),
                    &[index.unwrap(), length],
                )
            });
        }

        for stmt in &literal.body {
            if self.graph.block(self.current_block).ended {
                break;
            }
            self.visit(stmt);
        }

        if !self.graph.block(self.current_block).ended {
            let nil = self.add(Opcode::Nil, Payload::None);
            self.emit_return(nil);
        }
    }

    /// Visits an expression, panicking if the node is a statement.
    fn visit_value(&mut self, node: &'ast Node) -> InstrId {
        self.visit(node).expect("expression in value position")
    }

    fn visit(&mut self, node: &'ast Node) -> Option<InstrId> {
        match &node.kind {
            NodeKind::Function(literal) => {
                let instr = self.graph.create_instr(
                    Opcode::Function,
                    Payload::Function {
                        // Patched when the queue reaches this literal
                        body: BlockId(u32::MAX),
                        argc: literal.args.len(),
                    },
                );
                self.graph.append_instr(self.current_block, instr);
                self.work_queue.push_back(QueuedFunction {
                    literal,
                    instr: Some(instr),
                });
                Some(instr)
            }

            NodeKind::Block(stmts) => {
                for stmt in stmts {
                    if self.graph.block(self.current_block).ended {
                        break;
                    }
                    self.visit(stmt);
                }
                None
            }

            NodeKind::Assign { target, value } => Some(self.visit_assign(target, value)),

            NodeKind::Value { slot, .. } => Some(self.visit_slot(*slot)),

            NodeKind::Member { receiver, property } => {
                let prop = self.visit_value(property);
                let recv = self.visit_value(receiver);
                Some(self.add_with_args(Opcode::LoadProperty, Payload::None, &[recv, prop]))
            }

            NodeKind::Delete(member) => {
                let NodeKind::Member { receiver, property } = &member.kind else {
                    unreachable!("delete of a non-member expression")
                };
                let prop = self.visit_value(property);
                let recv = self.visit_value(receiver);
                self.add_with_args(Opcode::DeleteProperty, Payload::None, &[recv, prop]);

                // Delete property returns nil
                Some(self.add(Opcode::Nil, Payload::None))
            }

            NodeKind::Call { callee, args } => Some(self.visit_call(callee, args)),

            NodeKind::SelfArg | NodeKind::VarArg(_) => {
                unreachable!("argument markers outside a call")
            }

            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let t = self.create_block();
                let f = self.create_block();
                let cond = self.visit_value(condition);

                self.branch(cond, t, f);

                self.current_block = t;
                self.visit(then_branch);
                let t = self.current_block;

                let f = if let Some(else_branch) = else_branch {
                    self.current_block = f;
                    self.visit(else_branch);
                    self.current_block
                } else {
                    f
                };

                self.current_block = self.join(t, f);
                None
            }

            NodeKind::While { condition, body } => {
                self.visit_while(condition, body);
                None
            }

            NodeKind::Break => {
                let target = self.get_break();
                self.goto(target);
                None
            }

            NodeKind::Continue => {
                let target = self.get_continue();
                self.goto(target);
                None
            }

            NodeKind::Return(value) => {
                let value = self.visit_value(value);
                Some(self.emit_return(value))
            }

            NodeKind::UnOp { op, operand } => Some(self.visit_un_op(node, *op, operand)),

            NodeKind::BinOp { op, lhs, rhs } => Some(self.visit_bin_op(node, *op, lhs, rhs)),

            NodeKind::Typeof(operand) => {
                let lhs = self.visit_value(operand);
                Some(self.add_with_args(Opcode::Typeof, Payload::None, &[lhs]))
            }
            NodeKind::Sizeof(operand) => {
                let lhs = self.visit_value(operand);
                Some(self.add_with_args(Opcode::Sizeof, Payload::None, &[lhs]))
            }
            NodeKind::Keysof(operand) => {
                let lhs = self.visit_value(operand);
                Some(self.add_with_args(Opcode::Keysof, Payload::None, &[lhs]))
            }
            NodeKind::CloneOf(operand) => {
                let lhs = self.visit_value(operand);
                Some(self.add_with_args(Opcode::CloneOf, Payload::None, &[lhs]))
            }

            NodeKind::ObjectLiteral { keys, values } => {
                let res = self.add(Opcode::AllocateObject, Payload::None);
                for (key, value) in keys.iter().zip(values.iter()) {
                    let value = self.visit_value(value);
                    let key = self.visit_value(key);
                    self.add_with_args(Opcode::StoreProperty, Payload::None, &[res, key, value]);
                }
                Some(res)
            }

            NodeKind::ArrayLiteral(elements) => {
                let res = self.add(Opcode::AllocateArray, Payload::None);
                for (i, element) in elements.iter().enumerate() {
                    let key = self.number(i);
                    let value = self.visit_value(element);
                    self.add_with_args(Opcode::StoreProperty, Payload::None, &[res, key, value]);
                }
                Some(res)
            }

            NodeKind::Number(symbol) => Some(self.literal(RootValue::Number(*symbol), node)),
            NodeKind::String(symbol) => Some(self.literal(RootValue::String(*symbol), node)),
            NodeKind::Property(symbol) => Some(self.literal(RootValue::Property(*symbol), node)),
            NodeKind::True => Some(self.literal(RootValue::True, node)),
            NodeKind::False => Some(self.literal(RootValue::False, node)),
            NodeKind::Nil => Some(self.add(Opcode::Nil, Payload::None)),
        }
    }

    fn literal(&mut self, value: RootValue, node: &Node) -> InstrId {
        let root = self.graph.root_id(value);
        let instr = self.add(Opcode::Literal, Payload::Root(root));
        self.graph.instr_mut(instr).ast_offset = node.offset;
        instr
    }

    /// Reads a variable. Stack slots resolve through the environment,
    /// creating a single-input phi when the value flows in from outside
    /// this block (phi pruning collapses it again if it stays trivial).
    fn visit_slot(&mut self, slot: ScopeSlot) -> InstrId {
        if !slot.is_stack() {
            return self.add(
                Opcode::LoadContext,
                Payload::ContextSlot(slot.depth, slot.index),
            );
        }

        let block = self.current_block;
        let existing = self.graph.block(block).env.at(slot.index);

        if let Some(i) = existing {
            if self.graph.instr(i).block == block {
                // Local value
                return i;
            }
        }

        // External value
        let phi = self.create_phi(block, slot);
        self.graph.append_phi(block, phi);
        if let Some(i) = existing {
            self.graph.add_arg(phi, i);
        }
        self.assign(slot, phi)
    }

    fn visit_assign(&mut self, target: &'ast Node, value: &'ast Node) -> InstrId {
        let rhs = self.visit_value(value);

        match &target.kind {
            NodeKind::Value { slot, .. } => {
                if slot.is_stack() {
                    // No instruction is needed
                    self.assign(*slot, rhs);
                } else {
                    self.add_with_args(
                        Opcode::StoreContext,
                        Payload::ContextSlot(slot.depth, slot.index),
                        &[rhs],
                    );
                }
                rhs
            }
            NodeKind::Member { receiver, property } => {
                let property = self.visit_value(property);
                let receiver = self.visit_value(receiver);
                self.add_with_args(
                    Opcode::StoreProperty,
                    Payload::None,
                    &[receiver, property, rhs],
                )
            }
            _ => unreachable!("assignment to a non-place expression"),
        }
    }

    fn visit_un_op(&mut self, node: &'ast Node, op: UnOpKind, operand: &'ast Node) -> InstrId {
        match op {
            UnOpKind::PreInc | UnOpKind::PostInc | UnOpKind::PreDec | UnOpKind::PostDec => {
                let bin_op = if matches!(op, UnOpKind::PreInc | UnOpKind::PostInc) {
                    BinOpKind::Add
                } else {
                    BinOpKind::Sub
                };

                let pre = matches!(op, UnOpKind::PreInc | UnOpKind::PreDec);

                let (res, load, value) = if pre {
                    // ++i lowers as i = i + 1, yielding the new value
                    let one = Node::new(NodeKind::Number(Symbol::new("1")), node.offset);
                    let lhs = self.visit_value(operand);
                    let ione = self.literal(RootValue::Number(Symbol::new("1")), &one);
                    let bin = self.add_with_args(
                        Opcode::BinOp,
                        Payload::BinOp(bin_op),
                        &[lhs, ione],
                    );
                    self.graph.instr_mut(bin).ast_offset = node.offset;
                    (bin, lhs, bin)
                } else {
                    // i++ yields the old value and assigns the new one
                    let one = Node::new(NodeKind::Number(Symbol::new("1")), node.offset);
                    let ione = self.literal(RootValue::Number(Symbol::new("1")), &one);
                    let res = self.visit_value(operand);
                    let bin = self.add_with_args(
                        Opcode::BinOp,
                        Payload::BinOp(bin_op),
                        &[res, ione],
                    );
                    self.graph.instr_mut(bin).ast_offset = node.offset;
                    (res, res, bin)
                };

                // Assign the new value back to the place
                match &operand.kind {
                    NodeKind::Value { slot, .. } => {
                        if slot.is_stack() {
                            self.assign(*slot, value);
                        } else {
                            self.add_with_args(
                                Opcode::StoreContext,
                                Payload::ContextSlot(slot.depth, slot.index),
                                &[value],
                            );
                        }
                    }
                    NodeKind::Member { .. } => {
                        // The property load carries the receiver and key
                        let receiver = self.graph.instr(load).args[0];
                        let property = self.graph.instr(load).args[1];
                        self.add_with_args(
                            Opcode::StoreProperty,
                            Payload::None,
                            &[receiver, property, value],
                        );
                    }
                    _ => unreachable!("increment of a non-place expression"),
                }

                res
            }

            UnOpKind::Plus | UnOpKind::Minus => {
                // +i = 0 + i, -i = 0 - i
                let bin_op = if op == UnOpKind::Plus {
                    BinOpKind::Add
                } else {
                    BinOpKind::Sub
                };
                let zero = Node::new(NodeKind::Number(Symbol::new("0")), node.offset);
                let lhs = self.literal(RootValue::Number(Symbol::new("0")), &zero);
                let rhs = self.visit_value(operand);
                let bin =
                    self.add_with_args(Opcode::BinOp, Payload::BinOp(bin_op), &[lhs, rhs]);
                self.graph.instr_mut(bin).ast_offset = node.offset;
                bin
            }

            UnOpKind::Not => {
                let lhs = self.visit_value(operand);
                self.add_with_args(Opcode::Not, Payload::None, &[lhs])
            }
        }
    }

    fn visit_bin_op(
        &mut self,
        node: &'ast Node,
        op: BinOpKind,
        lhs: &'ast Node,
        rhs: &'ast Node,
    ) -> InstrId {
        if !op.is_bool_logic() {
            let lhs = self.visit_value(lhs);
            let rhs = self.visit_value(rhs);
            let res = self.add_with_args(Opcode::BinOp, Payload::BinOp(op), &[lhs, rhs]);
            self.graph.instr_mut(res).ast_offset = node.offset;
            return res;
        }

        // Short-circuit logic routes both outcomes through the reserved
        // logic slot and reads the value back out of the join's phi.
        let lhs = self.visit_value(lhs);
        let slot = self.graph.block(self.current_block).env.logic_slot();

        // A block can't be a join and a branch at the same time
        let branch_block = self.create_block();
        self.goto(branch_block);
        self.current_block = branch_block;

        let t = self.create_block();
        let f = self.create_block();
        self.branch(lhs, t, f);

        self.current_block = t;
        if op == BinOpKind::LAnd {
            let rhs_value = self.visit_value(rhs);
            self.assign(slot, rhs_value);
        } else {
            self.assign(slot, lhs);
        }
        let t = self.current_block;

        self.current_block = f;
        if op == BinOpKind::LAnd {
            self.assign(slot, lhs);
        } else {
            let rhs_value = self.visit_value(rhs);
            self.assign(slot, rhs_value);
        }
        let f = self.current_block;

        self.current_block = self.join(t, f);
        self.graph
            .block(self.current_block)
            .env
            .phi_at(slot.index)
            .expect("short-circuit join without a phi")
    }

    fn visit_while(&mut self, condition: &'ast Node, body: &'ast Node) {
        let outer_depth = self.loop_depth;
        self.loop_depth += 1;

        let start = self.create_block();
        self.mark_pre_loop();
        self.goto(start);

        // A block can't be a join and a branch at the same time
        let cond_block = self.create_block();
        self.mark_loop(start);
        self.goto_from(start, cond_block);
        self.current_block = cond_block;

        let cond = self.visit_value(condition);

        let body_block = self.create_block();
        let latch = self.create_block();
        let end = self.create_block_at(outer_depth);

        self.branch(cond, body_block, end);

        self.current_block = body_block;
        self.break_continue.push(BreakContinueInfo {
            brk: end,
            continue_blocks: VecDeque::new(),
            outer_depth,
        });

        self.visit(body);

        // Route pending continue blocks through the tail of the body
        while let Some(next) = {
            let info = self.break_continue.last_mut().unwrap();
            info.continue_blocks.pop_front()
        } {
            self.goto(next);
            self.current_block = next;
        }
        self.goto(latch);
        self.goto_from(latch, start);

        // The block after the loop should not be a join
        let brk = self.get_break();
        self.current_block = brk;

        self.break_continue.pop();
        self.loop_depth = outer_depth;
    }

    /// Allocates a fresh break target chained after the previous one, so
    /// every `break` (and the loop exit itself) gets its own block.
    fn get_break(&mut self) -> BlockId {
        let info = self.break_continue.last().expect("break outside a loop");
        let depth = info.outer_depth;
        let old_brk = info.brk;

        let block = self.create_block_at(depth);
        self.goto_from(old_brk, block);
        self.break_continue.last_mut().unwrap().brk = block;

        block
    }

    fn get_continue(&mut self) -> BlockId {
        let block = self.create_block();
        self.break_continue
            .last_mut()
            .expect("continue outside a loop")
            .continue_blocks
            .push_back(block);
        block
    }

    fn visit_call(&mut self, callee: &'ast Node, args: &'ast [Node]) -> InstrId {
        // Compiler intrinsics
        if let NodeKind::Value { name, .. } = &callee.kind {
            if name.value() == "__$gc" {
                self.add(Opcode::CollectGarbage, Payload::None);
                return self.add(Opcode::Nil, Payload::None);
            } else if name.value() == "__$trace" {
                return self.add(Opcode::GetStackTrace, Payload::None);
            }
        }

        let has_self = matches!(args.first().map(|a| &a.kind), Some(NodeKind::SelfArg));

        // Generate all argument values and collect the pending stores
        let mut vararg: Option<InstrId> = None;
        let mut stores: Vec<InstrId> = Vec::new();
        for arg in args {
            let (opcode, rhs) = match &arg.kind {
                // The self argument is processed later
                NodeKind::SelfArg => continue,
                NodeKind::VarArg(inner) => {
                    let rhs = self.visit_value(inner);
                    vararg = Some(rhs);
                    (Opcode::StoreVarArg, rhs)
                }
                _ => (Opcode::StoreArg, self.visit_value(arg)),
            };

            let store = self.graph.create_instr(opcode, Payload::None);
            self.graph.add_arg(store, rhs);
            stores.insert(0, store);
        }

        // Determine argc; a vararg contributes its dynamic length instead
        let mut argc = args.len();
        if vararg.is_some() {
            argc -= 1;
        }

        let mut hargc = self.number(argc);

        if let Some(vararg) = vararg {
            let length = self.add_with_args(Opcode::Sizeof, Payload::None, &[vararg]);
            hargc = self.add_with_args(
                Opcode::BinOp,
                Payload::BinOp(BinOpKind::Add),
                &[hargc, length],
            );
        }

        // Process the self argument
        let mut receiver = None;
        if has_self {
            let NodeKind::Member { receiver: recv, .. } = &callee.kind else {
                unreachable!("method call without a member callee")
            };
            let recv = self.visit_value(recv);
            receiver = Some(recv);

            let store = self.graph.create_instr(Opcode::StoreArg, Payload::None);
            self.graph.add_arg(store, recv);
            stores.push(store);
        }

        let callee_value = if has_self {
            let NodeKind::Member { property, .. } = &callee.kind else {
                unreachable!()
            };
            let property = self.visit_value(property);
            self.add_with_args(
                Opcode::LoadProperty,
                Payload::None,
                &[receiver.unwrap(), property],
            )
        } else {
            self.visit_value(callee)
        };

        self.add_with_args(Opcode::AlignStack, Payload::None, &[hargc]);

        // Now place the stores
        for store in stores {
            self.graph.append_instr(self.current_block, store);
        }

        let call = self.graph.create_instr(Opcode::Call, Payload::None);
        self.graph.append_instr(self.current_block, call);
        self.graph.add_arg(call, callee_value);
        self.graph.add_arg(call, hargc);
        call
    }
}
