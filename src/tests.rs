//! End-to-end tests over hand-built ASTs: the parser lives outside this
//! crate, so scenarios construct their input directly and assert on graph
//! structure, dump contents, and allocation invariants.

use crate::{
    ast::{BinOpKind, FunctionLiteral, Node, NodeKind, ScopeSlot, UnOpKind},
    compile,
    hir::{self, dom, Graph, Opcode},
    intern::Symbol,
    lir::{IntervalKind, LOpcode, Lir},
};

/* AST construction helpers */

fn func(stack_slots: usize, args: Vec<Node>, body: Vec<Node>) -> FunctionLiteral {
    FunctionLiteral {
        args,
        body,
        stack_slots,
        context_slots: 0,
    }
}

fn var(index: usize) -> Node {
    Node::synthetic(NodeKind::Value {
        slot: ScopeSlot::stack(index),
        name: Symbol::new(&format!("v{index}")),
    })
}

fn num(text: &str) -> Node {
    Node::number(text)
}

fn boolean(value: bool) -> Node {
    Node::synthetic(if value { NodeKind::True } else { NodeKind::False })
}

fn assign(target: Node, value: Node) -> Node {
    Node::synthetic(NodeKind::Assign {
        target: Box::new(target),
        value: Box::new(value),
    })
}

fn bin(op: BinOpKind, lhs: Node, rhs: Node) -> Node {
    Node::synthetic(NodeKind::BinOp {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    })
}

fn un(op: UnOpKind, operand: Node) -> Node {
    Node::synthetic(NodeKind::UnOp {
        op,
        operand: Box::new(operand),
    })
}

fn ret(value: Node) -> Node {
    Node::synthetic(NodeKind::Return(Box::new(value)))
}

fn block(stmts: Vec<Node>) -> Node {
    Node::synthetic(NodeKind::Block(stmts))
}

fn if_else(cond: Node, then_branch: Node, else_branch: Option<Node>) -> Node {
    Node::synthetic(NodeKind::If {
        condition: Box::new(cond),
        then_branch: Box::new(then_branch),
        else_branch: else_branch.map(Box::new),
    })
}

fn while_(cond: Node, body: Node) -> Node {
    Node::synthetic(NodeKind::While {
        condition: Box::new(cond),
        body: Box::new(body),
    })
}

fn vararg(inner: Node) -> Node {
    Node::synthetic(NodeKind::VarArg(Box::new(inner)))
}

fn call(callee: Node, args: Vec<Node>) -> Node {
    Node::synthetic(NodeKind::Call {
        callee: Box::new(callee),
        args,
    })
}

/* Structural checkers */

/// Live, reachable opcodes of one block in list order, phis excluded.
fn block_opcodes(graph: &Graph, seq: u32) -> Vec<Opcode> {
    let block = graph
        .blocks
        .iter()
        .find(|b| b.seq == seq)
        .expect("no block with that number");
    block
        .instructions
        .iter()
        .map(|i| graph.instr(*i).opcode)
        .collect()
}

fn live_opcode_count(graph: &Graph, opcode: Opcode) -> usize {
    graph
        .instrs
        .iter()
        .filter(|i| !i.removed && i.is_live && i.opcode == opcode)
        .count()
}

/// SSA validity: every argument's definition dominates the use (through
/// the matching predecessor for phis), and in-block order follows ids.
fn check_ssa(graph: &Graph) {
    for instr in graph.instrs.iter() {
        if instr.removed || !instr.is_live {
            continue;
        }
        if graph.block(instr.block).dfs_id == hir::DFS_UNVISITED {
            continue;
        }

        for (pos, arg) in instr.args.iter().enumerate() {
            let def = graph.instr(*arg);
            assert!(!def.removed, "use of a removed instruction");

            if instr.is_phi() {
                let pred = graph.block(instr.block).preds[pos];
                if graph.block(pred).dfs_id == hir::DFS_UNVISITED {
                    continue;
                }
                assert!(
                    dom::dominates(graph, def.block, pred),
                    "phi input does not dominate its predecessor"
                );
            } else {
                assert!(
                    dom::dominates(graph, def.block, instr.block),
                    "definition does not dominate use"
                );
                if def.block == instr.block && !def.is_phi() {
                    assert!(def.id < instr.id, "definition after use in a block");
                }
            }
        }
    }
}

/// For every CFG edge u -> v, idom(v) dominates u.
fn check_dominators(graph: &Graph) {
    for block in graph.blocks.iter() {
        if block.dfs_id == hir::DFS_UNVISITED {
            continue;
        }
        let Some(idom) = block.dominator else {
            continue;
        };

        for pred in &block.preds {
            if graph.block(*pred).dfs_id == hir::DFS_UNVISITED {
                continue;
            }
            assert!(
                dom::dominates(graph, idom, *pred),
                "idom not on a path to a predecessor"
            );
        }
    }
}

/// Interval sanity: ranges sorted, disjoint, non-empty; every use at a
/// real (even) position is inside or exactly at the end of a range.
fn check_intervals(lir: &Lir) {
    for interval in lir.intervals.iter() {
        for w in interval.ranges.windows(2) {
            assert!(w[0].end <= w[1].start, "overlapping or unsorted ranges");
        }
        for range in &interval.ranges {
            assert!(range.start < range.end, "empty range");
        }

        for use_id in &interval.uses {
            let pos = lir.use_position(*use_id);
            if pos % 2 != 0 {
                continue;
            }
            let touched = interval.covers(pos)
                || interval.ranges.iter().any(|r| r.end == pos);
            assert!(touched, "use at {pos} outside every range");
        }
    }
}

/// Allocation soundness: everything with a range ends up placed, no two
/// overlapping virtual-born intervals share a register, and no two
/// overlapping spilled intervals share a slot.
fn check_allocation(lir: &Lir) {
    let placed: Vec<_> = lir
        .intervals
        .iter()
        .filter(|i| !i.ranges.is_empty())
        .collect();

    for interval in &placed {
        assert!(
            !interval.is_virtual(),
            "interval {:?} left unallocated",
            interval.id
        );
        if interval.is_register() {
            assert!((0..crate::lir::NUM_REGISTERS as i32).contains(&interval.index));
        }
        if interval.is_stack_slot() {
            assert!(interval.index >= 0, "spill without a slot");
        }
    }

    for (i, a) in placed.iter().enumerate() {
        for b in placed.iter().skip(i + 1) {
            if a.is_fixed() || b.is_fixed() {
                continue;
            }
            if a.kind != b.kind || a.index != b.index {
                continue;
            }
            if a.is_register() || a.is_stack_slot() {
                assert!(
                    a.find_intersection(b).is_none(),
                    "{:?} and {:?} share a location while overlapping",
                    a.id,
                    b.id
                );
            }
        }
    }
}

fn check_units(units: &[Lir]) {
    for lir in units {
        check_intervals(lir);
        check_allocation(lir);

        for block in &lir.order {
            let block = lir.block(*block);
            let ids: Vec<i32> = block
                .instructions
                .iter()
                .map(|i| lir.instr(*i).id)
                .collect();

            // Label first, ids strictly increasing, control not followed
            // by anything
            assert_eq!(ids.first(), Some(&block.start_id));
            for w in ids.windows(2) {
                assert!(w[0] < w[1], "instruction ids out of order");
            }
            for (i, instr) in block.instructions.iter().enumerate() {
                if lir.instr(*instr).opcode.is_control() {
                    assert_eq!(i, block.instructions.len() - 1);
                }
            }
        }
    }
}

/* Scenarios */

#[test]
fn straight_line_addition_stays_in_one_block() {
    let f = func(0, vec![], vec![ret(bin(BinOpKind::Add, num("1"), num("2")))]);
    let result = compile(&f, None);

    assert_eq!(result.graph.roots.len(), 1);
    assert_eq!(result.graph.blocks.len(), 1);
    assert_eq!(
        block_opcodes(&result.graph, 0),
        vec![
            Opcode::Entry,
            Opcode::Literal,
            Opcode::Literal,
            Opcode::BinOp,
            Opcode::Return
        ]
    );

    let dump = crate::hir::pretty_print::hir_to_string(&result.graph);
    assert!(dump.contains("# Block 0"), "{dump}");
    assert!(dump.contains("BinOp[+](i1, i2)"), "{dump}");

    check_ssa(&result.graph);
    check_dominators(&result.graph);
    check_units(&result.units);
}

#[test]
fn branch_merges_through_a_phi() {
    // if (a) { a = 2 } return a
    let f = func(
        1,
        vec![],
        vec![
            if_else(var(0), block(vec![assign(var(0), num("2"))]), None),
            ret(var(0)),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    assert_eq!(graph.blocks.len(), 4);

    let join = graph.blocks.iter().find(|b| b.seq == 3).unwrap();
    assert_eq!(join.phis.len(), 1);

    let phi = graph.instr(join.phis[0]);
    assert_eq!(phi.input_count(), 2);
    // Input 0 comes through the then-branch, input 1 is the undefined
    // path, collapsed to a nil materialization
    assert_eq!(graph.instr(phi.args[0]).opcode, Opcode::Literal);
    assert_eq!(graph.instr(phi.args[1]).opcode, Opcode::Nil);

    // The literal stays in the then-branch, not hoisted past the split
    assert_eq!(graph.block(graph.instr(phi.args[0]).block).seq, 1);

    let idom = join.dominator.expect("join without a dominator");
    assert_eq!(graph.block(idom).seq, 0);

    check_ssa(graph);
    check_dominators(graph);
    check_units(&result.units);
}

#[test]
fn loop_counter_keeps_its_back_edge_phi() {
    // while (true) { a++ } return a
    let f = func(
        1,
        vec![],
        vec![
            while_(boolean(true), block(vec![un(UnOpKind::PostInc, var(0))])),
            ret(var(0)),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    let header = graph
        .blocks
        .iter()
        .find(|b| b.is_loop)
        .expect("no loop header");
    assert_eq!(header.loop_depth, 1);
    assert_eq!(header.phis.len(), 1);

    let phi = graph.instr(header.phis[0]);
    assert_eq!(phi.input_count(), 2);
    // The increment feeds the back edge
    assert_eq!(graph.instr(phi.args[1]).opcode, Opcode::BinOp);

    // The post-exit block carries the return
    let exit = graph.blocks.iter().find(|b| b.seq == 6).unwrap();
    assert_eq!(
        graph.instr(*exit.instructions.last().unwrap()).opcode,
        Opcode::Return
    );

    // Both literals are loop-invariant and end up in the entry block
    for instr in graph.instrs.iter() {
        if instr.removed || !instr.is_live || instr.opcode != Opcode::Literal {
            continue;
        }
        assert_eq!(
            graph.block(instr.block).seq,
            0,
            "literal left inside the loop"
        );
    }

    // The phi's interval cannot survive the body's clobbers in one piece;
    // splitting must leave a move connecting the pieces
    let lir = result.main_unit();
    let family = |i: &crate::lir::Interval| i.split_parent.unwrap_or(i.id);
    let bridged = lir
        .instrs
        .iter()
        .filter(|i| i.opcode == LOpcode::Gap)
        .flat_map(|g| g.moves.iter())
        .any(|(from, to)| {
            let a = lir.interval(lir.use_(*from).interval);
            let b = lir.interval(lir.use_(*to).interval);
            a.id != b.id && family(a) == family(b)
        });
    assert!(bridged, "split intervals left unbridged");

    check_ssa(graph);
    check_dominators(graph);
    check_units(&result.units);
}

#[test]
fn short_circuit_uses_the_reserved_logic_slot() {
    // i = 0; return i && 1
    let f = func(
        1,
        vec![],
        vec![
            assign(var(0), num("0")),
            ret(bin(BinOpKind::LAnd, var(0), num("1"))),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    let phi = graph
        .instrs
        .iter()
        .find(|i| i.is_phi() && !i.removed)
        .expect("short-circuit join lost its phi");
    assert_eq!(phi.input_count(), 2);
    // Published through the slot reserved past the function's own slots
    assert_eq!(phi.slot, Some(ScopeSlot::stack(1)));

    // True branch selects the rhs literal, false branch the lhs value
    let t = graph.instr(phi.args[0]);
    let f_ = graph.instr(phi.args[1]);
    assert_eq!(t.opcode, Opcode::Literal);
    assert_eq!(f_.opcode, Opcode::Literal);
    assert_ne!(t.handle, f_.handle);

    // The return reads the phi
    let ret_instr = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::Return && !i.removed)
        .unwrap();
    assert!(graph.instr(ret_instr.args[0]).is_phi());

    check_ssa(graph);
    check_units(&result.units);
}

#[test]
fn nested_loops_carry_independent_phis() {
    // while (i) { while (j) { --j } --i } return 0
    let f = func(
        2,
        vec![],
        vec![
            while_(
                var(0),
                block(vec![
                    while_(var(1), block(vec![un(UnOpKind::PreDec, var(1))])),
                    un(UnOpKind::PreDec, var(0)),
                ]),
            ),
            ret(num("0")),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    let headers: Vec<_> = graph.blocks.iter().filter(|b| b.is_loop).collect();
    assert_eq!(headers.len(), 2);

    let depths: Vec<u32> = headers.iter().map(|h| h.loop_depth).collect();
    assert!(depths.contains(&1) && depths.contains(&2), "{depths:?}");

    // Each header keeps a two-input phi for its own counter
    for header in &headers {
        assert!(
            header
                .phis
                .iter()
                .any(|p| graph.instr(*p).input_count() == 2),
            "loop header lost its back-edge phi"
        );
    }

    check_ssa(graph);
    check_dominators(graph);
    check_units(&result.units);
}

#[test]
fn gvn_merges_within_a_root_only() {
    // x = 1; y = 2; return (x + y) + (x + y)
    let f = func(
        2,
        vec![],
        vec![
            assign(var(0), num("1")),
            assign(var(1), num("2")),
            ret(bin(
                BinOpKind::Add,
                bin(BinOpKind::Add, var(0), var(1)),
                bin(BinOpKind::Add, var(0), var(1)),
            )),
        ],
    );
    let result = compile(&f, None);

    // One inner sum survives, plus the outer one
    assert_eq!(live_opcode_count(&result.graph, Opcode::BinOp), 2);
    check_ssa(&result.graph);
    check_units(&result.units);
}

#[test]
fn gvn_keeps_roots_separate() {
    // a = 1; f = fn() { return 1 }
    let inner = func(0, vec![], vec![ret(num("1"))]);
    let f = func(
        2,
        vec![],
        vec![
            assign(var(0), num("1")),
            assign(var(1), Node::synthetic(NodeKind::Function(inner))),
            ret(var(0)),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    assert_eq!(graph.roots.len(), 2);
    assert_eq!(result.units.len(), 2);

    // The literal 1 exists once per root; value numbering never reaches
    // across function boundaries
    let literals: Vec<_> = graph
        .instrs
        .iter()
        .filter(|i| !i.removed && i.is_live && i.opcode == Opcode::Literal)
        .collect();
    assert_eq!(literals.len(), 2);

    let roots: Vec<_> = literals
        .iter()
        .map(|l| graph.block(l.block).root)
        .collect();
    assert_ne!(roots[0], roots[1]);

    check_ssa(graph);
    check_units(&result.units);
}

#[test]
fn dead_literal_is_eliminated() {
    // x = 1; y = 2; return x
    let f = func(
        2,
        vec![],
        vec![
            assign(var(0), num("1")),
            assign(var(1), num("2")),
            ret(var(0)),
        ],
    );
    let result = compile(&f, None);

    assert_eq!(live_opcode_count(&result.graph, Opcode::Literal), 1);
    check_units(&result.units);
}

#[test]
fn discarded_property_load_survives() {
    // o.p; return nil
    let member = Node::synthetic(NodeKind::Member {
        receiver: Box::new(var(0)),
        property: Box::new(Node::synthetic(NodeKind::Property(Symbol::new("p")))),
    });
    let f = func(
        1,
        vec![],
        vec![member, ret(Node::synthetic(NodeKind::Nil))],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    // The load's value is never read, but the getter stub still runs
    assert_eq!(live_opcode_count(graph, Opcode::LoadProperty), 1);

    let load = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::LoadProperty && !i.removed)
        .unwrap();
    assert!(load.is_live);
    // Kept as a root, not through use-liveness
    assert!(load.uses.is_empty());

    check_ssa(graph);
    check_units(&result.units);
}

#[test]
fn phi_pruning_is_idempotent() {
    let f = func(
        1,
        vec![],
        vec![
            if_else(var(0), block(vec![assign(var(0), num("2"))]), None),
            ret(var(0)),
        ],
    );
    let mut graph = crate::hir::ast_lowering::lower_to_hir(&f);

    crate::optimization::phi_prune::prune_phis(&mut graph);
    let snapshot: Vec<Vec<hir::InstrId>> =
        graph.blocks.iter().map(|b| b.phis.clone()).collect();

    crate::optimization::phi_prune::prune_phis(&mut graph);
    let again: Vec<Vec<hir::InstrId>> =
        graph.blocks.iter().map(|b| b.phis.clone()).collect();

    assert_eq!(snapshot, again);
}

#[test]
fn vararg_parameter_adjusts_following_indices() {
    // fn(a, b..., c)
    let f = func(
        3,
        vec![var(0), vararg(var(1)), var(2)],
        vec![ret(var(2))],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    let entry_ops = block_opcodes(graph, 0);
    assert!(entry_ops.contains(&Opcode::AllocateArray));
    assert!(entry_ops.contains(&Opcode::LoadVarArg));
    assert!(entry_ops.contains(&Opcode::Sizeof));

    // The vararg load takes (index, rest count, array)
    let load = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::LoadVarArg)
        .unwrap();
    assert_eq!(load.args.len(), 3);
    assert_eq!(graph.instr(load.args[2]).opcode, Opcode::AllocateArray);

    // The trailing formal's index comes from sizeof-driven arithmetic
    let loads: Vec<_> = graph
        .instrs
        .iter()
        .filter(|i| i.opcode == Opcode::LoadArg && !i.removed)
        .collect();
    let last = loads.last().unwrap();
    assert_eq!(graph.instr(last.args[0]).opcode, Opcode::BinOp);

    check_ssa(graph);
    check_units(&result.units);
}

#[test]
fn vararg_call_grows_argc_dynamically() {
    // f = nil; a = nil; return f(1, 2, a...)
    let f = func(
        2,
        vec![],
        vec![ret(call(
            var(0),
            vec![num("1"), num("2"), vararg(var(1))],
        ))],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    assert_eq!(live_opcode_count(graph, Opcode::StoreArg), 2);
    assert_eq!(live_opcode_count(graph, Opcode::StoreVarArg), 1);
    assert_eq!(live_opcode_count(graph, Opcode::AlignStack), 1);
    assert_eq!(live_opcode_count(graph, Opcode::Sizeof), 1);

    // argc = 2 + sizeof(vararg)
    let call_instr = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::Call)
        .unwrap();
    let argc = graph.instr(call_instr.args[1]);
    assert_eq!(argc.opcode, Opcode::BinOp);

    check_units(&result.units);
}

#[test]
fn method_call_loads_receiver_once() {
    // o = nil; return o:m(1)
    let callee = Node::synthetic(NodeKind::Member {
        receiver: Box::new(var(0)),
        property: Box::new(Node::synthetic(NodeKind::Property(Symbol::new("m")))),
    });
    let f = func(
        1,
        vec![],
        vec![ret(call(
            callee,
            vec![Node::synthetic(NodeKind::SelfArg), num("1")],
        ))],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    // One store per real argument plus the self store
    assert_eq!(live_opcode_count(graph, Opcode::StoreArg), 2);
    assert_eq!(live_opcode_count(graph, Opcode::LoadProperty), 1);

    check_units(&result.units);
}

#[test]
fn register_pressure_forces_spills() {
    // fn(a..h) { return a+(b+(c+(d+(e+(f+(g+h)))))) }
    let args: Vec<Node> = (0..8).map(var).collect();
    let mut expr = bin(BinOpKind::Add, var(6), var(7));
    for i in (0..6).rev() {
        expr = bin(BinOpKind::Add, var(i), expr);
    }
    let f = func(8, args, vec![ret(expr)]);
    let result = compile(&f, None);

    let lir = result.main_unit();
    // Eight argument values cannot all sit in six registers across the
    // first addition's clobbers
    assert!(lir.spill_count > 0, "no spills under pressure");

    check_ssa(&result.graph);
    check_units(&result.units);
}

#[test]
fn constants_rematerialize_in_gaps() {
    let f = func(0, vec![], vec![ret(bin(BinOpKind::Add, num("1"), num("2")))]);
    let result = compile(&f, None);
    let lir = result.main_unit();

    // Const intervals never take a register
    let consts: Vec<_> = lir
        .intervals
        .iter()
        .filter(|i| i.kind == IntervalKind::Const)
        .collect();
    assert_eq!(consts.len(), 2);

    // Every real use was redirected through a gap load
    let mut gap_loads = 0;
    for instr in lir.instrs.iter() {
        if instr.opcode != LOpcode::Gap {
            continue;
        }
        for (from, _to) in &instr.moves {
            if lir.interval(lir.use_(*from).interval).is_const() {
                gap_loads += 1;
            }
        }
    }
    assert!(gap_loads >= 2, "constants not rematerialized");

    check_units(&result.units);
}

#[test]
fn resolved_branches_know_their_labels() {
    let f = func(
        1,
        vec![],
        vec![
            if_else(var(0), block(vec![assign(var(0), num("2"))]), None),
            ret(var(0)),
        ],
    );
    let result = compile(&f, None);
    let lir = result.main_unit();

    for block in &lir.order {
        let block = lir.block(*block);
        let Some(last) = block.instructions.last() else {
            continue;
        };
        let last = lir.instr(*last);

        match last.opcode {
            LOpcode::Branch | LOpcode::BranchNumber => {
                assert_eq!(last.target_labels.len(), 2);
                for label in &last.target_labels {
                    assert_eq!(lir.instr(*label).opcode, LOpcode::Label);
                }
            }
            LOpcode::Goto => {
                // Surviving gotos always carry an explicit target
                assert_eq!(last.target_labels.len(), 1);
            }
            _ => {}
        }
    }

    check_units(&result.units);
}

#[test]
fn source_offsets_flow_to_the_map() {
    use crate::source_map::{Assembler, SourceMap};

    struct CountingAssembler {
        offset: u32,
        emitted: usize,
        slots: usize,
    }

    impl Assembler for CountingAssembler {
        fn offset(&self) -> u32 {
            self.offset
        }
        fn stack_slots(&mut self, slots: usize) {
            self.slots = slots;
        }
        fn emit(&mut self, _lir: &Lir, _instr: &crate::lir::LInstr) {
            self.offset += 4;
            self.emitted += 1;
        }
    }

    let mut lit = num("7");
    lit.offset = 21;
    let f = func(0, vec![], vec![ret(lit)]);
    let result = compile(&f, None);

    let mut asm = CountingAssembler {
        offset: 0,
        emitted: 0,
        slots: 0,
    };
    let mut map = SourceMap::new();
    result.main_unit().generate(&mut asm, &mut map);

    assert!(asm.emitted > 0);
    assert!(asm.slots >= 1);
    assert!(map.entries().iter().any(|e| e.offset == 21));
}

#[test]
fn interval_dump_marks_blocks_and_uses() {
    crate::config::enable_lir_logging();
    assert!(crate::config::lir_logging());
    crate::config::disable_lir_logging();

    let f = func(0, vec![], vec![ret(num("1"))]);
    let result = compile(&f, None);
    let viz = crate::lir::pretty_print::intervals_to_string(result.main_unit());

    // Register rows exist and the body uses the range alphabet
    assert!(viz.contains("r0     : "), "{viz}");
    assert!(viz.contains('R') || viz.contains('r'), "{viz}");
    assert!(viz.contains('.'), "{viz}");
}

#[test]
fn unreachable_code_after_double_return_is_tolerated() {
    // if (c) { return 1 } else { return 2 }; return 3
    let f = func(
        1,
        vec![],
        vec![
            if_else(
                var(0),
                block(vec![ret(num("1"))]),
                Some(block(vec![ret(num("2"))])),
            ),
            ret(num("3")),
        ],
    );
    let result = compile(&f, None);

    // Only the two live returns make it into the LIR
    let lir = result.main_unit();
    let returns = lir
        .instrs
        .iter()
        .filter(|i| i.opcode == LOpcode::Return && i.id >= 0)
        .count();
    assert_eq!(returns, 2);

    check_units(&result.units);
}

#[test]
fn break_and_continue_route_through_fresh_blocks() {
    // while (c) { if (c) { break } continue } return 0
    let f = func(
        1,
        vec![],
        vec![
            while_(
                var(0),
                block(vec![
                    if_else(
                        var(0),
                        block(vec![Node::synthetic(NodeKind::Break)]),
                        None,
                    ),
                    Node::synthetic(NodeKind::Continue),
                ]),
            ),
            ret(num("0")),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    // No block collects more than two predecessors
    for block in graph.blocks.iter() {
        assert!(block.preds.len() <= 2);
        assert!(block.succs.len() <= 2);
    }

    check_ssa(graph);
    check_dominators(graph);
    check_units(&result.units);
}

#[test]
fn stub_results_hint_toward_the_result_register() {
    let f = func(0, vec![], vec![ret(bin(BinOpKind::Add, num("1"), num("2")))]);
    let result = compile(&f, None);
    let lir = result.main_unit();

    // The BinOp result interval is hinted at r0 through the copy-out move
    let binop = lir
        .instrs
        .iter()
        .find(|i| i.opcode == LOpcode::BinOp)
        .unwrap();
    assert!(binop.has_call);
    let result_use = binop.result.expect("stub without a result");
    let fixed = lir.interval(lir.use_(result_use).interval);
    assert!(fixed.is_fixed());
    assert_eq!(fixed.index, crate::lir::STUB_RESULT_REGISTER as i32);
}

#[test]
fn effect_order_keeps_loads_behind_stores() {
    // o = {}; o.p = 1; return o.p
    let prop = || Node::synthetic(NodeKind::Property(Symbol::new("p")));
    let member = Node::synthetic(NodeKind::Member {
        receiver: Box::new(var(0)),
        property: Box::new(prop()),
    });
    let f = func(
        1,
        vec![],
        vec![
            assign(
                var(0),
                Node::synthetic(NodeKind::ObjectLiteral {
                    keys: vec![],
                    values: vec![],
                }),
            ),
            assign(
                Node::synthetic(NodeKind::Member {
                    receiver: Box::new(var(0)),
                    property: Box::new(prop()),
                }),
                num("1"),
            ),
            ret(member),
        ],
    );
    let result = compile(&f, None);
    let graph = &result.graph;

    let load = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::LoadProperty && !i.removed)
        .expect("property load eliminated");
    let store = graph
        .instrs
        .iter()
        .find(|i| i.opcode == Opcode::StoreProperty && !i.removed)
        .unwrap();

    // Same block, store first: the load may not float above it
    assert_eq!(load.block, store.block);
    assert!(store.id < load.id);

    check_ssa(graph);
    check_units(&result.units);
}
