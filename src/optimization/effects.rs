//! Effect analysis. Two graph walks compute, per instruction, the set of
//! effectful instructions downstream of its value (`effects_out`, use to
//! def) and the set of effectful instructions that happen before it and
//! constrain where it may move (`effects_in`, def to use). The incoming
//! pass filters by ordered reachability: an effect counts only if its
//! block can reach the instruction's block, or both share a block and the
//! effect has the smaller id.

use hashbrown::HashSet;

use crate::hir::{Graph, InstrId, Opcode};

/// Whether `opcode` imposes an effect on its argument values: merges
/// (phis), calls, and everything that mutates memory through its args.
fn effects_args(opcode: Opcode) -> bool {
    match opcode {
        Opcode::Phi | Opcode::Call | Opcode::CollectGarbage | Opcode::GetStackTrace => true,
        Opcode::StoreArg
        | Opcode::StoreVarArg
        | Opcode::AlignStack
        | Opcode::StoreContext
        | Opcode::StoreProperty
        | Opcode::DeleteProperty
        | Opcode::LoadVarArg => true,
        _ => false,
    }
}

pub fn analyze_effects(graph: &mut Graph) {
    // Pass one: outgoing effects, use -> def
    for id in graph.instrs.indices().collect::<Vec<_>>() {
        if graph.instr(id).removed {
            continue;
        }
        compute_outgoing(graph, id);
    }

    // Pass two: incoming effects, def -> use
    for id in graph.instrs.indices().collect::<Vec<_>>() {
        if graph.instr(id).removed {
            continue;
        }
        compute_incoming(graph, id);
    }
}

/// `effects_out(i)` = every use's `effects_out`, plus the use itself when
/// it effects `i`. Cycles through loop phis terminate on the visit mark;
/// the partially-built set of an in-progress instruction is used as-is.
fn compute_outgoing(graph: &mut Graph, id: InstrId) {
    if graph.instr(id).alias_visited >= 1 {
        return;
    }
    graph.instr_mut(id).alias_visited = 1;

    let mut set: HashSet<InstrId> = HashSet::new();

    for ui in 0..graph.instr(id).uses.len() {
        let user = graph.instr(id).uses[ui];
        if graph.instr(user).removed {
            continue;
        }

        compute_outgoing(graph, user);

        if effects_args(graph.instr(user).opcode) {
            set.insert(user);
        }
        for e in &graph.instr(user).effects_out {
            set.insert(*e);
        }
    }

    let mut out: Vec<InstrId> = set.into_iter().collect();
    out.sort_by_key(|e| graph.instr(*e).id);
    graph.instr_mut(id).effects_out = out;
}

/// `effects_in(i)` = for every argument, its incoming and outgoing
/// effects, filtered down to effects ordered before `i`.
fn compute_incoming(graph: &mut Graph, id: InstrId) {
    if graph.instr(id).alias_visited >= 2 {
        return;
    }
    graph.instr_mut(id).alias_visited = 2;

    let mut set: HashSet<InstrId> = HashSet::new();

    for ai in 0..graph.instr(id).args.len() {
        let arg = graph.instr(id).args[ai];
        if graph.instr(arg).removed {
            continue;
        }

        compute_incoming(graph, arg);

        let candidates: Vec<InstrId> = graph
            .instr(arg)
            .effects_in
            .iter()
            .chain(graph.instr(arg).effects_out.iter())
            .copied()
            .collect();

        for e in candidates {
            if e == id || graph.instr(e).removed {
                continue;
            }
            if ordered_before(graph, e, id) {
                set.insert(e);
            }
        }
    }

    let mut incoming: Vec<InstrId> = set.into_iter().collect();
    incoming.sort_by_key(|e| graph.instr(*e).id);
    graph.instr_mut(id).effects_in = incoming;
}

/// The ordered-reachability relation: `e` happens before `i`.
fn ordered_before(graph: &Graph, e: InstrId, i: InstrId) -> bool {
    let eb = graph.instr(e).block;
    let ib = graph.instr(i).block;

    if eb == ib {
        return graph.instr(e).id < graph.instr(i).id;
    }

    graph.block(ib).reachable_from.contains(eb.0 as usize)
}
