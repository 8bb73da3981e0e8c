//! Global value numbering: pure instructions are hash-consed per function
//! root, so syntactically identical computations collapse onto one
//! representative. Anything with GVN side effects never enters the table,
//! and roots never share a table, so literals in different functions stay
//! distinct.

use hashbrown::HashMap;
use log::debug;

use crate::hir::{BlockId, Graph, InstrId, Opcode, Payload};

type ValueKey = (Opcode, Payload, Vec<InstrId>);

pub fn eliminate_redundancy(graph: &mut Graph) {
    let mut merged = 0usize;

    for ri in 0..graph.roots.len() {
        let root = graph.roots[ri];
        let mut table: HashMap<ValueKey, InstrId> = HashMap::new();

        let root_blocks: Vec<BlockId> = graph
            .blocks
            .indices()
            .filter(|b| graph.block(*b).root == root)
            .collect();

        for block in root_blocks {
            // Snapshot: processing removes duplicates from these lists
            let instrs: Vec<InstrId> = graph.block(block).instructions.clone();
            for instr in instrs {
                merged += process(graph, &mut table, instr);
            }
        }
    }

    debug!("gvn: merged {merged} redundant instructions");
}

/// Numbers `instr` after its inputs; returns how many instructions were
/// eliminated beneath it.
fn process(graph: &mut Graph, table: &mut HashMap<ValueKey, InstrId>, instr: InstrId) -> usize {
    if graph.instr(instr).gvn_visited || graph.instr(instr).removed {
        return 0;
    }
    graph.instr_mut(instr).gvn_visited = true;

    let mut merged = 0;
    for i in 0..graph.instr(instr).args.len() {
        let arg = graph.instr(instr).args[i];
        merged += process(graph, table, arg);
    }

    if graph.instr(instr).opcode.has_gvn_side_effects() {
        return merged;
    }

    let key: ValueKey = (
        graph.instr(instr).opcode,
        graph.instr(instr).payload,
        graph.instr(instr).args.to_vec(),
    );

    match table.get(&key) {
        Some(representative) => {
            let representative = *representative;
            graph.replace_all_uses(instr, representative);
            graph.remove_from_block(instr);
            merged + 1
        }
        None => {
            table.insert(key, instr);
            merged
        }
    }
}
