//! Dead-code elimination: instructions whose effects are observable are
//! roots; everything they transitively use stays, the rest goes. Block
//! order of the survivors is preserved.

use log::debug;

use crate::hir::{Graph, InstrId};

pub fn eliminate_dead_code(graph: &mut Graph) {
    let mut worklist: Vec<InstrId> = Vec::new();

    for instr in graph.instrs.iter() {
        if instr.removed {
            continue;
        }
        if instr.opcode.has_side_effects() {
            worklist.push(instr.handle);
        }
    }

    // Mark live via a backward use walk from the roots
    while let Some(id) = worklist.pop() {
        if graph.instr(id).is_live {
            continue;
        }
        graph.instr_mut(id).is_live = true;

        for i in 0..graph.instr(id).args.len() {
            let arg = graph.instr(id).args[i];
            if !graph.instr(arg).is_live {
                worklist.push(arg);
            }
        }
    }

    // Sweep: reinstate survivors in their original order
    let mut removed = 0usize;
    for bi in graph.blocks.indices().collect::<Vec<_>>() {
        let dead: Vec<InstrId> = graph
            .block(bi)
            .instructions
            .iter()
            .chain(graph.block(bi).phis.iter())
            .copied()
            .filter(|i| !graph.instr(*i).is_live)
            .collect();

        for instr in dead {
            let list = &mut graph.block_mut(bi).instructions;
            if let Some(pos) = list.iter().position(|i| *i == instr) {
                list.remove(pos);
            } else {
                let phis = &mut graph.block_mut(bi).phis;
                let pos = phis.iter().position(|i| *i == instr).unwrap();
                phis.remove(pos);
            }
            graph.mark_removed(instr);
            removed += 1;
        }
    }

    debug!("dce: removed {removed} dead instructions");
}
