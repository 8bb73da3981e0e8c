//! Phi pruning. The builder creates phis eagerly (every external value
//! read, every loop-header slot), so most of them are trivial: zero inputs
//! (value never defined), one input, or a second input that is the phi
//! itself through the loop back edge. Collapsing one phi can make its phi
//! users trivial too, hence the worklist.

use std::collections::VecDeque;

use hashbrown::HashSet;
use log::debug;

use crate::hir::{Graph, InstrId, Opcode, Payload};

pub fn prune_phis(graph: &mut Graph) {
    let mut queue: VecDeque<InstrId> = VecDeque::new();

    // First, take every phi out of every block
    for block in graph.blocks.iter_mut() {
        queue.extend(block.phis.drain(..));
    }

    let mut survivors: Vec<InstrId> = Vec::new();
    let mut collapsed = 0usize;

    while let Some(phi) = queue.pop_front() {
        if graph.instr(phi).removed {
            continue;
        }

        if graph.instr(phi).input_count() == 2 {
            let args = &graph.instr(phi).args;
            if args[1] == phi || args[0] == args[1] {
                shrink_to_one_input(graph, phi);
            } else {
                survivors.push(phi);
                continue;
            }
        }

        match graph.instr(phi).input_count() {
            0 => {
                // A slot that was never written reads as nil
                nilify(graph, phi);
            }
            1 => {
                let input = graph.instr(phi).args[0];

                // Phi users may collapse now, re-evaluate them
                let phi_uses: Vec<InstrId> = graph
                    .instr(phi)
                    .uses
                    .iter()
                    .copied()
                    .filter(|u| !graph.instr(*u).removed && graph.instr(*u).is_phi())
                    .collect();
                queue.extend(phi_uses);

                graph.replace_all_uses(phi, input);
                graph.mark_removed(phi);
                collapsed += 1;
            }
            _ => unreachable!("phi with more than two inputs"),
        }
    }

    // Put the surviving phis back into their blocks, once each, in id order
    let mut seen = HashSet::new();
    survivors.retain(|phi| !graph.instr(*phi).removed && seen.insert(*phi));
    survivors.sort_by_key(|phi| graph.instr(*phi).id);

    for phi in survivors {
        let block = graph.instr(phi).block;
        graph.block_mut(block).phis.push(phi);
    }

    debug!("phi-prune: collapsed {collapsed} phis");
}

fn shrink_to_one_input(graph: &mut Graph, phi: InstrId) {
    let removed_arg = graph.instr_mut(phi).args.pop().expect("empty phi");
    let uses = &mut graph.instr_mut(removed_arg).uses;
    let pos = uses
        .iter()
        .position(|u| *u == phi)
        .expect("use mirror out of sync");
    uses.remove(pos);
}

/// Turns an input-less phi into a nil materialization at its block's head.
fn nilify(graph: &mut Graph, phi: InstrId) {
    let instr = graph.instr_mut(phi);
    instr.opcode = Opcode::Nil;
    instr.payload = Payload::None;

    let block = instr.block;
    graph.block_mut(block).instructions.insert(0, phi);
}
