//! Global code motion, after Click. Pinned instructions (control, stores,
//! calls, entries, argument loads, and the back-edge input of every
//! loop-header phi) stay put; everything else is scheduled early to the
//! dominator-deepest input, then late to the shallowest-loop block on the
//! dominator path down to the least common ancestor of its uses.

use hashbrown::{HashMap, HashSet};
use log::debug;

use crate::hir::{dom, BlockId, Graph, InstrId};

pub fn schedule(graph: &mut Graph) {
    // The back-edge value of a loop phi is observably part of the loop
    let mut pinned: HashSet<InstrId> = HashSet::new();
    for block in graph.blocks.iter() {
        if !block.is_loop {
            continue;
        }
        for phi in &block.phis {
            let phi = &graph.instrs[*phi];
            if !phi.removed && phi.input_count() == 2 {
                pinned.insert(phi.args[1]);
            }
        }
    }

    let is_pinned =
        |graph: &Graph, id: InstrId| graph.instr(id).opcode.is_pinned() || pinned.contains(&id);

    // Original placement, for the reachability guard in the late pass
    let original: HashMap<InstrId, BlockId> = graph
        .instrs
        .iter()
        .filter(|i| !i.removed)
        .map(|i| (i.handle, i.block))
        .collect();

    /* Schedule early */

    let all: Vec<InstrId> = graph
        .instrs
        .indices()
        .filter(|i| !graph.instr(*i).removed)
        .collect();

    for id in &all {
        if !is_pinned(graph, *id) {
            continue;
        }
        graph.instr_mut(*id).gcm_visited = 1;
        for ai in 0..graph.instr(*id).args.len() {
            let arg = graph.instr(*id).args[ai];
            schedule_early(graph, arg, &pinned);
        }
    }
    // Free instructions only feeding other free instructions
    for id in &all {
        schedule_early(graph, *id, &pinned);
    }

    /* Schedule late */

    for id in &all {
        if is_pinned(graph, *id) {
            graph.instr_mut(*id).gcm_visited = 2;
        }
    }
    let mut moved = 0usize;
    for id in &all {
        moved += schedule_late(graph, *id, &original);
    }

    /* Reinsert into block lists */

    for block in graph.blocks.iter_mut() {
        block.instructions.clear();
    }

    for id in all.iter().rev() {
        let (is_phi, block, is_control) = {
            let instr = graph.instr(*id);
            (instr.is_phi(), instr.block, instr.opcode.is_control())
        };
        if is_phi {
            continue;
        }
        if is_control {
            graph.block_mut(block).instructions.push(*id);
        } else {
            graph.block_mut(block).instructions.insert(0, *id);
        }
    }

    debug!("gcm: moved {moved} instructions");
}

/// Raises the starting block of a free instruction to the deepest input
/// block in the dominator tree. No incoming effects means the value could
/// in principle compute at the function root; effects anchor it where the
/// builder left it.
fn schedule_early(graph: &mut Graph, id: InstrId, pinned: &HashSet<InstrId>) {
    if graph.instr(id).gcm_visited >= 1 || graph.instr(id).removed {
        return;
    }
    graph.instr_mut(id).gcm_visited = 1;

    if graph.instr(id).opcode.is_pinned() || pinned.contains(&id) {
        return;
    }

    // Blocks the dominator DFS never reached have no tree to move along
    if graph.block(graph.instr(id).block).dfs_id == crate::hir::DFS_UNVISITED {
        return;
    }

    if graph.instr(id).effects_in.is_empty() {
        let root = graph.block(graph.instr(id).block).root;
        graph.instr_mut(id).block = root;
    }

    for ai in 0..graph.instr(id).args.len() {
        let arg = graph.instr(id).args[ai];
        schedule_early(graph, arg, pinned);

        let current = graph.instr(id).block;
        let input = graph.instr(arg).block;
        if graph.block(input).dominator_depth > graph.block(current).dominator_depth {
            graph.instr_mut(id).block = input;
        }
    }
}

/// Sinks a free instruction toward its uses: the target is the least
/// common dominator-tree ancestor of all use blocks (phi uses count at the
/// matching predecessor), hoisted to the smallest loop depth on the path
/// up to the early block. Returns 1 if the instruction moved.
fn schedule_late(
    graph: &mut Graph,
    id: InstrId,
    original: &HashMap<InstrId, BlockId>,
) -> usize {
    if graph.instr(id).gcm_visited >= 2 || graph.instr(id).removed {
        return 0;
    }
    graph.instr_mut(id).gcm_visited = 2;

    // Unreachable placements stay put
    if graph.block(graph.instr(id).block).dfs_id == crate::hir::DFS_UNVISITED {
        return 0;
    }

    let mut moved = 0;
    for ui in 0..graph.instr(id).uses.len() {
        let user = graph.instr(id).uses[ui];
        moved += schedule_late(graph, user, original);
    }

    let mut lca: Option<BlockId> = None;
    for ui in 0..graph.instr(id).uses.len() {
        let user = graph.instr(id).uses[ui];
        if graph.instr(user).removed {
            continue;
        }

        if graph.instr(user).is_phi() {
            // A phi uses its input at the tail of the matching predecessor
            for (pos, arg) in graph.instr(user).args.iter().enumerate() {
                if *arg != id {
                    continue;
                }
                let phi_block = graph.instr(user).block;
                let pred = graph.block(phi_block).preds[pos];
                if graph.block(pred).dfs_id == crate::hir::DFS_UNVISITED {
                    continue;
                }
                lca = Some(match lca {
                    Some(l) => dom::common_ancestor(graph, l, pred),
                    None => pred,
                });
            }
        } else {
            let use_block = graph.instr(user).block;
            if graph.block(use_block).dfs_id == crate::hir::DFS_UNVISITED {
                continue;
            }
            lca = Some(match lca {
                Some(l) => dom::common_ancestor(graph, l, use_block),
                None => use_block,
            });
        }
    }

    let Some(lca) = lca else {
        return moved;
    };

    // Walk the dominator chain from the LCA up to the early block, taking
    // the shallowest loop, and stopping at any block that cannot reach the
    // instruction's original home.
    let early = graph.instr(id).block;
    let orig = original[&id];

    let mut best = lca;
    let mut b = lca;
    loop {
        if b != orig && !graph.block(orig).reachable_from.contains(b.0 as usize) {
            break;
        }
        if graph.block(b).loop_depth < graph.block(best).loop_depth {
            best = b;
        }
        if b == early {
            break;
        }
        match graph.block(b).dominator {
            Some(dom) => b = dom,
            None => break,
        }
    }

    if graph.instr(id).block != best {
        moved += 1;
    }
    graph.instr_mut(id).block = best;

    moved
}
