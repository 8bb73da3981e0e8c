//! Dominator tree (Lengauer-Tarjan) and reachable-from bitsets. Both cope
//! with multi-root graphs: every nested function literal contributes its
//! own root, and blocks orphaned by `break`/`return` lowering simply keep
//! `dfs_id == -1` and stay out of the tree.

use log::trace;

use crate::hir::{BlockId, Graph, DFS_UNVISITED};

/// A fast algorithm for finding dominators in a flowgraph,
/// by T. Lengauer and R. E. Tarjan.
pub fn derive_dominators(graph: &mut Graph) {
    let mut dfs_id = 0;

    let roots = graph.roots.clone();
    for root in roots {
        let mut dfs_blocks = Vec::new();
        enumerate_dfs(graph, root, &mut dfs_blocks, &mut dfs_id);

        // Visit all blocks except the root in reverse DFS order
        for wi in (1..dfs_blocks.len()).rev() {
            let w = dfs_blocks[wi];
            let parent = graph.block(w).parent.expect("non-root without dfs parent");

            // Propagate semidominators from predecessors
            for pi in 0..graph.block(w).preds.len() {
                let pred = graph.block(w).preds[pi];
                // Predecessors the DFS never reached contribute nothing
                if graph.block(pred).dfs_id == DFS_UNVISITED {
                    continue;
                }

                let u = evaluate(graph, pred);
                let u_semi = graph.block(u).semi;
                if graph.block(u_semi).dfs_id < graph.block(graph.block(w).semi).dfs_id {
                    graph.block_mut(w).semi = u_semi;
                }
            }

            let semi = graph.block(w).semi;
            graph.block_mut(semi).dominates.push(w);
            graph.block_mut(w).ancestor = Some(parent);

            // Empty the parent's bucket, fixing dominators where the
            // semidominator already is the answer
            while let Some(v) = {
                let bucket = &mut graph.block_mut(parent).dominates;
                bucket.pop()
            } {
                let u = evaluate(graph, v);
                let u_semi = graph.block(u).semi;
                if graph.block(u_semi).dfs_id < graph.block(graph.block(v).semi).dfs_id {
                    graph.block_mut(v).dominator = Some(u);
                } else {
                    graph.block_mut(v).dominator = Some(parent);
                }
            }
        }

        // Back sweep: complete dominators in DFS order
        for wi in 1..dfs_blocks.len() {
            let w = dfs_blocks[wi];
            let dom = graph.block(w).dominator.expect("missing semidominator link");
            if dom != graph.block(w).semi {
                let dd = graph.block(dom).dominator.expect("dominator chain broken");
                graph.block_mut(w).dominator = Some(dd);
            }
        }

        // Rebuild the bucket lists as dominator-tree child lists and
        // assign dominator depths top-down
        for wi in 0..dfs_blocks.len() {
            let w = dfs_blocks[wi];
            graph.block_mut(w).dominates.clear();
        }
        graph.block_mut(root).dominator_depth = 0;
        for wi in 1..dfs_blocks.len() {
            let w = dfs_blocks[wi];
            let dom = graph.block(w).dominator.unwrap();
            graph.block_mut(dom).dominates.push(w);
            // DFS order guarantees the dominator was processed first
            let depth = graph.block(dom).dominator_depth;
            assert!(depth >= 0, "dominator depth out of order");
            graph.block_mut(w).dominator_depth = depth + 1;
        }

        trace!(
            "dom: root b{} spans {} reachable blocks",
            graph.block(root).seq,
            dfs_blocks.len()
        );
    }
}

fn enumerate_dfs(graph: &mut Graph, block: BlockId, out: &mut Vec<BlockId>, dfs_id: &mut i32) {
    graph.block_mut(block).dfs_id = *dfs_id;
    *dfs_id += 1;
    out.push(block);

    for i in 0..graph.block(block).succs.len() {
        let succ = graph.block(block).succs[i];
        if graph.block(succ).dfs_id != DFS_UNVISITED {
            continue;
        }
        graph.block_mut(succ).parent = Some(block);
        enumerate_dfs(graph, succ, out, dfs_id);
    }
}

/// Path-compressing evaluate over the ancestor/label forest.
fn evaluate(graph: &mut Graph, v: BlockId) -> BlockId {
    if graph.block(v).ancestor.is_none() {
        return v;
    }
    compress(graph, v);
    graph.block(v).label
}

fn compress(graph: &mut Graph, v: BlockId) {
    let ancestor = graph.block(v).ancestor.expect("compress at forest root");
    if graph.block(ancestor).ancestor.is_none() {
        return;
    }

    compress(graph, ancestor);

    let ancestor_label = graph.block(ancestor).label;
    let label = graph.block(v).label;
    if graph.block(graph.block(ancestor_label).semi).dfs_id
        < graph.block(graph.block(label).semi).dfs_id
    {
        graph.block_mut(v).label = ancestor_label;
    }
    let next = graph.block(ancestor).ancestor;
    graph.block_mut(v).ancestor = next;
}

/// Fixed point: a block is reachable from all of its predecessors and from
/// everything those predecessors are reachable from.
pub fn derive_reachability(graph: &mut Graph) {
    let n = graph.blocks.len();
    for block in graph.blocks.iter_mut() {
        block.reachable_from.grow(n);
    }

    let mut change = true;
    while change {
        change = false;

        for bi in 0..n {
            let block = BlockId(bi as u32);
            for pi in 0..graph.block(block).preds.len() {
                let pred = graph.block(block).preds[pi];

                let mut incoming = graph.block(pred).reachable_from.clone();
                incoming.insert(pred.0 as usize);

                let set = &mut graph.block_mut(block).reachable_from;
                let before = set.count_ones(..);
                set.union_with(&incoming);
                if set.count_ones(..) != before {
                    change = true;
                }
            }
        }
    }
}

/// Whether `a` dominates `b` (reflexively).
pub fn dominates(graph: &Graph, a: BlockId, b: BlockId) -> bool {
    let mut current = Some(b);
    while let Some(c) = current {
        if c == a {
            return true;
        }
        current = graph.block(c).dominator;
    }
    false
}

/// Least common ancestor of two blocks in the dominator tree.
pub fn common_ancestor(graph: &Graph, a: BlockId, b: BlockId) -> BlockId {
    let mut a = a;
    let mut b = b;

    while a != b {
        while graph.block(a).dominator_depth > graph.block(b).dominator_depth {
            a = graph.block(a).dominator.expect("lca walked past a root");
        }
        while graph.block(b).dominator_depth > graph.block(a).dominator_depth {
            b = graph.block(b).dominator.expect("lca walked past a root");
        }
        if a != b {
            a = graph.block(a).dominator.expect("lca of disjoint trees");
            b = graph.block(b).dominator.expect("lca of disjoint trees");
        }
    }

    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hir::Graph, index::Index};

    fn diamond() -> (Graph, [BlockId; 4]) {
        let mut graph = Graph::new();
        let b0 = graph.create_block(0, 0, BlockId(0));
        let b1 = graph.create_block(0, 0, b0);
        let b2 = graph.create_block(0, 0, b0);
        let b3 = graph.create_block(0, 0, b0);
        graph.roots.push(b0);

        graph.add_edge(b0, b1);
        graph.add_edge(b0, b2);
        graph.add_edge(b1, b3);
        graph.add_edge(b2, b3);

        (graph, [b0, b1, b2, b3])
    }

    #[test]
    fn diamond_joins_dominate_from_the_split() {
        let (mut graph, [b0, b1, b2, b3]) = diamond();
        derive_dominators(&mut graph);

        assert_eq!(graph.block(b1).dominator, Some(b0));
        assert_eq!(graph.block(b2).dominator, Some(b0));
        assert_eq!(graph.block(b3).dominator, Some(b0));
        assert_eq!(graph.block(b0).dominator, None);
        assert_eq!(graph.block(b0).dominator_depth, 0);
        assert_eq!(graph.block(b3).dominator_depth, 1);

        assert!(dominates(&graph, b0, b3));
        assert!(!dominates(&graph, b1, b3));
        assert_eq!(common_ancestor(&graph, b1, b2), b0);
        assert_eq!(common_ancestor(&graph, b1, b3), b0);
    }

    #[test]
    fn reachability_accumulates_all_ancestors() {
        let (mut graph, [b0, b1, _b2, b3]) = diamond();
        derive_dominators(&mut graph);
        derive_reachability(&mut graph);

        let set = &graph.block(b3).reachable_from;
        assert!(set.contains(b0.index()));
        assert!(set.contains(b1.index()));
        assert!(!graph.block(b1).reachable_from.contains(b3.index()));
    }
}
