//! The fixed machine-independent pass pipeline. Order matters: pruning
//! simplifies the phi population DCE walks, effect sets must exist before
//! code motion runs, and value numbering shrinks the graph GCM schedules.

use crate::hir::Graph;

pub mod dce;
pub mod effects;
pub mod gcm;
pub mod gvn;
pub mod phi_prune;

pub fn run(graph: &mut Graph) {
    phi_prune::prune_phis(graph);
    dce::eliminate_dead_code(graph);
    effects::analyze_effects(graph);
    gvn::eliminate_redundancy(graph);
    gcm::schedule(graph);
}
