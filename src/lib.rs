//! silt — the optimizing SSA middle-end of the Silt JIT.
//!
//! Input is a resolved AST for a function body; output is register-
//! allocated LIR plus a source map, ready for a target assembler. In
//! between: SSA construction with phi insertion, dominators and
//! reachability, phi pruning, dead-code elimination, effect analysis,
//! global value numbering, global code motion, lowering, liveness,
//! linear-scan register allocation with live-range splitting, data-flow
//! resolution and spill coloring.
//!
//! The pipeline is synchronous and total: a well-formed AST always
//! compiles, and malformed input trips an assertion rather than producing
//! a partial artifact.

pub mod ast;
pub mod config;
pub mod hir;
pub mod index;
pub mod intern;
pub mod lir;
pub mod optimization;
pub mod source_map;

#[cfg(test)]
mod tests;

use ast::FunctionLiteral;
use hir::Graph;
use lir::Lir;

/// Everything the middle-end produces for one compilation unit: the
/// optimized SSA graph and one allocated LIR per function root (nested
/// function literals compile alongside their parent).
pub struct CompileResult {
    pub graph: Graph,
    pub units: Vec<Lir>,
}

impl CompileResult {
    /// The LIR of the outermost function.
    pub fn main_unit(&self) -> &Lir {
        &self.units[0]
    }
}

/// Compiles one function (and every function literal it contains) down to
/// allocated LIR. `filename` only labels the optional dumps.
pub fn compile(function: &FunctionLiteral, filename: Option<&str>) -> CompileResult {
    let mut graph = hir::ast_lowering::lower_to_hir(function);
    optimization::run(&mut graph);
    hir::pretty_print::dump_hir(&graph, filename);

    let roots = graph.roots.clone();
    let mut units = Vec::with_capacity(roots.len());
    for root in roots {
        let mut lir = lir::hir_lowering::lower_to_lir(&graph, root);

        lir::liveness::compute_local_live_sets(&mut lir);
        lir::liveness::compute_global_live_sets(&mut lir);
        lir::liveness::build_intervals(&mut lir);

        let mut allocator = lir::linear_scan::Allocator::new();
        allocator.walk_intervals(&mut lir);
        lir::resolve::resolve_data_flow(&mut allocator, &mut lir);
        lir::resolve::allocate_spills(&mut allocator, &mut lir);

        lir::pretty_print::dump_lir(&lir, filename, true);
        units.push(lir);
    }

    CompileResult { graph, units }
}
