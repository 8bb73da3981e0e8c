use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::hir::{Graph, Instr, Payload};
use crate::index::Index;

/// Renders the whole graph block-by-block. The output is plain text so it
/// can be compared verbatim; `dump_hir` adds the colored framing.
pub fn hir_to_string(graph: &Graph) -> String {
    let mut out = String::new();

    for block in graph.blocks.iter() {
        writeln!(out, "# Block {}", block.seq).unwrap();
        if let Some(dom) = block.dominator {
            writeln!(out, "# dom: {}", graph.block(dom).seq).unwrap();
        }
        if block.is_loop {
            writeln!(out, "# loop, depth: {}", block.loop_depth).unwrap();
        }

        for phi in &block.phis {
            let phi = graph.instr(*phi);
            if phi.removed {
                continue;
            }
            writeln!(out, "{}", format_instr(graph, phi)).unwrap();
        }

        for instr in &block.instructions {
            let instr = graph.instr(*instr);
            if instr.removed {
                continue;
            }
            writeln!(out, "{}", format_instr(graph, instr)).unwrap();
        }

        if !block.succs.is_empty() {
            writeln!(
                out,
                "# succ: {}",
                block.succs.iter().map(|s| graph.block(*s).seq).join(" ")
            )
            .unwrap();
        }
        out.push('\n');
    }

    out
}

fn format_instr(graph: &Graph, instr: &Instr) -> String {
    let mut res = format!("i{} = {}", instr.id, instr.opcode);

    match instr.payload {
        Payload::None => {}
        Payload::ContextSlots(n) => write!(res, "[{n}]").unwrap(),
        Payload::Root(root) => {
            write!(res, "[${}]", root.index()).unwrap();
        }
        Payload::BinOp(op) => write!(res, "[{op}]").unwrap(),
        Payload::ContextSlot(depth, index) => write!(res, "[{depth}:{index}]").unwrap(),
        Payload::Function { body, argc } => {
            write!(res, "[b{}, argc: {argc}]", graph.block(body).seq).unwrap()
        }
    }

    write!(
        res,
        "({})",
        instr.args.iter().map(|a| format!("i{}", graph.instr(*a).id)).join(", ")
    )
    .unwrap();

    res
}

/// Prints the post-build HIR dump when HIR logging is enabled.
pub fn dump_hir(graph: &Graph, filename: Option<&str>) {
    if !crate::config::hir_logging() {
        return;
    }

    let name = filename.unwrap_or("unknown");
    println!("{}", format!("## HIR {name} Start ##").magenta());
    print!("{}", hir_to_string(graph));
    println!("{}", "## HIR End ##".magenta());
}
