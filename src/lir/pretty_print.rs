use std::fmt::Write;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    index::Index,
    lir::{Interval, IntervalKind, LInstr, LOpcode, LPayload, Lir, UseId, NUM_REGISTERS},
};

/// Renders the flattened LIR block-by-block, optionally preceded by the
/// interval visualization. Plain text, verbatim-comparable.
pub fn lir_to_string(lir: &Lir, extended: bool) -> String {
    let mut out = String::new();

    if extended {
        out.push_str(&intervals_to_string(lir));
    }

    for block in &lir.order {
        let block = lir.block(*block);
        writeln!(out, "# Block {}", block.id.index()).unwrap();

        for instr in &block.instructions {
            writeln!(out, "{}", format_instr(lir, lir.instr(*instr))).unwrap();
        }
        out.push('\n');
    }

    out
}

/// One row per interval, one character per instruction position:
/// `.` outside every range, `_` covered, `r`/`a` register/any use,
/// `R`/`A` the same for results, `|` marking block boundaries.
pub fn intervals_to_string(lir: &Lir) -> String {
    let mut out = String::new();

    for interval in lir.intervals.iter() {
        out.push_str(&row_label(interval));

        for pos in 0..lir.position_count() {
            let c = match lir.use_at(interval.id, pos) {
                Some(use_id) => use_char(lir, use_id),
                None => {
                    if interval.covers(pos) {
                        '_'
                    } else {
                        '.'
                    }
                }
            };
            out.push(c);

            // Make block boundaries visible
            if lir.block_starting_at(pos + 1).is_some() {
                out.push('|');
            }
        }

        if let Some(parent) = interval.split_parent {
            write!(out, " P:{}", parent.index()).unwrap();
        }
        out.push('\n');
    }

    out.push('\n');
    out
}

fn row_label(interval: &Interval) -> String {
    if interval.id.index() < NUM_REGISTERS {
        format!("{}     : ", crate::lir::register_name(interval.id.index()))
    } else {
        match interval.kind {
            IntervalKind::StackSlot => {
                format!("{:03} [{:02}]: ", interval.id.index(), interval.index)
            }
            IntervalKind::Const => format!("{:03} c   : ", interval.id.index()),
            _ => format!("{:03}     : ", interval.id.index()),
        }
    }
}

fn use_char(lir: &Lir, use_id: UseId) -> char {
    let use_ = lir.use_(use_id);
    let is_result = lir.instr(use_.instr).result == Some(use_id);

    match (is_result, use_.kind) {
        (true, crate::lir::UseKind::Register) => 'R',
        (true, crate::lir::UseKind::Any) => 'A',
        (false, crate::lir::UseKind::Register) => 'r',
        (false, crate::lir::UseKind::Any) => 'a',
    }
}

fn operand(lir: &Lir, use_id: UseId) -> String {
    let interval = lir.interval(lir.use_(use_id).interval);
    match interval.kind {
        IntervalKind::Register if interval.index >= 0 => {
            crate::lir::register_name(interval.index as usize).to_string()
        }
        IntervalKind::Register => format!("v{}", interval.id.index()),
        IntervalKind::StackSlot => format!("[{}]", interval.index),
        IntervalKind::Const => format!("c{}", interval.id.index()),
        IntervalKind::Virtual => format!("v{}", interval.id.index()),
    }
}

fn format_instr(lir: &Lir, instr: &LInstr) -> String {
    let mut res = format!("{:02}: {}", instr.id, instr.opcode);

    match instr.payload {
        LPayload::None => {}
        LPayload::ContextSlots(n) => write!(res, "[{n}]").unwrap(),
        LPayload::Root(root) => write!(res, "[${}]", root.index()).unwrap(),
        LPayload::BinOp(op) => write!(res, "[{op}]").unwrap(),
        LPayload::ContextSlot(depth, index) => write!(res, "[{depth}:{index}]").unwrap(),
        LPayload::Function { argc, .. } => write!(res, "[argc: {argc}]").unwrap(),
    }

    if instr.opcode == LOpcode::Gap {
        write!(
            res,
            " {{{}}}",
            instr
                .moves
                .iter()
                .map(|(from, to)| format!("{} => {}", operand(lir, *from), operand(lir, *to)))
                .join(", ")
        )
        .unwrap();
        return res;
    }

    if !instr.inputs.is_empty() {
        write!(
            res,
            " {}",
            instr.inputs.iter().map(|u| operand(lir, *u)).join(", ")
        )
        .unwrap();
    }

    if !instr.scratches.is_empty() {
        write!(
            res,
            " scratch: {}",
            instr.scratches.iter().map(|u| operand(lir, *u)).join(", ")
        )
        .unwrap();
    }

    if let Some(result) = instr.result {
        write!(res, " => {}", operand(lir, result)).unwrap();
    }

    if !instr.target_labels.is_empty() {
        write!(
            res,
            " -> {}",
            instr
                .target_labels
                .iter()
                .map(|l| format!("{:02}", lir.instr(*l).id))
                .join(", ")
        )
        .unwrap();
    }

    res
}

/// Prints the allocated LIR when LIR logging is enabled; `extended` adds
/// the interval visualization.
pub fn dump_lir(lir: &Lir, filename: Option<&str>, extended: bool) {
    if !crate::config::lir_logging() {
        return;
    }

    let name = filename.unwrap_or("unknown");
    println!("{}", format!("## LIR {name} Start ##").cyan());
    print!("{}", lir_to_string(lir, extended));
    println!("{}", "## LIR End ##".cyan());
}
