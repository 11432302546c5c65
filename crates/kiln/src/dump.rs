//! Per-stage graph dumps: `kiln_program_<id>_<stage>.{graph,info,order,optimized}`.
//!
//! `.graph` is DOT for quick visualization, `.info` is one JSON record per
//! node, `.order` the processing sequence, `.optimized` the removed-id map.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{GraphError, GraphResult};
use crate::graph::Program;

pub(crate) fn dump_program(program: &Program, stage: &str) -> GraphResult<()> {
    let Some(dir) = program.options().graph_dumps_dir.clone() else {
        return Ok(());
    };
    fs::create_dir_all(&dir).map_err(|e| dump_error(&dir, e))?;
    let base = dir.join(format!("kiln_program_{}_{}", program.id(), stage));

    write_file(&base.with_extension("graph"), &render_dot(program))?;
    write_file(&base.with_extension("info"), &render_info(program)?)?;
    write_file(&base.with_extension("order"), &render_order(program))?;
    write_file(&base.with_extension("optimized"), &render_optimized(program))?;
    Ok(())
}

fn write_file(path: &Path, content: &str) -> GraphResult<()> {
    fs::write(path, content).map_err(|e| dump_error(path, e))
}

fn dump_error(path: &Path, err: std::io::Error) -> GraphError {
    GraphError::Configuration(format!("failed to write graph dump {}: {err}", path.display()))
}

fn render_dot(program: &Program) -> String {
    let mut out = String::from("digraph program {\n");
    for node_id in program.processing_order().iter() {
        let node = program.node(node_id);
        let layout = node.output_layout_or_dummy();
        let _ = writeln!(
            out,
            "  \"{}\" [label=\"{}\\n{}\\n{}\"];",
            node.id(),
            node.id(),
            node.kind_tag().as_str(),
            layout.format.as_str()
        );
        for &dep in node.dependencies() {
            let _ = writeln!(out, "  \"{}\" -> \"{}\";", program.node(dep).id(), node.id());
        }
    }
    out.push_str("}\n");
    out
}

fn render_info(program: &Program) -> GraphResult<String> {
    let mut out = String::new();
    for info in program.get_current_stage_info() {
        let line = serde_json::to_string(&info)
            .map_err(|e| GraphError::Configuration(format!("info dump serialization: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn render_order(program: &Program) -> String {
    let mut out = String::new();
    for node_id in program.processing_order().iter() {
        out.push_str(program.node(node_id).id());
        out.push('\n');
    }
    out
}

fn render_optimized(program: &Program) -> String {
    let mut out = String::new();
    for (removed, survivors) in program.optimized_out() {
        let _ = write!(out, "{removed} -> ");
        out.push_str(&survivors.join(", "));
        out.push('\n');
    }
    out
}
