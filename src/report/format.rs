//! Formatted terminal output.

use crate::models::StanBackendKind;
use crate::report::ParamSummary;

/// Which backend call produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Fit,
    Sample,
}

/// One-line header naming the backend and what was run.
pub fn format_run_header(backend: StanBackendKind, kind: RunKind, details: &str) -> String {
    let what = match kind {
        RunKind::Fit => "MAP fit",
        RunKind::Sample => "posterior sampling",
    };
    if details.is_empty() {
        format!("=== prophet-stan - {what} ({backend}) ===\n")
    } else {
        format!("=== prophet-stan - {what} ({backend}) ===\n{details}\n")
    }
}

/// Format the per-parameter summary table.
pub fn format_summary_table(rows: &[ParamSummary]) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<16} {:<12} {:>14} {:>14} {:>14}",
            "param", "shape", "mean", "min", "max"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(format!("{:-<16} {:-<12} {:-<14} {:-<14} {:-<14}", "", "", "", "", "").trim_end());
    out.push('\n');

    for r in rows {
        out.push_str(
            format!(
                "{:<16} {:<12} {:>14} {:>14} {:>14}",
                truncate(&r.name, 16),
                fmt_shape(&r.shape),
                fmt_opt(r.mean),
                fmt_opt(r.min),
                fmt_opt(r.max),
            )
            .trim_end(),
        );
        out.push('\n');
    }

    out
}

fn fmt_shape(shape: &[usize]) -> String {
    match shape {
        [n] => format!("({n},)"),
        _ => {
            let parts: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x:.6}"),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
