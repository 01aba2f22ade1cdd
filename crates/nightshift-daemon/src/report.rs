use std::fmt::Write;

use nightshift_scheduler::{HandlerOutcome, RunSummary};

/// Plain-text table of a run summary.
pub fn render(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run {} ({}) started {} took {} ms",
        summary.run_id, summary.trigger, summary.started_at, summary.duration_ms
    );
    let width = summary
        .handlers
        .iter()
        .map(|r| r.handler.len())
        .max()
        .unwrap_or(0)
        .max("handler".len());
    let _ = writeln!(
        out,
        "{:<width$}  {:<14}  {:>7}  {:>10}  {:>10}",
        "handler", "outcome", "batches", "rows", "elapsed_ms"
    );
    for report in &summary.handlers {
        let totals = report.outcome.totals();
        let _ = writeln!(
            out,
            "{:<width$}  {:<14}  {:>7}  {:>10}  {:>10}",
            report.handler,
            report.outcome.label(),
            totals.batches,
            totals.rows,
            report.elapsed_ms
        );
        if let HandlerOutcome::Failed { cause, .. } = &report.outcome {
            let _ = writeln!(out, "{:<width$}  cause: {cause}", "");
        }
    }
    out
}

pub fn to_json(summary: &RunSummary) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}
