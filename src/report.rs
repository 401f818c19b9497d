use crate::result::AggregatedResult;
use eyre::Result;
use std::fmt::Write as _;

/// Plain-text run report: one glyph-prefixed line per target in arrival
/// order, then the summary block.
pub fn render_text(aggregate: &AggregatedResult) -> String {
    let mut out = String::new();
    for result in &aggregate.results {
        let _ = write!(
            out,
            "{} {:<44} {:<8} {:>8.1}s",
            result.status.glyph(),
            result.instance.identity(),
            result.status.label(),
            result.duration.as_secs_f64()
        );
        if let Some(err) = result.get_error() {
            let _ = write!(out, "  {err}");
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "total: {}  success: {}  failed: {}  skipped: {}  canceled: {}",
        aggregate.total, aggregate.success, aggregate.failed, aggregate.skipped, aggregate.canceled
    );
    let _ = writeln!(
        out,
        "success rate: {:.1}%  failure rate: {:.1}%  wall clock: {:.1}s",
        aggregate.success_rate(),
        aggregate.failure_rate(),
        aggregate.total_time.as_secs_f64()
    );
    out
}

/// `--json` form of the run report.
pub fn render_json(aggregate: &AggregatedResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(aggregate)?)
}
