use anyhow::{Context, Result};
use jiff::Timestamp;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

use super::pipeline::{RunReport, Step, StepStatus};

/// Status mark for a match percentage.
pub fn match_mark(match_percentage: f64) -> &'static str {
    if match_percentage >= 95.0 {
        "✅"
    } else if match_percentage >= 80.0 {
        "⚠️"
    } else {
        "❌"
    }
}

fn status_mark(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Ok => "✅",
        StepStatus::Failed => "❌",
        StepStatus::Skipped => "⏭️",
    }
}

/// Human readable summary printed at the end of a run.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "🎨 Figma visual comparison ({})", report.mode);

    if !report.steps.is_empty() {
        let _ = writeln!(out, "\nSteps:");
        for step in &report.steps {
            let _ = writeln!(
                out,
                "  {} {}: {}",
                status_mark(step.status),
                step.step,
                step.detail
            );
        }
    }

    if !report.results.is_empty() {
        let _ = writeln!(out, "\nResults:");
        for result in &report.results {
            let _ = writeln!(
                out,
                "  {} {}: {:.2}% match ({} of {} pixels differ) -> {}",
                match_mark(result.match_percentage),
                result.name,
                result.match_percentage,
                result.diff_pixels,
                result.total_pixels,
                result.diff_path
            );
        }
    }

    if let Some(average) = report.average_match {
        let _ = writeln!(out, "\n📊 Average match: {:.2}%", average);
        let _ = writeln!(out, "   Diff images saved to: {}", report.diff_location);
    } else if report.step(Step::Compare).is_some() {
        let _ = writeln!(out, "\n📊 No frames could be compared");
    }

    out
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    generated_at: Timestamp,
    #[serde(flatten)]
    report: &'a RunReport,
}

/// Write the report as pretty JSON, creating parent directories as needed.
pub fn write_json(report: &RunReport, path: &Path) -> Result<()> {
    let document = ReportDocument {
        generated_at: Timestamp::now(),
        report,
    };
    let content = serde_json::to_string_pretty(&document).context("Failed to serialize report")?;
    crate::utils::fs::write_creating_dirs(path, content.as_bytes())?;
    tracing::info!(report = %path.display(), "Wrote JSON report");
    Ok(())
}
