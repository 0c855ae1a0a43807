//! Output formatting for findings and run summaries.
//!
//! A [`FindingFormatter`] turns each streamed [`Finding`] into one line of
//! output, and the final [`RunSummary`] into a closing block.
//!
//! - [`PlainFormatter`] - human readable, one finding per line
//! - [`JsonFormatter`] - JSON lines, one object per finding
use std::fmt::{Display, Write};

use serde::Serialize;

use crate::engine::{Finding, RunSummary};

/// Formats findings of record type `R`.
pub trait FindingFormatter<R>: Send + Sync + 'static {
    fn format_finding(&self, finding: &Finding<R>) -> anyhow::Result<String>;

    fn format_summary(&self, summary: &RunSummary) -> anyhow::Result<String>;
}

/// Formats findings as `target  record` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

/// Formats findings and the summary as JSON objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl<R: Display> FindingFormatter<R> for PlainFormatter {
    fn format_finding(&self, finding: &Finding<R>) -> anyhow::Result<String> {
        Ok(format!("{:<30} {}", finding.target, finding.record))
    }

    fn format_summary(&self, summary: &RunSummary) -> anyhow::Result<String> {
        let mut out = String::new();
        writeln!(
            out,
            "{} targets supplied, {} skipped by probe, {} dispatched, {} undispatched",
            summary.supplied, summary.skipped, summary.submitted, summary.undispatched
        )?;
        writeln!(
            out,
            "{} completed with {} records, {} failed, {} timed out",
            summary.completed,
            summary.records,
            summary.failed.len(),
            summary.timed_out.len()
        )?;
        for failed in &summary.failed {
            writeln!(out, "  failed    {} ({})", failed.target, failed.error)?;
        }
        for target in &summary.timed_out {
            writeln!(out, "  timed out {target}")?;
        }
        if summary.stopped_early {
            writeln!(out, "stopped on first match")?;
        }
        if summary.pool.leaked > 0 {
            writeln!(out, "{} execution contexts leaked", summary.pool.leaked)?;
        }
        write!(
            out,
            "peak concurrency {}/{}, elapsed {:.2?}",
            summary.pool.peak_running, summary.pool.capacity, summary.elapsed
        )?;
        Ok(out)
    }
}

impl<R: Serialize> FindingFormatter<R> for JsonFormatter {
    fn format_finding(&self, finding: &Finding<R>) -> anyhow::Result<String> {
        Ok(serde_json::to_string(finding)?)
    }

    fn format_summary(&self, summary: &RunSummary) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&serde_json::json!({ "summary": summary }))?)
    }
}
