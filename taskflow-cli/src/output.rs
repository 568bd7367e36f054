use serde::Serialize;
use std::io::{self, Write};
use taskflow::{ErrorKind, PoolReport};

use crate::cli::OutputFormat;
use crate::demos::{ResultRecord, RunSummary};
use crate::error::Result;

/// Writes run results to stdout in the selected format.
pub struct OutputManager {
    format: OutputFormat,
}

#[derive(Serialize)]
struct SummaryLine<'a> {
    status: &'static str,
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    layout: Option<&'static str>,
    total: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    abandoned: usize,
    deadline_expired: bool,
    stages: &'a [PoolReport],
}

impl OutputManager {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn print(&self, summary: &RunSummary) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write(&mut out, summary)?;
        out.flush()?;
        Ok(())
    }

    pub fn write(&self, out: &mut impl Write, summary: &RunSummary) -> Result<()> {
        let mut records: Vec<&ResultRecord> = summary.results.iter().collect();
        records.sort_by_key(|r| r.task_id);

        match self.format {
            OutputFormat::Json => {
                for record in &records {
                    writeln!(out, "{}", serde_json::to_string(record)?)?;
                }
                let cancelled = summary.count_kind(ErrorKind::Cancelled);
                let line = SummaryLine {
                    status: "ok",
                    command: summary.command,
                    layout: summary.layout,
                    total: summary.results.len(),
                    succeeded: summary.succeeded(),
                    failed: summary.results.len() - summary.succeeded() - cancelled,
                    cancelled,
                    abandoned: summary.abandoned,
                    deadline_expired: summary.deadline_expired,
                    stages: &summary.stages,
                };
                writeln!(out, "{}", serde_json::to_string(&line)?)?;
            }
            OutputFormat::Pretty => {
                for record in &records {
                    writeln!(out, "{}", format_record(record))?;
                }
                writeln!(out)?;
                if let Some(layout) = summary.layout {
                    writeln!(out, "Stages: {layout}")?;
                }
                for stage in &summary.stages {
                    writeln!(out, "{}", format_stage(stage))?;
                }
                if summary.abandoned > 0 {
                    writeln!(out, "{} result(s) were never read", summary.abandoned)?;
                }
                if summary.deadline_expired {
                    writeln!(out, "Deadline expired before the run finished")?;
                }
            }
        }
        Ok(())
    }
}

fn format_record(record: &ResultRecord) -> String {
    match (&record.output, &record.error) {
        (Some(output), _) => format!(
            "task {:>3}  worker {:>2}  ok      {:>5}ms  {}",
            record.task_id, record.worker_id, record.duration_ms, output
        ),
        (None, Some(error)) => format!(
            "task {:>3}  worker {:>2}  {:<7} {:>5}ms  {}",
            record.task_id,
            record.worker_id,
            kind_label(error.kind()),
            record.duration_ms,
            error.description()
        ),
        (None, None) => format!("task {:>3}  worker {:>2}  (no output)", record.task_id, record.worker_id),
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "invalid",
        ErrorKind::Resource => "resource",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Cancelled => "cancel",
        ErrorKind::Unclassified => "fault",
    }
}

fn format_stage(stage: &PoolReport) -> String {
    let mut line = format!(
        "[{}] completed={} failed={} cancelled={} forwarded={} filtered={}",
        stage.name, stage.completed, stage.failed, stage.cancelled, stage.forwarded, stage.filtered
    );
    if stage.dropped > 0 {
        line.push_str(&format!(" dropped={}", stage.dropped));
    }
    if stage.lost_workers > 0 {
        line.push_str(&format!(" lost_workers={}", stage.lost_workers));
    }
    line
}
