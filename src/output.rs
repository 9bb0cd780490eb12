use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{
    AnalyzeSummary, ListResult, ProgressEvent, ProgressSink, RemoveResult, SequenceOutcome,
    ShowResult, StatsResult,
};
use crate::store::SweepReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_analyze(result: &AnalyzeSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_stats(result: &StatsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_show(result: &ShowResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clean(result: &SweepReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain-text rendering for interactive runs that do not need a full screen.
pub struct TextOutput;

impl TextOutput {
    pub fn print_analyze(result: &AnalyzeSummary) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "Analyzed {}", result.directory)?;
        writeln!(
            out,
            "  images: {}  candidates: {}  already stored: {}",
            result.total_images, result.candidates, result.already_known
        )?;
        writeln!(
            out,
            "  processed: {}  succeeded: {}  skipped: {}  failed: {}",
            result.processed, result.succeeded, result.skipped, result.failed
        )?;
        writeln!(
            out,
            "  confirmed series: {}  tokens: {}",
            result.confirmed, result.total_tokens
        )?;
        if result.cancelled {
            writeln!(out, "  run was cancelled before the queue was finished")?;
        }
        for report in &result.sequences {
            match &report.outcome {
                SequenceOutcome::Stored {
                    is_series: true,
                    included,
                    caption,
                    ..
                } => writeln!(
                    out,
                    "  + {} ({included}/{}): {caption}",
                    report.base_name, report.candidate_count
                )?,
                SequenceOutcome::Stored { reason, .. } => {
                    writeln!(out, "  - {}: {reason}", report.base_name)?
                }
                SequenceOutcome::Skipped { reason } => {
                    writeln!(out, "  ~ {}: skipped, {reason}", report.base_name)?
                }
                SequenceOutcome::Failed { error } => {
                    writeln!(out, "  ! {}: {error}", report.base_name)?
                }
            }
        }
        Ok(())
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if result.series.is_empty() {
            writeln!(out, "No series stored.")?;
        }
        for series in &result.series {
            let status = if series.is_series { "series" } else { "rejected" };
            writeln!(
                out,
                "{:>6}  {:<8}  {:>2}/{:<2}  {}  {}",
                series.id,
                status,
                series.member_count,
                series.candidate_count,
                series.created_at.format("%Y-%m-%d %H:%M"),
                series.base_name
            )?;
        }
        Ok(())
    }

    pub fn print_stats(result: &StatsResult) -> io::Result<()> {
        let stats = &result.statistics;
        let mut out = io::stdout().lock();
        writeln!(out, "Series analyzed:    {}", stats.total_series)?;
        writeln!(out, "Confirmed series:   {}", stats.confirmed_series)?;
        writeln!(out, "Images in series:   {}", stats.total_images)?;
        match stats.average_images_per_series {
            Some(average) => writeln!(out, "Average per series: {average:.1}")?,
            None => writeln!(out, "Average per series: n/a")?,
        }
        if !stats.size_distribution.is_empty() {
            writeln!(out, "Size distribution:")?;
            for bucket in &stats.size_distribution {
                writeln!(out, "  {:>2} images: {}", bucket.member_count, bucket.series)?;
            }
        }
        if !result.newest.is_empty() {
            writeln!(out, "Newest series:")?;
            for series in &result.newest {
                writeln!(out, "  {} ({} images)", series.base_name, series.member_count)?;
                if !series.caption.is_empty() {
                    writeln!(out, "    {}", series.caption)?;
                }
            }
        }
        Ok(())
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(
            out,
            "Removed {} series named {}",
            result.removed.len(),
            result.base_name
        )
    }
}

/// Forwards progress to the log when no screen is attached.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!("{} ({}ms)", event.message, elapsed.as_millis()),
            None => info!("{}", event.message),
        }
    }
}
