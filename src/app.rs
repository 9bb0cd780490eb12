use std::time::{Duration, Instant};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::classifier::{CancelFlag, Classifier, classify_request};
use crate::cluster::FilenameClusterer;
use crate::domain::{AnalysisLog, CandidateSequence, ClassificationResult, Series, SeriesImage};
use crate::error::CurateError;
use crate::request::{RequestBuilder, RequestPolicy};
use crate::store::{CurationStore, SeriesFilter, SeriesOrder, StoreStatistics, SweepReport, sweep_missing_files};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSinkKind {
    Analyze,
    Clean,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn timed(message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            message: message.into(),
            elapsed: Some(elapsed),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub limit: Option<usize>,
    pub sort_by_size: bool,
    pub min_images: usize,
    pub max_images: usize,
    pub policy: RequestPolicy,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            limit: None,
            sort_by_size: true,
            min_images: 2,
            max_images: 14,
            policy: RequestPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SequenceOutcome {
    Stored {
        series_id: i64,
        is_series: bool,
        included: usize,
        caption: String,
        reason: String,
        skipped_images: usize,
        tokens: Option<u64>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceReport {
    pub base_name: String,
    pub candidate_count: usize,
    #[serde(flatten)]
    pub outcome: SequenceOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyzeSummary {
    pub directory: String,
    pub total_images: usize,
    pub candidates: usize,
    pub already_known: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub confirmed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub total_tokens: u64,
    pub sequences: Vec<SequenceReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub id: i64,
    pub base_name: String,
    pub is_series: bool,
    pub member_count: usize,
    pub candidate_count: usize,
    pub caption: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Series> for SeriesSummary {
    fn from(series: &Series) -> Self {
        Self {
            id: series.id,
            base_name: series.base_name.clone(),
            is_series: series.is_series,
            member_count: series.member_count,
            candidate_count: series.candidate_count,
            caption: series.caption.clone(),
            created_at: series.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResult {
    pub series: Vec<SeriesSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsResult {
    #[serde(flatten)]
    pub statistics: StoreStatistics,
    pub newest: Vec<SeriesSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesDetail {
    pub id: i64,
    pub base_name: String,
    pub source_directory: String,
    pub candidate_count: usize,
    pub token_usage: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub classification: ClassificationResult,
    pub images: Vec<SeriesImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShowResult {
    pub series: Vec<SeriesDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoveResult {
    pub base_name: String,
    pub removed: Vec<i64>,
}

/// Batch and query operations on top of one curation store.
pub struct Curator<S: CurationStore> {
    store: S,
}

impl<S: CurationStore> Curator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Scans `root`, classifies every new candidate and persists the outcome.
    /// A failure on one candidate is recorded and the batch moves on; only the
    /// scan itself and cancellation end it early.
    pub fn analyze<C: Classifier + ?Sized>(
        &mut self,
        root: &Utf8Path,
        classifier: &C,
        options: &AnalyzeOptions,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<AnalyzeSummary, CurateError> {
        let started = Instant::now();
        sink.event(ProgressEvent::new(format!("phase=Scan; scanning {root}")));
        let discovery = FilenameClusterer::discover(root)?;

        let known = self.store.known_base_names()?;
        let mut summary = AnalyzeSummary {
            directory: root.to_string(),
            total_images: discovery.total_images,
            candidates: discovery.clusters.len(),
            ..AnalyzeSummary::default()
        };

        let mut queue: Vec<&CandidateSequence> = if options.sort_by_size {
            discovery.by_size()
        } else {
            discovery.clusters.values().collect()
        };
        queue.retain(|candidate| {
            let fresh = !known.contains(candidate.base_name());
            if !fresh {
                summary.already_known += 1;
            }
            fresh
        });
        if let Some(limit) = options.limit {
            queue.truncate(limit);
        }
        sink.event(ProgressEvent::timed(
            format!(
                "phase=Cluster; {} images, {} candidates, {} new",
                discovery.total_images,
                discovery.clusters.len(),
                queue.len()
            ),
            started.elapsed(),
        ));

        let builder = RequestBuilder::new(options.policy);
        let total = queue.len();
        for (index, candidate) in queue.into_iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            sink.event(ProgressEvent::new(format!(
                "phase=Classify; [{}/{total}] {} ({} images)",
                index + 1,
                candidate.base_name(),
                candidate.len()
            )));
            summary.processed += 1;

            let outcome = match self.process_candidate(candidate, classifier, &builder, options) {
                Ok(outcome) => outcome,
                Err(CurateError::Cancelled) => {
                    summary.processed -= 1;
                    summary.cancelled = true;
                    break;
                }
                Err(err) => SequenceOutcome::Failed {
                    error: err.to_string(),
                },
            };

            match &outcome {
                SequenceOutcome::Stored {
                    is_series, tokens, ..
                } => {
                    summary.succeeded += 1;
                    summary.total_tokens += tokens.unwrap_or(0);
                    if *is_series {
                        summary.confirmed += 1;
                    }
                }
                SequenceOutcome::Skipped { reason } => {
                    info!("skipped {}: {reason}", candidate.base_name());
                    summary.skipped += 1;
                }
                SequenceOutcome::Failed { error } => {
                    warn!("{} failed: {error}", candidate.base_name());
                    summary.failed += 1;
                }
            }
            summary.sequences.push(SequenceReport {
                base_name: candidate.base_name().to_string(),
                candidate_count: candidate.len(),
                outcome,
            });
        }

        let log = AnalysisLog {
            directory: root.to_string(),
            total_images: discovery.total_images,
            total_series: summary.confirmed,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.store.append_analysis_log(&log) {
            warn!("could not record analysis log: {err}");
        }

        sink.event(ProgressEvent::timed(
            format!(
                "phase=Done; processed={} succeeded={} skipped={} failed={}",
                summary.processed, summary.succeeded, summary.skipped, summary.failed
            ),
            started.elapsed(),
        ));
        Ok(summary)
    }

    fn process_candidate<C: Classifier + ?Sized>(
        &mut self,
        candidate: &CandidateSequence,
        classifier: &C,
        builder: &RequestBuilder,
        options: &AnalyzeOptions,
    ) -> Result<SequenceOutcome, CurateError> {
        let count = candidate.len();
        if count < options.min_images {
            return Ok(SequenceOutcome::Skipped {
                reason: format!("{count} images, fewer than {}", options.min_images),
            });
        }
        if count > options.max_images {
            return Ok(SequenceOutcome::Skipped {
                reason: format!("{count} images, more than {}", options.max_images),
            });
        }

        let request = match builder.build(candidate) {
            Ok(request) => request,
            Err(CurateError::NoValidImages(_)) => {
                return Ok(SequenceOutcome::Skipped {
                    reason: "no readable images".to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let started = Instant::now();
        let outcome = classify_request(classifier, &request)?;
        info!(
            "{}: is_series={} included={} in {}ms",
            candidate.base_name(),
            outcome.result.is_series,
            outcome.result.member_count(),
            started.elapsed().as_millis()
        );

        let series_id = self.store.create_series(candidate, &outcome)?;
        Ok(SequenceOutcome::Stored {
            series_id,
            is_series: outcome.result.is_series,
            included: outcome.result.member_count(),
            caption: outcome.result.caption.clone(),
            reason: outcome.result.reason.clone(),
            skipped_images: outcome.skipped_images,
            tokens: outcome.usage.map(|usage| usage.total_tokens),
        })
    }

    pub fn stats(&self, top: usize) -> Result<StatsResult, CurateError> {
        let statistics = self.store.statistics()?;
        let newest = self
            .store
            .load_series(
                &SeriesFilter::confirmed()
                    .with_order(SeriesOrder::NewestFirst)
                    .with_limit(top),
            )?
            .iter()
            .map(SeriesSummary::from)
            .collect();
        Ok(StatsResult { statistics, newest })
    }

    pub fn list(&self, limit: Option<usize>) -> Result<ListResult, CurateError> {
        let mut filter = SeriesFilter::all().with_order(SeriesOrder::NewestFirst);
        filter.limit = limit;
        let series = self
            .store
            .load_series(&filter)?
            .iter()
            .map(SeriesSummary::from)
            .collect();
        Ok(ListResult { series })
    }

    pub fn show(&self, base_name: &str) -> Result<ShowResult, CurateError> {
        let matches = self
            .store
            .load_series(&SeriesFilter::by_base_name(base_name).with_order(SeriesOrder::Id))?;
        if matches.is_empty() {
            return Err(CurateError::SeriesNameNotFound(base_name.to_string()));
        }
        let series = matches
            .into_iter()
            .map(|series| {
                let images = self.store.series_images(series.id)?;
                Ok(SeriesDetail {
                    id: series.id,
                    base_name: series.base_name,
                    source_directory: series.source_directory.to_string(),
                    candidate_count: series.candidate_count,
                    token_usage: series.token_usage,
                    created_at: series.created_at,
                    classification: series.classification,
                    images,
                })
            })
            .collect::<Result<Vec<_>, CurateError>>()?;
        Ok(ShowResult { series })
    }

    pub fn remove(&mut self, base_name: &str) -> Result<RemoveResult, CurateError> {
        let ids = self
            .store
            .load_series(&SeriesFilter::by_base_name(base_name).with_order(SeriesOrder::Id))?
            .into_iter()
            .map(|series| series.id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Err(CurateError::SeriesNameNotFound(base_name.to_string()));
        }
        for id in &ids {
            self.store.delete_series(*id)?;
        }
        info!("removed {} series named {base_name}", ids.len());
        Ok(RemoveResult {
            base_name: base_name.to_string(),
            removed: ids,
        })
    }

    pub fn clean(&mut self, sink: &dyn ProgressSink) -> Result<SweepReport, CurateError> {
        self.clean_with(|path| path.exists(), sink)
    }

    pub fn clean_with<F>(&mut self, exists: F, sink: &dyn ProgressSink) -> Result<SweepReport, CurateError>
    where
        F: Fn(&Utf8Path) -> bool,
    {
        let started = Instant::now();
        sink.event(ProgressEvent::new("phase=Verify; checking image references"));
        let report = sweep_missing_files(&mut self.store, exists)?;
        sink.event(ProgressEvent::timed(
            format!(
                "phase=Done; checked={} removed={} empty_series={}",
                report.checked, report.removed, report.empty_series_removed
            ),
            started.elapsed(),
        ));
        Ok(report)
    }
}
