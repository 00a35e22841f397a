// Pipeline controller: seeds, bounded fetch pool, extraction and per-batch reconciliation

use super::seeds::SeedSource;
use super::writer::{BatchWriter, PendingLink};
use super::{EntityPhase, PipelineState, SyncSummary};
use crate::calendar::{extract_with_issues, CalendarSource, ExtractionContext};
use crate::config::SyncConfig;
use crate::errors::PipelineError;
use crate::identity::IdentityCache;
use crate::models::{Entity, EntityKind, FetchOutcome, RawCalendarDocument};
use crate::store::ScheduleStore;
use crate::telemetry;
use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub batch_size: usize,
    pub timezone: Tz,
}

impl PipelineConfig {
    pub fn from_settings(config: &SyncConfig) -> Result<Self, PipelineError> {
        let timezone = config
            .timezone
            .parse::<Tz>()
            .map_err(|_| PipelineError::Configuration(format!("Unknown timezone: {}", config.timezone)))?;
        Ok(Self {
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
            timezone,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            batch_size: 100,
            timezone: chrono_tz::Europe::Warsaw,
        }
    }
}

/// Drives one synchronization run
///
/// Fetches run concurrently inside a batch; extraction and reconciliation
/// happen here, after the batch barrier, so the writer is never shared.
pub struct PipelineController {
    store: Arc<dyn ScheduleStore>,
    cache: Arc<IdentityCache>,
    source: Arc<dyn CalendarSource>,
    seeds: Arc<dyn SeedSource>,
    writer: BatchWriter,
    config: PipelineConfig,
    state: PipelineState,
}

impl PipelineController {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        cache: Arc<IdentityCache>,
        source: Arc<dyn CalendarSource>,
        seeds: Arc<dyn SeedSource>,
        writer: BatchWriter,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            seeds,
            writer,
            config,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    fn transition(&mut self, next: PipelineState) -> Result<(), PipelineError> {
        self.state = self.state.advance(next)?;
        Ok(())
    }

    /// Run the whole synchronization
    ///
    /// Only a failed identity seed or an unavailable seed list abort the run;
    /// everything else is reported in the summary.
    #[instrument(skip(self, shutdown))]
    pub async fn run(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SyncSummary, PipelineError> {
        let mut summary = SyncSummary::new(Utc::now());
        self.transition(PipelineState::LoadingSeeds)?;

        for kind in EntityKind::ALL {
            self.cache
                .bulk_load(kind, self.store.as_ref())
                .await
                .map_err(|e| {
                    error!(kind = %kind, error = %e, "Failed to seed identity cache");
                    PipelineError::IdentitySeed(e)
                })?;
        }

        let mut phase_entities: Vec<(EntityPhase, Vec<Entity>)> = Vec::with_capacity(2);
        for phase in EntityPhase::ORDER {
            let kind = phase.kind();
            let entities = self.seeds.entities(kind).await?;
            let report = self.writer.write_entities(kind, &entities, &self.cache).await;

            let phase_summary = summary.phase_mut(phase);
            phase_summary.entities = entities.len();
            phase_summary.entities_written = report.written;
            phase_summary.truncations += report.truncations;
            phase_summary.write_conflicts += report.conflicts.len();
            summary.conflicts.extend(report.conflicts);
            phase_entities.push((phase, entities));
        }

        let mut deferred: Vec<PendingLink> = Vec::new();
        'phases: for (phase, entities) in &phase_entities {
            info!(phase = ?phase, entities = entities.len(), "Starting entity phase");

            for batch in entities.chunks(self.config.batch_size) {
                if stop_requested(&shutdown) {
                    summary.interrupted = true;
                    break 'phases;
                }

                self.transition(PipelineState::FetchingCalendars)?;
                let documents = self.fetch_batch(batch, &shutdown).await;
                if documents.len() < batch.len() {
                    summary.interrupted = true;
                }

                self.transition(PipelineState::Extracting)?;
                let extracted = self.extract_batch(&documents);

                self.transition(PipelineState::Reconciling)?;
                let report = self.writer.reconcile(extracted.sessions, &self.cache).await;
                self.writer.mark_synced(&documents).await;

                let phase_summary = summary.phase_mut(*phase);
                for document in &documents {
                    phase_summary.outcomes.record(document.outcome);
                }
                phase_summary.sessions_extracted += extracted.count;
                phase_summary.malformed_records += extracted.malformed;
                phase_summary.sessions_written += report.written;
                phase_summary.links_written += report.links_written;
                phase_summary.write_conflicts += report.conflicts.len();
                phase_summary.truncations += report.truncations;
                phase_summary.deferred_links += report.deferred.len();
                summary.conflicts.extend(report.conflicts);
                deferred.extend(report.deferred);

                telemetry::set_deferred_links(deferred.len());
                if summary.interrupted {
                    break 'phases;
                }
            }
        }

        if !deferred.is_empty() {
            let before = deferred.len();
            let report = self.writer.retry_deferred(deferred, &self.cache).await;
            summary.deferred_remaining = report.remaining.len();
            summary.deferred_resolved = before - report.remaining.len();
            summary.conflicts.extend(report.conflicts);
        }

        self.transition(PipelineState::Done)?;
        summary.final_state = self.state;
        summary.finished_at = Some(Utc::now());

        if let Err(e) = self.writer.record_run(&summary).await {
            warn!(error = %e, "Failed to record sync run");
        }

        if summary.interrupted {
            warn!(
                sessions_written = summary.sessions_written(),
                "Synchronization interrupted by shutdown signal"
            );
        }
        info!(
            entities_fetched = summary.entities_fetched(),
            sessions_written = summary.sessions_written(),
            write_conflicts = summary.write_conflicts(),
            deferred_remaining = summary.deferred_remaining,
            "Synchronization finished"
        );
        Ok(summary)
    }

    /// Fetch one batch through the bounded pool, in completion order
    ///
    /// Once shutdown is signalled no new fetch starts; fetches already in
    /// flight complete and are returned.
    async fn fetch_batch(
        &self,
        batch: &[Entity],
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<RawCalendarDocument> {
        stream::iter(batch.iter().cloned())
            .map(|entity| {
                let source = Arc::clone(&self.source);
                let shutdown = shutdown.clone();
                async move {
                    if stop_requested(&shutdown) {
                        return None;
                    }
                    Some(source.fetch(&entity).await)
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter_map(|document| async move { document })
            .collect()
            .await
    }

    fn extract_batch(&self, documents: &[RawCalendarDocument]) -> ExtractedBatch {
        let context = ExtractionContext {
            timezone: self.config.timezone,
        };
        let mut batch = ExtractedBatch::default();

        for document in documents.iter().filter(|d| d.outcome == FetchOutcome::Success) {
            let extraction = extract_with_issues(document, &context);
            for issue in &extraction.issues {
                warn!(issue = %issue, "Degraded calendar record");
            }
            telemetry::record_sessions_extracted(document.entity.kind, extraction.sessions.len());
            batch.count += extraction.sessions.len();
            batch.malformed += extraction.issues.len();
            batch.sessions.extend(extraction.sessions);
        }
        batch
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[derive(Default)]
struct ExtractedBatch {
    sessions: Vec<crate::models::ClassSession>,
    count: usize,
    malformed: usize,
}
