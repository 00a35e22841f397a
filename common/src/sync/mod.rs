// Synchronization run: state machine, entity phases and run summary

pub mod pipeline;
pub mod seeds;
pub mod writer;

use crate::errors::{PipelineError, SyncIssue};
use crate::models::{EntityKind, FetchOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use pipeline::{PipelineConfig, PipelineController};
pub use seeds::{JsonSeedFile, SeedSource, StoreSeedSource};
pub use writer::{BatchWriter, DeferredReport, EntityWriteReport, PendingLink, ReconcileReport};

/// Controller state; each batch cycles Fetching → Extracting → Reconciling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    LoadingSeeds,
    FetchingCalendars,
    Extracting,
    Reconciling,
    Done,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, LoadingSeeds)
                | (LoadingSeeds, FetchingCalendars)
                | (LoadingSeeds, Done)
                | (FetchingCalendars, Extracting)
                | (Extracting, Reconciling)
                | (Reconciling, FetchingCalendars)
                | (Reconciling, Done)
        )
    }

    /// Move to `next`, refusing transitions the run loop never makes
    pub fn advance(self, next: PipelineState) -> Result<PipelineState, PipelineError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PipelineError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Groups are always synchronized before instructors so that instructor
/// feeds can link to groups persisted earlier in the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    Groups,
    Instructors,
}

impl EntityPhase {
    pub const ORDER: [EntityPhase; 2] = [EntityPhase::Groups, EntityPhase::Instructors];

    pub fn kind(self) -> EntityKind {
        match self {
            EntityPhase::Groups => EntityKind::Group,
            EntityPhase::Instructors => EntityKind::Instructor,
        }
    }
}

/// Fetch outcome histogram
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: usize,
    pub not_found: usize,
    pub empty: usize,
    pub error: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success => self.success += 1,
            FetchOutcome::NotFound => self.not_found += 1,
            FetchOutcome::Empty => self.empty += 1,
            FetchOutcome::Error => self.error += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.not_found + self.empty + self.error
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: EntityPhase,
    /// Entities in the seed list
    pub entities: usize,
    /// Seed rows the store acknowledged
    pub entities_written: usize,
    pub outcomes: OutcomeCounts,
    pub sessions_extracted: usize,
    pub malformed_records: usize,
    pub sessions_written: usize,
    pub links_written: usize,
    pub write_conflicts: usize,
    pub truncations: usize,
    /// Links left for the deferred pass
    pub deferred_links: usize,
}

impl PhaseSummary {
    pub fn new(phase: EntityPhase) -> Self {
        Self {
            phase,
            entities: 0,
            entities_written: 0,
            outcomes: OutcomeCounts::default(),
            sessions_extracted: 0,
            malformed_records: 0,
            sessions_written: 0,
            links_written: 0,
            write_conflicts: 0,
            truncations: 0,
            deferred_links: 0,
        }
    }
}

/// Outcome of one synchronization run
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_state: PipelineState,
    /// Set when a shutdown signal cut the run short
    pub interrupted: bool,
    pub phases: Vec<PhaseSummary>,
    pub deferred_resolved: usize,
    pub deferred_remaining: usize,
    /// Rows the store rejected, one entry per row
    #[serde(skip)]
    pub conflicts: Vec<SyncIssue>,
}

impl SyncSummary {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            final_state: PipelineState::Idle,
            interrupted: false,
            phases: EntityPhase::ORDER.iter().map(|p| PhaseSummary::new(*p)).collect(),
            deferred_resolved: 0,
            deferred_remaining: 0,
            conflicts: Vec::new(),
        }
    }

    pub fn phase(&self, phase: EntityPhase) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn phase_mut(&mut self, phase: EntityPhase) -> &mut PhaseSummary {
        let index = match phase {
            EntityPhase::Groups => 0,
            EntityPhase::Instructors => 1,
        };
        &mut self.phases[index]
    }

    pub fn entities_fetched(&self) -> usize {
        self.phases.iter().map(|p| p.outcomes.total()).sum()
    }

    pub fn sessions_written(&self) -> usize {
        self.phases.iter().map(|p| p.sessions_written).sum()
    }

    pub fn write_conflicts(&self) -> usize {
        self.conflicts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = PipelineState::Idle;
        for next in [
            PipelineState::LoadingSeeds,
            PipelineState::FetchingCalendars,
            PipelineState::Extracting,
            PipelineState::Reconciling,
            PipelineState::FetchingCalendars,
            PipelineState::Extracting,
            PipelineState::Reconciling,
            PipelineState::Done,
        ] {
            state = state.advance(next).unwrap();
        }
        assert_eq!(state, PipelineState::Done);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        assert!(PipelineState::Idle.advance(PipelineState::Reconciling).is_err());
        assert!(PipelineState::FetchingCalendars.advance(PipelineState::Done).is_err());
        assert!(PipelineState::Extracting.advance(PipelineState::FetchingCalendars).is_err());
        assert!(PipelineState::Done.advance(PipelineState::LoadingSeeds).is_err());

        match PipelineState::Idle.advance(PipelineState::Done) {
            Err(PipelineError::InvalidTransition { from, to }) => {
                assert_eq!(from, PipelineState::Idle);
                assert_eq!(to, PipelineState::Done);
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
    }

    #[test]
    fn test_groups_phase_comes_first() {
        assert_eq!(EntityPhase::ORDER[0].kind(), EntityKind::Group);
        assert_eq!(EntityPhase::ORDER[1].kind(), EntityKind::Instructor);
    }

    #[test]
    fn test_summary_totals() {
        let mut summary = SyncSummary::new(Utc::now());
        summary.phase_mut(EntityPhase::Groups).outcomes.record(FetchOutcome::Success);
        summary.phase_mut(EntityPhase::Groups).sessions_written = 4;
        summary.phase_mut(EntityPhase::Instructors).outcomes.record(FetchOutcome::NotFound);
        summary.phase_mut(EntityPhase::Instructors).sessions_written = 1;

        assert_eq!(summary.entities_fetched(), 2);
        assert_eq!(summary.sessions_written(), 5);
        assert_eq!(
            summary.phase(EntityPhase::Instructors).unwrap().outcomes.not_found,
            1
        );
    }
}
