//! Foreground submission of one completed checklist.
//!
//! Each call to [`SubmissionController::submit`] walks one attempt through
//!
//! ```text
//! Idle -> Validating -> PinCheck -> OnlineAttempt -> Success
//!                                                 -> RecoverableFailure -> Queued
//!                                                 -> TerminalFailure
//!                               -> DirectQueue    -> Queued
//!                               -> PinRejected
//! ```
//!
//! and ends in one [`SubmissionOutcome`]. The form is only reset once the
//! outcome is known, so a terminal failure leaves it intact for a manual retry.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cascade::{CascadeOutcome, ResolutionCascade};
use crate::model::{ChecklistArea, CleaningLogRecord, LogStatus, PinSession, StoredRecord};
use crate::network::NetworkMonitor;
use crate::pending::PendingWriteStore;
use crate::pin::PinFreshnessGuard;
use crate::remote::{with_timeout, RemoteStore};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemMark {
    #[default]
    Unchecked,
    Checked,
    NotApplicable,
}

/// Staff-facing checklist state for one location.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistForm {
    pub location_id: String,
    pub location_name: String,
    #[serde(default)]
    pub staff_name: String,
    #[serde(default)]
    pub items: HashMap<ChecklistArea, ItemMark>,
    #[serde(default)]
    pub notes: String,
}

impl ChecklistForm {
    pub fn new(location_id: impl Into<String>, location_name: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            location_name: location_name.into(),
            ..Default::default()
        }
    }

    pub fn mark(&mut self, area: ChecklistArea, mark: ItemMark) -> &mut Self {
        self.items.insert(area, mark);
        self
    }

    pub fn mark_of(&self, area: ChecklistArea) -> ItemMark {
        self.items.get(&area).copied().unwrap_or_default()
    }

    pub fn unchecked_areas(&self) -> Vec<ChecklistArea> {
        ChecklistArea::ALL
            .into_iter()
            .filter(|area| self.mark_of(*area) == ItemMark::Unchecked)
            .collect()
    }

    /// `Complete` when every area is checked or marked not applicable.
    pub fn derived_status(&self) -> LogStatus {
        if self.unchecked_areas().is_empty() {
            LogStatus::Complete
        } else {
            LogStatus::AttentionRequired
        }
    }

    /// A named staff member, and an explanation for anything left unchecked.
    pub fn can_submit(&self) -> bool {
        !self.staff_name.trim().is_empty()
            && (self.unchecked_areas().is_empty() || !self.notes.trim().is_empty())
    }

    pub fn to_record(&self) -> CleaningLogRecord {
        let checked = |area: ChecklistArea| self.mark_of(area) == ItemMark::Checked;
        CleaningLogRecord {
            location_id: self.location_id.clone(),
            location_name: self.location_name.clone(),
            staff_name: self.staff_name.trim().to_string(),
            timestamp: Utc::now(),
            status: self.derived_status(),
            toilets: checked(ChecklistArea::Toilets),
            sinks: checked(ChecklistArea::Sinks),
            floors: checked(ChecklistArea::Floors),
            supplies: checked(ChecklistArea::Supplies),
            waste_bins: checked(ChecklistArea::WasteBins),
            notes: self.notes.trim().to_string(),
            resolved: false,
            resolved_at: None,
        }
    }

    /// Clear everything the staff member entered; the location stays selected.
    pub fn reset(&mut self) {
        self.staff_name.clear();
        self.items.clear();
        self.notes.clear();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("staff name is required")]
    MissingStaffName,
    #[error("notes are required when areas are left unchecked: {0:?}")]
    MissingExplanation(Vec<ChecklistArea>),
    #[error("illegal submission transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SubmissionPhase,
        to: SubmissionPhase,
    },
}

/// Phases of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    Validating,
    PinCheck,
    OnlineAttempt,
    DirectQueue,
    RecoverableFailure,
    Success,
    Queued,
    TerminalFailure,
    PinRejected,
}

impl SubmissionPhase {
    fn can_enter(self, next: SubmissionPhase) -> bool {
        use SubmissionPhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, PinCheck)
                | (PinCheck, OnlineAttempt)
                | (PinCheck, DirectQueue)
                | (PinCheck, PinRejected)
                | (OnlineAttempt, Success)
                | (OnlineAttempt, RecoverableFailure)
                | (OnlineAttempt, TerminalFailure)
                | (RecoverableFailure, Queued)
                | (DirectQueue, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        use SubmissionPhase::*;
        matches!(self, Success | Queued | TerminalFailure | PinRejected)
    }
}

/// Why a submission ended up in the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueReason {
    Offline,
    TransientFailure,
}

/// What the staff member sees after submitting.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    Submitted {
        stored: StoredRecord,
        cascade: Option<CascadeOutcome>,
    },
    SavedOffline {
        offline_id: String,
        reason: QueueReason,
    },
    /// The access code changed; the checklist is closed and code entry reopens.
    PinRotated,
    /// The server refused the write; the form is kept so the user can retry.
    Rejected { message: String },
}

impl SubmissionOutcome {
    pub fn notice(&self) -> &'static str {
        match self {
            SubmissionOutcome::Submitted { .. } => "Cleaning log submitted.",
            SubmissionOutcome::SavedOffline { .. } => {
                "Saved offline. It will sync automatically when you're back online."
            }
            SubmissionOutcome::PinRotated => {
                "The access code for this location has changed. Please enter the new code."
            }
            SubmissionOutcome::Rejected { .. } => "Submission failed. Tap retry to try again.",
        }
    }
}

/// Outcome plus the phases the attempt went through.
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    pub outcome: SubmissionOutcome,
    pub trail: Vec<SubmissionPhase>,
}

/// Options that vary per checklist interaction.
#[derive(Debug, Clone, Default)]
pub struct SubmitContext {
    pub pin: Option<PinSession>,
    /// Inspectors and admins open checklists without a staff access code.
    pub bypass_pin: bool,
}

struct Flow {
    phase: SubmissionPhase,
    trail: Vec<SubmissionPhase>,
}

impl Flow {
    fn new() -> Self {
        Self {
            phase: SubmissionPhase::Idle,
            trail: vec![SubmissionPhase::Idle],
        }
    }

    fn enter(&mut self, next: SubmissionPhase) -> Result<(), SubmissionError> {
        if !self.phase.can_enter(next) {
            return Err(SubmissionError::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = ?self.phase, to = ?next, "submission transition");
        self.phase = next;
        self.trail.push(next);
        Ok(())
    }

    fn finish(self, outcome: SubmissionOutcome) -> SubmissionReport {
        SubmissionReport {
            outcome,
            trail: self.trail,
        }
    }
}

#[derive(Clone)]
pub struct SubmissionController {
    store: PendingWriteStore,
    remote: Arc<dyn RemoteStore>,
    network: NetworkMonitor,
    pin_guard: PinFreshnessGuard,
    cascade: ResolutionCascade,
    call_timeout: Duration,
}

impl SubmissionController {
    pub fn new(
        store: PendingWriteStore,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
        pin_guard: PinFreshnessGuard,
        cascade: ResolutionCascade,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            network,
            pin_guard,
            cascade,
            call_timeout,
        }
    }

    /// Submit the form. Validation failures come back as [`SubmissionError`]
    /// inside the `anyhow` error; local storage failures propagate as-is.
    #[instrument(skip_all, fields(location_id = %form.location_id))]
    pub async fn submit(
        &self,
        form: &mut ChecklistForm,
        ctx: SubmitContext,
    ) -> anyhow::Result<SubmissionReport> {
        let mut flow = Flow::new();

        flow.enter(SubmissionPhase::Validating)?;
        validate(form)?;
        let record = form.to_record();

        flow.enter(SubmissionPhase::PinCheck)?;
        let online = self.network.is_connected();
        let session = if online && !ctx.bypass_pin { ctx.pin } else { None };
        if let Some(session) = session {
            if self
                .pin_guard
                .check_invalid(&form.location_id, session.verified_at)
                .await
            {
                flow.enter(SubmissionPhase::PinRejected)?;
                warn!("access code rotated since checklist opened");
                form.reset();
                return Ok(flow.finish(SubmissionOutcome::PinRotated));
            }
        }

        if !online {
            flow.enter(SubmissionPhase::DirectQueue)?;
            let offline_id = self.store.enqueue(&record).await?;
            flow.enter(SubmissionPhase::Queued)?;
            form.reset();
            info!(%offline_id, "saved offline");
            return Ok(flow.finish(SubmissionOutcome::SavedOffline {
                offline_id,
                reason: QueueReason::Offline,
            }));
        }

        flow.enter(SubmissionPhase::OnlineAttempt)?;
        let idempotency_key = Uuid::new_v4().to_string();
        let call = self.remote.insert_log(&record, Some(&idempotency_key));
        match with_timeout(self.call_timeout, call).await {
            Ok(stored) => {
                flow.enter(SubmissionPhase::Success)?;
                info!(remote_id = %stored.id, status = record.status.as_str(), "cleaning log submitted");
                let cascade = if record.status.is_complete() {
                    Some(self.cascade.run(&record.location_id, record.timestamp).await)
                } else {
                    None
                };
                form.reset();
                Ok(flow.finish(SubmissionOutcome::Submitted { stored, cascade }))
            }
            Err(err) if err.is_network_like() => {
                flow.enter(SubmissionPhase::RecoverableFailure)?;
                warn!(%err, "online submit failed; falling back to queue");
                self.store.enqueue_with_id(&idempotency_key, &record).await?;
                flow.enter(SubmissionPhase::Queued)?;
                form.reset();
                Ok(flow.finish(SubmissionOutcome::SavedOffline {
                    offline_id: idempotency_key,
                    reason: QueueReason::TransientFailure,
                }))
            }
            Err(err) => {
                flow.enter(SubmissionPhase::TerminalFailure)?;
                warn!(%err, "remote store rejected cleaning log");
                Ok(flow.finish(SubmissionOutcome::Rejected {
                    message: err.to_string(),
                }))
            }
        }
    }
}

fn validate(form: &ChecklistForm) -> Result<(), SubmissionError> {
    if form.staff_name.trim().is_empty() {
        return Err(SubmissionError::MissingStaffName);
    }
    if !form.can_submit() {
        return Err(SubmissionError::MissingExplanation(form.unchecked_areas()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_form() -> ChecklistForm {
        let mut form = ChecklistForm::new("loc-1", "Ground Floor Restroom");
        form.staff_name = "Jordan".into();
        for area in ChecklistArea::ALL {
            form.mark(area, ItemMark::Checked);
        }
        form
    }

    #[test]
    fn not_applicable_counts_as_done() {
        let mut form = full_form();
        form.mark(ChecklistArea::Supplies, ItemMark::NotApplicable);
        assert_eq!(form.derived_status(), LogStatus::Complete);
        assert!(form.can_submit());
        let record = form.to_record();
        assert!(!record.supplies);
        assert!(record.toilets);
    }

    #[test]
    fn unchecked_item_requires_notes() {
        let mut form = full_form();
        form.mark(ChecklistArea::Floors, ItemMark::Unchecked);
        assert_eq!(form.derived_status(), LogStatus::AttentionRequired);
        assert!(!form.can_submit());
        assert_eq!(
            validate(&form),
            Err(SubmissionError::MissingExplanation(vec![ChecklistArea::Floors]))
        );

        form.notes = "   ".into();
        assert!(!form.can_submit());
        form.notes = "Floor cleaner ran out".into();
        assert!(form.can_submit());
    }

    #[test]
    fn staff_name_is_mandatory() {
        let mut form = full_form();
        form.staff_name = "  ".into();
        assert!(!form.can_submit());
        assert_eq!(validate(&form), Err(SubmissionError::MissingStaffName));
    }

    #[test]
    fn empty_checklist_with_notes_is_submittable() {
        let mut form = ChecklistForm::new("loc-1", "Lobby");
        form.staff_name = "Jordan".into();
        form.notes = "Area closed for repairs".into();
        assert!(form.can_submit());
        assert_eq!(form.unchecked_areas().len(), 5);
    }

    #[test]
    fn reset_keeps_location() {
        let mut form = full_form();
        form.notes = "all good".into();
        form.reset();
        assert_eq!(form.location_id, "loc-1");
        assert!(form.staff_name.is_empty());
        assert!(form.items.is_empty());
        assert!(form.notes.is_empty());
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use SubmissionPhase::*;
        assert!(Idle.can_enter(Validating));
        assert!(PinCheck.can_enter(DirectQueue));
        assert!(!Idle.can_enter(OnlineAttempt));
        assert!(!DirectQueue.can_enter(Success));
        assert!(!TerminalFailure.can_enter(Queued));
        let mut flow = Flow::new();
        assert!(flow.enter(Success).is_err());
        assert!(Queued.is_terminal());
        assert!(!OnlineAttempt.is_terminal());
    }

    #[test]
    fn form_deserializes_from_yaml() {
        let yaml = r#"
location_id: "loc-7"
location_name: "Kitchen"
staff_name: "Robin"
items:
  toilets: not_applicable
  sinks: checked
  floors: checked
  supplies: checked
  waste_bins: checked
"#;
        let form: ChecklistForm = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(form.mark_of(ChecklistArea::Toilets), ItemMark::NotApplicable);
        assert_eq!(form.derived_status(), LogStatus::Complete);
    }
}
