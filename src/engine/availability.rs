use std::collections::HashSet;

use ulid::Ulid;

use crate::authz::{Action, Actor, ResourceKind, Target};
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_overlap, validate_batch};
use super::{apply_window_deleted, apply_windows_created, Engine, EngineError};

impl Engine {
    /// Publish a batch of open windows for one professional. All-or-nothing:
    /// a malformed entry, an overlap, or a uniqueness clash inserts nothing.
    pub async fn create_availability_batch(
        &self,
        actor: &Actor,
        professional_id: Ulid,
        windows: Vec<NewWindow>,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        actor.require(
            Action::Create,
            ResourceKind::Availability,
            Some(&Target::professional(professional_id)),
        )?;
        let spans = validate_batch(&windows)?;
        if self.get_account(&professional_id).is_none() {
            return Err(EngineError::NotFound(professional_id));
        }

        let _commit = self.commit_gate.read().await;
        let schedule = self.schedule_or_create(professional_id);
        let mut guard = schedule.write().await;
        // Account locks are never held while waiting on a schedule.
        self.require_eligible(professional_id).await?;
        if guard.windows.len() + spans.len() > MAX_WINDOWS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many windows for professional"));
        }

        // Ids are unique across the tenant, including within the batch.
        let mut seen = HashSet::with_capacity(spans.len());
        for (id, _) in &spans {
            if !seen.insert(*id) || self.window_owner.contains_key(id) {
                return Err(EngineError::AlreadyExists(*id));
            }
        }

        check_no_overlap(&guard, &spans)?;
        // (professional_id, start) uniqueness is the last line of defence
        // behind the overlap pre-check.
        for (_, span) in &spans {
            if let Some(taken) = guard.window_starting_at(span.start) {
                return Err(EngineError::AlreadyExists(taken.id));
            }
        }

        let event = Event::AvailabilityCreated {
            professional_id,
            windows: spans.clone(),
        };
        self.wal_append(&event).await?;
        apply_windows_created(&mut guard, &spans, &self.window_owner);
        self.notify.send(professional_id, &event);
        metrics::counter!(crate::observability::WINDOWS_CREATED_TOTAL).increment(spans.len() as u64);

        Ok(spans
            .iter()
            .filter_map(|(id, _)| guard.window(*id).cloned())
            .collect())
    }

    /// Remove an unbooked window. Booked windows are immutable.
    pub async fn delete_availability(
        &self,
        actor: &Actor,
        window_id: Ulid,
    ) -> Result<AvailabilityWindow, EngineError> {
        let professional_id = self
            .window_professional(&window_id)
            .ok_or(EngineError::NotFound(window_id))?;
        actor.require(
            Action::Delete,
            ResourceKind::Availability,
            Some(&Target::professional(professional_id)),
        )?;

        let _commit = self.commit_gate.read().await;
        let schedule = self
            .get_schedule(&professional_id)
            .ok_or(EngineError::NotFound(window_id))?;
        let mut guard = schedule.write().await;
        // Re-read under the lock: a concurrent delete or reservation may have won.
        let window = guard
            .window(window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))?;
        // is_booked is set exactly when an attendance references the window.
        if window.is_booked {
            return Err(EngineError::AlreadyBooked(window_id));
        }

        let event = Event::AvailabilityDeleted {
            id: window_id,
            professional_id,
        };
        self.wal_append(&event).await?;
        apply_window_deleted(&mut guard, window_id, &self.window_owner);
        self.notify.send(professional_id, &event);
        Ok(window)
    }

    /// Unbooked windows that ended at or before `now`, for the reaper.
    pub async fn collect_expired_windows(&self, now: Ms) -> Vec<Ulid> {
        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut expired = Vec::new();
        for schedule in schedules {
            let guard = schedule.read().await;
            expired.extend(
                guard
                    .windows
                    .iter()
                    .filter(|w| !w.is_booked && w.span.end <= now)
                    .map(|w| w.id),
            );
        }
        expired
    }

    /// A professional may serve only while their account holds the role.
    pub(super) async fn require_eligible(&self, professional_id: Ulid) -> Result<(), EngineError> {
        match self.account_roles(&professional_id).await {
            None => Err(EngineError::NotFound(professional_id)),
            Some(roles) if roles.contains(&Role::Professional) => Ok(()),
            Some(_) => Err(EngineError::NotEligible(professional_id)),
        }
    }
}
