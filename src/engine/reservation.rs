use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::authz::{Action, Actor, ResourceKind, Target};
use crate::limits::*;
use crate::model::*;

use super::{apply_details, apply_reserved, Engine, EngineError};

fn attendance_target(att: &PendingAttendance) -> Target {
    Target {
        professional_id: att.professional_id,
        patient_id: Some(att.patient_id),
        account_id: None,
    }
}

fn check_text(field: &'static str, value: &Option<String>, max: usize) -> Result<(), EngineError> {
    if let Some(v) = value
        && v.len() > max
    {
        return Err(EngineError::invalid(field, format!("longer than {max} bytes")));
    }
    Ok(())
}

/// Decide, under both locks, whether `window_id` can be claimed for
/// `attendance`. Returns the instant the attendance will be scheduled at.
fn plan_reservation(
    attendance: &PendingAttendance,
    schedule: &ProfessionalSchedule,
    window_id: Ulid,
) -> Result<Ms, EngineError> {
    if attendance.is_scheduled() {
        return Err(EngineError::AlreadyScheduled(attendance.id));
    }
    let window = schedule
        .window(window_id)
        .ok_or(EngineError::NotFound(window_id))?;
    if window.is_booked {
        return Err(EngineError::AlreadyBooked(window_id));
    }
    Ok(window.span.start)
}

impl Engine {
    /// Record a finished intake as an unscheduled attendance.
    pub async fn open_attendance(
        &self,
        actor: &Actor,
        id: Ulid,
        patient_id: Ulid,
        professional_id: Option<Ulid>,
        note: Option<String>,
    ) -> Result<PendingAttendance, EngineError> {
        let attendance = PendingAttendance::new(id, patient_id, professional_id, note);
        actor.require(
            Action::Create,
            ResourceKind::Attendance,
            Some(&attendance_target(&attendance)),
        )?;
        check_text("note", &attendance.note, MAX_NOTE_LEN)?;
        if self.attendances.len() >= MAX_ATTENDANCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many attendances"));
        }
        if self.get_account(&patient_id).is_none() {
            return Err(EngineError::NotFound(patient_id));
        }
        if let Some(pid) = professional_id {
            self.require_eligible(pid).await?;
        }

        let _commit = self.commit_gate.read().await;
        let slot = Arc::new(RwLock::new(attendance.clone()));
        let pending = slot.clone().write_owned().await;
        match self.attendances.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(slot);
            }
        }

        let event = Event::AttendanceOpened {
            id,
            patient_id,
            professional_id,
            note: attendance.note.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.attendances.remove(&id);
            return Err(e);
        }
        drop(pending);
        Ok(attendance)
    }

    /// Attach an open window to an unscheduled attendance.
    ///
    /// The attendance and the window change together or not at all: both are
    /// locked, the window is re-checked, and a single event carries both writes.
    pub async fn reserve_availability(
        &self,
        actor: &Actor,
        attendance_id: Ulid,
        window_id: Ulid,
    ) -> Result<PendingAttendance, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut att = self.lock_attendance(attendance_id).await?;
        actor.require(Action::Reserve, ResourceKind::Attendance, Some(&attendance_target(&att)))?;

        if att.is_scheduled() {
            return Err(EngineError::AlreadyScheduled(attendance_id));
        }
        let professional_id = self
            .window_professional(&window_id)
            .ok_or(EngineError::NotFound(window_id))?;
        if let Some(assigned) = att.professional_id
            && assigned != professional_id
        {
            return Err(EngineError::invalid(
                "availability_id",
                "window belongs to another professional",
            ));
        }

        let schedule = self
            .get_schedule(&professional_id)
            .ok_or(EngineError::NotFound(window_id))?;
        let mut schedule = schedule.write().await;
        self.require_eligible(professional_id).await?;
        let date_at = match plan_reservation(&att, &schedule, window_id) {
            Ok(date_at) => date_at,
            Err(e) => {
                tracing::debug!(attendance = %attendance_id, window = %window_id, "reservation refused: {e}");
                return Err(e);
            }
        };

        let event = Event::AttendanceReserved {
            id: attendance_id,
            window_id,
            professional_id,
            date_at,
        };
        self.wal_append(&event).await?;
        apply_reserved(&mut att, &mut schedule, window_id, date_at);
        self.notify.send(professional_id, &event);
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL).increment(1);

        Ok(att.clone())
    }

    /// Edit attendance details. Patients may only leave feedback; date,
    /// duration and note need update rights.
    pub async fn update_attendance_details(
        &self,
        actor: &Actor,
        attendance_id: Ulid,
        changes: AttendanceChanges,
    ) -> Result<PendingAttendance, EngineError> {
        if changes.is_empty() {
            return Err(EngineError::invalid("changes", "nothing to update"));
        }
        check_text("note", &changes.note, MAX_NOTE_LEN)?;
        check_text("feedback", &changes.feedback, MAX_FEEDBACK_LEN)?;
        if let Some(minutes) = changes.duration_minutes
            && (minutes == 0 || minutes > MAX_DURATION_MINUTES)
        {
            return Err(EngineError::invalid(
                "duration_minutes",
                format!("must be between 1 and {MAX_DURATION_MINUTES}"),
            ));
        }

        let _commit = self.commit_gate.read().await;
        let mut att = self.lock_attendance(attendance_id).await?;
        let target = attendance_target(&att);
        if changes.touches_staff_fields() {
            actor.require(Action::Update, ResourceKind::Attendance, Some(&target))?;
        }
        if changes.feedback.is_some() {
            // Staff editing feedback on a patient's behalf counts as an update.
            actor
                .require(Action::Review, ResourceKind::Attendance, Some(&target))
                .or_else(|_| actor.require(Action::Update, ResourceKind::Attendance, Some(&target)))?;
        }

        // date_at mirrors the attached window's start and nothing else.
        if let Some(date_at) = changes.date_at
            && att.date_at != Some(date_at)
        {
            let reason = if att.is_scheduled() {
                "must equal the start of the reserved availability"
            } else {
                "attendance has no reserved availability"
            };
            return Err(EngineError::invalid("date_at", reason));
        }

        let event = Event::AttendanceUpdated {
            id: attendance_id,
            date_at: att.date_at,
            duration_minutes: changes.duration_minutes.or(att.duration_minutes),
            note: changes.note.or_else(|| att.note.clone()),
            feedback: changes.feedback.or_else(|| att.feedback.clone()),
        };
        self.wal_append(&event).await?;
        apply_details(&mut att, &event);
        Ok(att.clone())
    }
}
