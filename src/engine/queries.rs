use ulid::Ulid;

use crate::authz::{check, Action, Actor, Decision, ResourceKind, Target};
use crate::model::*;

use super::{still_mapped, Engine, EngineError, SharedSchedule};

impl Engine {
    /// Windows matching `filter`, ordered by start (then professional).
    pub async fn list_availability(
        &self,
        actor: &Actor,
        filter: &AvailabilityFilter,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let target = filter.professional_id.map(Target::professional);
        actor.require(Action::Read, ResourceKind::Availability, target.as_ref())?;

        let schedules: Vec<SharedSchedule> = match filter.professional_id {
            Some(pid) => self.get_schedule(&pid).into_iter().collect(),
            None => self.schedules.iter().map(|e| e.value().clone()).collect(),
        };

        let mut windows = Vec::new();
        for schedule in schedules {
            let guard = schedule.read().await;
            windows.extend(guard.windows.iter().filter(|w| filter.matches(w)).cloned());
        }
        windows.sort_by_key(|w| (w.span.start, w.professional_id));
        Ok(windows)
    }

    pub async fn attendance(
        &self,
        actor: &Actor,
        attendance_id: Ulid,
    ) -> Result<PendingAttendance, EngineError> {
        let att = self
            .get_attendance(&attendance_id)
            .ok_or(EngineError::NotFound(attendance_id))?;
        let guard = att.read().await;
        if !still_mapped(&self.attendances, &attendance_id, &att) {
            return Err(EngineError::NotFound(attendance_id));
        }
        let target = Target {
            professional_id: guard.professional_id,
            patient_id: Some(guard.patient_id),
            account_id: None,
        };
        actor.require(Action::Read, ResourceKind::Attendance, Some(&target))?;
        Ok(guard.clone())
    }

    /// Attendances matching `filter` that the actor may read, ordered by id
    /// (which is creation order for generated ids).
    pub async fn list_attendances(
        &self,
        actor: &Actor,
        filter: &AttendanceFilter,
    ) -> Vec<PendingAttendance> {
        let candidates: Vec<_> = match filter.id {
            Some(id) => self.get_attendance(&id).into_iter().collect(),
            None => self.attendances.iter().map(|e| e.value().clone()).collect(),
        };

        let mut visible = Vec::new();
        for att in candidates {
            let guard = att.read().await;
            if !filter.matches(&guard) || !still_mapped(&self.attendances, &guard.id, &att) {
                continue;
            }
            let target = Target {
                professional_id: guard.professional_id,
                patient_id: Some(guard.patient_id),
                account_id: None,
            };
            if check(actor, Action::Read, ResourceKind::Attendance, Some(&target)) == Decision::Allow {
                visible.push(guard.clone());
            }
        }
        visible.sort_by_key(|a| a.id);
        visible
    }
}
