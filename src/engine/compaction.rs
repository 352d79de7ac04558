use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: accounts, then schedules, then attendances.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive gate: no mutation is between its WAL write and its apply.
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let accounts: Vec<_> = self.accounts.iter().map(|e| e.value().clone()).collect();
        for acc in accounts {
            let guard = acc.read().await;
            events.push(Event::AccountRegistered {
                id: guard.id,
                name: guard.name.clone(),
                roles: guard.roles.iter().copied().collect(),
            });
        }

        let schedules: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        for schedule in schedules {
            let guard = schedule.read().await;
            if guard.windows.is_empty() {
                continue;
            }
            events.push(Event::AvailabilityCreated {
                professional_id: guard.id,
                windows: guard.windows.iter().map(|w| (w.id, w.span)).collect(),
            });
        }

        // Booked flags are restored by the reservations below.
        let attendances: Vec<_> = self.attendances.iter().map(|e| e.value().clone()).collect();
        for att in attendances {
            let guard = att.read().await;
            events.push(Event::AttendanceOpened {
                id: guard.id,
                patient_id: guard.patient_id,
                professional_id: guard.professional_id,
                note: guard.note.clone(),
            });
            if let (Some(window_id), Some(professional_id), Some(date_at)) =
                (guard.availability_id, guard.professional_id, guard.date_at)
            {
                events.push(Event::AttendanceReserved {
                    id: guard.id,
                    window_id,
                    professional_id,
                    date_at,
                });
            }
            if guard.duration_minutes.is_some() || guard.feedback.is_some() {
                events.push(Event::AttendanceUpdated {
                    id: guard.id,
                    date_at: guard.date_at,
                    duration_minutes: guard.duration_minutes,
                    note: guard.note.clone(),
                    feedback: guard.feedback.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
