mod accounts;
mod availability;
mod compaction;
mod conflict;
mod error;
mod queries;
mod reservation;
#[cfg(test)]
mod tests;

pub use conflict::now_ms;
pub use error::{EngineError, ErrorKind};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<ProfessionalSchedule>>;
pub type SharedAttendance = Arc<RwLock<PendingAttendance>>;
pub type SharedAccount = Arc<RwLock<Account>>;

/// True while `slot` is the entry registered under `id`.
fn still_mapped<T>(map: &DashMap<Ulid, Arc<RwLock<T>>>, id: &Ulid, slot: &Arc<RwLock<T>>) -> bool {
    map.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), slot))
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends into the batch.
/// 3. Single flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partially buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// One clinic's scheduling state.
///
/// Lock order is always: commit gate (read), attendance, schedule.
/// Mutations hold the commit gate for reading from before their first entity
/// lock until the event is applied; compaction takes it for writing to get a
/// consistent snapshot.
pub struct Engine {
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    pub(super) attendances: DashMap<Ulid, SharedAttendance>,
    pub(super) accounts: DashMap<Ulid, SharedAccount>,
    /// Reverse lookup: window id → professional id.
    pub(super) window_owner: DashMap<Ulid, Ulid>,
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

// ── Event application (caller holds the locks) ────────────

pub(super) fn apply_windows_created(
    schedule: &mut ProfessionalSchedule,
    windows: &[(Ulid, Span)],
    window_owner: &DashMap<Ulid, Ulid>,
) {
    for (id, span) in windows {
        let window = AvailabilityWindow {
            id: *id,
            professional_id: schedule.id,
            span: *span,
            is_booked: false,
        };
        // Uniqueness was verified before the event was written.
        if schedule.insert_window(window).is_ok() {
            window_owner.insert(*id, schedule.id);
        }
    }
}

pub(super) fn apply_window_deleted(
    schedule: &mut ProfessionalSchedule,
    id: Ulid,
    window_owner: &DashMap<Ulid, Ulid>,
) {
    schedule.remove_window(id);
    window_owner.remove(&id);
}

pub(super) fn apply_reserved(
    attendance: &mut PendingAttendance,
    schedule: &mut ProfessionalSchedule,
    window_id: Ulid,
    date_at: Ms,
) {
    if let Some(window) = schedule.window_mut(window_id) {
        window.is_booked = true;
    }
    attendance.availability_id = Some(window_id);
    attendance.professional_id = Some(schedule.id);
    attendance.date_at = Some(date_at);
}

pub(super) fn apply_details(attendance: &mut PendingAttendance, event: &Event) {
    if let Event::AttendanceUpdated {
        date_at,
        duration_minutes,
        note,
        feedback,
        ..
    } = event
    {
        attendance.date_at = *date_at;
        attendance.duration_minutes = *duration_minutes;
        attendance.note = note.clone();
        attendance.feedback = feedback.clone();
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            attendances: DashMap::new(),
            accounts: DashMap::new(),
            window_owner: DashMap::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
        };

        // We're the sole owner of every Arc during replay, so try_write always
        // succeeds. Never use blocking_write here: this may run inside an async
        // context (lazy tenant creation).
        for event in &events {
            engine.replay_event(event);
        }
        tracing::debug!(events = events.len(), "replayed WAL");

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::AccountRegistered { id, name, roles } => {
                let account = Account {
                    id: *id,
                    name: name.clone(),
                    roles: roles.iter().copied().collect(),
                };
                self.accounts.insert(*id, Arc::new(RwLock::new(account)));
            }
            Event::RoleGranted { account_id, role } => {
                if let Some(acc) = self.get_account(account_id)
                    && let Ok(mut guard) = acc.try_write()
                {
                    guard.roles.insert(*role);
                }
            }
            Event::RoleRevoked { account_id, role } => {
                if let Some(acc) = self.get_account(account_id)
                    && let Ok(mut guard) = acc.try_write()
                {
                    guard.roles.remove(role);
                }
            }
            Event::AvailabilityCreated { professional_id, windows } => {
                let schedule = self.schedule_or_create(*professional_id);
                if let Ok(mut guard) = schedule.try_write() {
                    apply_windows_created(&mut guard, windows, &self.window_owner);
                }
            }
            Event::AvailabilityDeleted { id, professional_id } => {
                if let Some(schedule) = self.get_schedule(professional_id)
                    && let Ok(mut guard) = schedule.try_write()
                {
                    apply_window_deleted(&mut guard, *id, &self.window_owner);
                }
            }
            Event::AttendanceOpened { id, patient_id, professional_id, note } => {
                let attendance = PendingAttendance::new(*id, *patient_id, *professional_id, note.clone());
                self.attendances.insert(*id, Arc::new(RwLock::new(attendance)));
            }
            Event::AttendanceReserved { id, window_id, professional_id, date_at } => {
                if let (Some(att), Some(schedule)) =
                    (self.get_attendance(id), self.get_schedule(professional_id))
                    && let (Ok(mut att), Ok(mut schedule)) = (att.try_write(), schedule.try_write())
                {
                    apply_reserved(&mut att, &mut schedule, *window_id, *date_at);
                }
            }
            Event::AttendanceUpdated { id, .. } => {
                if let Some(att) = self.get_attendance(id)
                    && let Ok(mut guard) = att.try_write()
                {
                    apply_details(&mut guard, event);
                }
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_schedule(&self, professional_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(professional_id).map(|e| e.value().clone())
    }

    pub(super) fn schedule_or_create(&self, professional_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(professional_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProfessionalSchedule::new(professional_id))))
            .value()
            .clone()
    }

    pub fn get_attendance(&self, id: &Ulid) -> Option<SharedAttendance> {
        self.attendances.get(id).map(|e| e.value().clone())
    }

    pub fn get_account(&self, id: &Ulid) -> Option<SharedAccount> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a committed attendance. A slot whose intake failed to reach
    /// the WAL is unmapped before its guard drops, so waiters see NotFound.
    pub(super) async fn lock_attendance(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PendingAttendance>, EngineError> {
        let slot = self.get_attendance(&id).ok_or(EngineError::NotFound(id))?;
        let guard = slot.clone().write_owned().await;
        if !still_mapped(&self.attendances, &id, &slot) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    pub(super) async fn lock_account(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<Account>, EngineError> {
        let slot = self.get_account(&id).ok_or(EngineError::NotFound(id))?;
        let guard = slot.clone().write_owned().await;
        if !still_mapped(&self.accounts, &id, &slot) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    pub fn window_professional(&self, window_id: &Ulid) -> Option<Ulid> {
        self.window_owner.get(window_id).map(|e| *e.value())
    }
}
