use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Accounts and roles ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Patient,
    /// Serving professional: may publish availability and take attendances.
    Professional,
    Staff,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_lowercase().as_str() {
            "patient" => Some(Role::Patient),
            "professional" => Some(Role::Professional),
            "staff" => Some(Role::Staff),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Professional => "professional",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type RoleSet = BTreeSet<Role>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub name: Option<String>,
    pub roles: RoleSet,
}

impl Account {
    pub fn roles_label(&self) -> String {
        self.roles
            .iter()
            .map(Role::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub span: Span,
    pub is_booked: bool,
}

/// Raw window as submitted by a professional, not yet validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewWindow {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
}

impl NewWindow {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self {
            id: Ulid::new(),
            start,
            end,
        }
    }
}

/// All windows of one professional, sorted by `span.start`.
///
/// The schedule is the storage layer's uniqueness guard: two windows of the
/// same professional never share a start instant.
#[derive(Debug, Clone)]
pub struct ProfessionalSchedule {
    pub id: Ulid,
    pub windows: Vec<AvailabilityWindow>,
}

impl ProfessionalSchedule {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            windows: Vec::new(),
        }
    }

    /// Insert maintaining sort order. Returns the id of the window already
    /// occupying the same start instant, if any.
    pub fn insert_window(&mut self, window: AvailabilityWindow) -> Result<(), Ulid> {
        match self
            .windows
            .binary_search_by_key(&window.span.start, |w| w.span.start)
        {
            Ok(pos) => Err(self.windows[pos].id),
            Err(pos) => {
                self.windows.insert(pos, window);
                Ok(())
            }
        }
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn window(&self, id: Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn window_starting_at(&self, start: Ms) -> Option<&AvailabilityWindow> {
        self.windows
            .binary_search_by_key(&start, |w| w.span.start)
            .ok()
            .map(|pos| &self.windows[pos])
    }

    pub fn window_mut(&mut self, id: Ulid) -> Option<&mut AvailabilityWindow> {
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// Return only windows whose span overlaps the query.
    /// Uses binary search to skip windows starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &AvailabilityWindow> {
        let right_bound = self
            .windows
            .partition_point(|w| w.span.start < query.end);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.span.end > query.start)
    }
}

// ── Attendances ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAttendance {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub professional_id: Option<Ulid>,
    pub availability_id: Option<Ulid>,
    /// `None` until a window is attached; then always the window's start.
    pub date_at: Option<Ms>,
    pub duration_minutes: Option<u32>,
    pub note: Option<String>,
    pub feedback: Option<String>,
}

impl PendingAttendance {
    pub fn new(id: Ulid, patient_id: Ulid, professional_id: Option<Ulid>, note: Option<String>) -> Self {
        Self {
            id,
            patient_id,
            professional_id,
            availability_id: None,
            date_at: None,
            duration_minutes: None,
            note,
            feedback: None,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.availability_id.is_some()
    }
}

/// Field changes requested on an attendance. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendanceChanges {
    pub date_at: Option<Ms>,
    pub duration_minutes: Option<u32>,
    pub note: Option<String>,
    pub feedback: Option<String>,
}

impl AttendanceChanges {
    pub fn is_empty(&self) -> bool {
        self.date_at.is_none()
            && self.duration_minutes.is_none()
            && self.note.is_none()
            && self.feedback.is_none()
    }

    /// Whether any field outside `feedback` is set.
    pub fn touches_staff_fields(&self) -> bool {
        self.date_at.is_some() || self.duration_minutes.is_some() || self.note.is_some()
    }
}

// ── Query filters ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityFilter {
    pub professional_id: Option<Ulid>,
    pub booked: Option<bool>,
    /// Windows starting at or after this instant.
    pub from: Option<Ms>,
    /// Windows ending at or before this instant.
    pub until: Option<Ms>,
}

impl AvailabilityFilter {
    pub fn matches(&self, w: &AvailabilityWindow) -> bool {
        self.professional_id.is_none_or(|p| w.professional_id == p)
            && self.booked.is_none_or(|b| w.is_booked == b)
            && self.from.is_none_or(|t| w.span.start >= t)
            && self.until.is_none_or(|t| w.span.end <= t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendanceFilter {
    pub id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub professional_id: Option<Ulid>,
    pub scheduled: Option<bool>,
}

impl AttendanceFilter {
    pub fn matches(&self, a: &PendingAttendance) -> bool {
        self.id.is_none_or(|id| a.id == id)
            && self.patient_id.is_none_or(|p| a.patient_id == p)
            && self.professional_id.is_none_or(|p| a.professional_id == Some(p))
            && self.scheduled.is_none_or(|s| a.is_scheduled() == s)
    }
}

/// WAL record format. One event per mutation.
/// One mutating operation writes exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountRegistered {
        id: Ulid,
        name: Option<String>,
        roles: Vec<Role>,
    },
    RoleGranted {
        account_id: Ulid,
        role: Role,
    },
    RoleRevoked {
        account_id: Ulid,
        role: Role,
    },
    AvailabilityCreated {
        professional_id: Ulid,
        windows: Vec<(Ulid, Span)>,
    },
    AvailabilityDeleted {
        id: Ulid,
        professional_id: Ulid,
    },
    AttendanceOpened {
        id: Ulid,
        patient_id: Ulid,
        professional_id: Option<Ulid>,
        note: Option<String>,
    },
    AttendanceReserved {
        id: Ulid,
        window_id: Ulid,
        professional_id: Ulid,
        date_at: Ms,
    },
    AttendanceUpdated {
        id: Ulid,
        date_at: Option<Ms>,
        duration_minutes: Option<u32>,
        note: Option<String>,
        feedback: Option<String>,
    },
}

impl Event {
    /// The professional whose schedule this event touches, for LISTEN fan-out.
    pub fn professional_id(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilityCreated { professional_id, .. }
            | Event::AvailabilityDeleted { professional_id, .. }
            | Event::AttendanceReserved { professional_id, .. } => Some(*professional_id),
            // Intake notes stay off the schedule feed.
            Event::AttendanceOpened { .. }
            | Event::AccountRegistered { .. }
            | Event::RoleGranted { .. }
            | Event::RoleRevoked { .. }
            | Event::AttendanceUpdated { .. } => None,
        }
    }
}
