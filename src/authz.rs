//! Capability checks.
//!
//! `check` answers whether an actor may perform an action on a kind of
//! resource, optionally scoped to a concrete target. Every role decides over
//! the full `ResourceKind × Action` grid, so adding a variant forces a policy
//! decision everywhere.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Role, RoleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    /// Attach an availability window to an attendance.
    Reserve,
    /// Leave feedback on an attendance.
    Review,
    ManageRoles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Availability,
    Attendance,
    Account,
}

/// Ownership facts about the instance being acted on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Target {
    pub professional_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub account_id: Option<Ulid>,
}

impl Target {
    pub fn professional(id: Ulid) -> Self {
        Self {
            professional_id: Some(id),
            ..Default::default()
        }
    }

    pub fn account(id: Ulid) -> Self {
        Self {
            account_id: Some(id),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub roles: RoleSet,
}

impl Actor {
    pub fn new(id: Ulid, roles: RoleSet) -> Self {
        Self { id, roles }
    }

    /// The built-in administrator used by the configured admin login and the reaper.
    pub fn system() -> Self {
        Self {
            id: Ulid::nil(),
            roles: [Role::Admin].into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn require(
        &self,
        action: Action,
        kind: ResourceKind,
        target: Option<&Target>,
    ) -> Result<(), EngineError> {
        match check(self, action, kind, target) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                tracing::debug!(actor = %self.id, ?action, ?kind, "capability denied");
                Err(EngineError::Forbidden)
            }
        }
    }

    /// A professional's schedule feed carries attendance ids, so it is gated
    /// like reading that professional's attendances.
    pub fn require_schedule_feed(&self, professional_id: Ulid) -> Result<(), EngineError> {
        self.require(
            Action::Read,
            ResourceKind::Attendance,
            Some(&Target::professional(professional_id)),
        )
    }
}

pub fn check(actor: &Actor, action: Action, kind: ResourceKind, target: Option<&Target>) -> Decision {
    let allowed = actor
        .roles
        .iter()
        .any(|role| role_allows(*role, actor.id, action, kind, target));
    if allowed { Decision::Allow } else { Decision::Deny }
}

fn role_allows(
    role: Role,
    actor_id: Ulid,
    action: Action,
    kind: ResourceKind,
    target: Option<&Target>,
) -> bool {
    use Action::*;

    let owns_schedule = target.is_some_and(|t| t.professional_id == Some(actor_id));
    let is_patient = target.is_some_and(|t| t.patient_id == Some(actor_id));
    let is_self = target.is_some_and(|t| t.account_id == Some(actor_id));

    match role {
        Role::Admin => true,
        Role::Staff => match kind {
            ResourceKind::Availability => match action {
                Read => true,
                Create | Update | Delete | Reserve | Review | ManageRoles => false,
            },
            ResourceKind::Attendance => match action {
                Create | Read | Update | Reserve => true,
                Delete | Review | ManageRoles => false,
            },
            ResourceKind::Account => match action {
                Create | Read => true,
                Update | Delete | Reserve | Review | ManageRoles => false,
            },
        },
        Role::Professional => match kind {
            ResourceKind::Availability => match action {
                Read => true,
                Create | Delete => owns_schedule,
                Update | Reserve | Review | ManageRoles => false,
            },
            ResourceKind::Attendance => match action {
                Read | Update => owns_schedule,
                Create | Delete | Reserve | Review | ManageRoles => false,
            },
            ResourceKind::Account => match action {
                Read => is_self,
                Create | Update | Delete | Reserve | Review | ManageRoles => false,
            },
        },
        Role::Patient => match kind {
            ResourceKind::Availability => match action {
                Read => true,
                Create | Update | Delete | Reserve | Review | ManageRoles => false,
            },
            ResourceKind::Attendance => match action {
                Create | Read | Reserve | Review => is_patient,
                Update | Delete | ManageRoles => false,
            },
            ResourceKind::Account => match action {
                Read => is_self,
                Create | Update | Delete | Reserve | Review | ManageRoles => false,
            },
        },
    }
}
