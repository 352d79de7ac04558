use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::authz::{Action, Actor, ResourceKind, Target};
use crate::limits::*;
use crate::model::*;

use super::{still_mapped, Engine, EngineError};

impl Engine {
    pub async fn register_account(
        &self,
        actor: &Actor,
        id: Ulid,
        name: Option<String>,
        roles: RoleSet,
    ) -> Result<Account, EngineError> {
        // Staff may enroll patients; anything else is a role assignment.
        let patient_only = roles.iter().all(|r| *r == Role::Patient);
        let action = if patient_only { Action::Create } else { Action::ManageRoles };
        actor.require(action, ResourceKind::Account, None)?;

        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("account name too long"));
        }
        if self.accounts.len() >= MAX_ACCOUNTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }

        let _commit = self.commit_gate.read().await;
        let account = Account { id, name, roles };
        let event = Event::AccountRegistered {
            id,
            name: account.name.clone(),
            roles: account.roles.iter().copied().collect(),
        };

        // The slot reserves the id before the WAL write; its write guard keeps
        // readers out until the event is durable.
        let slot = Arc::new(RwLock::new(account.clone()));
        let pending = slot.clone().write_owned().await;
        match self.accounts.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(slot);
            }
        }
        if let Err(e) = self.wal_append(&event).await {
            self.accounts.remove(&id);
            return Err(e);
        }
        drop(pending);

        tracing::info!(account = %id, roles = %account.roles_label(), "account registered");
        Ok(account)
    }

    /// Add a role to an account's set. Idempotent: granting a held role is a no-op.
    pub async fn grant_role(&self, actor: &Actor, account_id: Ulid, role: Role) -> Result<Account, EngineError> {
        self.change_role(actor, account_id, role, true).await
    }

    /// Remove a role from an account's set. Idempotent: revoking an absent role is a no-op.
    pub async fn revoke_role(&self, actor: &Actor, account_id: Ulid, role: Role) -> Result<Account, EngineError> {
        self.change_role(actor, account_id, role, false).await
    }

    async fn change_role(
        &self,
        actor: &Actor,
        account_id: Ulid,
        role: Role,
        grant: bool,
    ) -> Result<Account, EngineError> {
        actor.require(Action::ManageRoles, ResourceKind::Account, Some(&Target::account(account_id)))?;

        let _commit = self.commit_gate.read().await;
        let mut guard = self.lock_account(account_id).await?;

        if guard.roles.contains(&role) == grant {
            return Ok(guard.clone());
        }

        let event = if grant {
            Event::RoleGranted { account_id, role }
        } else {
            Event::RoleRevoked { account_id, role }
        };
        self.wal_append(&event).await?;
        if grant {
            guard.roles.insert(role);
        } else {
            guard.roles.remove(&role);
        }
        tracing::info!(account = %account_id, %role, grant, "account roles changed");
        Ok(guard.clone())
    }

    pub async fn account(&self, actor: &Actor, account_id: Ulid) -> Result<Account, EngineError> {
        let acc = self
            .get_account(&account_id)
            .ok_or(EngineError::NotFound(account_id))?;
        actor.require(Action::Read, ResourceKind::Account, Some(&Target::account(account_id)))?;
        let guard = acc.read().await;
        if !still_mapped(&self.accounts, &account_id, &acc) {
            return Err(EngineError::NotFound(account_id));
        }
        Ok(guard.clone())
    }

    /// Build the acting identity for a login, with roles as of now.
    pub async fn resolve_actor(&self, account_id: Ulid) -> Result<Actor, EngineError> {
        // Unknown logins are reported as a plain denial.
        let acc = self.get_account(&account_id).ok_or(EngineError::Forbidden)?;
        let guard = acc.read().await;
        if !still_mapped(&self.accounts, &account_id, &acc) {
            return Err(EngineError::Forbidden);
        }
        Ok(Actor::new(guard.id, guard.roles.clone()))
    }

    pub(super) async fn account_roles(&self, account_id: &Ulid) -> Option<RoleSet> {
        let acc = self.get_account(account_id)?;
        let guard = acc.read().await;
        still_mapped(&self.accounts, account_id, &acc).then(|| guard.roles.clone())
    }
}
