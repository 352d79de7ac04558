use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::observability;

/// Shared-password login. The user name picks the actor: the configured
/// admin user, or the ULID of an account in the tenant being connected to.
#[derive(Debug)]
pub struct CareSlotAuthSource {
    password: String,
    admin_user: String,
}

impl CareSlotAuthSource {
    pub fn new(password: String, admin_user: String) -> Self {
        Self {
            password,
            admin_user,
        }
    }

    fn accepts_user(&self, user: &str) -> bool {
        user == self.admin_user || Ulid::from_string(user).is_ok()
    }
}

#[async_trait]
impl AuthSource for CareSlotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if !self.accepts_user(user) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user \"{user}\" is neither the admin nor an account id"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
