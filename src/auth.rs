use std::collections::HashMap;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext credentials: staff accounts with their own password, everyone
/// else checked against the shared password.
#[derive(Debug)]
pub struct StaffAuthSource {
    shared: String,
    users: HashMap<String, String>,
}

impl StaffAuthSource {
    pub fn new(shared: String, users: HashMap<String, String>) -> Self {
        Self { shared, users }
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        user.and_then(|u| self.users.get(u))
            .map_or(self.shared.as_str(), String::as_str)
    }
}

#[async_trait]
impl AuthSource for StaffAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.password_for(login.user());
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}
