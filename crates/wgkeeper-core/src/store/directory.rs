// ── Configuration-backed user directory ──

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::UserConfig;
use crate::error::CoreError;
use crate::repository::UserDirectory;

/// Users listed in static configuration.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: BTreeMap<String, Option<SecretString>>,
}

impl StaticDirectory {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn list_valid_usernames(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self.users.keys().cloned().collect())
    }

    async fn authenticate(&self, username: &str, password: &SecretString) -> Result<(), CoreError> {
        let rejected = || CoreError::AuthenticationFailed {
            message: format!("invalid credentials for {username}"),
        };
        match self.users.get(username) {
            Some(Some(expected)) if expected.expose_secret() == password.expose_secret() => Ok(()),
            _ => Err(rejected()),
        }
    }
}
