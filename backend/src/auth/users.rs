use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::models::AuthUser;
use crate::config::UserEntry;

/// Static user table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<String, UserEntry>,
}

impl UserDirectory {
    pub fn new(entries: &[UserEntry]) -> Self {
        let users = entries
            .iter()
            .map(|entry| (entry.username.clone(), entry.clone()))
            .collect();
        Self { users }
    }

    pub fn verify(&self, username: &str, password: &str) -> Option<AuthUser> {
        let entry = self.users.get(username)?;
        let digest = hex::encode(Sha256::digest(password.as_bytes()));
        if digest.eq_ignore_ascii_case(&entry.password_sha256) {
            Some(AuthUser {
                id: entry.username.clone(),
                role: entry.role,
            })
        } else {
            None
        }
    }
}
