//! Session keys and a registry of live harness instances.
//!
//! Front ends that multiplex several concurrent users key their sessions
//! with [`generate_session_key`] and park the corresponding [`Harness`]
//! instances in a [`SessionRegistry`]. Sessions never share state: each
//! harness owns its namespace and stores exclusively.

use std::collections::HashMap;

use chrono::Local;
use uuid::Uuid;

use crate::promptloom::harness::Harness;

/// Generate a unique session key combining a timestamp with a random
/// component, e.g. `"20240315T123456Z-a1b2c3d4"`.
pub fn generate_session_key() -> String {
    let timestamp = Local::now().format("%Y%m%dT%H%M%SZ");
    let random_component = Uuid::new_v4().to_string();
    format!("{}-{}", timestamp, &random_component[..8])
}

/// Map of session key → live [`Harness`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Harness>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: HashMap::new(),
        }
    }

    /// Register a harness under a fresh session key and return the key.
    pub fn create(&mut self, harness: Harness) -> String {
        let key = generate_session_key();
        self.sessions.insert(key.clone(), harness);
        key
    }

    pub fn get(&self, key: &str) -> Option<&Harness> {
        self.sessions.get(key)
    }

    /// Reset a session back to its bootstrap state. Returns `false` when
    /// the key is unknown.
    pub fn reset(&self, key: &str) -> bool {
        match self.sessions.get(key) {
            Some(harness) => {
                harness.reset();
                true
            }
            None => false,
        }
    }

    /// Remove a session entirely, returning its harness.
    pub fn remove(&mut self, key: &str) -> Option<Harness> {
        self.sessions.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
