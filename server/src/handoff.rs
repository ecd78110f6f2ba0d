//! Session handoff boundary.
//!
//! The login side registers the connection it is about to redirect here,
//! together with the encryption key and seed it negotiated. When the client
//! reconnects to the world it presents the same tuple, which is accepted
//! exactly once.

use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;

const KEY_LEN: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("no handoff is expected for connection {0}")]
    Unknown(u32),

    #[error("handoff claim for connection {0} does not match")]
    Mismatch(u32),
}

/// One expected connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub connection_id: u32,
    pub name: String,
    pub key: Vec<u8>,
    pub seed: u8,
}

impl Redirect {
    pub fn matches(&self, name: &str, key: &[u8], seed: u8) -> bool {
        self.name == name && self.key == key && self.seed == seed
    }
}

#[derive(Debug, Default)]
pub struct HandoffRegistry {
    next_id: u32,
    expected: HashMap<u32, Redirect>,
}

impl HandoffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an expected connection and returns its id.
    pub fn expect(&mut self, name: impl Into<String>, key: Vec<u8>, seed: u8) -> u32 {
        self.register(name.into(), key, seed).connection_id
    }

    /// Like [`expect`](Self::expect) with a freshly generated key and seed.
    pub fn issue(&mut self, name: impl Into<String>) -> Redirect {
        let mut rng = rand::thread_rng();
        let key: Vec<u8> = (0..KEY_LEN).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        let seed = rng.gen_range(0..10);

        self.register(name.into(), key, seed)
    }

    fn register(&mut self, name: String, key: Vec<u8>, seed: u8) -> Redirect {
        self.next_id = self.next_id.wrapping_add(1);
        let redirect = Redirect {
            connection_id: self.next_id,
            name,
            key,
            seed,
        };
        debug!(
            "Expecting {} on connection {}",
            redirect.name, redirect.connection_id
        );
        self.expected.insert(redirect.connection_id, redirect.clone());
        redirect
    }

    /// Checks a claim without consuming it.
    pub fn verify(
        &self,
        connection_id: u32,
        name: &str,
        key: &[u8],
        seed: u8,
    ) -> Result<&Redirect, HandoffError> {
        let redirect = self
            .expected
            .get(&connection_id)
            .ok_or(HandoffError::Unknown(connection_id))?;

        if !redirect.matches(name, key, seed) {
            warn!(
                "Handoff claim for connection {} as {} does not match",
                connection_id, name
            );
            return Err(HandoffError::Mismatch(connection_id));
        }
        Ok(redirect)
    }

    /// Accepts a claim at most once. A claim that does not match leaves the
    /// expectation in place for the genuine client.
    pub fn redeem(
        &mut self,
        connection_id: u32,
        name: &str,
        key: &[u8],
        seed: u8,
    ) -> Result<Redirect, HandoffError> {
        self.verify(connection_id, name, key, seed)?;

        info!("{} redeemed connection {}", name, connection_id);
        self.expected
            .remove(&connection_id)
            .ok_or(HandoffError::Unknown(connection_id))
    }

    pub fn pending(&self) -> usize {
        self.expected.len()
    }
}
