//! Short human-readable session codes and their in-memory lookup cache

use log::warn;
use rand::Rng;
use shared::CODE_LENGTH;
use std::collections::HashMap;

use crate::store::SessionId;

/// Draws a random code of `CODE_LENGTH` lowercase letters.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH).map(|_| rng.gen_range('a'..='z')).collect()
}

/// Bidirectional `code <-> session id` cache.
///
/// Only the persistence gateway mutates it, right after the matching
/// session insert or delete has been confirmed by the store.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    ids_by_code: HashMap<String, SessionId>,
    codes_by_id: HashMap<SessionId, String>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, code: &str, id: SessionId) {
        if let Some(previous) = self.ids_by_code.insert(code.to_string(), id) {
            if previous != id {
                warn!("Code {} reassigned from game {} to {}", code, previous, id);
                self.codes_by_id.remove(&previous);
            }
        }
        if let Some(previous) = self.codes_by_id.insert(id, code.to_string()) {
            if previous != code {
                self.ids_by_code.remove(&previous);
            }
        }
    }

    /// Removes the entry only if `code` still maps to `id`.
    pub fn unregister(&mut self, code: &str, id: SessionId) -> bool {
        if self.ids_by_code.get(code) != Some(&id) {
            return false;
        }
        self.ids_by_code.remove(code);
        self.codes_by_id.remove(&id);
        true
    }

    pub fn resolve(&self, code: &str) -> Option<SessionId> {
        self.ids_by_code.get(code).copied()
    }

    pub fn code_of(&self, id: SessionId) -> Option<&str> {
        self.codes_by_id.get(&id).map(String::as_str)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.ids_by_code.contains_key(code)
    }

    /// Generates codes until one is not registered yet.
    pub fn generate_unique<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        loop {
            let code = generate_code(rng);
            if !self.contains(&code) {
                return code;
            }
            warn!("Duplicate code {} generated, drawing again", code);
        }
    }

    pub fn len(&self) -> usize {
        self.ids_by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids_by_code.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids_by_code.clear();
        self.codes_by_id.clear();
    }
}
