//! Per-(agent, tool) state arena shared by the rate limiter and the breaker.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Identity of the stream of calls one agent makes to one tool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallKey {
    pub agent_id: String,
    pub tool_name: String,
}

impl CallKey {
    pub fn new(agent_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tool_name: tool_name.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_id, self.tool_name)
    }
}

/// Lazily populated map of `CallKey -> S` with one lock per key.
///
/// The outer lock only guards slot lookup and insertion. All reads and
/// writes of a slot's state happen under that slot's own lock, so calls for
/// different keys never contend and a read-modify-write on one key is
/// atomic. Neither lock is held across an `.await`.
#[derive(Debug)]
pub struct KeyedStore<S> {
    slots: Mutex<HashMap<CallKey, Arc<Mutex<S>>>>,
}

impl<S> Default for KeyedStore<S> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> KeyedStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the state for `key`, creating it with `init` if absent.
    pub fn with<R>(
        &self,
        key: &CallKey,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let slot = Arc::clone(
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        );
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Read the state for `key` without creating it.
    pub fn peek<R>(&self, key: &CallKey, f: impl FnOnce(&S) -> R) -> Option<R> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&state))
    }

    /// Drop the state for `key`. The next call recreates it at its zero value.
    pub fn evict(&self, key: &CallKey) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Keep only the keys for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&CallKey, &S) -> bool) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|key, slot| {
            let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            keep(key, &state)
        });
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_creates_lazily_and_persists() {
        let store: KeyedStore<u32> = KeyedStore::new();
        let key = CallKey::new("agent-1", "bash");
        assert!(store.peek(&key, |v| *v).is_none());

        store.with(&key, || 10, |v| *v -= 1);
        store.with(&key, || 10, |v| *v -= 1);
        assert_eq!(store.peek(&key, |v| *v), Some(8));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let store: KeyedStore<u32> = KeyedStore::new();
        store.with(&CallKey::new("a", "bash"), || 0, |v| *v += 5);
        store.with(&CallKey::new("b", "bash"), || 0, |v| *v += 1);
        assert_eq!(store.peek(&CallKey::new("a", "bash"), |v| *v), Some(5));
        assert_eq!(store.peek(&CallKey::new("b", "bash"), |v| *v), Some(1));
    }

    #[test]
    fn test_evict_resets_to_zero_value() {
        let store: KeyedStore<u32> = KeyedStore::new();
        let key = CallKey::new("a", "read_file");
        store.with(&key, || 3, |v| *v = 0);
        assert!(store.evict(&key));
        assert!(!store.evict(&key));
        assert_eq!(store.with(&key, || 3, |v| *v), 3);
    }

    #[test]
    fn test_retain_drops_cold_keys() {
        let store: KeyedStore<u32> = KeyedStore::new();
        for (i, tool) in ["a", "b", "c"].iter().enumerate() {
            store.with(&CallKey::new("agent", *tool), || i as u32, |_| ());
        }
        store.retain(|_, v| *v != 1);
        assert_eq!(store.len(), 2);
        assert!(store.peek(&CallKey::new("agent", "b"), |_| ()).is_none());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store: Arc<KeyedStore<u64>> = Arc::new(KeyedStore::new());
        let key = CallKey::new("agent", "tool");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.with(&key, || 0, |v| *v += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.peek(&key, |v| *v), Some(8000));
    }

    #[test]
    fn test_call_key_display() {
        assert_eq!(CallKey::new("agent-7", "http_get").to_string(), "agent-7/http_get");
    }
}
