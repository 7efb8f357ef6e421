use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};

/// Recursively merge `update` into `target`.
///
/// Objects merge key by key; any other value overwrites.
pub fn deep_merge(target: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, incoming) in update {
        if let (Some(Value::Object(existing)), Value::Object(nested)) = (target.get_mut(key), incoming)
        {
            deep_merge(existing, nested);
            continue;
        }
        target.insert(key.clone(), incoming.clone());
    }
}

/// The part of `after` that differs from `before`, nested objects diffed
/// recursively. Removed keys are not represented.
pub fn state_delta(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut delta = Map::new();
    for (key, value) in after {
        match (before.get(key), value) {
            (Some(old), new) if old == new => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                let nested = state_delta(old, new);
                if !nested.is_empty() {
                    delta.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                delta.insert(key.clone(), value.clone());
            }
        }
    }
    delta
}

/// Canonical session state for one run.
///
/// Units never write here directly: they get a [`StateHandle`] and the
/// engine merges the handle's changes back when the unit finishes.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl SessionState {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.into(), value);
    }

    pub fn merge(&self, update: &Map<String, Value>) {
        if update.is_empty() {
            return;
        }
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        deep_merge(&mut guard, update);
    }

    /// Private copy for one unit.
    pub fn handle(&self) -> StateHandle {
        StateHandle::new(self.snapshot())
    }

    /// Merge whatever the unit changed on its handle.
    pub fn apply(&self, handle: &StateHandle) {
        self.merge(&handle.changes());
    }

    /// Independent copy sharing nothing with `self`.
    pub fn fork(&self) -> SessionState {
        SessionState::new(self.snapshot())
    }
}

/// A unit's private, mutable view of session state.
///
/// Clones share the same underlying copy, so a handle moved into a
/// step function still reports its writes to the engine.
#[derive(Debug, Clone)]
pub struct StateHandle {
    baseline: Arc<Map<String, Value>>,
    values: Arc<Mutex<Map<String, Value>>>,
}

impl StateHandle {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            baseline: Arc::new(values.clone()),
            values: Arc::new(Mutex::new(values)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    /// Deep-merge a batch of updates, e.g. state returned by an executor.
    pub fn merge(&self, update: &Map<String, Value>) {
        deep_merge(&mut self.lock(), update);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    /// Keys added or changed since the handle was created.
    pub fn changes(&self) -> Map<String, Value> {
        state_delta(&self.baseline, &self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new(Map::new())
    }
}
