//! In-memory registry of running instances.
//!
//! One lock-guarded object constructed at startup and shared by reference;
//! there are no ambient singletons. At most one instance exists per
//! subdomain at any instant.

use std::collections::HashMap;

use parking_lot::RwLock;

/// A currently executing deployed process. Never persisted.
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub subdomain: String,
    pub project_id: i64,
    pub pid: u32,
    pub port: u16,
    /// Set by a deliberate stop so the exit monitor does not treat the
    /// resulting process exit as a crash.
    pub stopping: bool,
}

/// Lock-guarded subdomain -> instance table.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: RwLock<HashMap<String, RunningInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new instance, returning any instance it displaced.
    pub fn insert(&self, instance: RunningInstance) -> Option<RunningInstance> {
        self.inner
            .write()
            .insert(instance.subdomain.clone(), instance)
    }

    /// Remove and return the instance for a subdomain.
    pub fn remove(&self, subdomain: &str) -> Option<RunningInstance> {
        self.inner.write().remove(subdomain)
    }

    pub fn get(&self, subdomain: &str) -> Option<RunningInstance> {
        self.inner.read().get(subdomain).cloned()
    }

    pub fn is_running(&self, subdomain: &str) -> bool {
        self.inner.read().contains_key(subdomain)
    }

    /// Flag an instance as deliberately stopping. Returns the flagged
    /// instance, or None when nothing is running.
    pub fn mark_stopping(&self, subdomain: &str) -> Option<RunningInstance> {
        let mut inner = self.inner.write();
        inner.get_mut(subdomain).map(|instance| {
            instance.stopping = true;
            instance.clone()
        })
    }

    /// Subdomains with a live instance, sorted for stable output.
    pub fn active_subdomains(&self) -> Vec<String> {
        let mut subs: Vec<String> = self.inner.read().keys().cloned().collect();
        subs.sort();
        subs
    }
}
