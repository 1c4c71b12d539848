//! Instance lifecycle callbacks.
//!
//! External subsystems register a callback for instance creation and one
//! for destruction, so their own per-instance state (usually kept in the
//! instance's [`Extensions`](super::Extensions)) is set up and torn down in
//! lockstep with the instance.
//!
//! The hook list is a global field behind the read-mostly hooks lock. The
//! process clones the current list out and runs it after every lock has
//! been released, so a hook may freely take instance or global locks.

use std::fmt;
use std::sync::Arc;

use super::instance::Instance;

/// A lifecycle callback.
pub type Hook = Arc<dyn Fn(&Instance) + Send + Sync>;

/// Token returned at registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Which lifecycle event a hook runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Created,
    Destroyed,
}

#[derive(Default)]
pub struct LifecycleHooks {
    created: Vec<(HookId, Hook)>,
    destroyed: Vec<(HookId, Hook)>,
    next_id: u64,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: HookEvent, hook: Hook) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        match event {
            HookEvent::Created => self.created.push((id, hook)),
            HookEvent::Destroyed => self.destroyed.push((id, hook)),
        }
        id
    }

    /// Unregister a hook. Returns whether it was registered.
    pub fn remove(&mut self, id: HookId) -> bool {
        let before = self.created.len() + self.destroyed.len();
        self.created.retain(|(hid, _)| *hid != id);
        self.destroyed.retain(|(hid, _)| *hid != id);
        before != self.created.len() + self.destroyed.len()
    }

    /// Snapshot of the hooks for `event`, in registration order.
    pub fn snapshot(&self, event: HookEvent) -> Vec<Hook> {
        let list = match event {
            HookEvent::Created => &self.created,
            HookEvent::Destroyed => &self.destroyed,
        };
        list.iter().map(|(_, hook)| Arc::clone(hook)).collect()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.destroyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("created", &self.created.len())
            .field("destroyed", &self.destroyed.len())
            .finish()
    }
}
