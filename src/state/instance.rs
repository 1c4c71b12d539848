//! Interpreter instances and the live-instance registry.
//!
//! An [`Instance`] owns every per-instance variable. Its variables sit
//! behind the instance lock (rank 0), which only ever hands ownership from
//! one bound thread to the next: the lowest rank means a thread working on
//! its instance may still take any global lock, and a thread holding a
//! global lock can never reach back into instance state.
//!
//! The [`Registry`] is the one structure shared by every instance. It lives
//! in the global tier behind the registry lock; creation, destruction and
//! enumeration all go through that lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::StateError;
use super::extensions::Extensions;
use super::lock::{LockId, OrderToken};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of an instance. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance #{}", self.0)
    }
}

crate::state_vars! {
    /// Variables owned by one interpreter instance.
    pub struct InstanceVars: PerInstance {
        /// Taint checks are on for this instance.
        tainting: bool = false,
        /// Status reported when the instance exits.
        exit_code: i32 = 0,
        /// Bumped whenever a named sub is redefined; method caches compare
        /// against it.
        sub_generation: u64 = 1,
        /// Live scalar values.
        sv_count: usize = 0,
        /// State owned by other subsystems, keyed by type.
        extensions: Extensions = Extensions::new(),
    }
}

/// One isolated runtime context.
pub struct Instance {
    id: InstanceId,
    parent: Option<InstanceId>,
    // Token of the process state that created this instance.
    owner: u64,
    vars: Mutex<InstanceVars>,
    alive: AtomicBool,
}

impl Instance {
    pub(crate) fn new(owner: u64, parent: Option<InstanceId>, vars: InstanceVars) -> Self {
        Self {
            id: InstanceId::next(),
            parent,
            owner,
            vars: Mutex::new(vars),
            alive: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The instance this one was spawned from, if any.
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_destroyed(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Run `f` with exclusive access to the per-instance variables.
    pub fn with_vars<R>(&self, f: impl FnOnce(&mut InstanceVars) -> R) -> Result<R, StateError> {
        if !self.is_alive() {
            return Err(StateError::InstanceDestroyed(self.id));
        }
        let _order = OrderToken::acquire(LockId::INSTANCE)?;
        let mut vars = self.vars.lock();
        Ok(f(&mut vars))
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Live instances of one process, plus the initial one.
#[derive(Debug, Default)]
pub struct Registry {
    instances: BTreeMap<InstanceId, Arc<Instance>>,
    initial: Option<InstanceId>,
    // Set once the initial instance has been chosen, even after it is gone.
    initial_chosen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. The first instance ever registered becomes the
    /// initial one; later instances never do.
    pub fn insert(&mut self, instance: Arc<Instance>) {
        let id = instance.id();
        if !self.initial_chosen {
            self.initial = Some(id);
            self.initial_chosen = true;
        }
        self.instances.insert(id, instance);
    }

    /// Unregister an instance. Destroying the initial instance leaves the
    /// process without one; no other instance is promoted.
    pub fn remove(&mut self, id: InstanceId) -> Option<Arc<Instance>> {
        if self.initial == Some(id) {
            self.initial = None;
        }
        self.instances.remove(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.instances.get(&id).cloned()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn initial(&self) -> Option<InstanceId> {
        self.initial
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Live ids in creation order.
    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.keys().copied().collect()
    }

    /// Remove every instance, newest first.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Instance>> {
        self.initial = None;
        let drained = std::mem::take(&mut self.instances);
        drained.into_values().rev().collect()
    }
}
