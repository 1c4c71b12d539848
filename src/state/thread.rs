//! Per-thread state and thread bindings.
//!
//! Each process state acquires one [`ThreadKey`] at startup. Every thread
//! keeps a private map from key token to its binding for that process, so
//! several process states can coexist in one address space without seeing
//! each other's bindings.
//!
//! A binding ties the calling thread to one instance and owns the thread's
//! [`ThreadVars`] for it. It holds only a weak reference to the instance:
//! the instance does not own the thread and the thread does not keep the
//! instance alive. A thread is bound to at most one instance per process
//! at a time; binding to another instance releases the current binding.
//!
//! Resolving the current binding touches only thread-local data and takes
//! no lock.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::error::StateError;
use super::instance::{Instance, InstanceId};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-wide registration token for the per-thread lookup slot.
pub struct ThreadKey {
    token: u64,
    released: Arc<AtomicBool>,
}

impl ThreadKey {
    pub(crate) fn acquire() -> Self {
        let token = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        debug!(target: "tierstate::binding", token, "Acquired thread key");
        Self {
            token,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Invalidate every binding made under this key. Slots on other
    /// threads are dropped the next time those threads bind.
    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!(target: "tierstate::binding", token = self.token, "Released thread key");
        }
        let _ = SLOTS.try_with(|slots| {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                slots.remove(&self.token);
            }
        });
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadKey")
            .field("token", &self.token)
            .field("released", &self.is_released())
            .finish()
    }
}

crate::state_vars! {
    /// Variables owned by one thread binding.
    pub struct ThreadVars: PerThread {
        /// Current interpreter call depth.
        stack_depth: usize = 0,
        /// Message of the last error raised on this thread.
        last_error: Option<String> = None,
        /// Locale selected by this thread; kept across re-binding.
        @persistent locale: Option<String> = None,
    }
}

struct Binding {
    id: InstanceId,
    instance: Weak<Instance>,
    vars: Rc<RefCell<ThreadVars>>,
}

// Persistent fields of a released binding, waiting for the same thread to
// bind to the same instance again.
struct Retired {
    instance: Weak<Instance>,
    vars: ThreadVars,
}

struct Slot {
    released: Arc<AtomicBool>,
    binding: Option<Binding>,
    retired: HashMap<InstanceId, Retired>,
}

impl Slot {
    fn new(key: &ThreadKey) -> Self {
        Self {
            released: Arc::clone(&key.released),
            binding: None,
            retired: HashMap::new(),
        }
    }

    fn prune_retired(&mut self) {
        self.retired
            .retain(|_, retired| retired.instance.upgrade().is_some_and(|i| i.is_alive()));
    }
}

thread_local! {
    static SLOTS: RefCell<HashMap<u64, Slot>> = RefCell::new(HashMap::new());
}

/// What the calling thread is bound to under one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    Bound(InstanceId),
    /// Bound to an instance that has since been destroyed.
    Stale(InstanceId),
}

/// Access to the calling thread's per-thread variables for one binding.
///
/// Handles are tied to the thread that created them. Once the binding is
/// released every access through an old handle fails; a handle never
/// brings a binding back.
pub struct ThreadStateHandle {
    id: InstanceId,
    instance: Weak<Instance>,
    vars: RcWeak<RefCell<ThreadVars>>,
}

impl ThreadStateHandle {
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn instance(&self) -> Result<Arc<Instance>, StateError> {
        live_instance(self.id, &self.instance)
    }

    /// Whether the binding behind this handle still exists.
    pub fn is_bound(&self) -> bool {
        self.vars.strong_count() > 0
    }

    /// Run `f` with exclusive access to this thread's variables.
    pub fn with<R>(&self, f: impl FnOnce(&mut ThreadVars) -> R) -> Result<R, StateError> {
        let vars = self.vars.upgrade().ok_or(StateError::NoActiveInstance)?;
        live_instance(self.id, &self.instance)?;
        let mut vars = vars
            .try_borrow_mut()
            .map_err(|_| StateError::ReentrantAccess)?;
        Ok(f(&mut vars))
    }
}

impl fmt::Debug for ThreadStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStateHandle")
            .field("instance", &self.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

fn live_instance(id: InstanceId, weak: &Weak<Instance>) -> Result<Arc<Instance>, StateError> {
    match weak.upgrade() {
        Some(instance) if instance.is_alive() => Ok(instance),
        _ => Err(StateError::InstanceDestroyed(id)),
    }
}

fn handle_for(binding: &Binding) -> ThreadStateHandle {
    ThreadStateHandle {
        id: binding.id,
        instance: Weak::clone(&binding.instance),
        vars: Rc::downgrade(&binding.vars),
    }
}

// Move a binding's variables into the retired map, or drop them. Fails if
// the variables are borrowed by an enclosing `with` on this thread.
fn retire(slot: &mut Slot, binding: Binding) -> Result<(), (Binding, StateError)> {
    let taken = binding
        .vars
        .try_borrow_mut()
        .map(|mut vars| std::mem::take(&mut *vars));
    let vars = match taken {
        Ok(vars) => vars,
        Err(_) => return Err((binding, StateError::ReentrantAccess)),
    };
    if binding.instance.upgrade().is_some_and(|i| i.is_alive()) {
        slot.retired.insert(
            binding.id,
            Retired {
                instance: binding.instance,
                vars,
            },
        );
    }
    Ok(())
}

/// Bind the calling thread to `instance` under `key`.
pub(crate) fn bind(key: &ThreadKey, instance: &Arc<Instance>) -> Result<ThreadStateHandle, StateError> {
    SLOTS.with(|slots| {
        let mut slots = slots
            .try_borrow_mut()
            .map_err(|_| StateError::ReentrantAccess)?;
        slots.retain(|_, slot| !slot.released.load(Ordering::Acquire));

        let slot = slots.entry(key.token).or_insert_with(|| Slot::new(key));
        if let Some(binding) = &slot.binding {
            if binding.id == instance.id() {
                trace!(target: "tierstate::binding", instance = %binding.id, "Reusing binding");
                return Ok(handle_for(binding));
            }
        }

        if let Some(previous) = slot.binding.take() {
            let previous_id = previous.id;
            if let Err((previous, err)) = retire(slot, previous) {
                slot.binding = Some(previous);
                return Err(err);
            }
            debug!(
                target: "tierstate::binding",
                from = %previous_id,
                to = %instance.id(),
                "Rebinding thread"
            );
        }
        slot.prune_retired();

        let mut vars = ThreadVars::new();
        if let Some(mut retired) = slot.retired.remove(&instance.id()) {
            vars.carry_persistent(&mut retired.vars);
        }
        let binding = Binding {
            id: instance.id(),
            instance: Arc::downgrade(instance),
            vars: Rc::new(RefCell::new(vars)),
        };
        let handle = handle_for(&binding);
        slot.binding = Some(binding);
        debug!(target: "tierstate::binding", instance = %instance.id(), "Bound thread");
        Ok(handle)
    })
}

/// Drop the calling thread's binding under `key`. Returns the instance it
/// was bound to, if any.
pub(crate) fn release(key: &ThreadKey) -> Result<Option<InstanceId>, StateError> {
    SLOTS.with(|slots| {
        let mut slots = slots
            .try_borrow_mut()
            .map_err(|_| StateError::ReentrantAccess)?;
        let Some(slot) = slots.get_mut(&key.token) else {
            return Ok(None);
        };
        let Some(binding) = slot.binding.take() else {
            return Ok(None);
        };
        let id = binding.id;
        if let Err((binding, err)) = retire(slot, binding) {
            slot.binding = Some(binding);
            return Err(err);
        }
        slot.prune_retired();
        debug!(target: "tierstate::binding", instance = %id, "Released thread binding");
        Ok(Some(id))
    })
}

/// The instance the calling thread is bound to under `key`.
#[inline]
pub(crate) fn current(key: &ThreadKey) -> Result<Arc<Instance>, StateError> {
    SLOTS.with(|slots| {
        let slots = slots
            .try_borrow()
            .map_err(|_| StateError::ReentrantAccess)?;
        let binding = slots
            .get(&key.token)
            .and_then(|slot| slot.binding.as_ref())
            .ok_or(StateError::NoActiveInstance)?;
        trace!(target: "tierstate::binding", instance = %binding.id, "Resolved current instance");
        live_instance(binding.id, &binding.instance)
    })
}

pub(crate) fn state(key: &ThreadKey) -> BindingState {
    SLOTS
        .try_with(|slots| {
            let Ok(slots) = slots.try_borrow() else {
                return BindingState::Unbound;
            };
            match slots.get(&key.token).and_then(|slot| slot.binding.as_ref()) {
                None => BindingState::Unbound,
                Some(binding) => match live_instance(binding.id, &binding.instance) {
                    Ok(_) => BindingState::Bound(binding.id),
                    Err(_) => BindingState::Stale(binding.id),
                },
            }
        })
        .unwrap_or(BindingState::Unbound)
}

/// Handle to the calling thread's current binding under `key`.
pub(crate) fn handle(key: &ThreadKey) -> Result<ThreadStateHandle, StateError> {
    SLOTS.with(|slots| {
        let slots = slots
            .try_borrow()
            .map_err(|_| StateError::ReentrantAccess)?;
        let binding = slots
            .get(&key.token)
            .and_then(|slot| slot.binding.as_ref())
            .ok_or(StateError::NoActiveInstance)?;
        live_instance(binding.id, &binding.instance)?;
        Ok(handle_for(binding))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::instance::InstanceVars;
    use std::thread;

    fn instance() -> Arc<Instance> {
        Arc::new(Instance::new(0, None, InstanceVars::new()))
    }

    #[test]
    fn test_unbound_thread_has_no_instance() {
        let key = ThreadKey::acquire();
        assert_eq!(current(&key).unwrap_err(), StateError::NoActiveInstance);
        assert_eq!(state(&key), BindingState::Unbound);
    }

    #[test]
    fn test_bind_is_idempotent() {
        let key = ThreadKey::acquire();
        let inst = instance();
        let first = bind(&key, &inst).unwrap();
        first.with(|vars| vars.set_stack_depth(3)).unwrap();

        let second = bind(&key, &inst).unwrap();
        assert_eq!(second.with(|vars| *vars.stack_depth()).unwrap(), 3);
        assert_eq!(current(&key).unwrap().id(), inst.id());
    }

    #[test]
    fn test_release_invalidates_handles() {
        let key = ThreadKey::acquire();
        let inst = instance();
        let handle = bind(&key, &inst).unwrap();
        assert_eq!(release(&key).unwrap(), Some(inst.id()));
        assert!(!handle.is_bound());
        assert_eq!(handle.with(|_| ()).unwrap_err(), StateError::NoActiveInstance);
        assert_eq!(current(&key).unwrap_err(), StateError::NoActiveInstance);
        assert_eq!(release(&key).unwrap(), None);
    }

    #[test]
    fn test_persistent_fields_survive_rebind_to_same_instance() {
        let key = ThreadKey::acquire();
        let inst = instance();
        bind(&key, &inst)
            .unwrap()
            .with(|vars| {
                vars.set_stack_depth(9);
                vars.set_locale(Some("fr_FR".to_string()));
            })
            .unwrap();
        release(&key).unwrap();

        let vars = bind(&key, &inst)
            .unwrap()
            .with(|vars| (*vars.stack_depth(), vars.locale().clone()))
            .unwrap();
        assert_eq!(vars, (0, Some("fr_FR".to_string())));
    }

    #[test]
    fn test_persistent_fields_do_not_cross_instances() {
        let key = ThreadKey::acquire();
        let a = instance();
        let b = instance();
        bind(&key, &a)
            .unwrap()
            .with(|vars| vars.set_locale(Some("C".to_string())))
            .unwrap();

        let locale = bind(&key, &b)
            .unwrap()
            .with(|vars| vars.locale().clone())
            .unwrap();
        assert_eq!(locale, None);
        assert_eq!(current(&key).unwrap().id(), b.id());
    }

    #[test]
    fn test_destroyed_instance_is_reported() {
        let key = ThreadKey::acquire();
        let inst = instance();
        let handle = bind(&key, &inst).unwrap();
        inst.mark_destroyed();
        assert_eq!(
            current(&key).unwrap_err(),
            StateError::InstanceDestroyed(inst.id())
        );
        assert_eq!(state(&key), BindingState::Stale(inst.id()));
        assert!(handle.with(|_| ()).is_err());
    }

    #[test]
    fn test_reentrant_borrow_rejected() {
        let key = ThreadKey::acquire();
        let inst = instance();
        let handle = bind(&key, &inst).unwrap();
        let inner = handle.with(|_| handle.with(|_| ())).unwrap();
        assert_eq!(inner, Err(StateError::ReentrantAccess));

        let released = handle.with(|_| release(&key)).unwrap();
        assert_eq!(released, Err(StateError::ReentrantAccess));
        assert!(handle.is_bound());
    }

    #[test]
    fn test_keys_are_isolated() {
        let k1 = ThreadKey::acquire();
        let k2 = ThreadKey::acquire();
        let inst = instance();
        bind(&k1, &inst).unwrap();
        assert_eq!(state(&k2), BindingState::Unbound);
    }

    #[test]
    fn test_released_key_drops_binding() {
        let key = ThreadKey::acquire();
        let inst = instance();
        bind(&key, &inst).unwrap();
        key.release();
        assert!(key.is_released());
        assert_eq!(current(&key).unwrap_err(), StateError::NoActiveInstance);
    }

    #[test]
    fn test_bindings_are_per_thread() {
        let key = Arc::new(ThreadKey::acquire());
        let inst = instance();
        bind(&key, &inst).unwrap();

        let other_key = Arc::clone(&key);
        let seen = thread::spawn(move || state(&other_key)).join().unwrap();
        assert_eq!(seen, BindingState::Unbound);
        assert_eq!(state(&key), BindingState::Bound(inst.id()));
    }
}
