//! Lock identities, acquisition ordering, and the guarded cell types.
//!
//! Every lock in the layer has a fixed rank. Ranks form a total order and a
//! thread may only acquire a lock whose rank is strictly greater than every
//! lock it already holds. The built-in order is:
//!
//! ```text
//! rank  lock          guards
//!    0  instance      one instance's per-instance variables
//!   10  registry      live instances + the initial instance
//!   20  hooks         instance lifecycle callbacks
//!   30  sh_path       shell path (read-mostly)
//!   40  program_name  externally visible program name
//!   50  op_refcount   shared op-tree reference counts
//!   60  alloc         allocation bookkeeping
//! ```
//!
//! Ordering is checked before blocking, so an out-of-order acquisition
//! fails with [`StateError::LockOrderViolation`] instead of deadlocking.
//!
//! Cell types:
//!
//! - [`Guarded<T>`]: single mutex, every read and write takes the lock.
//! - [`ReadMostly<T>`]: rwlock, concurrent readers, exclusive writers.
//! - [`Flag`]: lock-free boolean for unguarded fields.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::error;

use super::error::StateError;

/// Identity and rank of one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId {
    name: &'static str,
    rank: u8,
}

impl LockId {
    pub const INSTANCE: LockId = LockId::new("instance", 0);
    pub const REGISTRY: LockId = LockId::new("registry", 10);
    pub const HOOKS: LockId = LockId::new("hooks", 20);
    pub const SH_PATH: LockId = LockId::new("sh_path", 30);
    pub const PROGRAM_NAME: LockId = LockId::new("program_name", 40);
    pub const OP_REFCOUNT: LockId = LockId::new("op_refcount", 50);
    pub const ALLOC: LockId = LockId::new("alloc", 60);

    /// Built-in locks in acquisition order.
    pub const BUILTIN: &'static [LockId] = &[
        LockId::INSTANCE,
        LockId::REGISTRY,
        LockId::HOOKS,
        LockId::SH_PATH,
        LockId::PROGRAM_NAME,
        LockId::OP_REFCOUNT,
        LockId::ALLOC,
    ];

    pub const fn new(name: &'static str, rank: u8) -> Self {
        Self { name, rank }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rank(&self) -> u8 {
        self.rank
    }
}

thread_local! {
    // Locks held by this thread, in acquisition order.
    static HELD: RefCell<SmallVec<[LockId; 4]>> = RefCell::new(SmallVec::new());
}

/// Registration of one held lock in the per-thread order tracker.
///
/// Created before the underlying lock is taken and dropped after it is
/// released, so the tracker never reports a lock that is not held.
pub(crate) struct OrderToken {
    lock: LockId,
    // Tokens must be released on the thread that took them.
    _not_send: PhantomData<*const ()>,
}

impl OrderToken {
    pub(crate) fn acquire(lock: LockId) -> Result<Self, StateError> {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            let blocking = held
                .iter()
                .copied()
                .filter(|h| h.rank >= lock.rank)
                .max_by_key(|h| h.rank);
            if let Some(blocking) = blocking {
                error!(
                    target: "tierstate::lock",
                    held = blocking.name,
                    requested = lock.name,
                    "Lock order violation"
                );
                return Err(StateError::LockOrderViolation {
                    held: blocking,
                    requested: lock,
                });
            }
            held.push(lock);
            Ok(OrderToken {
                lock,
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for OrderToken {
    fn drop(&mut self) {
        // The slot may already be gone during thread teardown.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|l| *l == self.lock) {
                held.remove(pos);
            }
        });
    }
}

/// Locks currently held by the calling thread, lowest rank first.
pub fn held_locks() -> Vec<LockId> {
    HELD.with(|held| held.borrow().to_vec())
}

/// A value behind its own mutex.
///
/// Both reads and writes acquire the lock; the guard is released on every
/// exit path, including unwinding out of the closure.
pub struct Guarded<T> {
    lock: LockId,
    cell: Mutex<T>,
}

impl<T> Guarded<T> {
    pub fn new(lock: LockId, value: T) -> Self {
        Self {
            lock,
            cell: Mutex::new(value),
        }
    }

    pub fn lock_id(&self) -> LockId {
        self.lock
    }

    /// Run `f` with exclusive access to the value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StateError> {
        let _order = OrderToken::acquire(self.lock)?;
        let mut guard = self.cell.lock();
        Ok(f(&mut guard))
    }

    /// Clone the current value out under the lock.
    pub fn read(&self) -> Result<T, StateError>
    where
        T: Clone,
    {
        self.with(|value| value.clone())
    }

    /// Replace the value, returning the previous one.
    pub fn write(&self, value: T) -> Result<T, StateError> {
        self.with(|slot| std::mem::replace(slot, value))
    }

    /// Exclusive access without locking; only reachable through `&mut self`.
    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

/// A value behind a read-mostly lock.
pub struct ReadMostly<T> {
    lock: LockId,
    cell: RwLock<T>,
}

impl<T> ReadMostly<T> {
    pub fn new(lock: LockId, value: T) -> Self {
        Self {
            lock,
            cell: RwLock::new(value),
        }
    }

    pub fn lock_id(&self) -> LockId {
        self.lock
    }

    /// Run `f` with shared access; readers do not block each other.
    pub fn read_with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, StateError> {
        let _order = OrderToken::acquire(self.lock)?;
        let guard = self.cell.read();
        Ok(f(&guard))
    }

    pub fn read(&self) -> Result<T, StateError>
    where
        T: Clone,
    {
        self.read_with(|value| value.clone())
    }

    /// Run `f` with exclusive access.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StateError> {
        let _order = OrderToken::acquire(self.lock)?;
        let mut guard = self.cell.write();
        Ok(f(&mut guard))
    }

    /// Replace the value, returning the previous one.
    pub fn write(&self, value: T) -> Result<T, StateError> {
        self.update(|slot| std::mem::replace(slot, value))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

/// Lock-free boolean for fields with no lock bound.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub const fn new(value: bool) -> Self {
        Self(AtomicBool::new(value))
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get_mut(&mut self) -> &mut bool {
        self.0.get_mut()
    }
}
