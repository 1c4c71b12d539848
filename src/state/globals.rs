//! The process-wide singleton tier.
//!
//! One [`GlobalVars`] exists per process state. Fields with a lock clause
//! are wrapped in their cell type and every access goes through that lock;
//! the rest are either immutable after construction (`thread_key`) or
//! lock-free flags that may only be written during startup.

#[cfg(feature = "threads")]
use std::collections::HashMap;

use super::hooks::LifecycleHooks;
use super::instance::Registry;
use super::lock::{Flag, LockId};
use super::thread::ThreadKey;

/// Identity of a shared op tree.
#[cfg(feature = "threads")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

/// Reference counts of op trees shared between instances.
#[cfg(feature = "threads")]
#[derive(Debug, Default)]
pub struct OpRefTable {
    counts: HashMap<OpId, usize>,
}

#[cfg(feature = "threads")]
impl OpRefTable {
    /// Add a reference, returning the new count.
    pub fn inc(&mut self, op: OpId) -> usize {
        let count = self.counts.entry(op).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a reference, returning the remaining count. The entry goes away
    /// at zero; decrementing an unknown op is a no-op returning zero.
    pub fn dec(&mut self, op: OpId) -> usize {
        match self.counts.get_mut(&op) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.counts.remove(&op);
                0
            }
            None => 0,
        }
    }

    pub fn get(&self, op: OpId) -> usize {
        self.counts.get(&op).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Allocation bookkeeping shared by every instance.
#[cfg(all(feature = "tracked-alloc", feature = "threads"))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub bytes_live: usize,
    pub allocations: u64,
    pub frees: u64,
}

#[cfg(all(feature = "tracked-alloc", feature = "threads"))]
impl AllocStats {
    pub fn record_alloc(&mut self, bytes: usize) {
        self.bytes_live += bytes;
        self.allocations += 1;
    }

    pub fn record_free(&mut self, bytes: usize) {
        self.bytes_live = self.bytes_live.saturating_sub(bytes);
        self.frees += 1;
    }
}

crate::state_vars! {
    /// Variables shared by every instance of one process.
    pub struct GlobalVars: Global {
        /// Live instances and the initial instance.
        registry: Registry = Registry::new() => locked(LockId::REGISTRY),
        /// Instance lifecycle callbacks.
        hooks: LifecycleHooks = LifecycleHooks::new() => read_mostly(LockId::HOOKS),
        /// Registration token for the per-thread lookup slot.
        thread_key: ThreadKey = ThreadKey::acquire(),
        /// Restore from a dump image at startup.
        @export do_undump: Flag = Flag::new(false),
        /// Taint checks were requested before the first instance existed.
        early_taint: Flag = Flag::new(false),
        /// Full path of the shell used for subprocesses.
        @export sh_path: String = String::from("/bin/sh") => read_mostly(LockId::SH_PATH),
        /// Externally visible program name.
        @export program_name: String = String::new() => locked(LockId::PROGRAM_NAME),
        #[cfg(feature = "threads")]
        op_refcounts: OpRefTable = OpRefTable::default() => locked(LockId::OP_REFCOUNT),
        #[cfg(all(feature = "tracked-alloc", feature = "threads"))]
        alloc_stats: AllocStats = AllocStats::default() => locked(LockId::ALLOC),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Protection, Tier};

    #[test]
    fn test_defaults() {
        let globals = GlobalVars::new();
        assert_eq!(globals.sh_path().read().unwrap(), "/bin/sh");
        assert!(!globals.do_undump().get());
        assert_eq!(globals.registry().with(|r| r.len()).unwrap(), 0);
        assert!(!globals.thread_key().is_released());
    }

    #[test]
    fn test_declarations() {
        let decls = GlobalVars::declarations();
        assert!(decls.iter().all(|f| f.tier == Tier::Global));

        let exported: Vec<_> = decls
            .iter()
            .filter(|f| f.exported)
            .map(|f| f.name.as_ref())
            .collect();
        assert_eq!(exported, vec!["do_undump", "sh_path", "program_name"]);

        let registry = decls.iter().find(|f| f.name == "registry").unwrap();
        assert_eq!(registry.protection, Protection::Mutex(LockId::REGISTRY.into()));
        let key = decls.iter().find(|f| f.name == "thread_key").unwrap();
        assert_eq!(key.protection, Protection::None);
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_op_refcounts() {
        let mut table = OpRefTable::default();
        let op = OpId(42);
        assert_eq!(table.inc(op), 1);
        assert_eq!(table.inc(op), 2);
        assert_eq!(table.dec(op), 1);
        assert_eq!(table.dec(op), 0);
        assert!(table.is_empty());
        assert_eq!(table.dec(op), 0);
    }

    #[cfg(feature = "threads")]
    #[test]
    fn test_op_refcounts_field_is_gated() {
        let decls = GlobalVars::declarations();
        let field = decls.iter().find(|f| f.name == "op_refcounts").unwrap();
        assert!(field.guard.as_deref().is_some_and(|g| g.contains("threads")));
    }
}
