//! Declaration records for state fields.
//!
//! A [`StateField`] is the reflected form of one declared field: its name,
//! tier, value type, initializer, protection, and flags. `state_vars!`
//! produces these for compiled-in declarations; the manifest loader
//! produces them for generator input.

use std::borrow::Cow;
use std::fmt;

use super::lock::LockId;
use super::tier::Tier;

/// Name and rank of a lock as recorded in the policy table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockRef {
    pub name: Cow<'static, str>,
    pub rank: u8,
}

impl LockRef {
    pub fn new(name: impl Into<Cow<'static, str>>, rank: u8) -> Self {
        Self {
            name: name.into(),
            rank,
        }
    }
}

impl From<LockId> for LockRef {
    fn from(lock: LockId) -> Self {
        Self {
            name: Cow::Borrowed(lock.name()),
            rank: lock.rank(),
        }
    }
}

impl fmt::Display for LockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.rank)
    }
}

/// Synchronization required for a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protection {
    /// Unsynchronized, or synchronized by ownership (per-instance, per-thread).
    None,
    /// A single mutex guards reads and writes.
    Mutex(LockRef),
    /// A reader/writer lock; reads may proceed concurrently.
    ReadMostly(LockRef),
}

impl Protection {
    pub fn lock(&self) -> Option<&LockRef> {
        match self {
            Protection::None => None,
            Protection::Mutex(lock) | Protection::ReadMostly(lock) => Some(lock),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Protection::None => "none",
            Protection::Mutex(_) => "mutex",
            Protection::ReadMostly(_) => "read_mostly",
        }
    }
}

/// One declared state field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateField {
    pub name: Cow<'static, str>,
    pub tier: Tier,
    pub type_name: Cow<'static, str>,
    pub initializer: Option<Cow<'static, str>>,
    /// Build-time condition under which the field exists, in `cfg` syntax.
    pub guard: Option<Cow<'static, str>>,
    pub protection: Protection,
    /// Reachable from dynamically loaded extension code.
    pub exported: bool,
    /// Survives release and re-binding of the same thread to the same instance.
    pub persistent: bool,
    pub constant: bool,
}

impl StateField {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        tier: Tier,
        type_name: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            type_name: type_name.into(),
            initializer: None,
            guard: None,
            protection: Protection::None,
            exported: false,
            persistent: false,
            constant: false,
        }
    }

    pub fn initializer(mut self, init: impl Into<Cow<'static, str>>) -> Self {
        self.initializer = Some(init.into());
        self
    }

    pub fn guarded(mut self, guard: impl Into<Cow<'static, str>>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    pub fn export(mut self) -> Self {
        self.exported = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn constant(mut self) -> Self {
        self.constant = true;
        self
    }

    pub fn lock(&self) -> Option<&LockRef> {
        self.protection.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_flags() {
        let field = StateField::new("sh_path", Tier::Global, "String")
            .initializer("\"/bin/sh\"")
            .protection(Protection::ReadMostly(LockId::SH_PATH.into()))
            .export();

        assert!(field.exported);
        assert!(!field.persistent);
        assert_eq!(field.lock().map(|l| l.name.as_ref()), Some("sh_path"));
        assert_eq!(field.protection.kind(), "read_mostly");
    }

    #[test]
    fn test_lock_ref_from_lock_id() {
        let lock: LockRef = LockId::REGISTRY.into();
        assert_eq!(lock, LockRef::new("registry", 10));
        assert_eq!(lock.to_string(), "registry#10");
    }
}
