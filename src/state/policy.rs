//! The synchronization policy table.
//!
//! Maps every declared field to its tier and protection, and every lock to
//! the field group it protects. The table is built once,
//! from `state_vars!` declarations at process startup or from a manifest at
//! generation time, and every rule is checked while building it:
//!
//! - field names are unique across all tiers
//! - lock names and ranks are unique, so acquisition order is total
//! - only global fields take locks or are exported
//! - a field has at most one lock; a lock may guard a group of fields,
//!   all with the same kind of protection
//! - constants are unlocked globals, persistent fields are per-thread
//!
//! Nothing is re-derived per access: accessors carry their lock with them
//! and the table exists to reject bad declaration sets up front.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, warn};

use super::error::ConfigurationError;
use super::field::{LockRef, Protection, StateField};
use super::lock::LockId;
use super::tier::Tier;

/// Validated declarations of one runtime.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    /// Declared locks, lowest rank first.
    locks: Vec<LockRef>,
    /// Fields in declaration order.
    fields: Vec<StateField>,
    /// Field name -> index into `fields`.
    index: HashMap<String, usize>,
    /// Lock name -> fields it protects, in declaration order.
    guarded: HashMap<String, Vec<String>>,
}

impl PolicyTable {
    /// Create an empty table with the given locks.
    pub fn new(locks: impl IntoIterator<Item = LockRef>) -> Result<Self, ConfigurationError> {
        let mut table = PolicyTable::default();
        for lock in locks {
            table.declare_lock(lock)?;
        }
        Ok(table)
    }

    /// Create an empty table with the built-in lock order.
    pub fn with_builtin_locks() -> Result<Self, ConfigurationError> {
        Self::new(LockId::BUILTIN.iter().copied().map(LockRef::from))
    }

    /// Build a table from locks and field declarations in one step.
    pub fn from_declarations(
        locks: impl IntoIterator<Item = LockRef>,
        fields: impl IntoIterator<Item = StateField>,
    ) -> Result<Self, ConfigurationError> {
        let mut table = Self::new(locks)?;
        for field in fields {
            table.declare(field)?;
        }
        Ok(table)
    }

    /// Register a lock. Name and rank must both be unused.
    pub fn declare_lock(&mut self, lock: LockRef) -> Result<(), ConfigurationError> {
        if self
            .locks
            .iter()
            .any(|l| l.name == lock.name || l.rank == lock.rank)
        {
            warn!(target: "tierstate::policy", lock = %lock, "Rejected duplicate lock");
            return Err(ConfigurationError::DuplicateLock {
                name: lock.name.into_owned(),
                rank: lock.rank,
            });
        }
        let pos = self.locks.partition_point(|l| l.rank < lock.rank);
        self.locks.insert(pos, lock);
        Ok(())
    }

    /// Register a field declaration.
    pub fn declare(&mut self, field: StateField) -> Result<(), ConfigurationError> {
        let name = field.name.to_string();
        if self.index.contains_key(&name) {
            warn!(target: "tierstate::policy", field = %name, "Rejected duplicate field");
            return Err(ConfigurationError::DuplicateField(name));
        }
        if field.constant && (field.tier != Tier::Global || field.lock().is_some()) {
            return Err(ConfigurationError::InvalidConstant(name));
        }
        if field.exported && !field.tier.is_shared() {
            return Err(ConfigurationError::ExportOnUnsharedTier {
                field: name,
                tier: field.tier,
            });
        }
        if field.persistent && field.tier != Tier::PerThread {
            return Err(ConfigurationError::PersistentOutsideThreadTier {
                field: name,
                tier: field.tier,
            });
        }
        if let Some(lock) = field.lock() {
            self.check_lock_binding(&name, field.tier, &field.protection)?;
            self.guarded
                .entry(lock.name.to_string())
                .or_default()
                .push(name.clone());
        }
        debug!(
            target: "tierstate::policy",
            field = %name,
            tier = %field.tier,
            protection = field.protection.kind(),
            "Declared field"
        );
        self.index.insert(name, self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    /// Bind a lock to an already declared, currently unlocked field.
    pub fn bind(&mut self, field: &str, protection: Protection) -> Result<(), ConfigurationError> {
        let idx = *self
            .index
            .get(field)
            .ok_or_else(|| ConfigurationError::UnknownField(field.to_string()))?;

        let Some(lock) = protection.lock() else {
            return Ok(());
        };
        if let Some(existing) = self.fields[idx].lock() {
            return Err(ConfigurationError::FieldAlreadyLocked {
                field: field.to_string(),
                existing: existing.name.to_string(),
                requested: lock.name.to_string(),
            });
        }
        if self.fields[idx].constant {
            return Err(ConfigurationError::InvalidConstant(field.to_string()));
        }
        self.check_lock_binding(field, self.fields[idx].tier, &protection)?;

        self.guarded
            .entry(lock.name.to_string())
            .or_default()
            .push(field.to_string());
        self.fields[idx].protection = protection;
        Ok(())
    }

    fn check_lock_binding(
        &self,
        field: &str,
        tier: Tier,
        protection: &Protection,
    ) -> Result<(), ConfigurationError> {
        let Some(lock) = protection.lock() else {
            return Ok(());
        };
        if !tier.is_shared() {
            return Err(ConfigurationError::LockOnUnsharedTier {
                field: field.to_string(),
                tier,
            });
        }
        if !self.locks.iter().any(|l| l == lock) {
            return Err(ConfigurationError::UnknownLock {
                field: field.to_string(),
                lock: lock.to_string(),
            });
        }
        // Every field of a group is locked the same way.
        let existing = self
            .guarded_fields(&lock.name)
            .iter()
            .find(|name| self.protection(name).map(Protection::kind) != Some(protection.kind()));
        if let Some(existing) = existing {
            return Err(ConfigurationError::LockKindConflict {
                lock: lock.name.to_string(),
                field: field.to_string(),
                existing_field: existing.clone(),
            });
        }
        Ok(())
    }

    /// Declared locks in acquisition order.
    pub fn locks(&self) -> &[LockRef] {
        &self.locks
    }

    pub fn fields(&self) -> &[StateField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn protection(&self, name: &str) -> Option<&Protection> {
        self.field(name).map(|f| &f.protection)
    }

    /// Fields protected by the named lock, in declaration order.
    pub fn guarded_fields(&self, lock: &str) -> &[String] {
        self.guarded.get(lock).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tier_fields(&self, tier: Tier) -> impl Iterator<Item = &StateField> {
        self.fields.iter().filter(move |f| f.tier == tier)
    }

    /// Global fields visible to extension code.
    pub fn exports(&self) -> impl Iterator<Item = &StateField> {
        self.fields.iter().filter(|f| f.exported)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Plain-text rendering, one field per line, grouped by tier.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "locks (acquisition order):");
        for lock in &self.locks {
            let guarded = match self.guarded_fields(&lock.name) {
                [] => "-".to_string(),
                fields => fields.join(", "),
            };
            let _ = writeln!(out, "  {:>3}  {:<14} {}", lock.rank, lock.name, guarded);
        }
        for tier in [Tier::Global, Tier::PerInstance, Tier::PerThread] {
            let _ = writeln!(out, "{}:", tier);
            for field in self.tier_fields(tier) {
                let mut flags = Vec::new();
                if field.exported {
                    flags.push("export");
                }
                if field.persistent {
                    flags.push("persistent");
                }
                if field.constant {
                    flags.push("constant");
                }
                let lock = field
                    .lock()
                    .map(|l| format!("{}({})", field.protection.kind(), l.name))
                    .unwrap_or_else(|| "none".to_string());
                let _ = write!(out, "  {:<16} {:<28} {}", field.name, field.type_name, lock);
                if !flags.is_empty() {
                    let _ = write!(out, " [{}]", flags.join(","));
                }
                if let Some(guard) = &field.guard {
                    let _ = write!(out, " cfg({})", guard);
                }
                out.push('\n');
            }
        }
        out
    }
}
