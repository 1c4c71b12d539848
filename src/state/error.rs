//! Error types for the state layer.
//!
//! Two families:
//!
//! - [`ConfigurationError`]: a declaration set is malformed (duplicate names,
//!   a field bound to two locks, a missing tier). Raised while building a
//!   [`PolicyTable`](super::policy::PolicyTable), i.e. during generation or
//!   process startup, and always fatal to that step.
//! - [`StateError`]: a runtime accessor could not be served (no binding on
//!   this thread, lock taken out of order, instance already destroyed).
//!   Returned to the immediate caller, never retried.

use std::fmt;

use super::instance::InstanceId;
use super::lock::LockId;
use super::tier::Tier;

/// A malformed declaration set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Two declarations share a field name.
    DuplicateField(String),
    /// A declaration has neither a tier nor placement axes.
    MissingTier(String),
    /// The declared tier disagrees with the tier derived from placement.
    TierConflict {
        field: String,
        declared: Tier,
        classified: Tier,
    },
    /// A lock was registered for a field that already has one.
    FieldAlreadyLocked {
        field: String,
        existing: String,
        requested: String,
    },
    /// Fields sharing one lock disagree on mutex versus read-mostly.
    LockKindConflict {
        lock: String,
        field: String,
        existing_field: String,
    },
    /// Two locks share a name or a rank, so no total order exists.
    DuplicateLock { name: String, rank: u8 },
    /// A field names a lock that was never declared.
    UnknownLock { field: String, lock: String },
    /// Only global fields may be protected by a lock.
    LockOnUnsharedTier { field: String, tier: Tier },
    /// Only global fields may be exported to extension code.
    ExportOnUnsharedTier { field: String, tier: Tier },
    /// Only per-thread fields may be persistent.
    PersistentOutsideThreadTier { field: String, tier: Tier },
    /// Constants live in the global tier and are never locked.
    InvalidConstant(String),
    /// A constant name was defined twice.
    DuplicateConstant(String),
    /// A constant's storage is already registered under another name.
    AliasedConstant { name: String, existing: String },
    /// A lock was bound to a field that was never declared.
    UnknownField(String),
    /// A generated name is not a usable Rust identifier.
    InvalidIdentifier(String),
    /// Two lock names map to the same generated constant.
    LockNameCollision {
        lock: String,
        existing: String,
        generated: String,
    },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::DuplicateField(name) => {
                write!(f, "Field '{}' is declared more than once", name)
            }
            ConfigurationError::MissingTier(name) => {
                write!(f, "Field '{}' has no tier and no placement", name)
            }
            ConfigurationError::TierConflict {
                field,
                declared,
                classified,
            } => write!(
                f,
                "Field '{}' is declared {} but its placement classifies it as {}",
                field, declared, classified
            ),
            ConfigurationError::FieldAlreadyLocked {
                field,
                existing,
                requested,
            } => write!(
                f,
                "Field '{}' is already protected by lock '{}', cannot bind '{}'",
                field, existing, requested
            ),
            ConfigurationError::LockKindConflict {
                lock,
                field,
                existing_field,
            } => write!(
                f,
                "Field '{}' uses lock '{}' with a different protection than '{}'",
                field, lock, existing_field
            ),
            ConfigurationError::DuplicateLock { name, rank } => {
                write!(f, "Lock '{}' (rank {}) clashes with another lock", name, rank)
            }
            ConfigurationError::UnknownLock { field, lock } => {
                write!(f, "Field '{}' refers to undeclared lock '{}'", field, lock)
            }
            ConfigurationError::LockOnUnsharedTier { field, tier } => {
                write!(f, "Field '{}' is {} and cannot take a lock", field, tier)
            }
            ConfigurationError::ExportOnUnsharedTier { field, tier } => {
                write!(f, "Field '{}' is {} and cannot be exported", field, tier)
            }
            ConfigurationError::PersistentOutsideThreadTier { field, tier } => {
                write!(f, "Field '{}' is {} and cannot be persistent", field, tier)
            }
            ConfigurationError::InvalidConstant(name) => {
                write!(f, "Constant '{}' must be an unlocked global", name)
            }
            ConfigurationError::DuplicateConstant(name) => {
                write!(f, "Constant '{}' is already defined", name)
            }
            ConfigurationError::AliasedConstant { name, existing } => write!(
                f,
                "Constant '{}' shares its address with '{}'; give it its own storage",
                name, existing
            ),
            ConfigurationError::UnknownField(name) => {
                write!(f, "Field '{}' is not declared", name)
            }
            ConfigurationError::InvalidIdentifier(name) => {
                write!(f, "'{}' is not a valid Rust identifier", name)
            }
            ConfigurationError::LockNameCollision {
                lock,
                existing,
                generated,
            } => write!(
                f,
                "Locks '{}' and '{}' both generate the constant '{}'",
                existing, lock, generated
            ),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// A runtime accessor failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The calling thread is not bound to an instance.
    NoActiveInstance,
    /// A lock was requested while a lock of equal or higher rank is held.
    LockOrderViolation { held: LockId, requested: LockId },
    /// Per-thread storage was re-entered while already borrowed.
    ReentrantAccess,
    /// The instance has been torn down.
    InstanceDestroyed(InstanceId),
    /// The instance belongs to a different process state.
    ForeignInstance(InstanceId),
    /// The process state has been shut down.
    ProcessShutDown,
    /// An unguarded global was written after startup ended.
    StartupSealed(&'static str),
    /// The configured instance limit has been reached.
    InstanceLimit(usize),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::NoActiveInstance => {
                write!(f, "No instance is bound to the current thread")
            }
            StateError::LockOrderViolation { held, requested } => write!(
                f,
                "Lock order violation: requested '{}' (rank {}) while holding '{}' (rank {})",
                requested.name(),
                requested.rank(),
                held.name(),
                held.rank()
            ),
            StateError::ReentrantAccess => {
                write!(f, "Per-thread state is already borrowed on this thread")
            }
            StateError::InstanceDestroyed(id) => write!(f, "{} has been destroyed", id),
            StateError::ForeignInstance(id) => {
                write!(f, "{} belongs to a different process state", id)
            }
            StateError::ProcessShutDown => write!(f, "Process state has been shut down"),
            StateError::StartupSealed(field) => write!(
                f,
                "Field '{}' can only be written before the first instance is created",
                field
            ),
            StateError::InstanceLimit(max) => {
                write!(f, "Instance limit of {} reached", max)
            }
        }
    }
}

impl std::error::Error for StateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::FieldAlreadyLocked {
            field: "program_name".to_string(),
            existing: "program_name".to_string(),
            requested: "registry".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("program_name"));
        assert!(msg.contains("registry"));
    }

    #[test]
    fn test_lock_order_violation_display() {
        let err = StateError::LockOrderViolation {
            held: LockId::PROGRAM_NAME,
            requested: LockId::REGISTRY,
        };
        assert_eq!(
            err.to_string(),
            "Lock order violation: requested 'registry' (rank 10) while holding 'program_name' (rank 40)"
        );
    }
}
