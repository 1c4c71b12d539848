//! State tiers and the tier classifier.
//!
//! Every piece of mutable runtime state lives in exactly one tier:
//!
//! ```text
//! Global       one copy per process, shared by every instance
//! PerInstance  one copy per interpreter instance
//! PerThread    one copy per (thread, instance) binding
//! ```
//!
//! The tier is fixed when the field is declared. Declarations either name
//! the tier directly or describe a [`Placement`] from which the tier is
//! derived by [`Tier::classify`].

use std::fmt;

use serde::Deserialize;

/// Lifetime and sharing scope of a state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Shared across the whole process, lives as long as the process.
    Global,
    /// Owned by one instance, created and destroyed with it.
    PerInstance,
    /// Owned by one thread binding, created lazily on first access.
    PerThread,
}

/// The two placement axes used to derive a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Placement {
    /// The field is needed before any instance exists.
    #[serde(default)]
    pub before_instance: bool,
    /// Each execution thread needs its own copy.
    #[serde(default)]
    pub per_thread: bool,
}

impl Placement {
    pub const fn new(before_instance: bool, per_thread: bool) -> Self {
        Self {
            before_instance,
            per_thread,
        }
    }
}

impl Tier {
    /// Derive the tier for a field from its placement axes.
    ///
    /// `instances_supported` is false for runtimes built without instance
    /// support; everything that is not per-thread then collapses into the
    /// global tier.
    pub fn classify(placement: Placement, instances_supported: bool) -> Tier {
        if placement.before_instance {
            Tier::Global
        } else if placement.per_thread {
            Tier::PerThread
        } else if instances_supported {
            Tier::PerInstance
        } else {
            Tier::Global
        }
    }

    /// Whether fields of this tier are shared between threads without an owner.
    pub fn is_shared(self) -> bool {
        matches!(self, Tier::Global)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::PerInstance => "per_instance",
            Tier::PerThread => "per_thread",
        }
    }

    /// Identifier used by `state_vars!` for this tier.
    pub fn variant_name(self) -> &'static str {
        match self {
            Tier::Global => "Global",
            Tier::PerInstance => "PerInstance",
            Tier::PerThread => "PerThread",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
