//! tierstate - Tiered Runtime State Library
//!
//! This library provides the state layer of an embeddable, multi-threaded
//! language runtime. Every piece of mutable runtime state is declared once,
//! assigned to exactly one tier, and reached through generated accessors
//! that carry the tier's synchronization with them.
//!
//! # Tiers
//!
//! 1. **Global** (`state::globals`)
//!    - One copy per process, shared by every instance
//!    - Mutable fields sit behind their own lock, acquired in a fixed order
//!    - Unlocked fields are immutable or written only during startup
//!
//! 2. **Per-instance** (`state::instance`)
//!    - One copy per interpreter instance, owned by that instance
//!    - Created and destroyed with the instance; lifecycle hooks let other
//!      subsystems follow along
//!
//! 3. **Per-thread** (`state::thread`)
//!    - One copy per (thread, instance) binding
//!    - Found through a thread-local map keyed by the process's thread key,
//!      without taking any lock
//!
//! Constants (`state::constants`) are global values with a fixed address,
//! compared by identity rather than content.
//!
//! # Example
//!
//! ```rust
//! use tierstate::state::{ProcessState, StateError};
//!
//! let process = ProcessState::with_defaults().unwrap();
//!
//! // Nothing is bound yet: accessors refuse rather than guess.
//! assert_eq!(process.with_instance(|_| ()).unwrap_err(), StateError::NoActiveInstance);
//!
//! let instance = process.create_instance().unwrap();
//! process.bind_current_thread(&instance).unwrap();
//! process.with_instance(|vars| vars.set_tainting(true)).unwrap();
//! process.with_thread(|vars| *vars.stack_depth_mut() += 1).unwrap();
//!
//! assert_eq!(process.current().unwrap().id(), instance.id());
//! ```
//!
//! # Declaring state
//!
//! Runtimes declare their own fields with `state_vars!`, by hand or from a
//! TOML manifest via the `codegen` module (`tierstate gen`).

pub mod codegen;
pub mod config;
pub mod ffi;
pub mod logging;
pub mod manifest;
pub mod state;

#[doc(hidden)]
pub use paste;

pub use config::RuntimeConfig;
pub use manifest::{Manifest, ManifestError};
pub use state::{
    BindingState, ConfigurationError, Instance, InstanceId, PolicyTable, ProcessState,
    StableHandle, StateError, Tier,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_round_trip() {
        let process = ProcessState::with_defaults().unwrap();
        let instance = process.create_instance().unwrap();
        process.bind_current_thread(&instance).unwrap();

        process.with_instance(|vars| vars.set_sv_count(12)).unwrap();
        let count = process.with_instance(|vars| *vars.sv_count()).unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn test_policy_covers_every_tier() {
        let process = ProcessState::with_defaults().unwrap();
        for tier in [Tier::Global, Tier::PerInstance, Tier::PerThread] {
            assert!(process.policy().tier_fields(tier).next().is_some());
        }
    }

    #[test]
    fn test_constants_shared_across_processes() {
        let a = ProcessState::with_defaults().unwrap();
        let b = ProcessState::with_defaults().unwrap();
        assert!(a.constants().yes.same(&b.constants().yes));
    }
}
