//! Tiered runtime state.
//!
//! Every piece of mutable runtime state belongs to one of three tiers
//! (see [`Tier`]). Fields are declared with [`state_vars!`](crate::state_vars),
//! which produces the storage struct, accessors, and reflected
//! [`StateField`] records; the records are validated into a
//! [`PolicyTable`] when a [`ProcessState`] starts.
//!
//! ```ignore
//! use tierstate::state::ProcessState;
//!
//! let process = ProcessState::with_defaults()?;
//! let instance = process.create_instance()?;
//! process.bind_current_thread(&instance)?;
//! process.with_instance(|vars| vars.set_tainting(true))?;
//! ```

pub mod constants;
pub mod declare;
pub mod error;
pub mod extensions;
pub mod field;
pub mod globals;
pub mod hooks;
pub mod instance;
pub mod lock;
pub mod policy;
pub mod process;
pub mod thread;
pub mod tier;

pub use constants::{builtins, identity_eq, Builtins, ConstantRegistry, StableHandle};
pub use error::{ConfigurationError, StateError};
pub use extensions::Extensions;
pub use field::{LockRef, Protection, StateField};
#[cfg(all(feature = "tracked-alloc", feature = "threads"))]
pub use globals::AllocStats;
pub use globals::GlobalVars;
#[cfg(feature = "threads")]
pub use globals::{OpId, OpRefTable};
pub use hooks::{Hook, HookEvent, HookId, LifecycleHooks};
pub use instance::{Instance, InstanceId, InstanceVars, Registry};
pub use lock::{held_locks, Flag, Guarded, LockId, ReadMostly};
pub use policy::PolicyTable;
pub use process::{Phase, ProcessState};
pub use thread::{BindingState, ThreadKey, ThreadStateHandle, ThreadVars};
pub use tier::{Placement, Tier};
