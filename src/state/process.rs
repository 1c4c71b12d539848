//! The process state: global tier, instance lifecycle, thread binding.
//!
//! A [`ProcessState`] owns one [`GlobalVars`], the validated
//! [`PolicyTable`] for every declared field, and the built-in constants.
//! Everything an embedder does goes through it:
//!
//! - instance creation and teardown, serialized by the registry lock
//! - binding the calling thread and resolving the current instance
//! - guarded access to the global fields
//!
//! A process moves through three phases. During `Startup` the unguarded
//! global flags may still be written; the first instance moves it to
//! `Running`; [`ProcessState::shutdown`] tears every instance down and
//! moves it to `ShutDown`, after which every operation fails.
//!
//! Several process states may coexist (tests create one each). One of them
//! may be installed as the process-wide default, which is what the C ABI
//! talks to.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use super::constants::{builtins, Builtins};
use super::error::{ConfigurationError, StateError};
use super::field::LockRef;
use super::globals::GlobalVars;
#[cfg(all(feature = "tracked-alloc", feature = "threads"))]
use super::globals::AllocStats;
#[cfg(feature = "threads")]
use super::globals::OpId;
use super::hooks::{HookEvent, HookId};
use super::instance::{Instance, InstanceId, InstanceVars};
use super::lock::{Flag, LockId};
use super::policy::PolicyTable;
use super::thread::{self, BindingState, ThreadStateHandle, ThreadVars};
use crate::config::RuntimeConfig;

/// Lifecycle phase of a process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Running,
    ShutDown,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Startup,
            1 => Phase::Running,
            _ => Phase::ShutDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Startup => 0,
            Phase::Running => 1,
            Phase::ShutDown => 2,
        }
    }
}

static INSTALLED: OnceLock<Arc<ProcessState>> = OnceLock::new();

/// All runtime state of one process.
pub struct ProcessState {
    vars: GlobalVars,
    policy: PolicyTable,
    constants: &'static Builtins,
    phase: AtomicU8,
    max_instances: usize,
}

impl ProcessState {
    /// Validate every declaration and construct the global tier, seeded
    /// from `config`.
    pub fn new(config: &RuntimeConfig) -> Result<Arc<Self>, ConfigurationError> {
        let constants = builtins()?;
        let policy = Self::builtin_policy()?;

        let mut vars = GlobalVars::new();
        vars.set_sh_path(config.process.sh_path.clone());
        vars.set_program_name(config.process.program_name.clone());
        vars.do_undump().set(config.process.do_undump);
        vars.early_taint().set(config.process.early_taint);

        debug!(
            target: "tierstate::registry",
            fields = policy.len(),
            token = vars.thread_key().token(),
            "Process state ready"
        );
        Ok(Arc::new(Self {
            vars,
            policy,
            constants,
            phase: AtomicU8::new(Phase::Startup.as_u8()),
            max_instances: config.instances.max_instances,
        }))
    }

    /// A process state with default configuration.
    pub fn with_defaults() -> Result<Arc<Self>, ConfigurationError> {
        Self::new(&RuntimeConfig::default())
    }

    /// The policy table for every field compiled into this build.
    pub fn builtin_policy() -> Result<PolicyTable, ConfigurationError> {
        let constants = builtins()?;
        PolicyTable::from_declarations(
            LockId::BUILTIN.iter().copied().map(LockRef::from),
            GlobalVars::declarations()
                .into_iter()
                .chain(constants.registry().declarations())
                .chain(InstanceVars::declarations())
                .chain(ThreadVars::declarations()),
        )
    }

    /// Make `state` the process-wide default. Only the first call wins.
    pub fn install(state: &Arc<ProcessState>) -> bool {
        let installed = INSTALLED.set(Arc::clone(state)).is_ok();
        if installed {
            info!(target: "tierstate::registry", "Installed process-wide state");
        }
        installed
    }

    /// The installed process-wide default, if any.
    pub fn global() -> Option<&'static Arc<ProcessState>> {
        INSTALLED.get()
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn constants(&self) -> &'static Builtins {
        self.constants
    }

    /// Raw access to the global tier.
    pub fn vars(&self) -> &GlobalVars {
        &self.vars
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn token(&self) -> u64 {
        self.vars.thread_key().token()
    }

    #[inline]
    fn ensure_live(&self) -> Result<(), StateError> {
        if self.phase() == Phase::ShutDown {
            return Err(StateError::ProcessShutDown);
        }
        Ok(())
    }

    fn ensure_owned(&self, instance: &Instance) -> Result<(), StateError> {
        if instance.owner() != self.token() {
            return Err(StateError::ForeignInstance(instance.id()));
        }
        Ok(())
    }

    fn run_hooks(&self, event: HookEvent, instance: &Instance) -> Result<(), StateError> {
        let hooks = self.vars.hooks().read_with(|hooks| hooks.snapshot(event))?;
        for hook in hooks {
            hook(instance);
        }
        Ok(())
    }

    /// Create an instance with fresh per-instance state and register it.
    ///
    /// The first instance ever created becomes the initial instance and
    /// ends the startup phase.
    pub fn create_instance(&self) -> Result<Arc<Instance>, StateError> {
        self.register(None)
    }

    /// Create an instance spawned from `parent`. The child gets fresh
    /// per-instance state; only the relationship is recorded.
    pub fn spawn_child(&self, parent: &Instance) -> Result<Arc<Instance>, StateError> {
        self.ensure_owned(parent)?;
        if !parent.is_alive() {
            return Err(StateError::InstanceDestroyed(parent.id()));
        }
        self.register(Some(parent.id()))
    }

    fn register(&self, parent: Option<InstanceId>) -> Result<Arc<Instance>, StateError> {
        self.ensure_live()?;
        let instance = Arc::new(Instance::new(self.token(), parent, InstanceVars::new()));

        self.vars.registry().with(|registry| {
            // Shutdown flips the phase under this lock.
            self.ensure_live()?;
            if self.max_instances > 0 && registry.len() >= self.max_instances {
                return Err(StateError::InstanceLimit(self.max_instances));
            }
            registry.insert(Arc::clone(&instance));
            let _ = self.phase.compare_exchange(
                Phase::Startup.as_u8(),
                Phase::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            Ok(())
        })??;

        debug!(
            target: "tierstate::registry",
            instance = %instance.id(),
            parent = ?parent,
            "Created instance"
        );
        self.run_hooks(HookEvent::Created, &instance)?;
        Ok(instance)
    }

    /// Unregister an instance and tear it down.
    ///
    /// Destroy hooks run while the instance is still reachable, then the
    /// instance is marked dead. Bindings on other threads observe
    /// `InstanceDestroyed` on their next access.
    pub fn destroy_instance(&self, instance: &Instance) -> Result<(), StateError> {
        self.ensure_live()?;
        self.ensure_owned(instance)?;
        let id = instance.id();
        let removed = self.vars.registry().with(|registry| registry.remove(id))?;
        let Some(removed) = removed else {
            return Err(StateError::InstanceDestroyed(id));
        };
        self.teardown(&removed)?;
        debug!(target: "tierstate::registry", instance = %id, "Destroyed instance");
        Ok(())
    }

    fn teardown(&self, instance: &Instance) -> Result<(), StateError> {
        let hooks = self.run_hooks(HookEvent::Destroyed, instance);
        instance.mark_destroyed();
        let key = self.vars.thread_key();
        if thread::state(key) == BindingState::Stale(instance.id()) {
            if let Err(err) = thread::release(key) {
                debug!(
                    target: "tierstate::binding",
                    instance = %instance.id(),
                    error = %err,
                    "Left stale binding in place"
                );
            }
        }
        hooks
    }

    /// Ids of every live instance, in creation order.
    pub fn instances(&self) -> Result<Vec<InstanceId>, StateError> {
        self.ensure_live()?;
        self.vars.registry().with(|registry| registry.ids())
    }

    pub fn instance_count(&self) -> Result<usize, StateError> {
        self.ensure_live()?;
        self.vars.registry().with(|registry| registry.len())
    }

    pub fn instance(&self, id: InstanceId) -> Result<Option<Arc<Instance>>, StateError> {
        self.ensure_live()?;
        self.vars.registry().with(|registry| registry.get(id))
    }

    /// The initial instance, unless it has been destroyed.
    pub fn initial_instance(&self) -> Result<Option<Arc<Instance>>, StateError> {
        self.ensure_live()?;
        self.vars
            .registry()
            .with(|registry| registry.initial().and_then(|id| registry.get(id)))
    }

    /// Bind the calling thread to `instance`, creating its per-thread state
    /// on first use. Re-binding to the same instance returns the existing
    /// binding; binding to another instance releases the current one.
    pub fn bind_current_thread(
        &self,
        instance: &Arc<Instance>,
    ) -> Result<ThreadStateHandle, StateError> {
        self.ensure_live()?;
        self.ensure_owned(instance)?;
        if !instance.is_alive() {
            return Err(StateError::InstanceDestroyed(instance.id()));
        }
        thread::bind(self.vars.thread_key(), instance)
    }

    /// Detach the calling thread from its instance. Per-thread state is
    /// dropped, except persistent fields, which wait for the same thread to
    /// bind to the same instance again.
    pub fn release_current_thread(&self) -> Result<Option<InstanceId>, StateError> {
        self.ensure_live()?;
        thread::release(self.vars.thread_key())
    }

    /// The instance the calling thread is bound to. Takes no lock.
    #[inline]
    pub fn current(&self) -> Result<Arc<Instance>, StateError> {
        self.ensure_live()?;
        thread::current(self.vars.thread_key())
    }

    /// Handle to the calling thread's current binding.
    pub fn current_thread(&self) -> Result<ThreadStateHandle, StateError> {
        self.ensure_live()?;
        thread::handle(self.vars.thread_key())
    }

    pub fn binding_state(&self) -> BindingState {
        thread::state(self.vars.thread_key())
    }

    /// Run `f` on the per-instance variables of the current instance.
    pub fn with_instance<R>(
        &self,
        f: impl FnOnce(&mut InstanceVars) -> R,
    ) -> Result<R, StateError> {
        self.current()?.with_vars(f)
    }

    /// Run `f` on the calling thread's per-thread variables.
    pub fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadVars) -> R) -> Result<R, StateError> {
        self.current_thread()?.with(f)
    }

    pub fn on_instance_created(
        &self,
        hook: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> Result<HookId, StateError> {
        self.ensure_live()?;
        self.vars
            .hooks()
            .update(|hooks| hooks.register(HookEvent::Created, Arc::new(hook)))
    }

    pub fn on_instance_destroyed(
        &self,
        hook: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> Result<HookId, StateError> {
        self.ensure_live()?;
        self.vars
            .hooks()
            .update(|hooks| hooks.register(HookEvent::Destroyed, Arc::new(hook)))
    }

    pub fn remove_hook(&self, id: HookId) -> Result<bool, StateError> {
        self.ensure_live()?;
        self.vars.hooks().update(|hooks| hooks.remove(id))
    }

    // The phase leaves Startup under the registry lock; so does every write.
    fn write_startup_flag(
        &self,
        field: &'static str,
        flag: &Flag,
        value: bool,
    ) -> Result<(), StateError> {
        self.vars.registry().with(|_| match self.phase() {
            Phase::Startup => {
                flag.set(value);
                Ok(())
            }
            Phase::Running => Err(StateError::StartupSealed(field)),
            Phase::ShutDown => Err(StateError::ProcessShutDown),
        })?
    }

    pub fn do_undump(&self) -> bool {
        self.vars.do_undump().get()
    }

    /// Only valid before the first instance exists.
    pub fn set_do_undump(&self, value: bool) -> Result<(), StateError> {
        self.write_startup_flag("do_undump", self.vars.do_undump(), value)
    }

    pub fn early_taint(&self) -> bool {
        self.vars.early_taint().get()
    }

    /// Only valid before the first instance exists.
    pub fn set_early_taint(&self, value: bool) -> Result<(), StateError> {
        self.write_startup_flag("early_taint", self.vars.early_taint(), value)
    }

    pub fn sh_path(&self) -> Result<String, StateError> {
        self.ensure_live()?;
        self.vars.sh_path().read()
    }

    /// Replace the shell path, returning the previous one.
    pub fn set_sh_path(&self, path: impl Into<String>) -> Result<String, StateError> {
        self.ensure_live()?;
        self.vars.sh_path().write(path.into())
    }

    pub fn program_name(&self) -> Result<String, StateError> {
        self.ensure_live()?;
        self.vars.program_name().read()
    }

    /// Replace the program name, returning the previous one.
    pub fn set_program_name(&self, name: impl Into<String>) -> Result<String, StateError> {
        self.ensure_live()?;
        self.vars.program_name().write(name.into())
    }

    #[cfg(feature = "threads")]
    pub fn op_refcnt_inc(&self, op: OpId) -> Result<usize, StateError> {
        self.ensure_live()?;
        self.vars.op_refcounts().with(|table| table.inc(op))
    }

    #[cfg(feature = "threads")]
    pub fn op_refcnt_dec(&self, op: OpId) -> Result<usize, StateError> {
        self.ensure_live()?;
        self.vars.op_refcounts().with(|table| table.dec(op))
    }

    #[cfg(all(feature = "tracked-alloc", feature = "threads"))]
    pub fn record_alloc(&self, bytes: usize) -> Result<(), StateError> {
        self.ensure_live()?;
        self.vars.alloc_stats().with(|stats| stats.record_alloc(bytes))
    }

    #[cfg(all(feature = "tracked-alloc", feature = "threads"))]
    pub fn record_free(&self, bytes: usize) -> Result<(), StateError> {
        self.ensure_live()?;
        self.vars.alloc_stats().with(|stats| stats.record_free(bytes))
    }

    #[cfg(all(feature = "tracked-alloc", feature = "threads"))]
    pub fn alloc_stats(&self) -> Result<AllocStats, StateError> {
        self.ensure_live()?;
        self.vars.alloc_stats().read()
    }

    /// Destroy every instance, newest first, and release the thread key.
    /// Returns the number of instances torn down.
    pub fn shutdown(&self) -> Result<usize, StateError> {
        let drained = self.vars.registry().with(|registry| {
            if self.phase() == Phase::ShutDown {
                return Err(StateError::ProcessShutDown);
            }
            self.phase.store(Phase::ShutDown.as_u8(), Ordering::Release);
            Ok(registry.drain())
        })??;

        let count = drained.len();
        let mut first_err = None;
        for instance in &drained {
            if let Err(err) = self.teardown(instance) {
                first_err.get_or_insert(err);
            }
        }
        self.vars.thread_key().release();
        info!(target: "tierstate::registry", instances = count, "Process state shut down");
        match first_err {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }
}

impl Drop for ProcessState {
    fn drop(&mut self) {
        self.vars.thread_key().release();
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("phase", &self.phase())
            .field("thread_key", self.vars.thread_key())
            .field("fields", &self.policy.len())
            .finish()
    }
}
