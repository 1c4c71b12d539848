//! Integration tests for instance isolation and thread binding.
//!
//! These tests verify:
//! - Per-instance writes never leak into another instance
//! - Per-thread state is private to one (thread, instance) binding
//! - Unbound accessors fail instead of picking an instance
//! - A binding to an instance destroyed elsewhere is Stale until released
//! - Lifecycle hooks see each instance exactly once on each edge
//! - Configuration seeds the global tier

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use tierstate::config::RuntimeConfig;
use tierstate::state::{BindingState, Instance, InstanceId, ProcessState, StateError};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

#[test]
fn test_instances_do_not_share_state() {
    let process = ProcessState::with_defaults().unwrap();
    let a = process.create_instance().unwrap();
    let b = process.create_instance().unwrap();

    process.bind_current_thread(&a).unwrap();
    process.with_instance(|vars| vars.set_tainting(true)).unwrap();
    process.with_instance(|vars| vars.set_sv_count(100)).unwrap();

    process.bind_current_thread(&b).unwrap();
    let (tainting, count) = process
        .with_instance(|vars| (*vars.tainting(), *vars.sv_count()))
        .unwrap();
    assert!(!tainting);
    assert_eq!(count, 0);

    assert!(a.with_vars(|vars| *vars.tainting()).unwrap());
}

#[test]
fn test_child_instance_starts_fresh() {
    let process = ProcessState::with_defaults().unwrap();
    let parent = process.create_instance().unwrap();
    parent.with_vars(|vars| vars.set_exit_code(7)).unwrap();

    let child = process.spawn_child(&parent).unwrap();
    assert_eq!(child.parent(), Some(parent.id()));
    assert_eq!(child.with_vars(|vars| *vars.exit_code()).unwrap(), 0);
}

#[test]
fn test_thread_state_private_to_thread() {
    let process = ProcessState::with_defaults().unwrap();
    let instance = process.create_instance().unwrap();
    process.bind_current_thread(&instance).unwrap();
    process
        .with_thread(|vars| vars.set_last_error(Some("main".to_string())))
        .unwrap();

    let worker_process = Arc::clone(&process);
    let worker_instance = Arc::clone(&instance);
    let seen = thread::spawn(move || {
        assert_eq!(
            worker_process.with_thread(|_| ()).unwrap_err(),
            StateError::NoActiveInstance
        );
        worker_process.bind_current_thread(&worker_instance).unwrap();
        worker_process
            .with_thread(|vars| vars.last_error().clone())
            .unwrap()
    })
    .join()
    .unwrap();

    assert_eq!(seen, None);
    let mine = process.with_thread(|vars| vars.last_error().clone()).unwrap();
    assert_eq!(mine.as_deref(), Some("main"));
}

#[test]
fn test_no_silent_fallback_to_initial_instance() {
    let process = ProcessState::with_defaults().unwrap();
    let initial = process.create_instance().unwrap();
    assert_eq!(
        process.initial_instance().unwrap().map(|i| i.id()),
        Some(initial.id())
    );

    // An initial instance exists, but this thread never bound to it.
    assert_eq!(process.current().unwrap_err(), StateError::NoActiveInstance);
    assert_eq!(
        process.with_instance(|_| ()).unwrap_err(),
        StateError::NoActiveInstance
    );
    assert_eq!(process.binding_state(), BindingState::Unbound);
}

#[test]
fn test_release_then_rebind() {
    let process = ProcessState::with_defaults().unwrap();
    let instance = process.create_instance().unwrap();

    let handle = process.bind_current_thread(&instance).unwrap();
    handle
        .with(|vars| {
            vars.set_stack_depth(4);
            vars.set_locale(Some("ja_JP".to_string()));
        })
        .unwrap();
    assert_eq!(process.release_current_thread().unwrap(), Some(instance.id()));
    assert_eq!(handle.with(|_| ()).unwrap_err(), StateError::NoActiveInstance);

    process.bind_current_thread(&instance).unwrap();
    let (depth, locale) = process
        .with_thread(|vars| (*vars.stack_depth(), vars.locale().clone()))
        .unwrap();
    assert_eq!(depth, 0);
    assert_eq!(locale.as_deref(), Some("ja_JP"));
}

#[test]
fn test_destroy_from_another_thread_invalidates_binding() {
    let process = ProcessState::with_defaults().unwrap();
    let instance = process.create_instance().unwrap();
    process.bind_current_thread(&instance).unwrap();

    let other = Arc::clone(&process);
    let target = Arc::clone(&instance);
    thread::spawn(move || other.destroy_instance(&target).unwrap())
        .join()
        .unwrap();

    assert_eq!(
        process.current().unwrap_err(),
        StateError::InstanceDestroyed(instance.id())
    );
    assert_eq!(process.binding_state(), BindingState::Stale(instance.id()));
    assert_eq!(
        process.bind_current_thread(&instance).unwrap_err(),
        StateError::InstanceDestroyed(instance.id())
    );

    // Binding elsewhere replaces the stale binding.
    let fresh = process.create_instance().unwrap();
    process.bind_current_thread(&fresh).unwrap();
    assert_eq!(process.current().unwrap().id(), fresh.id());
}

#[test]
fn test_stale_binding_behaves_as_unbound() {
    let process = ProcessState::with_defaults().unwrap();
    let instance = process.create_instance().unwrap();
    let handle = process.bind_current_thread(&instance).unwrap();
    handle.with(|vars| vars.set_stack_depth(9)).unwrap();

    let other = Arc::clone(&process);
    let target = Arc::clone(&instance);
    thread::spawn(move || other.destroy_instance(&target).unwrap())
        .join()
        .unwrap();

    // A binding whose instance was torn down elsewhere is reported as Stale
    // rather than Unbound, and access names the destroyed instance instead
    // of NoActiveInstance. It never yields the old storage.
    assert_eq!(process.binding_state(), BindingState::Stale(instance.id()));
    assert_eq!(
        handle.with(|vars| *vars.stack_depth()).unwrap_err(),
        StateError::InstanceDestroyed(instance.id())
    );
    assert_eq!(
        process.with_thread(|_| ()).unwrap_err(),
        StateError::InstanceDestroyed(instance.id())
    );

    // Releasing it completes the move to Unbound.
    assert_eq!(process.release_current_thread().unwrap(), Some(instance.id()));
    assert_eq!(process.binding_state(), BindingState::Unbound);
    assert_eq!(process.current().unwrap_err(), StateError::NoActiveInstance);
    assert_eq!(handle.with(|_| ()).unwrap_err(), StateError::NoActiveInstance);
}

#[test]
fn test_lifecycle_hooks_follow_instances() {
    let process = ProcessState::with_defaults().unwrap();
    let events: Arc<Mutex<Vec<(&'static str, InstanceId)>>> = Arc::new(Mutex::new(Vec::new()));

    let created = Arc::clone(&events);
    process
        .on_instance_created(move |inst: &Instance| {
            created.lock().unwrap().push(("created", inst.id()));
        })
        .unwrap();
    let destroyed = Arc::clone(&events);
    process
        .on_instance_destroyed(move |inst: &Instance| {
            destroyed.lock().unwrap().push(("destroyed", inst.id()));
        })
        .unwrap();

    let a = process.create_instance().unwrap();
    let b = process.create_instance().unwrap();
    process.destroy_instance(&a).unwrap();
    assert_eq!(process.shutdown().unwrap(), 1);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ("created", a.id()),
            ("created", b.id()),
            ("destroyed", a.id()),
            ("destroyed", b.id()),
        ]
    );
}

#[test]
fn test_config_seeds_globals() {
    let config = RuntimeConfig::load(&fixtures_dir().join("config.toml")).unwrap();
    let process = ProcessState::new(&config).unwrap();

    assert_eq!(process.sh_path().unwrap(), "/usr/bin/dash");
    assert_eq!(process.program_name().unwrap(), "fixture");

    for _ in 0..4 {
        process.create_instance().unwrap();
    }
    assert_eq!(
        process.create_instance().unwrap_err(),
        StateError::InstanceLimit(4)
    );
}

#[test]
fn test_constants_compare_by_identity() {
    let process = ProcessState::with_defaults().unwrap();
    let constants = process.constants();
    let yes = constants.registry().lookup::<String>("Yes").unwrap();

    assert!(yes.same(&constants.yes));
    assert!(!constants.yes.same(&constants.no));
    assert_eq!(constants.hexdigit.get().len(), 32);
}
