//! Loader and dispatcher behaviour against a runtime with native and
//! discovered modules.

#![cfg(unix)]

mod common;

use common::{events, native, Fixture, Probe};
use hatch_common::module::RegistrySnapshot;
use hatch_common::{BatchFailurePolicy, HatchError, Runtime};

fn names(events: &common::Events) -> Vec<String> {
    events.borrow().clone()
}

#[test]
fn test_load_is_idempotent() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("config", &ev), &[], &[])).unwrap();

    assert_eq!(rt.load(&["config"]).unwrap(), vec!["config"]);
    assert!(rt.load(&["config"]).unwrap().is_empty());

    assert_eq!(rt.registry().loaded(), ["config"]);
    assert_eq!(names(&ev), vec!["init config"]);
}

#[test]
fn test_load_orders_dependencies_first() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("monitor", &ev), &["service"], &[])).unwrap();
    rt.register(native(Probe::new("service", &ev), &["config"], &[])).unwrap();
    rt.register(native(Probe::new("config", &ev), &[], &[])).unwrap();

    let loaded = rt.load(&["monitor"]).unwrap();
    assert_eq!(loaded, vec!["config", "service", "monitor"]);
    assert_eq!(
        names(&ev),
        vec!["init config", "init service", "init monitor"]
    );
}

#[test]
fn test_capability_auto_loads_once() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("config", &ev), &[], &["config_get"])).unwrap();

    let out = rt.invoke("config_get", &["port".to_string()]).unwrap();
    assert_eq!(out.stdout, "config_get port");
    rt.invoke("config_get", &[]).unwrap();

    assert_eq!(
        names(&ev),
        vec!["init config", "call config_get", "call config_get"]
    );
}

#[test]
fn test_cycle_loads_nothing() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("leaf", &ev), &[], &[])).unwrap();
    rt.register(native(Probe::new("a", &ev), &["leaf", "b"], &[])).unwrap();
    rt.register(native(Probe::new("b", &ev), &["a"], &[])).unwrap();

    let err = rt.load(&["a"]).unwrap_err();
    match err {
        HatchError::CyclicDependency { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(rt.registry().loaded().is_empty());
    assert!(names(&ev).is_empty());
}

#[test]
fn test_missing_dependency() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("monitor", &ev), &["service"], &[])).unwrap();

    let err = rt.load(&["monitor"]).unwrap_err();
    assert_eq!(err.exit_code(), hatch_common::error::EXIT_MISSING_DEPENDENCY);
    assert!(rt.registry().loaded().is_empty());
}

#[test]
fn test_capability_resolution_errors() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("a", &ev), &[], &["shared"])).unwrap();
    rt.register(native(Probe::new("b", &ev), &[], &["shared"])).unwrap();

    match rt.invoke("shared", &[]).unwrap_err() {
        HatchError::AmbiguousCapability { modules, .. } => assert_eq!(modules, vec!["a", "b"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        rt.invoke("nothing", &[]),
        Err(HatchError::UnknownCapability(_))
    ));
    assert!(names(&ev).is_empty());
}

#[test]
fn test_failing_capability_body() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("a", &ev), &[], &["do_fail"])).unwrap();

    match rt.invoke("do_fail", &[]).unwrap_err() {
        HatchError::CapabilityFailed { module, .. } => assert_eq!(module, "a"),
        other => panic!("unexpected error: {other}"),
    }
    // The module itself loaded fine
    assert!(rt.registry().is_loaded("a"));
}

#[test]
fn test_verify_failure_aborts_batch_keeping_siblings() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("config", &ev), &[], &[])).unwrap();
    let mut broken = Probe::new("service", &ev);
    broken.fail_verify = true;
    rt.register(native(broken, &["config"], &[])).unwrap();
    rt.register(native(Probe::new("monitor", &ev), &["service"], &[])).unwrap();

    let err = rt.load(&["monitor"]).unwrap_err();
    assert!(matches!(
        err,
        HatchError::ModuleVerificationFailed { ref module, .. } if module == "service"
    ));
    assert_eq!(rt.registry().loaded(), ["config"]);
    assert_eq!(names(&ev), vec!["init config"]);

    // The failed batch was persisted
    let snapshot = RegistrySnapshot::load(&fx.layout.registry_file())
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.loaded, vec!["config"]);
}

#[test]
fn test_unwind_policy_cleans_up_batch() {
    let fx = Fixture::new();
    let ev = events();
    let mut config = fx.config();
    config.modules.on_batch_failure = BatchFailurePolicy::Unwind;
    let mut rt = Runtime::new(fx.layout.clone(), config);

    rt.register(native(Probe::new("config", &ev), &[], &[])).unwrap();
    rt.register(native(Probe::new("service", &ev), &["config"], &[])).unwrap();
    let mut broken = Probe::new("monitor", &ev);
    broken.fail_init = true;
    rt.register(native(broken, &["service"], &[])).unwrap();

    let err = rt.load(&["monitor"]).unwrap_err();
    assert!(matches!(err, HatchError::ModuleInitFailed { .. }));
    assert!(rt.registry().loaded().is_empty());
    assert_eq!(
        names(&ev),
        vec![
            "init config",
            "init service",
            "cleanup service",
            "cleanup config"
        ]
    );
}

#[test]
fn test_unload_with_dependents() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    rt.register(native(Probe::new("config", &ev), &[], &[])).unwrap();
    rt.register(native(Probe::new("service", &ev), &["config"], &[])).unwrap();
    rt.register(native(Probe::new("monitor", &ev), &["service"], &[])).unwrap();
    rt.load(&["monitor"]).unwrap();
    ev.borrow_mut().clear();

    match rt.unload("config", false).unwrap_err() {
        HatchError::DependentModulesActive { dependents, .. } => {
            assert_eq!(dependents, vec!["service", "monitor"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(rt.registry().loaded().len(), 3);

    let unloaded = rt.unload("config", true).unwrap();
    assert_eq!(unloaded, vec!["monitor", "service", "config"]);
    assert_eq!(
        names(&ev),
        vec!["cleanup monitor", "cleanup service", "cleanup config"]
    );
    assert!(rt.registry().loaded().is_empty());

    // Not loaded any more: no-op
    assert!(rt.unload("config", false).unwrap().is_empty());
}

#[test]
fn test_failing_cleanup_keeps_module_loaded() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    let mut sticky = Probe::new("sticky", &ev);
    sticky.fail_cleanup = true;
    rt.register(native(sticky, &[], &[])).unwrap();
    rt.load(&["sticky"]).unwrap();

    assert!(matches!(
        rt.unload("sticky", false),
        Err(HatchError::ModuleCleanupFailed { .. })
    ));
    assert!(rt.registry().is_loaded("sticky"));
}

#[test]
fn test_nested_auto_load_from_init() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    let mut app = Probe::new("app", &ev);
    app.init_calls = Some("log_write".to_string());
    rt.register(native(app, &[], &["app_run"])).unwrap();
    rt.register(native(Probe::new("logger", &ev), &[], &["log_write"])).unwrap();

    rt.invoke("app_run", &[]).unwrap();

    assert_eq!(rt.registry().loaded(), ["logger", "app"]);
    assert_eq!(
        names(&ev),
        vec!["init logger", "call log_write", "init app", "call app_run"]
    );
}

#[test]
fn test_nested_load_cycle_terminates() {
    let fx = Fixture::new();
    let ev = events();
    let mut rt = fx.runtime();
    // a's init needs b, which cannot load before a
    let mut a = Probe::new("a", &ev);
    a.init_calls = Some("b_cap".to_string());
    rt.register(native(a, &[], &["a_cap"])).unwrap();
    rt.register(native(Probe::new("b", &ev), &["a"], &["b_cap"])).unwrap();

    let err = rt.invoke("a_cap", &[]).unwrap_err();
    match err {
        HatchError::ModuleInitFailed { module, reason, .. } => {
            assert_eq!(module, "a");
            assert!(reason.contains("dependency cycle: a -> b -> a"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(rt.registry().loaded().is_empty());
}

#[test]
fn test_discovered_modules_run_commands() {
    let fx = Fixture::new();
    fx.release("1.0.0")
        .module("config", &[], &["config_get"])
        .module("service", &["config"], &["service_status"])
        .write();
    fx.install("1.0.0");

    let mut rt = Runtime::open(fx.layout.clone(), fx.config()).unwrap();
    let out = rt
        .invoke("service_status", &["--brief".to_string()])
        .unwrap();
    assert!(out.success());
    assert_eq!(out.stdout.trim(), "service_status --brief");
    assert_eq!(rt.registry().loaded(), ["config", "service"]);
    assert_eq!(fx.hooks_log(), vec!["init config", "init service"]);

    // A fresh process picks up what is already loaded
    let mut rt = Runtime::open(fx.layout.clone(), fx.config()).unwrap();
    assert_eq!(rt.registry().loaded(), ["config", "service"]);
    rt.invoke("config_get", &[]).unwrap();
    assert_eq!(fx.hooks_log().len(), 2);

    rt.unload("config", true).unwrap();
    assert_eq!(
        fx.hooks_log()[2..],
        ["cleanup service".to_string(), "cleanup config".to_string()]
    );
}

#[test]
fn test_native_version_conflict_with_discovered() {
    let fx = Fixture::new();
    fx.release("1.0.0").module("config", &[], &[]).write();
    fx.install("1.0.0");

    let ev = events();
    let mut rt = Runtime::open(fx.layout.clone(), fx.config()).unwrap();
    let conflicting = hatch_common::ModuleDescriptor::new(
        "config",
        semver::Version::new(2, 0, 0),
        Probe::new("config", &ev),
    );
    assert!(matches!(
        rt.register(conflicting.clone()),
        Err(HatchError::DuplicateModule { .. })
    ));
    rt.register_override(conflicting).unwrap();
    assert_eq!(
        rt.registry().get("config").unwrap().version,
        semver::Version::new(2, 0, 0)
    );
}
