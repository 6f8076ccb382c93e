//! Loading, capability checks and dispatch into wasm modules.

use std::fs;
use std::path::{Path, PathBuf};

use veil::lifecycle::{AttachContext, ModuleId};
use veil::loader::{LoadError, ModuleLoader};

const PLUGIN_WAT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/plugin.wat"));

const METHODS: [(&str, &str); 10] = [
    ("attach", "(param i32 i32 i32)"),
    ("on_create", "(param i32 i32 i32)"),
    ("on_start", "(param i32)"),
    ("on_resume", "(param i32)"),
    ("on_pause", "(param i32)"),
    ("on_stop", "(param i32)"),
    ("on_destroy", "(param i32)"),
    ("on_back_pressed", "(param i32)"),
    ("can_exit", "(param i32) (result i32)"),
    ("on_activity_result", "(param i32 i32 i32 i32 i32)"),
];

/// Build a module for `entry` whose constructor returns `handle`, skipping
/// the lifecycle exports named in `omit`.
fn module_wat(entry: &str, handle: i32, omit: &[&str]) -> String {
    let mut wat = String::from(
        "(module\n  (memory (export \"memory\") 1)\n  (func (export \"alloc\") (param i32) (result i32) i32.const 1024)\n",
    );
    wat.push_str(&format!(
        "  (func (export \"{entry}.new\") (result i32) i32.const {handle})\n"
    ));
    for (method, sig) in METHODS {
        if omit.contains(&method) {
            continue;
        }
        let body = if method == "can_exit" { "i32.const 1" } else { "" };
        wat.push_str(&format!(
            "  (func (export \"{entry}.{method}\") {sig} {body})\n"
        ));
    }
    wat.push(')');
    wat
}

fn write_artifact(dir: &Path, wat: &str) -> PathBuf {
    let path = dir.join("plugin.wasm");
    fs::write(&path, wat).expect("write artifact");
    path
}

fn loader(dir: &Path) -> ModuleLoader {
    ModuleLoader::new(dir.join("module_opt")).expect("loader")
}

#[test]
fn generated_module_loads_and_allows_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = write_artifact(dir.path(), &module_wat("com.example.Dyn", 3, &[]));

    let mut module = loader(dir.path())
        .load(&artifact, &ModuleId::new("com.example.Dyn"))
        .expect("load");
    module.attach(&AttachContext::new()).expect("attach");
    module.on_create(None).expect("create");
    module.on_back_pressed().expect("back");
    assert!(module.can_exit().expect("can_exit"));
}

#[test]
fn missing_lifecycle_export_is_capability_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = write_artifact(dir.path(), &module_wat("plugin", 1, &["can_exit"]));

    let err = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .err()
        .expect("capability missing");
    match err {
        LoadError::CapabilityMissing { export, .. } => assert_eq!(export, "plugin.can_exit"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mistyped_export_is_capability_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wat = module_wat("plugin", 1, &["on_start"]).replace(
        "\n)",
        "\n  (func (export \"plugin.on_start\") (param i32 i32))\n)",
    );
    let artifact = write_artifact(dir.path(), &wat);

    let err = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .err()
        .expect("mistyped");
    assert!(
        matches!(err, LoadError::CapabilityMissing { ref export, .. } if export == "plugin.on_start")
    );
}

#[test]
fn negative_constructor_handle_is_instantiation_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = write_artifact(dir.path(), &module_wat("plugin", -1, &[]));

    let err = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .err()
        .expect("constructor refused");
    assert!(matches!(err, LoadError::Instantiation { .. }));
}

#[test]
fn unsatisfied_import_is_instantiation_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let wat = module_wat("plugin", 1, &[]).replacen(
        "(module\n",
        "(module\n  (import \"env\" \"host_secret\" (func))\n",
        1,
    );
    let artifact = write_artifact(dir.path(), &wat);

    let err = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .err()
        .expect("link failure");
    assert!(matches!(err, LoadError::Instantiation { .. }));
}

#[test]
fn trapping_start_function_fails_before_capability_checks() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Incomplete on purpose: the start trap must win over the missing export.
    let wat = module_wat("plugin", 1, &["can_exit"]).replacen(
        "(module\n",
        "(module\n  (func $boot unreachable)\n  (start $boot)\n",
        1,
    );
    let artifact = write_artifact(dir.path(), &wat);

    let err = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .err()
        .expect("start trapped");
    assert!(matches!(err, LoadError::Instantiation { .. }), "{err}");
}

#[test]
fn missing_artifact_is_unreadable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = loader(dir.path())
        .load(&dir.path().join("absent.wasm"), &ModuleId::new("plugin"))
        .err()
        .expect("absent");
    assert!(matches!(err, LoadError::ArtifactUnreadable { .. }));
}

#[test]
fn demo_module_logs_through_host_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = write_artifact(dir.path(), PLUGIN_WAT);

    let mut module = loader(dir.path())
        .load(&artifact, &ModuleId::new("plugin"))
        .expect("load");
    module
        .attach(&AttachContext::new().with_param("url", "https://example.invalid"))
        .expect("attach");
    module.on_start().expect("start");
    module.on_resume().expect("resume");
    module.on_pause().expect("pause");
    module.on_stop().expect("stop");
    module.on_destroy().expect("destroy");
}

#[test]
fn reloading_uses_same_scratch_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = write_artifact(dir.path(), PLUGIN_WAT);

    for _ in 0..2 {
        let loader = loader(dir.path());
        assert!(loader.scratch_dir().is_dir());
        loader
            .load(&artifact, &ModuleId::new("plugin"))
            .expect("load");
    }
}
