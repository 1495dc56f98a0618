//! Precedence and file-resolution tests for `SwitchyardConfig::load_from`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use switchyard_config::{CliOverrides, ConfigError, SwitchyardConfig};
use tempfile::TempDir;

const PROJECT_TOML: &str = r#"
[gateway]
call_timeout_ms = 1000

[[children]]
name = "project"
command = "project-server"
cwd = "servers"
"#;

const GLOBAL_TOML: &str = r#"
[gateway]
call_timeout_ms = 2000

[[children]]
name = "global"
command = "global-server"
"#;

struct Dirs {
    _root: TempDir,
    work: PathBuf,
    global: PathBuf,
}

fn dirs() -> Dirs {
    let root = TempDir::new().unwrap();
    let work = root.path().join("work");
    let global = root.path().join("global");
    fs::create_dir_all(&work).unwrap();
    fs::create_dir_all(&global).unwrap();
    Dirs {
        _root: root,
        work,
        global,
    }
}

fn load(
    dirs: &Dirs,
    overrides: CliOverrides,
    env: &[(&str, &str)],
) -> Result<SwitchyardConfig, ConfigError> {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    SwitchyardConfig::load_from(overrides, &dirs.work, &dirs.global, |key| {
        env.get(key).cloned()
    })
}

fn child_names(config: &SwitchyardConfig) -> Vec<&str> {
    config.children.iter().map(|c| c.name.as_str()).collect()
}

#[test]
fn no_files_yields_empty_defaults() {
    let dirs = dirs();
    let config = load(&dirs, CliOverrides::default(), &[]).unwrap();
    assert!(config.children.is_empty());
    assert!(config.source.is_none());
    assert_eq!(config.settings.call_timeout_ms, 30_000);
}

#[test]
fn global_file_is_used_when_no_project_file() {
    let dirs = dirs();
    fs::write(dirs.global.join("config.toml"), GLOBAL_TOML).unwrap();
    let config = load(&dirs, CliOverrides::default(), &[]).unwrap();
    assert_eq!(child_names(&config), ["global"]);
    assert_eq!(config.settings.call_timeout_ms, 2000);
}

#[test]
fn project_file_beats_global_file() {
    let dirs = dirs();
    fs::write(dirs.global.join("config.toml"), GLOBAL_TOML).unwrap();
    fs::write(dirs.work.join("switchyard.toml"), PROJECT_TOML).unwrap();
    let config = load(&dirs, CliOverrides::default(), &[]).unwrap();
    assert_eq!(child_names(&config), ["project"]);
    assert_eq!(config.source.as_deref(), Some(dirs.work.join("switchyard.toml").as_path()));
}

#[test]
fn env_config_beats_project_file_and_cli_beats_env() {
    let dirs = dirs();
    fs::write(dirs.work.join("switchyard.toml"), PROJECT_TOML).unwrap();
    let global_path = dirs.global.join("config.toml");
    fs::write(&global_path, GLOBAL_TOML).unwrap();
    let env_path = global_path.to_string_lossy().to_string();
    let env_path = env_path.as_str();

    let config = load(
        &dirs,
        CliOverrides::default(),
        &[("SWITCHYARD_CONFIG", env_path)],
    )
    .unwrap();
    assert_eq!(child_names(&config), ["global"]);

    let overrides = CliOverrides {
        config_path: Some(PathBuf::from("switchyard.toml")),
        ..CliOverrides::default()
    };
    let config = load(&dirs, overrides, &[("SWITCHYARD_CONFIG", env_path)]).unwrap();
    assert_eq!(child_names(&config), ["project"]);
}

#[test]
fn call_timeout_precedence() {
    let dirs = dirs();
    fs::write(dirs.work.join("switchyard.toml"), PROJECT_TOML).unwrap();

    let config = load(&dirs, CliOverrides::default(), &[]).unwrap();
    assert_eq!(config.settings.call_timeout_ms, 1000);

    let env = [("SWITCHYARD_CALL_TIMEOUT_MS", "1500")];
    let config = load(&dirs, CliOverrides::default(), &env).unwrap();
    assert_eq!(config.settings.call_timeout_ms, 1500);

    let overrides = CliOverrides {
        call_timeout_ms: Some(250),
        ..CliOverrides::default()
    };
    let config = load(&dirs, overrides, &env).unwrap();
    assert_eq!(config.settings.call_timeout_ms, 250);
}

#[test]
fn bad_timeout_env_is_rejected() {
    let dirs = dirs();
    let err = load(
        &dirs,
        CliOverrides::default(),
        &[("SWITCHYARD_CALL_TIMEOUT_MS", "soon")],
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SWITCHYARD_CALL_TIMEOUT_MS"));
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dirs = dirs();
    let overrides = CliOverrides {
        config_path: Some(dirs.work.join("nope.toml")),
        ..CliOverrides::default()
    };
    assert!(matches!(
        load(&dirs, overrides, &[]),
        Err(ConfigError::Read { .. })
    ));
}

#[test]
fn malformed_file_is_an_error() {
    let dirs = dirs();
    fs::write(dirs.work.join("switchyard.toml"), "[[children]\nname = ").unwrap();
    let err = load(&dirs, CliOverrides::default(), &[]).unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert!(path.ends_with("switchyard.toml")),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[test]
fn relative_cwd_resolves_against_config_file() {
    let dirs = dirs();
    let nested = dirs.global.join("nested");
    fs::create_dir_all(&nested).unwrap();
    let path = nested.join("gateway.toml");
    fs::write(&path, PROJECT_TOML).unwrap();

    let overrides = CliOverrides {
        config_path: Some(path),
        ..CliOverrides::default()
    };
    let config = load(&dirs, overrides, &[]).unwrap();
    assert_eq!(
        config.children[0].cwd.as_deref(),
        Some(Path::new(&nested).join("servers").as_path())
    );
}

#[test]
fn duplicate_children_fail_validation() {
    let dirs = dirs();
    fs::write(
        dirs.work.join("switchyard.toml"),
        r#"
[[children]]
name = "twin"
command = "a"

[[children]]
name = "twin"
command = "b"
"#,
    )
    .unwrap();
    assert!(matches!(
        load(&dirs, CliOverrides::default(), &[]),
        Err(ConfigError::InvalidValue { .. })
    ));
}
