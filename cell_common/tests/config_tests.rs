//! Configuration directory tests.
//!
//! Tests for `load_config_dir()`: required main file, optional axis file,
//! default axis fallback, section defaults and validation failures.

use cell_common::axis::{AxisId, HomingDirection, HomingSensor, MotorKind};
use cell_common::config::{BackendKind, ConfigError, load_config_dir};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Create a minimal cell.toml in the given directory.
fn write_cell_toml(dir: &Path) {
    fs::write(
        dir.join("cell.toml"),
        r#"
[shared]
log_level = "debug"
service_name = "cell-test"

[bus]
simulate = true

[motion]
backend = "simulation"
"#,
    )
    .unwrap();
}

fn write_axes_toml(dir: &Path, content: &str) {
    fs::write(dir.join("axes.toml"), content).unwrap();
}

// ─── Tests ──────────────────────────────────────────────────────────

/// Test: load_config_dir succeeds with a cell.toml and an axes.toml.
#[test]
fn load_config_dir_success() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();

    write_cell_toml(dir);
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "x"
motor_kind = "stepping"
limit_plus = 800.0

[[axis]]
axis = "z"
motor_kind = "closed_loop_stepping"
homing_order = 0
homing_direction = "cw"
origin_offset = 2.5
"#,
    );

    let config = load_config_dir(dir).expect("should load successfully");
    assert_eq!(config.shared.service_name, "cell-test");
    assert!(config.bus.simulate);
    assert_eq!(config.motion.backend, BackendKind::Simulation);
    assert_eq!(config.axes.len(), 2);

    let x = config.axis(AxisId::X).unwrap();
    assert_eq!(x.limit_plus, 800.0);
    assert_eq!(x.homing_sensor, HomingSensor::Auto);

    let z = config.axis(AxisId::Z).unwrap();
    assert_eq!(z.motor_kind, MotorKind::ClosedLoopStepping);
    assert_eq!(z.homing_order, 0);
    assert_eq!(z.homing_direction, HomingDirection::Cw);
    assert_eq!(z.origin_offset, 2.5);
}

/// Test: a missing cell.toml is reported as FileNotFound.
#[test]
fn missing_cell_toml() {
    let tmp = TempDir::new().unwrap();
    let result = load_config_dir(tmp.path());
    assert!(matches!(result, Err(ConfigError::FileNotFound)));
}

/// Test: without any axis records the default X/Y/Z set is used.
#[test]
fn default_axes_when_missing() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);

    let config = load_config_dir(dir).expect("should load");
    let ids: Vec<AxisId> = config.axes.iter().map(|a| a.axis).collect();
    assert_eq!(ids, vec![AxisId::X, AxisId::Y, AxisId::Z]);
    assert!(config.axes.iter().all(|a| a.motor_kind == MotorKind::Stepping));
}

/// Test: axes.toml replaces axis records embedded in cell.toml.
#[test]
fn axes_file_overrides_inline_axes() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(
        dir.join("cell.toml"),
        r#"
[[axis]]
axis = "u"
"#,
    )
    .unwrap();
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "y"
"#,
    );

    let config = load_config_dir(dir).expect("should load");
    assert_eq!(config.axes.len(), 1);
    assert_eq!(config.axes[0].axis, AxisId::Y);
}

/// Test: an inline axis table is honoured when axes.toml is absent.
#[test]
fn inline_axes_without_axes_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(
        dir.join("cell.toml"),
        r#"
[[axis]]
axis = "u"
motor_kind = "vendor_actuator"
"#,
    )
    .unwrap();

    let config = load_config_dir(dir).expect("should load");
    assert_eq!(config.axes.len(), 1);
    assert_eq!(config.axes[0].motor_kind, MotorKind::VendorActuator);
}

/// Test: duplicate axis ids are rejected.
#[test]
fn duplicate_axis_id() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "x"

[[axis]]
axis = "x"
"#,
    );

    let result = load_config_dir(dir);
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

/// Test: an empty soft-limit window is rejected.
#[test]
fn inverted_soft_limits() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "x"
limit_minus = 10.0
limit_plus = 5.0
"#,
    );

    let result = load_config_dir(dir);
    assert!(
        matches!(result, Err(ConfigError::ValidationError(ref msg)) if msg.contains("limit_minus")),
        "expected ValidationError, got {result:?}"
    );
}

/// Test: non-positive pulse length is rejected.
#[test]
fn zero_pulse_length() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "x"
pulse_length = 0.0
"#,
    );

    assert!(matches!(
        load_config_dir(dir),
        Err(ConfigError::ValidationError(_))
    ));
}

/// Test: board ids beyond the bus range are rejected.
#[test]
fn io_board_out_of_range() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(
        dir.join("cell.toml"),
        r#"
[io]
boards = [0, 20]
"#,
    )
    .unwrap();

    assert!(matches!(
        load_config_dir(dir),
        Err(ConfigError::ValidationError(_))
    ));
}

/// Test: malformed axes.toml surfaces as ParseError.
#[test]
fn malformed_axes_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);
    write_axes_toml(dir, "[[axis]\naxis = ");

    assert!(matches!(
        load_config_dir(dir),
        Err(ConfigError::ParseError(_))
    ));
}

/// Test: unknown motor kinds are rejected at parse time.
#[test]
fn unknown_motor_kind() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    write_cell_toml(dir);
    write_axes_toml(
        dir,
        r#"
[[axis]]
axis = "x"
motor_kind = "hydraulic"
"#,
    );

    assert!(matches!(
        load_config_dir(dir),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn shipped_config_dir_loads() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config");
    let config = load_config_dir(&dir).unwrap();
    assert_eq!(config.shared.service_name, "cell-01");
    assert_eq!(config.motion.backend, BackendKind::Native);
    assert_eq!(config.fitted_axes().count(), 3);
    let z = config.axis(AxisId::Z).unwrap();
    assert_eq!(z.motor_kind, MotorKind::ClosedLoopStepping);
    assert_eq!(z.homing_order, 1);
}
