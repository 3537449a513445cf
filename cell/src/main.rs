//! # Cell Supervisor Binary
//!
//! Command-line front end of the assembly cell robot. Loads the config
//! directory, builds the robot manager and runs one command against it.
//!
//! # Usage
//!
//! ```bash
//! # Run the cell until Ctrl-C, without hardware
//! cell --config-dir config/ --simulate run
//!
//! # Home every axis, then move X
//! cell --config-dir config/ home
//! cell --config-dir config/ move --axis x --position 120.5 --speed 40
//!
//! # Teaching points
//! cell --config-dir config/ point teach P001
//! cell --config-dir config/ point go P001
//!
//! # Named sequence from sequences.toml
//! cell --config-dir config/ sequence pick
//!
//! # Raw I/O
//! cell --config-dir config/ io write --board 0 --port 15 --value on
//! ```

use cell_common::axis::AxisId;
use cell_common::config::{CellConfig, ConfigError, LogLevel, load_config_dir};
use cell_common::io::IoPort;
use cell_control::{RobotManager, SequenceManager};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Assembly cell robot supervisor
#[derive(Parser, Debug)]
#[command(name = "cell")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Robot motion and I/O control for the assembly cell")]
#[command(long_about = None)]
struct Args {
    /// Config directory (cell.toml + axes.toml)
    #[arg(long, value_name = "DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Use the loopback bus and the simulated motion backend
    #[arg(short = 's', long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize and run until Ctrl-C, logging status every second
    Run,
    /// Home one axis, or every axis in homing order
    Home {
        #[arg(long)]
        axis: Option<AxisId>,
    },
    /// Absolute move of one axis
    Move {
        #[arg(long)]
        axis: AxisId,
        #[arg(long)]
        position: f64,
        /// Percent of the axis' max speed
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Teaching points
    #[command(subcommand)]
    Point(PointCommand),
    /// Run a named sequence
    Sequence { name: String },
    /// Raw I/O by board and port
    #[command(subcommand)]
    Io(IoCommand),
}

#[derive(Subcommand, Debug)]
enum PointCommand {
    List,
    Go {
        name: String,
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Store the current axis positions
    Teach {
        name: String,
        #[arg(long, default_value = "")]
        comment: String,
    },
    Delete { name: String },
    /// Import a legacy [Point] table
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum IoCommand {
    Read {
        #[arg(long)]
        board: u8,
        #[arg(long)]
        port: u8,
        /// Read the output image instead of the inputs
        #[arg(long)]
        output: bool,
    },
    Write {
        #[arg(long)]
        board: u8,
        #[arg(long)]
        port: u8,
        #[arg(long)]
        value: Switch,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // The config carries the default log level, so it is read before the
    // subscriber exists and reported right after.
    let loaded = load_config(&args.config_dir, args.simulate);
    let level = match &loaded {
        Ok(loaded) => loaded.config.shared.log_level,
        Err(_) => LogLevel::default(),
    };
    setup_tracing(&args, level);
    info!("Cell supervisor v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = match loaded {
        Ok(loaded) => {
            loaded.report(&args.config_dir);
            run(args, loaded.config).await
        }
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        error!("cell failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args, config: CellConfig) -> CliResult<()> {
    info!(service = %config.shared.service_name, "configuration loaded");
    let robot = Arc::new(RobotManager::new(config)?);

    // Point bookkeeping works without hardware.
    match args.command {
        Command::Point(PointCommand::List) => return list_points(&robot, args.json),
        Command::Point(PointCommand::Delete { name }) => {
            robot.delete_point(&name)?;
            info!(name, "point deleted");
            return Ok(());
        }
        Command::Point(PointCommand::Import { file }) => {
            let count = robot.import_points(&file)?;
            info!(count, file = %file.display(), "legacy points imported");
            return Ok(());
        }
        command => {
            robot.initialize().await?;
            let result = execute(&robot, command).await;
            robot.shutdown().await;
            result
        }
    }
}

async fn execute(robot: &Arc<RobotManager>, command: Command) -> CliResult<()> {
    let default_speed = robot.config().sequence.default_speed;
    match command {
        Command::Run => supervise(robot).await?,
        Command::Home { axis: Some(axis) } => robot.home_axis(axis).await?,
        Command::Home { axis: None } => robot.home_all().await?,
        Command::Move {
            axis,
            position,
            speed,
        } => {
            robot
                .move_axis(axis, position, speed.unwrap_or(default_speed), true)
                .await?;
            let status = robot.motion().get_status(axis)?;
            info!(%axis, position = status.position, "move complete");
        }
        Command::Point(PointCommand::Go { name, speed }) => {
            robot
                .move_to_point(&name, speed.unwrap_or(default_speed))
                .await?;
        }
        Command::Point(PointCommand::Teach { name, comment }) => {
            let point = robot.teach_point(&name, &comment)?;
            info!(name, axes = ?point.axes, "point taught");
        }
        Command::Point(_) => {}
        Command::Sequence { name } => run_sequence(robot, &name).await?,
        Command::Io(IoCommand::Read {
            board,
            port,
            output,
        }) => {
            let port = if output {
                IoPort::output(board, port)
            } else {
                IoPort::input(board, port)
            };
            port.validate()?;
            // Give the expander one poll cycle to receive input reports.
            robot.io().poll_cycle().await?;
            let value = robot.io_read(port)?;
            println!("{port} = {}", if value { "on" } else { "off" });
        }
        Command::Io(IoCommand::Write { board, port, value }) => {
            let port = IoPort::output(board, port);
            port.validate()?;
            robot.io_write(port, value == Switch::On).await?;
            info!(%port, ?value, "output written");
        }
    }
    Ok(())
}

/// Log the robot status every second and every event until Ctrl-C.
async fn supervise(robot: &Arc<RobotManager>) -> CliResult<()> {
    let mut events = robot.event_stream();
    let logger = tokio::spawn(async move {
        while let Ok(timed) = events.recv().await {
            info!(event = ?timed.event, "robot event");
        }
    });

    let mut heartbeat = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let status = robot.get_status();
                info!(
                    state = ?status.state,
                    mode = ?status.mode,
                    safety = ?status.safety,
                    homed = status.all_homed,
                    "status"
                );
                for axis in &status.axes {
                    debug!(
                        axis = %axis.axis,
                        state = %axis.state,
                        position = axis.position,
                        "axis"
                    );
                }
            }
            result = signal::ctrl_c() => {
                result?;
                info!("Received shutdown signal");
                break;
            }
        }
    }
    logger.abort();
    Ok(())
}

/// Run a named sequence; Ctrl-C stops it and waits for the abort.
async fn run_sequence(robot: &Arc<RobotManager>, name: &str) -> CliResult<()> {
    let sequences = SequenceManager::new(Arc::clone(robot));
    sequences.load_definitions(&robot.config().robot.sequences_path())?;

    let run = sequences.run_named(name);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = signal::ctrl_c() => {
            warn!(name, "interrupted, stopping sequence");
            let (result, ()) = tokio::join!(&mut run, sequences.stop());
            result
        }
    };
    result?;
    info!(name, "sequence complete");
    Ok(())
}

fn list_points(robot: &RobotManager, json: bool) -> CliResult<()> {
    let points = robot.points();
    if json {
        println!("{}", serde_json::to_string_pretty(&points)?);
        return Ok(());
    }
    for point in points {
        let axes: Vec<String> = point
            .axes
            .iter()
            .map(|(axis, value)| format!("{axis}={value:.3}"))
            .collect();
        let lock = if point.protected { " [protected]" } else { "" };
        println!("{:<8} {:?} {}{} {}", point.name, point.coordinate, axes.join(" "), lock, point.comment);
    }
    Ok(())
}

struct LoadedConfig {
    config: CellConfig,
    defaulted: bool,
    simulate: bool,
}

impl LoadedConfig {
    fn report(&self, dir: &Path) {
        if self.defaulted {
            warn!(dir = %dir.display(), "No cell.toml found, using defaults");
        }
        if self.simulate {
            info!("Simulation mode enabled");
        }
    }
}

/// Load the config directory. A missing `cell.toml` falls back to defaults.
fn load_config(dir: &Path, simulate: bool) -> Result<LoadedConfig, ConfigError> {
    let (mut config, defaulted) = match load_config_dir(dir) {
        Ok(config) => (config, false),
        Err(ConfigError::FileNotFound) => {
            let config = CellConfig {
                axes: CellConfig::default_axes(),
                ..Default::default()
            };
            (config, true)
        }
        Err(e) => return Err(e),
    };
    if simulate {
        config.force_simulation();
    }
    Ok(LoadedConfig {
        config,
        defaulted,
        simulate,
    })
}

/// Default filter directive when `RUST_LOG` is unset.
fn default_directive(verbose: bool, level: LogLevel) -> &'static str {
    if verbose && !matches!(level, LogLevel::Trace) {
        LogLevel::Debug.as_str()
    } else {
        level.as_str()
    }
}

/// Setup tracing subscriber. `RUST_LOG`, when set, replaces the default.
fn setup_tracing(args: &Args, level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(args.verbose, level)));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::config::BackendKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_move() {
        let args = Args::try_parse_from([
            "cell", "--simulate", "move", "--axis", "x", "--position", "120.5", "--speed", "40",
        ])
        .unwrap();
        assert!(args.simulate);
        match args.command {
            Command::Move {
                axis,
                position,
                speed,
            } => {
                assert_eq!(axis, AxisId::X);
                assert_eq!(position, 120.5);
                assert_eq!(speed, Some(40.0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_io_write() {
        let args = Args::try_parse_from([
            "cell", "io", "write", "--board", "0", "--port", "15", "--value", "on",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Io(IoCommand::Write {
                board: 0,
                port: 15,
                value: Switch::On
            })
        ));
        assert_eq!(args.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_rejects_unknown_axis() {
        assert!(Args::try_parse_from(["cell", "home", "--axis", "w"]).is_err());
    }

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = load_config(dir.path(), true).unwrap();
        assert!(loaded.defaulted);
        let config = loaded.config;
        assert_eq!(config.axes.len(), 3);
        assert!(config.bus.simulate);
        assert_eq!(config.motion.backend, BackendKind::Simulation);
    }

    #[test]
    fn test_config_log_level_is_default_directive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("cell.toml"),
            "[shared]\nlog_level = \"warn\"\nservice_name = \"cell-07\"\n",
        )
        .unwrap();
        let loaded = load_config(dir.path(), false).unwrap();
        assert!(!loaded.defaulted);
        assert_eq!(loaded.config.shared.log_level, LogLevel::Warn);
        assert_eq!(default_directive(false, loaded.config.shared.log_level), "warn");
    }

    #[test]
    fn test_verbose_raises_default_directive_to_debug() {
        assert_eq!(default_directive(true, LogLevel::Warn), "debug");
        assert_eq!(default_directive(true, LogLevel::Trace), "trace");
        assert_eq!(default_directive(false, LogLevel::Info), "info");
    }
}
