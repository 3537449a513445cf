//! Sequence engine: ordered programs run against the [`RobotManager`].
//!
//! A program is anything implementing [`SequenceStep`]; point lists, homing
//! groups and named definitions from `sequences.toml` are built-in step
//! types. One sequence runs at a time.
//!
//! # Control
//!
//! ```text
//! Idle ──run──► Running ⇄ Paused
//!                  │
//!                  ├──► Complete
//!                  ├──► Stopped   (stop requested)
//!                  └──► Error     (a step failed)
//! ```
//!
//! Pause is checked between steps only: a step in progress always runs to
//! its end. Stop cancels the motion wait of the running step, stops every
//! axis and waits (bounded) for the runner to acknowledge.

use cell_common::axis::AxisId;
use cell_common::config::SequenceConfig;
use cell_hal::CancelToken;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::error::{PointError, RobotError, SequenceError};
use crate::events::RobotEvent;
use crate::robot::RobotManager;

/// Poll period while `stop` waits for the runner.
const STOP_ACK_POLL: Duration = Duration::from_millis(10);

// ─── Progress ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceKind {
    Homing,
    PointMove,
    Custom,
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    #[default]
    Idle,
    Running,
    Paused,
    Complete,
    Stopped,
    Error,
}

impl SequenceState {
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Snapshot of the current or last sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceProgress {
    pub kind: Option<SequenceKind>,
    pub name: String,
    pub state: SequenceState,
    /// 1-based index of the step running or last run. 0 before the first.
    pub current_step: usize,
    pub total_steps: usize,
    pub step_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub failed_step: Option<usize>,
    pub error: Option<String>,
}

// ─── Steps ──────────────────────────────────────────────────────────

/// One program: step `index` (1-based) executed against the robot.
pub trait SequenceStep: Send + Sync {
    fn name(&self, index: usize) -> String {
        format!("step {index}")
    }

    fn execute(
        &self,
        index: usize,
        robot: &RobotManager,
    ) -> impl Future<Output = Result<(), RobotError>> + Send;
}

/// Visit named points in order.
struct PointSteps<'a> {
    names: &'a [String],
    speed_percent: f64,
    limit: Duration,
    cancel: CancelToken,
}

impl SequenceStep for PointSteps<'_> {
    fn name(&self, index: usize) -> String {
        match self.names.get(index - 1) {
            Some(point) => format!("move to {point}"),
            None => format!("step {index}"),
        }
    }

    async fn execute(&self, index: usize, robot: &RobotManager) -> Result<(), RobotError> {
        let point = self
            .names
            .get(index - 1)
            .ok_or_else(|| PointError::NotFound(format!("step {index}")))?;
        robot
            .move_to_point_with(point, self.speed_percent, self.limit, Some(&self.cancel))
            .await
    }
}

/// Home one homing-order group per step.
struct HomingSteps {
    groups: Vec<Vec<AxisId>>,
}

impl SequenceStep for HomingSteps {
    fn name(&self, index: usize) -> String {
        let axes: Vec<String> = self
            .groups
            .get(index - 1)
            .map(|group| group.iter().map(AxisId::to_string).collect())
            .unwrap_or_default();
        format!("home {}", axes.join("+"))
    }

    async fn execute(&self, index: usize, robot: &RobotManager) -> Result<(), RobotError> {
        match self.groups.get(index - 1) {
            Some(group) => robot.home_group(group).await,
            None => Ok(()),
        }
    }
}

// ─── Definitions ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefinitionStep {
    Point {
        point: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    Home {
        home: bool,
    },
}

/// A named program from `sequences.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub name: String,
    pub steps: Vec<DefinitionStep>,
}

impl SequenceDefinition {
    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.name.trim().is_empty() {
            return Err(SequenceError::Definition(
                "sequence name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SequenceError::Definition(format!(
                "sequence {} has no steps",
                self.name
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                DefinitionStep::Point { speed: Some(speed), .. }
                    if !(*speed > 0.0 && *speed <= 100.0) =>
                {
                    return Err(SequenceError::Definition(format!(
                        "sequence {} step {}: speed {speed} outside (0, 100]",
                        self.name,
                        index + 1
                    )));
                }
                DefinitionStep::Home { home: false } => {
                    return Err(SequenceError::Definition(format!(
                        "sequence {} step {}: home must be true",
                        self.name,
                        index + 1
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DefinitionFile {
    #[serde(default, rename = "sequence")]
    sequences: Vec<SequenceDefinition>,
}

/// Parse a `sequences.toml` document.
pub fn parse_definitions(text: &str) -> Result<Vec<SequenceDefinition>, SequenceError> {
    let file: DefinitionFile =
        toml::from_str(text).map_err(|e| SequenceError::Definition(e.to_string()))?;
    let mut seen = std::collections::HashSet::new();
    for definition in &file.sequences {
        definition.validate()?;
        if !seen.insert(definition.name.as_str()) {
            return Err(SequenceError::Definition(format!(
                "duplicate sequence {}",
                definition.name
            )));
        }
    }
    Ok(file.sequences)
}

struct DefinitionSteps<'a> {
    definition: &'a SequenceDefinition,
    default_speed: f64,
    limit: Duration,
    cancel: CancelToken,
}

impl SequenceStep for DefinitionSteps<'_> {
    fn name(&self, index: usize) -> String {
        match self.definition.steps.get(index - 1) {
            Some(DefinitionStep::Point { point, .. }) => format!("move to {point}"),
            Some(DefinitionStep::Home { .. }) => "home all".to_string(),
            None => format!("step {index}"),
        }
    }

    async fn execute(&self, index: usize, robot: &RobotManager) -> Result<(), RobotError> {
        match self.definition.steps.get(index - 1) {
            Some(DefinitionStep::Point { point, speed }) => {
                let speed = speed.unwrap_or(self.default_speed);
                robot
                    .move_to_point_with(point, speed, self.limit, Some(&self.cancel))
                    .await
            }
            Some(DefinitionStep::Home { .. }) => robot.home_all().await,
            None => Ok(()),
        }
    }
}

// ─── SequenceManager ────────────────────────────────────────────────

/// Clears the running flag however the runner exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SequenceManager {
    robot: Arc<RobotManager>,
    config: SequenceConfig,
    progress: RwLock<SequenceProgress>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    pause: watch::Sender<bool>,
    cancel: Mutex<CancelToken>,
    definitions: RwLock<BTreeMap<String, SequenceDefinition>>,
}

impl SequenceManager {
    pub fn new(robot: Arc<RobotManager>) -> Self {
        let config = robot.config().sequence.clone();
        Self::with_config(robot, config)
    }

    pub fn with_config(robot: Arc<RobotManager>, config: SequenceConfig) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            robot,
            config,
            progress: RwLock::new(SequenceProgress::default()),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            pause,
            cancel: Mutex::new(CancelToken::new()),
            definitions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn robot(&self) -> &Arc<RobotManager> {
        &self.robot
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn get_progress(&self) -> SequenceProgress {
        self.progress.read().clone()
    }

    // ─── Definitions ────────────────────────────────────────────────

    /// Load named sequences from a TOML file. A missing file loads nothing.
    pub fn load_definitions(&self, path: &Path) -> Result<usize, SequenceError> {
        if !path.exists() {
            debug!(path = %path.display(), "no sequence definitions");
            return Ok(0);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| SequenceError::Definition(format!("{}: {e}", path.display())))?;
        let parsed = parse_definitions(&text)?;
        let count = parsed.len();
        let mut definitions = self.definitions.write();
        for definition in parsed {
            definitions.insert(definition.name.clone(), definition);
        }
        info!(count, path = %path.display(), "sequence definitions loaded");
        Ok(count)
    }

    pub fn define(&self, definition: SequenceDefinition) -> Result<(), SequenceError> {
        definition.validate()?;
        self.definitions
            .write()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn definitions(&self) -> Vec<SequenceDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    // ─── Runs ───────────────────────────────────────────────────────

    /// Move through the named points in order at `speed_percent`.
    pub async fn run_point_sequence(
        &self,
        names: &[String],
        speed_percent: f64,
    ) -> Result<(), SequenceError> {
        let cancel = CancelToken::new();
        let steps = PointSteps {
            names,
            speed_percent,
            limit: self.move_timeout(),
            cancel: cancel.clone(),
        };
        self.run(SequenceKind::PointMove, "points", &steps, names.len(), cancel)
            .await
    }

    /// Home every fitted axis, one homing-order group per step.
    pub async fn run_homing_sequence(&self) -> Result<(), SequenceError> {
        let steps = HomingSteps {
            groups: self.robot.homing_groups(),
        };
        let total = steps.groups.len();
        self.run(SequenceKind::Homing, "homing", &steps, total, CancelToken::new())
            .await
    }

    /// Run a caller-supplied program of `total_steps` steps.
    pub async fn run_custom_sequence<S: SequenceStep>(
        &self,
        steps: &S,
        total_steps: usize,
    ) -> Result<(), SequenceError> {
        self.run(
            SequenceKind::Custom,
            "custom",
            steps,
            total_steps,
            CancelToken::new(),
        )
        .await
    }

    /// Run a definition loaded from `sequences.toml`.
    pub async fn run_named(&self, name: &str) -> Result<(), SequenceError> {
        let definition = self
            .definitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SequenceError::UnknownSequence(name.to_string()))?;
        let cancel = CancelToken::new();
        let steps = DefinitionSteps {
            definition: &definition,
            default_speed: self.config.default_speed,
            limit: self.move_timeout(),
            cancel: cancel.clone(),
        };
        let total = definition.steps.len();
        self.run(SequenceKind::Named, name, &steps, total, cancel)
            .await
    }

    fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.config.move_timeout_ms)
    }

    async fn run<S: SequenceStep>(
        &self,
        kind: SequenceKind,
        name: &str,
        steps: &S,
        total: usize,
        cancel: CancelToken,
    ) -> Result<(), SequenceError> {
        if total == 0 {
            return Err(SequenceError::Definition(format!(
                "sequence {name} has no steps"
            )));
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SequenceError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        // The token the steps' motion waits observe.
        *self.cancel.lock() = cancel;
        self.stop_requested.store(false, Ordering::Release);
        self.pause.send_replace(false);

        self.publish(|p| {
            *p = SequenceProgress {
                kind: Some(kind),
                name: name.to_string(),
                state: SequenceState::Running,
                total_steps: total,
                started_at: Some(Utc::now()),
                ..Default::default()
            };
        });
        info!(?kind, name, total, "sequence started");
        self.emit(RobotEvent::SequenceStarted {
            kind,
            total_steps: total,
        });

        let step_delay = Duration::from_millis(self.config.step_delay_ms);
        for index in 1..=total {
            if !self.gate(index - 1).await {
                return Err(self.finish_stopped(index - 1));
            }

            let step_name = steps.name(index);
            self.publish(|p| {
                p.current_step = index;
                p.step_name = Some(step_name.clone());
            });
            debug!(step = index, total, name = %step_name, "sequence step");
            self.emit(RobotEvent::SequenceProgress {
                step: index,
                total_steps: total,
                name: step_name.clone(),
            });

            if let Err(source) = steps.execute(index, &self.robot).await {
                if self.stop_requested.load(Ordering::Acquire) {
                    return Err(self.finish_stopped(index));
                }
                return Err(self.finish_failed(index, step_name, source));
            }

            if index < total && !step_delay.is_zero() {
                sleep(step_delay).await;
            }
        }

        self.publish(|p| p.state = SequenceState::Complete);
        info!(?kind, name, "sequence complete");
        self.emit(RobotEvent::SequenceComplete { kind });
        Ok(())
    }

    /// Between-step checkpoint. Parks while paused; `false` once a stop has
    /// been requested.
    async fn gate(&self, completed: usize) -> bool {
        let mut pause = self.pause.subscribe();
        let mut parked = false;
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return false;
            }
            if !*pause.borrow_and_update() {
                break;
            }
            if !parked {
                parked = true;
                self.publish(|p| p.state = SequenceState::Paused);
                info!(step = completed, "sequence paused");
                self.emit(RobotEvent::SequencePaused { step: completed });
            }
            if pause.changed().await.is_err() {
                return false;
            }
        }
        if parked {
            self.publish(|p| p.state = SequenceState::Running);
            info!(step = completed, "sequence resumed");
            self.emit(RobotEvent::SequenceResumed { step: completed });
        }
        true
    }

    fn finish_stopped(&self, step: usize) -> SequenceError {
        self.publish(|p| p.state = SequenceState::Stopped);
        warn!(step, "sequence stopped");
        self.emit(RobotEvent::SequenceStopped { step });
        SequenceError::Stopped { step }
    }

    fn finish_failed(&self, step: usize, name: String, source: RobotError) -> SequenceError {
        let message = source.to_string();
        self.publish(|p| {
            p.state = SequenceState::Error;
            p.failed_step = Some(step);
            p.error = Some(message.clone());
        });
        error!(step, name = %name, error = %message, "sequence step failed");
        self.emit(RobotEvent::SequenceError { step, message });
        SequenceError::StepFailed { step, name, source }
    }

    // ─── Control ────────────────────────────────────────────────────

    /// Park the runner before its next step. `false` if nothing runs.
    pub fn pause(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.pause.send_replace(true);
        true
    }

    pub fn resume(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.pause.send_replace(false);
        true
    }

    /// Cancel the running sequence and stop every axis.
    ///
    /// Returns once the runner has acknowledged, or after `move_timeout_ms`.
    /// Calling it with nothing running is a no-op.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("sequence stop requested");
        self.stop_requested.store(true, Ordering::Release);
        self.cancel.lock().cancel();
        self.pause.send_replace(false);

        if let Err(e) = self.robot.stop_all().await {
            warn!(error = %e, "stop_all during sequence stop failed");
        }

        let deadline = Instant::now() + self.move_timeout();
        while self.is_running() {
            if Instant::now() >= deadline {
                warn!("sequence did not acknowledge stop in time");
                return;
            }
            sleep(STOP_ACK_POLL).await;
        }
    }

    // ─── Reporting ──────────────────────────────────────────────────

    fn publish(&self, update: impl FnOnce(&mut SequenceProgress)) {
        let snapshot = {
            let mut progress = self.progress.write();
            update(&mut progress);
            if let Some(started) = progress.started_at {
                progress.elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
            }
            progress.clone()
        };
        self.robot.set_sequence_progress(snapshot);
    }

    fn emit(&self, event: RobotEvent) {
        self.robot.events().emit(event);
    }
}
