//! Robot manager: the single integration point of the cell.
//!
//! Owns the bus, the I/O expander and the motion controller, the teaching
//! points and the event bus. Two background tasks run while initialized:
//!
//! - the **safety monitor** polls the expander every
//!   `robot.estop_poll_interval_ms` and latches the emergency stop on the
//!   rising edge of the emergency input;
//! - the **event forwarder** turns motion notices into [`RobotEvent`]s.
//!
//! # Robot state
//!
//! ```text
//! Disconnected ──initialize──► Initializing ──► Idle ⇄ Moving / Homing
//!                                   │                    │
//!                                   ▼                    ▼
//!                                 Error ◄──────────── Error
//! any ──emergency input──► Emergency ──reset (input released)──► Idle
//! any ──shutdown──► Shutdown
//! ```

use cell_common::axis::{AxisId, AxisState, AxisStatus, JogDirection};
use cell_common::config::CellConfig;
use cell_common::io::IoPort;
use cell_hal::motion::{CancelToken, MotionEvent};
use cell_hal::{BusController, BusStats, IoExpander, IoSnapshot, MotionController, MotionError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::{PointError, RobotError};
use crate::events::{EventBus, ListenerId, RobotEvent, RobotEventKind, TimedEvent};
use crate::points::{Coordinate, Position, PositionStore};
use crate::sequence::SequenceProgress;

// ─── State & mode ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum RobotState {
    #[default]
    Disconnected,
    Initializing,
    Idle,
    Moving,
    Homing,
    Error,
    Emergency,
    Shutdown,
}

/// Operating mode. `Auto` requires every axis homed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum RobotMode {
    #[default]
    Manual,
    Auto,
    Teaching,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SafetyState {
    #[default]
    Safe,
    DoorOpen,
    EmergencyStop,
}

/// Aggregated, read-only robot snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RobotStatus {
    pub state: RobotState,
    pub mode: RobotMode,
    pub safety: SafetyState,
    pub initialized: bool,
    pub all_homed: bool,
    pub axes: Vec<AxisStatus>,
    pub io: IoSnapshot,
    pub bus: BusStats,
    pub sequence: Option<SequenceProgress>,
    pub current_point: Option<String>,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Core {
    state: RobotState,
    mode: RobotMode,
    safety: SafetyState,
    current_point: Option<String>,
    last_error: Option<String>,
}

/// State shared with the background tasks.
struct Shared {
    core: RwLock<Core>,
    events: EventBus,
}

impl Shared {
    fn transition(&self, to: RobotState) {
        let from = {
            let mut core = self.core.write();
            std::mem::replace(&mut core.state, to)
        };
        if from != to {
            debug!(?from, ?to, "robot state");
            self.events.emit(RobotEvent::StateChanged { from, to });
        }
    }

    fn record_error(&self, error: &RobotError) {
        self.core.write().last_error = Some(error.to_string());
    }
}

// ─── RobotManager ───────────────────────────────────────────────────

pub struct RobotManager {
    config: CellConfig,
    bus: Arc<BusController>,
    io: Arc<IoExpander>,
    motion: Arc<MotionController>,
    points: Mutex<PositionStore>,
    shared: Arc<Shared>,
    sequence: RwLock<Option<SequenceProgress>>,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RobotManager {
    /// Build every component from the configuration tree. Nothing touches
    /// hardware until [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// `Bus` if the SPI device cannot be opened, `Point` if the point file
    /// is unreadable.
    pub fn new(config: CellConfig) -> Result<Self, RobotError> {
        let bus = Arc::new(BusController::from_config(&config.bus)?);
        let io = Arc::new(IoExpander::new(Arc::clone(&bus), config.io.clone()));
        let motion = Arc::new(MotionController::from_config(&config.motion, &config.axes));
        let points = PositionStore::load(config.robot.points_path())?;

        Ok(Self {
            bus,
            io,
            motion,
            points: Mutex::new(points),
            shared: Arc::new(Shared {
                core: RwLock::new(Core::default()),
                events: EventBus::new(config.robot.event_capacity),
            }),
            sequence: RwLock::new(None),
            initialized: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<BusController> {
        &self.bus
    }

    pub fn io(&self) -> &Arc<IoExpander> {
        &self.io
    }

    pub fn motion(&self) -> &Arc<MotionController> {
        &self.motion
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Bring up bus, expander and motion in that order, then start the
    /// background tasks.
    pub async fn initialize(&self) -> Result<(), RobotError> {
        if self.is_initialized() {
            return Ok(());
        }
        info!("🔧 Initializing robot manager");
        self.shared.transition(RobotState::Initializing);

        if let Err(e) = self.bring_up().await {
            error!(error = %e, "robot initialization failed");
            self.shared.record_error(&e);
            self.shared.transition(RobotState::Error);
            return Err(e);
        }

        {
            let mut tasks = self.tasks.lock();
            if self.config.robot.enable_safety_checks {
                tasks.push(self.spawn_safety_monitor());
            } else {
                warn!("safety monitor disabled by configuration");
            }
            tasks.push(self.spawn_event_forwarder());
        }

        self.initialized.store(true, Ordering::Release);
        self.shared.transition(RobotState::Idle);
        info!(axes = ?self.motion.axes(), "✅ Robot manager initialized");
        Ok(())
    }

    async fn bring_up(&self) -> Result<(), RobotError> {
        self.bus.initialize().await?;
        self.io.initialize_outputs().await?;
        self.motion.initialize().await?;
        Ok(())
    }

    /// Tear down in reverse order. Every axis is stopped first whatever
    /// happened before; failures are logged, never raised.
    pub async fn shutdown(&self) {
        info!("Shutting down robot manager");
        if let Err(e) = self.motion.stop_all().await {
            warn!(error = %e, "stop before shutdown not confirmed");
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.motion.shutdown().await;
        self.bus.shutdown().await;

        {
            let mut points = self.points.lock();
            if points.is_modified() {
                if let Err(e) = points.save() {
                    error!(error = %e, "saving points on shutdown failed");
                }
            }
        }

        self.initialized.store(false, Ordering::Release);
        self.shared.transition(RobotState::Shutdown);
        info!("Robot manager shut down");
    }

    // ─── Background tasks ───────────────────────────────────────────

    fn spawn_safety_monitor(&self) -> JoinHandle<()> {
        let io = Arc::clone(&self.io);
        let motion = Arc::clone(&self.motion);
        let shared = Arc::clone(&self.shared);
        let period = Duration::from_millis(self.config.robot.estop_poll_interval_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut asserted = false;
            let mut poll_failing = false;
            loop {
                ticker.tick().await;
                match io.poll_cycle().await {
                    Ok(_) if poll_failing => {
                        info!("I/O polling recovered");
                        poll_failing = false;
                    }
                    Ok(_) => {}
                    Err(e) if !poll_failing => {
                        warn!(error = %e, "I/O polling failed");
                        poll_failing = true;
                    }
                    Err(_) => {}
                }

                let emergency = io.check_emergency();
                if emergency && !asserted {
                    asserted = true;
                    error!("🛑 Emergency stop input asserted");
                    motion.emergency_stop().await;
                    {
                        let mut core = shared.core.write();
                        core.safety = SafetyState::EmergencyStop;
                        core.last_error = Some("emergency stop".to_string());
                    }
                    shared.transition(RobotState::Emergency);
                    shared.events.emit(RobotEvent::EmergencyStop);
                } else if !emergency && asserted {
                    asserted = false;
                    info!("Emergency stop input released, reset required");
                    shared.core.write().safety = SafetyState::Safe;
                    shared.events.emit(RobotEvent::EmergencyReleased);
                }

                if !asserted {
                    let door = if io.check_door_open() {
                        SafetyState::DoorOpen
                    } else {
                        SafetyState::Safe
                    };
                    shared.core.write().safety = door;
                }
            }
        })
    }

    fn spawn_event_forwarder(&self) -> JoinHandle<()> {
        let mut notices = self.motion.subscribe();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let notice = match notices.recv().await {
                    Ok(notice) => notice,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "motion notices lost");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let event = match notice {
                    MotionEvent::MotionComplete { axis, position } => {
                        RobotEvent::MotionComplete { axis, position }
                    }
                    MotionEvent::HomingComplete { axis, .. } => {
                        RobotEvent::HomingComplete { axis: Some(axis) }
                    }
                    MotionEvent::LimitStop { axis, position } => {
                        RobotEvent::LimitStop { axis, position }
                    }
                    MotionEvent::Alarm {
                        axis,
                        code,
                        message,
                        ..
                    } => RobotEvent::AxisAlarm {
                        axis,
                        code,
                        message,
                    },
                    // Raised by the safety monitor itself.
                    MotionEvent::EmergencyStop => continue,
                };
                shared.events.emit(event);
            }
        })
    }

    // ─── Guards ─────────────────────────────────────────────────────

    fn ensure_ready(&self) -> Result<(), RobotError> {
        if !self.is_initialized() {
            return Err(RobotError::NotInitialized);
        }
        if self.motion.is_estop_latched()
            || self.shared.core.read().safety == SafetyState::EmergencyStop
        {
            return Err(RobotError::EmergencyActive);
        }
        Ok(())
    }

    /// Record a failed command for the status snapshot and pass it on.
    fn fail(&self, e: impl Into<RobotError>) -> RobotError {
        let e = e.into();
        warn!(error = %e, "robot command failed");
        self.shared.record_error(&e);
        e
    }

    fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.config.motion.motion_timeout_ms)
    }

    // ─── Homing ─────────────────────────────────────────────────────

    pub async fn home_axis(&self, axis: AxisId) -> Result<(), RobotError> {
        self.ensure_ready()?;
        self.motion.home(axis).await.map_err(|e| self.fail(e))
    }

    /// Fitted axes grouped by ascending homing order.
    pub fn homing_groups(&self) -> Vec<Vec<AxisId>> {
        let mut groups: BTreeMap<u8, Vec<AxisId>> = BTreeMap::new();
        for config in self.config.fitted_axes() {
            groups
                .entry(config.homing_order)
                .or_default()
                .push(config.axis);
        }
        groups.into_values().collect()
    }

    /// Home several axes concurrently. All are awaited; the first failure is
    /// returned.
    pub async fn home_group(&self, axes: &[AxisId]) -> Result<(), RobotError> {
        self.ensure_ready()?;
        let mut set = JoinSet::new();
        for &axis in axes {
            let motion = Arc::clone(&self.motion);
            set.spawn(async move { motion.home(axis).await });
        }
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(MotionError::AxisFault {
                    axis: axes.first().copied().unwrap_or(AxisId::X),
                    reason: format!("homing task failed: {e}"),
                }),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(self.fail(e)),
            None => Ok(()),
        }
    }

    /// Home every fitted axis, lower homing order first.
    pub async fn home_all(&self) -> Result<(), RobotError> {
        self.ensure_ready()?;
        info!("homing all axes");
        for group in self.homing_groups() {
            self.home_group(&group).await?;
        }
        self.shared
            .events
            .emit(RobotEvent::HomingComplete { axis: None });
        info!("all axes homed");
        Ok(())
    }

    // ─── Motion ─────────────────────────────────────────────────────

    /// Absolute move of one axis, optionally waiting for completion.
    pub async fn move_axis(
        &self,
        axis: AxisId,
        position: f64,
        speed_percent: f64,
        wait: bool,
    ) -> Result<(), RobotError> {
        self.ensure_ready()?;
        self.motion
            .move_absolute(axis, position, speed_percent)
            .await
            .map_err(|e| self.fail(e))?;
        if wait {
            self.motion
                .wait_motion_complete(axis, self.motion_timeout())
                .await
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Start every move, then wait for all of them.
    ///
    /// If one move is refused, or `cancel` fires before every move is out,
    /// the ones already started are stopped.
    pub async fn move_axes(
        &self,
        moves: &[(AxisId, f64)],
        speed_percent: f64,
        limit: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), RobotError> {
        self.ensure_ready()?;
        for (index, &(axis, target)) in moves.iter().enumerate() {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                self.stop_started(&moves[..index]).await;
                return Err(MotionError::Cancelled.into());
            }
            if let Err(e) = self.motion.move_absolute(axis, target, speed_percent).await {
                self.stop_started(&moves[..index]).await;
                return Err(self.fail(e));
            }
        }
        for &(axis, _) in moves {
            let waited = match cancel {
                Some(token) => {
                    self.motion
                        .wait_motion_complete_cancellable(axis, limit, token)
                        .await
                }
                None => self.motion.wait_motion_complete(axis, limit).await,
            };
            waited.map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    async fn stop_started(&self, started: &[(AxisId, f64)]) {
        for &(axis, _) in started {
            if let Err(e) = self.motion.stop(axis).await {
                warn!(%axis, error = %e, "stop of started move failed");
            }
        }
    }

    pub async fn move_to_point(&self, name: &str, speed_percent: f64) -> Result<(), RobotError> {
        self.move_to_point_with(name, speed_percent, self.motion_timeout(), None)
            .await
    }

    /// Move every set axis of a point concurrently. Unset axes are left
    /// alone; relative points are applied to the current positions.
    pub async fn move_to_point_with(
        &self,
        name: &str,
        speed_percent: f64,
        limit: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), RobotError> {
        self.ensure_ready()?;
        let point = self
            .point(name)
            .ok_or_else(|| self.fail(PointError::NotFound(name.to_string())))?;

        let mut moves = Vec::with_capacity(point.axes.len());
        for (&axis, &value) in &point.axes {
            let target = match point.coordinate {
                Coordinate::Absolute => value,
                Coordinate::Relative => {
                    self.motion.get_status(axis).map_err(|e| self.fail(e))?.position + value
                }
            };
            moves.push((axis, target));
        }
        debug!(name, ?moves, "moving to point");

        self.move_axes(&moves, speed_percent, limit, cancel).await?;
        self.shared.core.write().current_point = Some(name.to_string());
        self.shared.events.emit(RobotEvent::PositionReached {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn jog_start(
        &self,
        axis: AxisId,
        direction: JogDirection,
        speed_percent: f64,
    ) -> Result<(), RobotError> {
        self.ensure_ready()?;
        self.motion
            .move_jog(axis, direction, speed_percent)
            .await
            .map_err(|e| self.fail(e))
    }

    pub async fn jog_stop(&self, axis: AxisId) -> Result<(), RobotError> {
        self.motion.stop(axis).await.map_err(|e| self.fail(e))
    }

    /// Stop every axis. Allowed in any state.
    pub async fn stop_all(&self) -> Result<(), RobotError> {
        self.motion.stop_all().await.map_err(|e| self.fail(e))
    }

    // ─── Teaching points ────────────────────────────────────────────

    pub fn point(&self, name: &str) -> Option<Position> {
        self.points.lock().get(name).cloned()
    }

    pub fn points(&self) -> Vec<Position> {
        self.points.lock().list()
    }

    /// Store a point as given and save the store.
    pub fn save_point(&self, point: Position) -> Result<(), RobotError> {
        let mut store = self.points.lock();
        store.upsert(point)?;
        store.save()?;
        Ok(())
    }

    /// Record the current position of every fitted axis under `name`.
    pub fn teach_point(&self, name: &str, comment: &str) -> Result<Position, RobotError> {
        if !self.is_initialized() {
            return Err(RobotError::NotInitialized);
        }
        let mut point = Position::new(name).with_comment(comment);
        for status in self.motion.get_all_status() {
            point.axes.insert(status.axis, status.position);
        }
        self.save_point(point.clone())?;
        info!(name, axes = ?point.axes, "point taught");
        Ok(point)
    }

    pub fn delete_point(&self, name: &str) -> Result<Position, RobotError> {
        let mut store = self.points.lock();
        let removed = store.delete(name)?;
        store.save()?;
        Ok(removed)
    }

    /// Import a legacy position file and save the store.
    pub fn import_points(&self, path: &Path) -> Result<usize, RobotError> {
        let text = std::fs::read_to_string(path).map_err(PointError::from)?;
        let mut store = self.points.lock();
        let count = store.import_legacy(&text)?;
        store.save()?;
        Ok(count)
    }

    // ─── I/O ────────────────────────────────────────────────────────

    pub fn io_read(&self, port: IoPort) -> Result<bool, RobotError> {
        Ok(self.io.read(port)?)
    }

    pub async fn io_write(&self, port: IoPort, value: bool) -> Result<(), RobotError> {
        if !self.is_initialized() {
            return Err(RobotError::NotInitialized);
        }
        self.io.write(port, value).await.map_err(|e| self.fail(e))
    }

    // ─── Modes & recovery ───────────────────────────────────────────

    pub async fn set_mode(&self, mode: RobotMode) -> Result<(), RobotError> {
        if mode == RobotMode::Auto && !self.motion.all_homed() {
            return Err(RobotError::NotHomed(mode));
        }
        let changed = {
            let mut core = self.shared.core.write();
            std::mem::replace(&mut core.mode, mode) != mode
        };
        if changed {
            info!(?mode, "mode changed");
            self.shared.events.emit(RobotEvent::ModeChanged { mode });
        }
        Ok(())
    }

    /// Clear the emergency latch and every axis alarm.
    ///
    /// Refused while the emergency input is still asserted. Axes that were
    /// stopped by the emergency stop must be homed again.
    pub async fn reset(&self) -> Result<(), RobotError> {
        if !self.is_initialized() {
            return Err(RobotError::NotInitialized);
        }
        if self.io.check_emergency() {
            warn!("reset refused: emergency input still asserted");
            return Err(RobotError::EmergencyActive);
        }
        if let Err(e) = self.motion.stop_all().await {
            warn!(error = %e, "stop before reset not confirmed");
        }
        self.motion.reset_all().await?;
        {
            let mut core = self.shared.core.write();
            core.safety = SafetyState::Safe;
            core.last_error = None;
        }
        self.shared.transition(RobotState::Idle);
        info!("robot reset");
        Ok(())
    }

    // ─── Status & events ────────────────────────────────────────────

    pub fn get_status(&self) -> RobotStatus {
        let axes = self.motion.get_all_status();
        let core = self.shared.core.read();
        let state = match core.state {
            RobotState::Idle | RobotState::Moving | RobotState::Homing | RobotState::Error => {
                derive_state(&axes)
            }
            other => other,
        };
        RobotStatus {
            state,
            mode: core.mode,
            safety: core.safety,
            initialized: self.is_initialized(),
            all_homed: !axes.is_empty() && axes.iter().all(|a| a.homed),
            axes,
            io: self.io.snapshot(),
            bus: self.bus.stats(),
            sequence: self.sequence.read().clone(),
            current_point: core.current_point.clone(),
            last_error: core.last_error.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn subscribe(
        &self,
        kind: RobotEventKind,
        listener: impl Fn(&RobotEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.events.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    pub fn event_stream(&self) -> broadcast::Receiver<TimedEvent> {
        self.shared.events.event_stream()
    }

    pub(crate) fn set_sequence_progress(&self, progress: SequenceProgress) {
        *self.sequence.write() = Some(progress);
    }
}

impl Drop for RobotManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Robot state implied by the axis table.
fn derive_state(axes: &[AxisStatus]) -> RobotState {
    let any = |state: AxisState| axes.iter().any(|a| a.state == state);
    if any(AxisState::Error) {
        RobotState::Error
    } else if any(AxisState::Homing) {
        RobotState::Homing
    } else if axes.iter().any(|a| a.state.is_in_motion()) {
        RobotState::Moving
    } else {
        RobotState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::axis::{AxisConfig, MotorKind};
    use tempfile::TempDir;

    fn sim_config(dir: &TempDir) -> CellConfig {
        let mut config = CellConfig {
            axes: CellConfig::default_axes(),
            ..Default::default()
        };
        config.force_simulation();
        config.robot.data_dir = dir.path().to_path_buf();
        config
    }

    #[test]
    fn derive_state_prefers_error() {
        let mut x = AxisStatus::new(AxisId::X);
        let mut y = AxisStatus::new(AxisId::Y);
        assert_eq!(derive_state(&[x.clone(), y.clone()]), RobotState::Idle);
        y.state = AxisState::Moving;
        assert_eq!(derive_state(&[x.clone(), y.clone()]), RobotState::Moving);
        x.state = AxisState::Error;
        assert_eq!(derive_state(&[x, y]), RobotState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_need_initialize() {
        let dir = TempDir::new().unwrap();
        let robot = RobotManager::new(sim_config(&dir)).unwrap();
        assert!(matches!(
            robot.move_axis(AxisId::X, 1.0, 50.0, false).await,
            Err(RobotError::NotInitialized)
        ));
        assert_eq!(robot.get_status().state, RobotState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn homing_groups_follow_order() {
        let dir = TempDir::new().unwrap();
        let mut config = sim_config(&dir);
        let mut u = AxisConfig::new(AxisId::U, MotorKind::VendorActuator);
        u.homing_order = 0;
        config.axes.push(u);
        config.axes[2].homing_order = 2;
        let robot = RobotManager::new(config).unwrap();
        assert_eq!(
            robot.homing_groups(),
            vec![vec![AxisId::U], vec![AxisId::X, AxisId::Y], vec![AxisId::Z]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_mode_requires_homing() {
        let dir = TempDir::new().unwrap();
        let robot = RobotManager::new(sim_config(&dir)).unwrap();
        robot.initialize().await.unwrap();
        assert!(matches!(
            robot.set_mode(RobotMode::Auto).await,
            Err(RobotError::NotHomed(RobotMode::Auto))
        ));
        robot.home_all().await.unwrap();
        robot.set_mode(RobotMode::Auto).await.unwrap();
        assert_eq!(robot.get_status().mode, RobotMode::Auto);
        robot.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn teach_records_current_positions() {
        let dir = TempDir::new().unwrap();
        let robot = RobotManager::new(sim_config(&dir)).unwrap();
        robot.initialize().await.unwrap();
        robot.move_axis(AxisId::X, 25.0, 50.0, true).await.unwrap();

        let point = robot.teach_point("P100", "taught").unwrap();
        assert_eq!(point.get(AxisId::X), Some(25.0));
        assert_eq!(point.axes.len(), 3);

        let reloaded = PositionStore::load(robot.config().robot.points_path()).unwrap();
        assert_eq!(reloaded.get("P100"), Some(&point));

        robot.delete_point("P100").unwrap();
        assert!(robot.point("P100").is_none());
        robot.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reaches_shutdown_state() {
        let dir = TempDir::new().unwrap();
        let robot = RobotManager::new(sim_config(&dir)).unwrap();
        robot.initialize().await.unwrap();
        robot.shutdown().await;
        let status = robot.get_status();
        assert_eq!(status.state, RobotState::Shutdown);
        assert!(!status.initialized);
    }
}
