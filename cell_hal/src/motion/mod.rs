//! Multi-axis motion control.
//!
//! [`MotionController`] owns the axis configuration and the status table
//! and drives one [`MotionBackend`] (native library or simulation) chosen at
//! construction. Commands return once the backend has accepted them. A
//! control loop samples every axis each `status_interval_ms`, finishes moves,
//! enforces jog limits and latches drive alarms.
//!
//! # Module Structure
//!
//! - [`backend`] - Backend capability trait and drive status record
//! - [`native`] - Vendor library backend (FFI)
//! - [`simulation`] - Software backend with axis physics
//! - `homing` - Per-motor-kind homing procedures
//!
//! # Axis state machine
//!
//! ```text
//! Idle ──move──► Moving ──done──► Idle
//! Idle ──jog───► Jogging ─stop/limit─► Idle
//! Idle ──home──► Homing ──done──► Idle (homed)
//! any ──alarm / e-stop──► Error ──reset──► Idle
//! ```

pub mod backend;
mod homing;
pub mod native;
pub mod simulation;

use cell_common::axis::{
    AlarmFlags, AxisConfig, AxisId, AxisState, AxisStatus, JogDirection,
};
use cell_common::config::{BackendKind, MotionConfig};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use self::backend::{AxisOutput, BackendError, DriveStatus, MotionBackend};
use self::native::NativeBackend;
use self::simulation::{SimulationBackend, SimulationHandle};

/// Samples a command may stay not-busy before it counts as finished.
const START_GRACE_SAMPLES: u32 = 5;

/// Tolerance for "at the soft limit".
const LIMIT_EPSILON: f64 = 1e-6;

const CLEAR_PULSE: Duration = Duration::from_millis(100);
const SERVO_SETTLE: Duration = Duration::from_millis(500);

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum MotionError {
    #[error("Axis {axis}: target {target} outside soft limits [{min}, {max}]")]
    AxisLimit {
        axis: AxisId,
        target: f64,
        min: f64,
        max: f64,
    },

    #[error("Axis {axis}: homing not completed within {timeout_ms} ms")]
    HomingTimeout { axis: AxisId, timeout_ms: u64 },

    #[error("Axis {axis}: motion not completed within {timeout_ms} ms")]
    MotionTimeout { axis: AxisId, timeout_ms: u64 },

    #[error("Stop not confirmed within {timeout_ms} ms on {axes:?}")]
    MotionConfirm { axes: Vec<AxisId>, timeout_ms: u64 },

    #[error("Native backend error: {0}")]
    NativeBackend(#[from] BackendError),

    #[error("Axis {axis} faulted: {reason}")]
    AxisFault { axis: AxisId, reason: String },

    #[error("Axis {0} is busy")]
    AxisBusy(AxisId),

    #[error("Axis {0} not configured")]
    NotConfigured(AxisId),

    #[error("Invalid speed {0}%: must be in (0, 100]")]
    InvalidSpeed(f64),

    #[error("Invalid axis configuration: {0}")]
    Config(String),

    #[error("Wait cancelled")]
    Cancelled,
}

// ─── Events ─────────────────────────────────────────────────────────

/// Notices published by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MotionEvent {
    MotionComplete { axis: AxisId, position: f64 },
    HomingComplete { axis: AxisId, position: f64 },
    LimitStop { axis: AxisId, position: f64 },
    Alarm {
        axis: AxisId,
        alarm: AlarmFlags,
        code: u16,
        message: String,
    },
    EmergencyStop,
}

/// Cooperative cancellation flag for waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ─── Status table ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Job {
    None,
    Move { seen_busy: bool, samples: u32 },
    Jog { direction: JogDirection, seen_busy: bool, samples: u32 },
}

#[derive(Debug, Clone)]
struct AxisSlot {
    config: AxisConfig,
    status: AxisStatus,
    drive: DriveStatus,
    samples: u64,
    job: Job,
}

impl AxisSlot {
    fn new(config: AxisConfig) -> Self {
        Self {
            status: AxisStatus::new(config.axis),
            config,
            drive: DriveStatus::default(),
            samples: 0,
            job: Job::None,
        }
    }

    /// Latch a critical alarm. Returns the notice to publish, if the flag
    /// was not already set.
    fn fault(&mut self, flag: AlarmFlags, message: String) -> Option<MotionEvent> {
        let fresh = !self.status.alarm.contains(flag);
        self.status.state = AxisState::Error;
        self.status.alarm |= flag;
        self.status.target = None;
        self.job = Job::None;
        if !fresh {
            return None;
        }
        warn!(axis = %self.config.axis, %message, "axis fault");
        self.status.last_error = Some(message.clone());
        Some(MotionEvent::Alarm {
            axis: self.config.axis,
            alarm: self.status.alarm,
            code: self.status.alarm_code,
            message,
        })
    }

    fn finish(&mut self) {
        self.status.state = AxisState::Idle;
        self.status.target = None;
        self.job = Job::None;
    }
}

/// Reject commands the axis cannot take in its current state.
fn check_accepts(
    estop: bool,
    slot: &AxisSlot,
    next: AxisState,
) -> Result<(), MotionError> {
    let axis = slot.config.axis;
    if estop {
        return Err(MotionError::AxisFault {
            axis,
            reason: "emergency stop latched".to_string(),
        });
    }
    match slot.status.state {
        AxisState::Error => Err(MotionError::AxisFault {
            axis,
            reason: slot
                .status
                .last_error
                .clone()
                .unwrap_or_else(|| "axis in error".to_string()),
        }),
        AxisState::Homing => Err(MotionError::AxisBusy(axis)),
        state if next == AxisState::Homing && state.is_in_motion() => {
            Err(MotionError::AxisBusy(axis))
        }
        _ => Ok(()),
    }
}

fn validate_speed(percent: f64) -> Result<(), MotionError> {
    if percent > 0.0 && percent <= 100.0 {
        Ok(())
    } else {
        Err(MotionError::InvalidSpeed(percent))
    }
}

// ─── Shared state ───────────────────────────────────────────────────

pub(crate) struct Inner {
    config: MotionConfig,
    backend: tokio::sync::Mutex<Box<dyn MotionBackend>>,
    axes: RwLock<BTreeMap<AxisId, AxisSlot>>,
    estop: AtomicBool,
    events: broadcast::Sender<MotionEvent>,
}

impl Inner {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.status_interval_ms)
    }

    fn publish(&self, event: MotionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Run one backend call under the backend gate.
    async fn call<T>(
        &self,
        f: impl FnOnce(&mut dyn MotionBackend) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut backend = self.backend.lock().await;
        f(backend.as_mut())
    }

    /// Poll the sampled drive status of a homing axis until `pred` holds.
    ///
    /// `Ok(None)` when `limit` elapses. Fails if the axis leaves `Homing`
    /// (stop, alarm, emergency stop).
    async fn wait_drive(
        &self,
        axis: AxisId,
        limit: Duration,
        pred: impl Fn(&DriveStatus) -> bool,
    ) -> Result<Option<DriveStatus>, MotionError> {
        let start = self.sample_count(axis)?;
        let deadline = Instant::now() + limit;
        loop {
            {
                let axes = self.axes.read();
                let slot = axes.get(&axis).ok_or(MotionError::NotConfigured(axis))?;
                if slot.status.state != AxisState::Homing {
                    return Err(MotionError::AxisFault {
                        axis,
                        reason: slot
                            .status
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "homing aborted".to_string()),
                    });
                }
                if slot.samples > start && pred(&slot.drive) {
                    return Ok(Some(slot.drive));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.interval()).await;
        }
    }

    fn sample_count(&self, axis: AxisId) -> Result<u64, MotionError> {
        self.axes
            .read()
            .get(&axis)
            .map(|slot| slot.samples)
            .ok_or(MotionError::NotConfigured(axis))
    }

    /// One control-loop cycle.
    async fn tick(&self, dt: Duration) {
        let mut backend = self.backend.lock().await;
        backend.advance(dt);

        let axes: Vec<AxisId> = self.axes.read().keys().copied().collect();
        for axis in axes {
            let sample = sample_axis(backend.as_mut(), axis);
            let (events, stop) = self.apply_sample(axis, sample);
            if stop {
                if let Err(e) = backend.stop(axis) {
                    error!(%axis, error = %e, "limit stop failed");
                }
            }
            for event in events {
                self.publish(event);
            }
        }
    }

    /// Fold one sample into the status table.
    ///
    /// Returns the notices to publish and whether the axis must be stopped.
    fn apply_sample(
        &self,
        axis: AxisId,
        sample: Result<(f64, DriveStatus, u16), BackendError>,
    ) -> (Vec<MotionEvent>, bool) {
        let mut events = Vec::new();
        let mut stop = false;
        let mut axes = self.axes.write();
        let Some(slot) = axes.get_mut(&axis) else {
            return (events, stop);
        };

        let (position, drive, code) = match sample {
            Ok(sample) => sample,
            Err(e) => {
                events.extend(slot.fault(AlarmFlags::BACKEND_FAULT, format!("status read failed: {e}")));
                return (events, stop);
            }
        };

        slot.drive = drive;
        slot.samples += 1;
        slot.status.position = position;
        slot.status.moving = drive.busy;
        slot.status.alarm_code = code;

        if drive.alarm || code != 0 {
            if let Some(event) = slot.fault(
                AlarmFlags::DRIVE_ALARM,
                format!("drive alarm (code {code:#06x})"),
            ) {
                events.push(event);
                stop = true;
            }
        }
        if drive.emergency {
            events.extend(slot.fault(
                AlarmFlags::EMERGENCY_STOP,
                "drive emergency input asserted".to_string(),
            ));
        }

        match (slot.status.state, slot.job) {
            (AxisState::Moving, Job::Move { seen_busy, samples }) => {
                let seen_busy = seen_busy || drive.busy;
                let samples = samples + 1;
                let settled = !slot.config.in_position || drive.in_position;
                if !drive.busy && settled && (seen_busy || samples >= START_GRACE_SAMPLES) {
                    slot.finish();
                    debug!(%axis, position, "move complete");
                    events.push(MotionEvent::MotionComplete { axis, position });
                } else {
                    slot.job = Job::Move { seen_busy, samples };
                }
            }
            (AxisState::Jogging, Job::Jog { direction, seen_busy, samples }) => {
                let at_limit = match direction {
                    JogDirection::Positive => position >= slot.config.limit_plus - LIMIT_EPSILON,
                    JogDirection::Negative => position <= slot.config.limit_minus + LIMIT_EPSILON,
                };
                let seen_busy = seen_busy || drive.busy;
                let samples = samples + 1;
                if at_limit {
                    slot.finish();
                    slot.status.alarm |= AlarmFlags::SOFT_LIMIT;
                    slot.status.last_error = Some(format!("soft limit reached at {position:.3}"));
                    stop = true;
                    info!(%axis, position, "jog stopped at soft limit");
                    events.push(MotionEvent::LimitStop { axis, position });
                } else if !drive.busy && (seen_busy || samples >= START_GRACE_SAMPLES) {
                    slot.finish();
                } else {
                    slot.job = Job::Jog { direction, seen_busy, samples };
                }
            }
            _ => {}
        }
        (events, stop)
    }
}

fn sample_axis(
    backend: &mut dyn MotionBackend,
    axis: AxisId,
) -> Result<(f64, DriveStatus, u16), BackendError> {
    Ok((
        backend.read_position(axis)?,
        backend.read_drive_status(axis)?,
        backend.read_alarm(axis)?,
    ))
}

// ─── MotionController ───────────────────────────────────────────────

/// Axis motion facade.
pub struct MotionController {
    inner: Arc<Inner>,
    simulation: Option<SimulationHandle>,
    initialized: AtomicBool,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl MotionController {
    /// Controller over an explicit backend. Unfitted axes are dropped.
    pub fn new(config: MotionConfig, axes: &[AxisConfig], backend: Box<dyn MotionBackend>) -> Self {
        let table = axes
            .iter()
            .filter(|c| c.motor_kind.is_fitted())
            .map(|c| (c.axis, AxisSlot::new(c.clone())))
            .collect();
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                backend: tokio::sync::Mutex::new(backend),
                axes: RwLock::new(table),
                estop: AtomicBool::new(false),
                events,
            }),
            simulation: None,
            initialized: AtomicBool::new(false),
            control_task: Mutex::new(None),
        }
    }

    /// Controller over the backend selected by `config.backend`.
    pub fn from_config(config: &MotionConfig, axes: &[AxisConfig]) -> Self {
        match config.backend {
            BackendKind::Simulation => {
                let (backend, handle) = SimulationBackend::new();
                let mut controller = Self::new(config.clone(), axes, Box::new(backend));
                controller.simulation = Some(handle);
                controller
            }
            BackendKind::Native => {
                let backend = NativeBackend::new(config.library_path.clone());
                Self::new(config.clone(), axes, Box::new(backend))
            }
        }
    }

    /// Fault injection handle when running on the simulation backend.
    pub fn simulation(&self) -> Option<&SimulationHandle> {
        self.simulation.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MotionEvent> {
        self.inner.events.subscribe()
    }

    pub fn axes(&self) -> Vec<AxisId> {
        self.inner.axes.read().keys().copied().collect()
    }

    pub fn axis_config(&self, axis: AxisId) -> Result<AxisConfig, MotionError> {
        self.inner
            .axes
            .read()
            .get(&axis)
            .map(|slot| slot.config.clone())
            .ok_or(MotionError::NotConfigured(axis))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Open the backend, configure every axis, switch the drives on and
    /// start the control loop.
    pub async fn initialize(&self) -> Result<(), MotionError> {
        if self.is_initialized() {
            return Ok(());
        }
        let configs: Vec<AxisConfig> = self
            .inner
            .axes
            .read()
            .values()
            .map(|slot| slot.config.clone())
            .collect();

        self.inner
            .call(|b| {
                b.open()?;
                for config in &configs {
                    b.configure_axis(config)?;
                }
                Ok(())
            })
            .await?;

        // Clear pending drive alarms, then servo on.
        self.set_outputs(AxisOutput::Clear, true).await?;
        sleep(CLEAR_PULSE).await;
        self.set_outputs(AxisOutput::Clear, false).await?;
        sleep(CLEAR_PULSE).await;
        self.set_outputs(AxisOutput::Servo, true).await?;
        sleep(SERVO_SETTLE).await;

        self.spawn_control_loop();
        self.initialized.store(true, Ordering::Release);
        let backend = self.inner.backend.lock().await.name();
        info!(backend, axes = configs.len(), "✅ Motion controller initialized");
        Ok(())
    }

    async fn set_outputs(&self, output: AxisOutput, on: bool) -> Result<(), MotionError> {
        let axes = self.axes();
        self.inner
            .call(|b| {
                for axis in axes {
                    b.write_axis_output(axis, output, on)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    fn spawn_control_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let period = inner.interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.tick(period).await;
            }
        });
        if let Some(old) = self.control_task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop everything, switch the drives off and close the backend.
    /// Errors are logged, never raised.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_all().await {
            warn!(error = %e, "stop during shutdown not confirmed");
        }
        if let Err(e) = self.set_outputs(AxisOutput::Servo, false).await {
            warn!(error = %e, "servo off failed");
        }
        if let Some(task) = self.control_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.inner.call(|b| b.close()).await {
            warn!(error = %e, "backend close failed");
        }
        self.initialized.store(false, Ordering::Release);
        info!("Motion controller shut down");
    }

    // ─── Configuration ──────────────────────────────────────────────

    /// Replace one axis' configuration. Not allowed while it moves or
    /// while the emergency stop is latched.
    pub async fn configure(&self, config: AxisConfig) -> Result<(), MotionError> {
        config
            .validate()
            .map_err(|e| MotionError::Config(e.to_string()))?;
        let axis = config.axis;
        self.ensure_released(axis)?;
        if let Some(slot) = self.inner.axes.read().get(&axis) {
            if slot.status.state.is_in_motion() {
                return Err(MotionError::AxisBusy(axis));
            }
        }

        if self.is_initialized() {
            self.inner.call(|b| b.configure_axis(&config)).await?;
        }
        let mut axes = self.inner.axes.write();
        match axes.get_mut(&axis) {
            Some(slot) => slot.config = config,
            None => {
                axes.insert(axis, AxisSlot::new(config));
            }
        }
        info!(%axis, "axis reconfigured");
        Ok(())
    }

    // ─── Commands ───────────────────────────────────────────────────

    /// Mark the axis busy with `next`, re-checking under the status lock so
    /// an emergency stop latched meanwhile still wins.
    fn begin(
        &self,
        axis: AxisId,
        next: AxisState,
        target: Option<f64>,
        job: Job,
    ) -> Result<(), MotionError> {
        let mut axes = self.inner.axes.write();
        let slot = axes.get_mut(&axis).ok_or(MotionError::NotConfigured(axis))?;
        check_accepts(self.inner.estop.load(Ordering::Acquire), slot, next)?;
        slot.status.state = next;
        slot.status.target = target;
        slot.status.alarm &= AlarmFlags::CRITICAL_MASK;
        slot.job = job;
        Ok(())
    }

    /// Record a failed backend command on the axis.
    fn backend_fault(&self, axis: AxisId, error: BackendError) -> MotionError {
        let event = self
            .inner
            .axes
            .write()
            .get_mut(&axis)
            .and_then(|slot| slot.fault(AlarmFlags::BACKEND_FAULT, error.to_string()));
        if let Some(event) = event {
            self.inner.publish(event);
        }
        MotionError::NativeBackend(error)
    }

    fn accepts(&self, axis: AxisId, next: AxisState) -> Result<AxisConfig, MotionError> {
        let axes = self.inner.axes.read();
        let slot = axes.get(&axis).ok_or(MotionError::NotConfigured(axis))?;
        check_accepts(self.inner.estop.load(Ordering::Acquire), slot, next)?;
        Ok(slot.config.clone())
    }

    fn limit_error(config: &AxisConfig, target: f64) -> MotionError {
        MotionError::AxisLimit {
            axis: config.axis,
            target,
            min: config.limit_minus,
            max: config.limit_plus,
        }
    }

    /// Start an absolute move. Targets outside the soft limits are rejected
    /// before the backend sees anything.
    pub async fn move_absolute(
        &self,
        axis: AxisId,
        position: f64,
        speed_percent: f64,
    ) -> Result<(), MotionError> {
        validate_speed(speed_percent)?;
        let config = self.axis_config(axis)?;
        if !config.within_limits(position) {
            return Err(Self::limit_error(&config, position));
        }
        self.accepts(axis, AxisState::Moving)?;

        let speed = config.speed_for_percent(speed_percent);
        let mut backend = self.inner.backend.lock().await;
        self.begin(
            axis,
            AxisState::Moving,
            Some(position),
            Job::Move { seen_busy: false, samples: 0 },
        )?;
        debug!(%axis, position, speed, "move absolute");
        backend
            .move_absolute(axis, position, speed)
            .map_err(|e| self.backend_fault(axis, e))
    }

    /// Start a move by `distance` from the current position.
    pub async fn move_relative(
        &self,
        axis: AxisId,
        distance: f64,
        speed_percent: f64,
    ) -> Result<(), MotionError> {
        validate_speed(speed_percent)?;
        let config = self.axis_config(axis)?;
        let current = self.get_status(axis)?.position;
        let target = current + distance;
        if !config.within_limits(target) {
            return Err(Self::limit_error(&config, target));
        }
        self.accepts(axis, AxisState::Moving)?;

        let speed = config.speed_for_percent(speed_percent);
        let mut backend = self.inner.backend.lock().await;
        self.begin(
            axis,
            AxisState::Moving,
            Some(target),
            Job::Move { seen_busy: false, samples: 0 },
        )?;
        debug!(%axis, distance, speed, "move relative");
        backend
            .move_relative(axis, distance, speed)
            .map_err(|e| self.backend_fault(axis, e))
    }

    /// Start continuous motion. Runs until [`stop`](Self::stop) or the soft
    /// limit.
    pub async fn move_jog(
        &self,
        axis: AxisId,
        direction: JogDirection,
        speed_percent: f64,
    ) -> Result<(), MotionError> {
        validate_speed(speed_percent)?;
        let config = self.axis_config(axis)?;
        let position = self.get_status(axis)?.position;
        let blocked = match direction {
            JogDirection::Positive => position >= config.limit_plus - LIMIT_EPSILON,
            JogDirection::Negative => position <= config.limit_minus + LIMIT_EPSILON,
        };
        if blocked {
            return Err(Self::limit_error(&config, position));
        }
        self.accepts(axis, AxisState::Jogging)?;

        let speed = config.speed_for_percent(speed_percent);
        let mut backend = self.inner.backend.lock().await;
        self.begin(
            axis,
            AxisState::Jogging,
            None,
            Job::Jog { direction, seen_busy: false, samples: 0 },
        )?;
        debug!(%axis, ?direction, speed, "jog");
        backend
            .jog(axis, direction, speed)
            .map_err(|e| self.backend_fault(axis, e))
    }

    pub async fn stop(&self, axis: AxisId) -> Result<(), MotionError> {
        self.axis_config(axis)?;
        self.stop_axes(&[axis]).await
    }

    /// Stop every axis. A no-op that succeeds when nothing moves.
    pub async fn stop_all(&self) -> Result<(), MotionError> {
        let axes = self.axes();
        self.stop_axes(&axes).await
    }

    async fn stop_axes(&self, axes: &[AxisId]) -> Result<(), MotionError> {
        {
            let mut backend = self.inner.backend.lock().await;
            for &axis in axes {
                if let Err(e) = backend.stop(axis) {
                    warn!(%axis, error = %e, "stop command failed");
                }
            }
            let mut table = self.inner.axes.write();
            for axis in axes {
                if let Some(slot) = table.get_mut(axis) {
                    if slot.status.state.is_in_motion() {
                        slot.finish();
                    }
                }
            }
        }

        let timeout_ms = self.inner.config.stop_confirm_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let still_moving: Vec<AxisId> = {
                let table = self.inner.axes.read();
                axes.iter()
                    .copied()
                    .filter(|axis| table.get(axis).is_some_and(|slot| slot.status.moving))
                    .collect()
            };
            if still_moving.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let mut table = self.inner.axes.write();
                for axis in &still_moving {
                    if let Some(slot) = table.get_mut(axis) {
                        slot.status.alarm |= AlarmFlags::STOP_UNCONFIRMED;
                        slot.status.last_error = Some("stop not confirmed".to_string());
                    }
                }
                error!(axes = ?still_moving, timeout_ms, "stop not confirmed");
                return Err(MotionError::MotionConfirm {
                    axes: still_moving,
                    timeout_ms,
                });
            }
            sleep(self.inner.interval()).await;
        }
    }

    /// Run the homing procedure for the axis' motor kind.
    ///
    /// On success the axis is homed and its position equals
    /// `origin_offset`.
    pub async fn home(&self, axis: AxisId) -> Result<(), MotionError> {
        let config = self.accepts(axis, AxisState::Homing)?;
        self.begin(axis, AxisState::Homing, None, Job::None)?;
        if let Some(slot) = self.inner.axes.write().get_mut(&axis) {
            slot.status.homed = false;
        }
        info!(%axis, kind = ?config.motor_kind, "homing started");

        let result = homing::run(&self.inner, &config).await;

        let event = {
            let mut axes = self.inner.axes.write();
            let slot = axes.get_mut(&axis).ok_or(MotionError::NotConfigured(axis))?;
            match &result {
                Ok(()) if slot.status.state == AxisState::Homing => {
                    slot.finish();
                    slot.status.homed = true;
                    slot.status.position = config.origin_offset;
                    Some(MotionEvent::HomingComplete {
                        axis,
                        position: config.origin_offset,
                    })
                }
                Ok(()) => None,
                Err(e @ MotionError::HomingTimeout { .. }) => {
                    slot.fault(AlarmFlags::HOMING_TIMEOUT, e.to_string())
                }
                Err(MotionError::NativeBackend(e)) => {
                    slot.fault(AlarmFlags::BACKEND_FAULT, e.to_string())
                }
                Err(_) => {
                    if slot.status.state == AxisState::Homing {
                        slot.finish();
                    }
                    None
                }
            }
        };
        if let Some(event) = event {
            self.inner.publish(event);
        }

        match result {
            Ok(()) if self.get_status(axis)?.homed => {
                info!(%axis, "homing complete");
                Ok(())
            }
            Ok(()) => Err(MotionError::AxisFault {
                axis,
                reason: "homing interrupted".to_string(),
            }),
            Err(e) => {
                error!(%axis, error = %e, "homing failed");
                Err(e)
            }
        }
    }

    /// Redefine the current coordinate. Refused while the emergency stop
    /// is latched.
    pub async fn set_position(&self, axis: AxisId, position: f64) -> Result<(), MotionError> {
        self.ensure_released(axis)?;
        let status = self.get_status(axis)?;
        if status.state.is_in_motion() {
            return Err(MotionError::AxisBusy(axis));
        }
        self.inner.call(|b| b.set_position(axis, position)).await?;
        if let Some(slot) = self.inner.axes.write().get_mut(&axis) {
            slot.status.position = position;
        }
        Ok(())
    }

    // ─── Waiting ────────────────────────────────────────────────────

    /// Suspend until the axis leaves Moving/Homing/Jogging.
    ///
    /// # Errors
    ///
    /// `MotionTimeout` after `limit` (also recorded on the axis),
    /// `AxisFault` if the axis ends in `Error`.
    pub async fn wait_motion_complete(
        &self,
        axis: AxisId,
        limit: Duration,
    ) -> Result<(), MotionError> {
        self.wait_inner(axis, limit, None).await
    }

    /// As [`wait_motion_complete`](Self::wait_motion_complete), also
    /// returning `Cancelled` once `cancel` is set.
    pub async fn wait_motion_complete_cancellable(
        &self,
        axis: AxisId,
        limit: Duration,
        cancel: &CancelToken,
    ) -> Result<(), MotionError> {
        self.wait_inner(axis, limit, Some(cancel)).await
    }

    async fn wait_inner(
        &self,
        axis: AxisId,
        limit: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), MotionError> {
        let deadline = Instant::now() + limit;
        loop {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(MotionError::Cancelled);
            }
            let status = self.get_status(axis)?;
            match status.state {
                AxisState::Error => {
                    return Err(MotionError::AxisFault {
                        axis,
                        reason: status
                            .last_error
                            .unwrap_or_else(|| "axis in error".to_string()),
                    });
                }
                state if !state.is_in_motion() => return Ok(()),
                _ => {}
            }
            if Instant::now() >= deadline {
                let timeout_ms = limit.as_millis() as u64;
                if let Some(slot) = self.inner.axes.write().get_mut(&axis) {
                    slot.status.alarm |= AlarmFlags::MOTION_TIMEOUT;
                    slot.status.last_error = Some(format!("motion not complete after {timeout_ms} ms"));
                }
                return Err(MotionError::MotionTimeout { axis, timeout_ms });
            }
            sleep(self.inner.interval()).await;
        }
    }

    // ─── Status ─────────────────────────────────────────────────────

    pub fn get_status(&self, axis: AxisId) -> Result<AxisStatus, MotionError> {
        self.inner
            .axes
            .read()
            .get(&axis)
            .map(|slot| slot.status.clone())
            .ok_or(MotionError::NotConfigured(axis))
    }

    pub fn get_all_status(&self) -> Vec<AxisStatus> {
        self.inner
            .axes
            .read()
            .values()
            .map(|slot| slot.status.clone())
            .collect()
    }

    pub fn all_homed(&self) -> bool {
        self.inner.axes.read().values().all(|slot| slot.status.homed)
    }

    // ─── Safety ─────────────────────────────────────────────────────

    /// Latch the emergency stop: every axis to `Error`, then stop the drives.
    ///
    /// Commands are refused until [`reset_all`](Self::reset_all).
    pub async fn emergency_stop(&self) {
        self.inner.estop.store(true, Ordering::Release);
        {
            let mut axes = self.inner.axes.write();
            for slot in axes.values_mut() {
                // Published once below as EmergencyStop.
                let _ = slot.fault(
                    AlarmFlags::EMERGENCY_STOP,
                    "emergency stop".to_string(),
                );
            }
        }
        error!("🛑 EMERGENCY STOP");
        self.inner.publish(MotionEvent::EmergencyStop);

        let axes = self.axes();
        let mut backend = self.inner.backend.lock().await;
        for axis in axes {
            if let Err(e) = backend.stop(axis) {
                error!(%axis, error = %e, "emergency stop command failed");
            }
        }
    }

    pub fn is_estop_latched(&self) -> bool {
        self.inner.estop.load(Ordering::Acquire)
    }

    /// Clear one axis' alarms and return it to `Idle`.
    pub async fn reset(&self, axis: AxisId) -> Result<(), MotionError> {
        self.ensure_released(axis)?;
        self.reset_axes(&[axis]).await
    }

    fn ensure_released(&self, axis: AxisId) -> Result<(), MotionError> {
        if self.is_estop_latched() {
            return Err(MotionError::AxisFault {
                axis,
                reason: "emergency stop latched".to_string(),
            });
        }
        Ok(())
    }

    /// Release the emergency stop latch and reset every axis.
    pub async fn reset_all(&self) -> Result<(), MotionError> {
        self.inner.estop.store(false, Ordering::Release);
        let axes = self.axes();
        self.reset_axes(&axes).await?;
        info!("all axes reset");
        Ok(())
    }

    async fn reset_axes(&self, axes: &[AxisId]) -> Result<(), MotionError> {
        for &axis in axes {
            self.axis_config(axis)?;
        }
        self.inner
            .call(|b| {
                for &axis in axes {
                    b.write_axis_output(axis, AxisOutput::Clear, true)?;
                }
                Ok(())
            })
            .await?;
        sleep(CLEAR_PULSE).await;
        self.inner
            .call(|b| {
                for &axis in axes {
                    b.write_axis_output(axis, AxisOutput::Clear, false)?;
                }
                Ok(())
            })
            .await?;

        let mut table = self.inner.axes.write();
        for axis in axes {
            if let Some(slot) = table.get_mut(axis) {
                if slot.status.alarm.contains(AlarmFlags::EMERGENCY_STOP) {
                    slot.status.homed = false;
                }
                slot.status.state = AxisState::Idle;
                slot.status.alarm = AlarmFlags::empty();
                slot.status.last_error = None;
                slot.status.target = None;
                slot.job = Job::None;
            }
        }
        Ok(())
    }
}

impl Drop for MotionController {
    fn drop(&mut self) {
        if let Some(task) = self.control_task.get_mut().take() {
            task.abort();
        }
    }
}
