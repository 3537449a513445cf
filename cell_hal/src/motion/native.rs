//! Vendor motion library backend.
//!
//! The library is opened at runtime with `libloading` and every entry point
//! is resolved once in [`NativeBackend::open`]. All calls return a C `bool`;
//! `false` becomes [`BackendError::Call`]. Register words read back from the
//! pulse-generator chip are decoded here and nowhere else.

use bitflags::bitflags;
use cell_common::axis::{AxisConfig, AxisId, HomingDirection, JogDirection, MotorKind};
use cell_common::consts::MAX_AXES;
use libc::c_int;
use libloading::Library;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::backend::{AxisOutput, BackendError, DriveStatus, HomingRequest, MotionBackend};

type OpenFn = unsafe extern "C" fn() -> bool;
type AxisFn = unsafe extern "C" fn(c_int) -> bool;
type SetModeFn = unsafe extern "C" fn(c_int, c_int, c_int, c_int, bool) -> bool;
type SetValueFn = unsafe extern "C" fn(c_int, c_int, bool) -> bool;
type AxisPairFn = unsafe extern "C" fn(c_int, c_int, c_int) -> bool;
type OrgModeFn = unsafe extern "C" fn(c_int, c_int, c_int, bool) -> bool;
type PtpFn = unsafe extern "C" fn(c_int, c_int, c_int, bool) -> bool;
type JogFn = unsafe extern "C" fn(c_int, bool, c_int) -> bool;
type GetCoordFn = unsafe extern "C" fn(c_int, *mut c_int) -> bool;
type SetCoordFn = unsafe extern "C" fn(c_int, c_int) -> bool;
type ReadRegFn = unsafe extern "C" fn(c_int, c_int, *mut c_int) -> bool;

/// Read registers.
const RR0: c_int = 0x00;
const RR2: c_int = 0x02;
const RR3: c_int = 0x03;

/// WR2 default: limits active, in-position input enabled.
const WR2_DEFAULT: c_int = 0xA384;
const WR2_INPOS_ENABLE: c_int = 0x0080;
/// WR3 for actuators with their own controller, and for pulse-train motors.
const WR3_ACTUATOR: c_int = 0x0B40;
const WR3_PULSE: c_int = 0x0F90;

/// Auto-origin mode words.
const H1M_BASE: c_int = 0x315;
const H1M_CW: c_int = 0x02;
const H2M: c_int = 0x686;

bitflags! {
    /// RR2 error register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Rr2: u32 {
        const ALARM = 1 << 10;
        const EMERGENCY = 1 << 20;
    }
}

bitflags! {
    /// RR3 low word, input signal status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Rr3: u16 {
        /// Origin sensor.
        const STOP1 = 0x0002;
        /// Drive-side homing running.
        const STOP2 = 0x0004;
        const INPOS = 0x0008;
    }
}

/// RR0 drive bit for an axis. Each chip serves four axes.
#[inline]
fn rr0_drive_bit(axis: AxisId) -> u32 {
    1 << (axis.index() % 4)
}

#[inline]
fn rr0_error_bit(axis: AxisId) -> u32 {
    0x10 << (axis.index() % 4)
}

/// Decode the three status registers into a [`DriveStatus`].
fn decode_status(axis: AxisId, rr0: u32, rr2: u32, rr3: u32) -> DriveStatus {
    let rr2 = Rr2::from_bits_truncate(rr2);
    let rr3 = Rr3::from_bits_truncate((rr3 & 0xFFFF) as u16);
    DriveStatus {
        busy: rr0 & rr0_drive_bit(axis) != 0,
        in_position: rr3.contains(Rr3::INPOS),
        alarm: rr0 & rr0_error_bit(axis) != 0 || rr2.contains(Rr2::ALARM),
        emergency: rr2.contains(Rr2::EMERGENCY),
        origin_sensor: rr3.contains(Rr3::STOP1),
        homing: rr3.contains(Rr3::STOP2),
    }
}

fn mode_words(config: &AxisConfig) -> (c_int, c_int) {
    let mut wr2 = WR2_DEFAULT;
    if !config.in_position {
        wr2 &= !WR2_INPOS_ENABLE;
    }
    let wr3 = match config.motor_kind {
        MotorKind::VendorActuator => WR3_ACTUATOR,
        _ => WR3_PULSE,
    };
    (wr2, wr3)
}

fn origin_mode(direction: HomingDirection) -> c_int {
    match direction {
        HomingDirection::Cw => H1M_BASE | H1M_CW,
        HomingDirection::Ccw => H1M_BASE,
    }
}

/// Resolved entry points. Holding the `Library` keeps them valid.
struct Api {
    _library: Library,
    close: OpenFn,
    set_mode: SetModeFn,
    set_drive: SetValueFn,
    set_iv: SetValueFn,
    set_acc: SetValueFn,
    set_dec: SetValueFn,
    set_slimit: AxisPairFn,
    set_org_mode: OrgModeFn,
    org: AxisPairFn,
    abs: AxisPairFn,
    ptp: PtpFn,
    jog: JogFn,
    stop: AxisFn,
    get_logic_cie: GetCoordFn,
    set_logic_cie: SetCoordFn,
    set_real_cie: SetCoordFn,
    set_gen_bout: SetValueFn,
    r_reg: ReadRegFn,
}

fn symbol<T: Copy>(library: &Library, name: &'static str) -> Result<T, BackendError> {
    // SAFETY: the caller names the C signature the vendor header declares
    // for `name`; the symbol lives as long as `library`, which `Api` owns.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|e| BackendError::Symbol {
            symbol: name,
            reason: e.to_string(),
        })
}

impl Api {
    fn load(path: &Path) -> Result<(Self, OpenFn), BackendError> {
        // SAFETY: loading runs the library's initializers. The path comes
        // from operator configuration and names the vendor library.
        let library = unsafe { Library::new(path) }
            .map_err(|e| BackendError::Load(format!("{}: {e}", path.display())))?;

        let open = symbol::<OpenFn>(&library, "cw_mc_open")?;
        let api = Self {
            close: symbol(&library, "cw_mc_close")?,
            set_mode: symbol(&library, "cw_mc_set_mode")?,
            set_drive: symbol(&library, "cw_mc_set_drive")?,
            set_iv: symbol(&library, "cw_mc_set_iv")?,
            set_acc: symbol(&library, "cw_mc_set_acc")?,
            set_dec: symbol(&library, "cw_mc_set_dec")?,
            set_slimit: symbol(&library, "cw_mc_set_slimit")?,
            set_org_mode: symbol(&library, "cw_mc_set_org_mode")?,
            org: symbol(&library, "cw_mc_org")?,
            abs: symbol(&library, "cw_mc_abs")?,
            ptp: symbol(&library, "cw_mc_ptp")?,
            jog: symbol(&library, "cw_mc_jog")?,
            stop: symbol(&library, "cw_mc_stop")?,
            get_logic_cie: symbol(&library, "cw_mc_get_logic_cie")?,
            set_logic_cie: symbol(&library, "cw_mc_set_logic_cie")?,
            set_real_cie: symbol(&library, "cw_mc_set_real_cie")?,
            set_gen_bout: symbol(&library, "cw_mc_set_gen_bout")?,
            r_reg: symbol(&library, "cw_mc_r_reg")?,
            _library: library,
        };
        Ok((api, open))
    }
}

#[inline]
fn check(ok: bool, function: &'static str, axis: AxisId) -> Result<(), BackendError> {
    if ok {
        Ok(())
    } else {
        Err(BackendError::Call { function, axis })
    }
}

/// Backend driving the vendor pulse-generator board.
pub struct NativeBackend {
    library_path: PathBuf,
    api: Option<Api>,
    configs: [Option<AxisConfig>; MAX_AXES],
}

impl NativeBackend {
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: library_path.into(),
            api: None,
            configs: std::array::from_fn(|_| None),
        }
    }

    fn api(&self) -> Result<&Api, BackendError> {
        self.api.as_ref().ok_or(BackendError::NotOpen)
    }

    fn config(&self, axis: AxisId) -> Result<&AxisConfig, BackendError> {
        self.configs[axis.index()]
            .as_ref()
            .ok_or(BackendError::NotConfigured(axis))
    }

    /// Axis number and pulse conversion for a configured axis.
    fn pulses(&self, axis: AxisId, mm: f64) -> Result<c_int, BackendError> {
        Ok(self.config(axis)?.mm_to_pulse(mm))
    }

    fn read_register(&self, axis: AxisId, register: c_int) -> Result<u32, BackendError> {
        let api = self.api()?;
        let mut value: c_int = 0;
        // SAFETY: `value` outlives the call and is a valid out pointer.
        let ok = unsafe { (api.r_reg)(axis.index() as c_int, register, &mut value) };
        check(ok, "cw_mc_r_reg", axis)?;
        Ok(value as u32)
    }
}

impl MotionBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open(&mut self) -> Result<(), BackendError> {
        if self.api.is_some() {
            return Ok(());
        }
        let (api, open) = Api::load(&self.library_path)?;
        // SAFETY: resolved from the loaded library, takes no arguments.
        if !unsafe { open() } {
            return Err(BackendError::Load("cw_mc_open returned false".to_string()));
        }
        info!(library = %self.library_path.display(), "motion library opened");
        self.api = Some(api);
        Ok(())
    }

    fn configure_axis(&mut self, config: &AxisConfig) -> Result<(), BackendError> {
        let axis = config.axis;
        let n = axis.index() as c_int;
        let (wr2, wr3) = mode_words(config);
        let api = self.api()?;

        // SAFETY (all calls below): plain integer arguments.
        unsafe {
            check((api.set_mode)(n, 0, wr2, wr3, false), "cw_mc_set_mode", axis)?;
            check(
                (api.set_drive)(n, config.mm_to_pulse(config.max_speed), false),
                "cw_mc_set_drive",
                axis,
            )?;
            check(
                (api.set_iv)(n, config.mm_to_pulse(config.start_speed), false),
                "cw_mc_set_iv",
                axis,
            )?;
            check(
                (api.set_acc)(n, config.mm_to_pulse(config.max_accel), false),
                "cw_mc_set_acc",
                axis,
            )?;
            check(
                (api.set_dec)(n, config.mm_to_pulse(config.max_decel), false),
                "cw_mc_set_dec",
                axis,
            )?;
            check(
                (api.set_slimit)(
                    n,
                    config.mm_to_pulse(config.limit_minus),
                    config.mm_to_pulse(config.limit_plus),
                ),
                "cw_mc_set_slimit",
                axis,
            )?;
            check((api.set_logic_cie)(n, 0), "cw_mc_set_logic_cie", axis)?;
        }

        debug!(%axis, wr2, wr3, "axis configured");
        self.configs[axis.index()] = Some(config.clone());
        Ok(())
    }

    fn move_absolute(
        &mut self,
        axis: AxisId,
        position: f64,
        speed: f64,
    ) -> Result<(), BackendError> {
        let target = self.pulses(axis, position)?;
        let speed = self.pulses(axis, speed)?;
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        let ok = unsafe { (api.abs)(axis.index() as c_int, target, speed) };
        check(ok, "cw_mc_abs", axis)
    }

    fn move_relative(
        &mut self,
        axis: AxisId,
        distance: f64,
        speed: f64,
    ) -> Result<(), BackendError> {
        let distance = self.pulses(axis, distance)?;
        let speed = self.pulses(axis, speed)?;
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        let ok = unsafe { (api.ptp)(axis.index() as c_int, distance, speed, false) };
        check(ok, "cw_mc_ptp", axis)
    }

    fn jog(
        &mut self,
        axis: AxisId,
        direction: JogDirection,
        speed: f64,
    ) -> Result<(), BackendError> {
        let speed = self.pulses(axis, speed)?;
        let ccw = direction == JogDirection::Negative;
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        let ok = unsafe { (api.jog)(axis.index() as c_int, ccw, speed) };
        check(ok, "cw_mc_jog", axis)
    }

    fn stop(&mut self, axis: AxisId) -> Result<(), BackendError> {
        let api = self.api()?;
        // SAFETY: plain integer argument.
        let ok = unsafe { (api.stop)(axis.index() as c_int) };
        check(ok, "cw_mc_stop", axis)
    }

    fn home(&mut self, axis: AxisId, request: &HomingRequest) -> Result<(), BackendError> {
        let speed = self.pulses(axis, request.speed)?;
        let n = axis.index() as c_int;
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        unsafe {
            check((api.set_drive)(n, speed, false), "cw_mc_set_drive", axis)?;
            check(
                (api.set_org_mode)(n, origin_mode(request.direction), H2M, false),
                "cw_mc_set_org_mode",
                axis,
            )?;
            check((api.org)(n, speed - 1, speed), "cw_mc_org", axis)
        }
    }

    fn write_axis_output(
        &mut self,
        axis: AxisId,
        output: AxisOutput,
        on: bool,
    ) -> Result<(), BackendError> {
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        let ok = unsafe { (api.set_gen_bout)(axis.index() as c_int, output as c_int, on) };
        check(ok, "cw_mc_set_gen_bout", axis)
    }

    fn set_soft_limits(
        &mut self,
        axis: AxisId,
        limits: Option<(f64, f64)>,
    ) -> Result<(), BackendError> {
        let (minus, plus) = match limits {
            Some((minus, plus)) => (self.pulses(axis, minus)?, self.pulses(axis, plus)?),
            None => (0, 0),
        };
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        let ok = unsafe { (api.set_slimit)(axis.index() as c_int, minus, plus) };
        check(ok, "cw_mc_set_slimit", axis)
    }

    fn set_position(&mut self, axis: AxisId, position: f64) -> Result<(), BackendError> {
        let pulse = self.pulses(axis, position)?;
        let n = axis.index() as c_int;
        let api = self.api()?;
        // SAFETY: plain integer arguments.
        unsafe {
            check((api.set_logic_cie)(n, pulse), "cw_mc_set_logic_cie", axis)?;
            check((api.set_real_cie)(n, pulse), "cw_mc_set_real_cie", axis)
        }
    }

    fn read_position(&mut self, axis: AxisId) -> Result<f64, BackendError> {
        let config = self.config(axis)?;
        let api = self.api()?;
        let mut pulse: c_int = 0;
        // SAFETY: `pulse` outlives the call and is a valid out pointer.
        let ok = unsafe { (api.get_logic_cie)(axis.index() as c_int, &mut pulse) };
        check(ok, "cw_mc_get_logic_cie", axis)?;
        Ok(config.pulse_to_mm(pulse))
    }

    fn read_alarm(&mut self, axis: AxisId) -> Result<u16, BackendError> {
        let rr2 = self.read_register(axis, RR2)?;
        Ok((rr2 & 0xFFFF) as u16)
    }

    fn read_drive_status(&mut self, axis: AxisId) -> Result<DriveStatus, BackendError> {
        let rr0 = self.read_register(axis, RR0)?;
        let rr2 = self.read_register(axis, RR2)?;
        let rr3 = self.read_register(axis, RR3)?;
        Ok(decode_status(axis, rr0, rr2, rr3))
    }

    fn close(&mut self) -> Result<(), BackendError> {
        let Some(api) = self.api.take() else {
            return Ok(());
        };
        // SAFETY: resolved from the still-loaded library, takes no arguments.
        let ok = unsafe { (api.close)() };
        info!("motion library closed");
        if ok {
            Ok(())
        } else {
            Err(BackendError::Load("cw_mc_close returned false".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decoding_per_axis() {
        let status = decode_status(AxisId::Y, 0x02 | 0x10, 0, 0x0008);
        assert!(status.busy);
        assert!(status.in_position);
        assert!(!status.alarm, "X error bit must not flag Y");

        let status = decode_status(AxisId::X, 0x10, 0, 0);
        assert!(status.alarm);
        assert!(!status.busy);
    }

    #[test]
    fn status_decoding_second_chip() {
        // S1 is the first axis of the second chip.
        let status = decode_status(AxisId::S1, 0x01, 0, 0);
        assert!(status.busy);
    }

    #[test]
    fn rr2_and_rr3_bits() {
        let status = decode_status(AxisId::Z, 0, (1 << 10) | (1 << 20), 0x0006);
        assert!(status.alarm);
        assert!(status.emergency);
        assert!(status.origin_sensor);
        assert!(status.homing);
    }

    #[test]
    fn mode_words_follow_motor_kind() {
        let mut config = AxisConfig::new(AxisId::X, MotorKind::VendorActuator);
        assert_eq!(mode_words(&config), (0xA384, 0x0B40));
        config.motor_kind = MotorKind::Stepping;
        config.in_position = false;
        assert_eq!(mode_words(&config), (0xA304, 0x0F90));
    }

    #[test]
    fn origin_mode_direction() {
        assert_eq!(origin_mode(HomingDirection::Cw), 0x317);
        assert_eq!(origin_mode(HomingDirection::Ccw), 0x315);
    }

    #[test]
    fn missing_library_is_a_load_error() {
        let mut backend = NativeBackend::new("/nonexistent/libcwmc.so");
        assert!(matches!(backend.open(), Err(BackendError::Load(_))));
        assert!(matches!(
            backend.read_position(AxisId::X),
            Err(BackendError::NotConfigured(AxisId::X))
        ));
    }
}
