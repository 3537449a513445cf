//! System-wide constants for the assembly cell workspace.
//!
//! Single source of truth for numeric limits shared by the HAL and the
//! control crates.

use static_assertions::const_assert;

/// Number of axis slots (X, Y, Z, U and four auxiliary axes).
pub const MAX_AXES: usize = 8;

/// Number of addressable I/O expander boards on the CAN bus.
pub const MAX_IO_BOARDS: usize = 16;

/// Input image size per board, in bytes (32 inputs).
pub const INPUT_IMAGE_BYTES: usize = 4;

/// Output image size per board, in bytes (64 outputs).
pub const OUTPUT_IMAGE_BYTES: usize = 8;

/// Maximum CAN payload length.
pub const CAN_MAX_PAYLOAD: usize = 8;

/// Default configuration directory path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cell/config";

/// Main configuration file name inside the configuration directory.
pub const CELL_CONFIG_FILE: &str = "cell.toml";

/// Axis configuration file name inside the configuration directory.
pub const AXES_CONFIG_FILE: &str = "axes.toml";

// Board images travel in a single CAN frame each.
const_assert!(INPUT_IMAGE_BYTES <= CAN_MAX_PAYLOAD);
const_assert!(OUTPUT_IMAGE_BYTES <= CAN_MAX_PAYLOAD);
const_assert!(MAX_IO_BOARDS <= 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert!(MAX_AXES > 0 && MAX_AXES <= 8);
        assert!(MAX_IO_BOARDS > 0);
        assert_eq!(INPUT_IMAGE_BYTES * 8, 32);
        assert_eq!(OUTPUT_IMAGE_BYTES * 8, 64);
    }
}
