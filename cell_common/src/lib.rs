//! Cell Common Library
//!
//! Shared constants, data model and configuration loading for the
//! assembly-cell workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - System-wide numeric limits and file names
//! - [`config`] - Configuration loading traits and the [`config::CellConfig`] tree
//! - [`axis`] - Axis identity, configuration and runtime status
//! - [`io`] - I/O expander addressing and the named point table
//! - [`can`] - CAN frame representation
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use cell_common::prelude::*;
//!
//! let axis: AxisId = "z".parse().unwrap();
//! assert_eq!(axis, AxisId::Z);
//! ```

pub mod axis;
pub mod can;
pub mod config;
pub mod consts;
pub mod io;
pub mod prelude;
