//! Stage controller driver for labctl.
//!
//! Supports ProScan-compatible XYZ stage controllers over RS-232.
//!
//! # Usage
//!
//! Register the factory with the driver registry:
//!
//! ```rust,ignore
//! use labctl_driver_stage::StageFactory;
//!
//! registry.register_factory(Box::new(StageFactory));
//! ```

pub mod proscan;

pub use proscan::{Axis, StageDriver, StageFactory};
