//! Fiber laser driver for labctl.
//!
//! Supports IPG-style lasers that answer `VERB: value` over RS-232.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labctl_driver_laser::LaserFactory;
//!
//! registry.register_factory(Box::new(LaserFactory));
//! ```

pub mod ylr;

pub use ylr::{LaserDriver, LaserFactory, LaserStatus};
