//! Shutter controller driver for labctl.
//!
//! Supports SC10-compatible controllers that echo each command and print an
//! interactive `> ` prompt.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labctl_driver_shutter::ShutterFactory;
//!
//! registry.register_factory(Box::new(ShutterFactory));
//! ```

pub mod sc10;

pub use sc10::{ShutterDriver, ShutterFactory};
