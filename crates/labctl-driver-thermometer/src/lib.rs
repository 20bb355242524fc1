//! Thermometer driver for labctl.
//!
//! Supports multi-channel thermometers driven by single control bytes, with
//! optional background polling of the temperature.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labctl_driver_thermometer::ThermometerDriver;
//! use std::time::Duration;
//!
//! let thermometer = ThermometerDriver::open("/dev/ttyUSB3").await?;
//! let mut rx = thermometer.subscribe();
//! thermometer.set_update_interval(Duration::from_secs(1));
//! while rx.changed().await.is_ok() {
//!     println!("{:?} °C", *rx.borrow());
//! }
//! ```

pub mod thermometer;

pub use thermometer::{Reading, ThermometerDriver, ThermometerFactory};
