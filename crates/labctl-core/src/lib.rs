//! `labctl-core`
//!
//! Shared building blocks for controlling serial laboratory instruments.
//!
//! ## Layers
//!
//! - **Transport**: [`serial::SerialPort`] frames ASCII lines over a character
//!   device, with an end-of-line byte and a per-byte read timeout. Line
//!   settings are delegated to `stty`.
//! - **Driver plumbing**: [`driver::open_device`] opens, identifies and on
//!   failure restores a device; [`driver::DriverOptions`] and
//!   [`driver::LineProfile`] carry the knobs.
//! - **Properties**: [`property::PropertyTable`] maps names to getters and
//!   setters; [`driver::Instrument`] exposes any driver through its table.
//!
//! ## Error policy
//!
//! Failures to open or identify a device are returned as [`LabError`].
//! Faults the instrument itself reports are logged and turned into sentinel
//! values by each driver.
//!
//! ## Testing
//!
//! [`mock_serial`] provides a scripted device and a loopback stream that plug
//! into [`serial::SerialPort::from_stream`].

pub mod driver;
pub mod error;
pub mod limits;
pub mod mock_serial;
pub mod observable;
pub mod property;
pub mod serial;
mod stty;
#[cfg(unix)]
pub mod tty;

pub use driver::{DriverFactory, DriverOptions, Instrument, LineProfile, PropertyDriver, SharedPort};
pub use error::{LabError, LabResult};
pub use observable::Observable;
pub use property::{Accessor, PropertyInfo, PropertyKind, PropertyTable, PropertyValue};
pub use serial::{LineRead, SerialPort};
