//! # labctl
//!
//! Property-based control of serial laboratory instruments.
//!
//! The drivers themselves live in the `labctl-driver-*` crates and share the
//! transport and property plumbing in `labctl-core`. This crate ties them
//! together for applications:
//!
//! - **`config`**: `labctl.toml` loading and validation (figment)
//! - **`logging`**: `tracing-subscriber` setup
//! - **`registry`**: driver type name to [`DriverFactory`](labctl_core::DriverFactory)
//!
//! ```rust,ignore
//! use labctl::{config::LabConfig, registry::DriverRegistry};
//!
//! let config = LabConfig::load()?;
//! config.validate()?;
//! let registry = DriverRegistry::with_builtin();
//! for def in config.enabled_instruments() {
//!     let instrument = registry.open(&def.driver, &def.device, def.options()).await?;
//!     println!("{}: {:?}", def.id, instrument.property_names());
//! }
//! ```

pub mod config;
pub mod logging;
pub mod registry;

pub use config::LabConfig;
pub use labctl_core::{Instrument, LabError, LabResult, PropertyValue};
pub use registry::DriverRegistry;
