//! Driver registry
//!
//! Maps the `driver = "..."` names used in configuration files to the
//! [`DriverFactory`] that opens that instrument family. The CLI and any
//! embedding application open instruments through this table rather than by
//! naming driver types directly.

use labctl_core::driver::{DriverFactory, DriverOptions, Instrument};
use labctl_core::error::{LabError, LabResult};
use labctl_core::serial::SerialPort;
use std::collections::BTreeMap;
use tracing::debug;

/// Registry of driver factories keyed by driver type.
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, Box<dyn DriverFactory>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_types())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the stage, laser, shutter and thermometer factories.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_factory(Box::new(labctl_driver_stage::StageFactory));
        registry.register_factory(Box::new(labctl_driver_laser::LaserFactory));
        registry.register_factory(Box::new(labctl_driver_shutter::ShutterFactory));
        registry.register_factory(Box::new(labctl_driver_thermometer::ThermometerFactory));
        registry
    }

    /// Add a factory. A factory with the same driver type is replaced.
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        debug!(driver_type, name = factory.name(), "Registered driver factory");
        self.factories.insert(driver_type, factory);
    }

    /// Registered driver types, sorted.
    pub fn driver_types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Whether `driver_type` has a factory.
    pub fn contains(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// `(driver_type, name)` pairs for display.
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        self.factories
            .values()
            .map(|f| (f.driver_type(), f.name()))
            .collect()
    }

    fn factory(&self, driver_type: &str) -> LabResult<&dyn DriverFactory> {
        self.factories
            .get(driver_type)
            .map(|f| f.as_ref())
            .ok_or_else(|| LabError::UnknownDriver(driver_type.to_string()))
    }

    /// Open and identify `device` with the `driver_type` factory.
    pub async fn open(
        &self,
        driver_type: &str,
        device: &str,
        options: DriverOptions,
    ) -> LabResult<Box<dyn Instrument>> {
        self.factory(driver_type)?
            .open(device.to_string(), options)
            .await
    }

    /// Identify the instrument behind an already open port.
    pub async fn connect(
        &self,
        driver_type: &str,
        port: SerialPort,
        options: DriverOptions,
    ) -> LabResult<Box<dyn Instrument>> {
        self.factory(driver_type)?.connect(port, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_driver_types() {
        let registry = DriverRegistry::with_builtin();
        assert_eq!(
            registry.driver_types(),
            vec!["laser", "shutter", "stage", "thermometer"]
        );
        assert!(registry.contains("stage"));
        assert!(!registry.contains("viper"));
    }

    #[tokio::test]
    async fn test_unknown_driver() {
        let registry = DriverRegistry::with_builtin();
        let result = registry
            .open("viper", "/dev/null", DriverOptions::default())
            .await;
        assert!(matches!(result, Err(LabError::UnknownDriver(name)) if name == "viper"));
    }
}
