//! Driver plumbing and the driver plugin API.
//!
//! Every instrument family follows the same construction path:
//!
//! ```text
//! open_device(path, profile, options, connect)
//!   │
//!   ├─ capture prior line settings (stty -g)
//!   ├─ serial::new(path).settings(..).eol(..).open()
//!   ├─ drain stale input
//!   └─ connect(port)         ── identification handshake
//!        │
//!        ├─ Ok(driver)
//!        └─ Err(NotRecognized) ── port dropped, prior settings restored
//! ```
//!
//! Drivers then describe themselves through a static [`PropertyTable`] and get
//! the object-safe [`Instrument`] interface for free by implementing
//! [`PropertyDriver`]. A [`DriverFactory`] per family lets the registry open
//! drivers by name.

use crate::error::{LabError, LabResult};
use crate::limits::DRAIN_WINDOW;
use crate::property::{PropertyInfo, PropertyTable, PropertyValue};
use crate::serial::{self, SerialPort};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Port handle shared between a driver and its background tasks.
///
/// The mutex is held for a full command round trip so that replies are never
/// interleaved.
pub type SharedPort = Arc<Mutex<SerialPort>>;

// =============================================================================
// Options and line profiles
// =============================================================================

/// Caller-tunable driver options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOptions {
    /// Read timeout overriding the family default.
    pub timeout: Option<Duration>,
    /// Suppress the advisory log when identification fails.
    /// Construction still fails.
    pub quiet: bool,
    /// Echo serial traffic to the debug log.
    pub debug: bool,
}

impl DriverOptions {
    /// Override the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Suppress identification failure logs.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Enable the serial debug echo.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Apply timeout and debug settings to an already open port.
    pub fn configure(&self, port: &mut SerialPort) {
        if let Some(timeout) = self.timeout {
            port.set_timeout(timeout);
        }
        if self.debug {
            port.set_debug(true);
        }
    }
}

/// Fixed line configuration of one instrument family.
#[derive(Debug, Clone, Copy)]
pub struct LineProfile {
    /// `stty` options (baud, parity, flow control, raw mode)
    pub settings: &'static [&'static str],
    /// End-of-line byte
    pub eol: u8,
    /// Default read timeout
    pub timeout: Duration,
}

// =============================================================================
// Construction
// =============================================================================

/// Open `path` with `profile` and hand the port to `connect` for identification.
///
/// If `connect` fails with [`LabError::NotRecognized`], the line settings the
/// device had before this call are restored. The port itself has already been
/// dropped by then.
pub async fn open_device<D, F, Fut>(
    path: &str,
    profile: &LineProfile,
    options: &DriverOptions,
    connect: F,
) -> LabResult<D>
where
    F: FnOnce(SerialPort) -> Fut,
    Fut: Future<Output = LabResult<D>>,
{
    let prior = match SerialPort::query_settings(path).await {
        Ok(settings) => Some(settings),
        Err(e) => {
            debug!(device = path, error = %e, "Could not capture prior line settings");
            None
        }
    };

    let mut port = serial::new(path)
        .settings(profile.settings)
        .eol(profile.eol)
        .timeout(options.timeout.unwrap_or(profile.timeout))
        .debug(options.debug)
        .open()
        .await?;
    port.drain(DRAIN_WINDOW).await;

    match connect(port).await {
        Err(err @ LabError::NotRecognized { .. }) => {
            if let Some(prior) = prior {
                SerialPort::apply_settings(path, &prior).await;
            }
            Err(err)
        }
        other => other,
    }
}

/// Build a [`LabError::NotRecognized`], logging it unless `quiet`.
pub fn not_recognized(device: &str, expected: &str, reply: &str, quiet: bool) -> LabError {
    if !quiet {
        warn!(
            device,
            expected,
            reply,
            "Identification failed, releasing port"
        );
    }
    LabError::NotRecognized {
        path: device.to_string(),
        expected: expected.to_string(),
        reply: reply.to_string(),
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// Object-safe view of any driver.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Driver family name (matches [`DriverFactory::driver_type`]).
    fn kind(&self) -> &'static str;

    /// Device path of the owned port.
    fn device(&self) -> &str;

    /// Property names in declaration order.
    fn property_names(&self) -> Vec<&'static str>;

    /// Introspection records for every property.
    fn describe(&self) -> Vec<PropertyInfo>;

    /// Read a property.
    async fn get_property(&self, name: &str) -> LabResult<PropertyValue>;

    /// Write a property.
    async fn set_property(&self, name: &str, value: PropertyValue) -> LabResult<()>;

    /// Parse and write a property.
    async fn set_property_str(&self, name: &str, input: &str) -> LabResult<()>;

    /// Read every readable property.
    async fn snapshot(&self) -> Vec<(&'static str, LabResult<PropertyValue>)>;

    /// Send a raw command and return the parsed reply.
    async fn command(&self, raw: &str) -> LabResult<String>;
}

/// A driver described by a static property table.
///
/// Implementing this trait provides [`Instrument`].
pub trait PropertyDriver: Send + Sync + 'static {
    /// Driver family name.
    const KIND: &'static str;

    /// The property table shared by every instance.
    fn properties() -> &'static PropertyTable<Self>
    where
        Self: Sized;

    /// Device path of the owned port.
    fn device_path(&self) -> &str;

    /// Raw command passthrough with the family's reply parsing.
    fn raw_command<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, LabResult<String>>;
}

#[async_trait]
impl<D: PropertyDriver> Instrument for D {
    fn kind(&self) -> &'static str {
        D::KIND
    }

    fn device(&self) -> &str {
        self.device_path()
    }

    fn property_names(&self) -> Vec<&'static str> {
        D::properties().names()
    }

    fn describe(&self) -> Vec<PropertyInfo> {
        D::properties().describe()
    }

    async fn get_property(&self, name: &str) -> LabResult<PropertyValue> {
        D::properties().get(self, name).await
    }

    async fn set_property(&self, name: &str, value: PropertyValue) -> LabResult<()> {
        D::properties().set(self, name, value).await
    }

    async fn set_property_str(&self, name: &str, input: &str) -> LabResult<()> {
        D::properties().set_str(self, name, input).await
    }

    async fn snapshot(&self) -> Vec<(&'static str, LabResult<PropertyValue>)> {
        D::properties().snapshot(self).await
    }

    async fn command(&self, raw: &str) -> LabResult<String> {
        self.raw_command(raw).await
    }
}

// =============================================================================
// DriverFactory
// =============================================================================

/// Opens drivers of one family by name.
///
/// ```rust,ignore
/// let factory = StageFactory;
/// let stage = factory.open("/dev/ttyUSB0".into(), DriverOptions::default()).await?;
/// println!("{}", stage.get_property("position").await?);
/// ```
pub trait DriverFactory: Send + Sync + 'static {
    /// Name used in configuration files (`driver = "stage"`).
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Open and identify the device at `device`.
    fn open(
        &self,
        device: String,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>>;

    /// Identify the device behind an already open port.
    fn connect(
        &self,
        port: SerialPort,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>>;
}
