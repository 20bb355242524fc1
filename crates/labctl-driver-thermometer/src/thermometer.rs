//! Control-Byte Thermometer Driver
//!
//! Protocol Overview:
//! - Commands are single non-printable bytes with no framing
//! - Replies are `\r` terminated text lines
//!
//! | Byte | Meaning | Reply |
//! |------|---------|-------|
//! | `0x59` | identification probe | `Y` |
//! | `0x64` | status query | fixed-width status line |
//! | `0x58` | advance to the next input channel | none |
//!
//! The status line carries the active channel digit at offset 1 and the
//! temperature in columns 3 to 9:
//!
//! ```text
//! C2 +021.50 ...
//!  ^ ^^^^^^^
//!  | temperature
//!  channel
//! ```
//!
//! A background poller can re-issue the status query at a fixed interval and
//! publish each reading through an [`Observable`].

use futures::future::BoxFuture;
use futures::FutureExt;
use labctl_core::driver::{
    not_recognized, open_device, DriverFactory, DriverOptions, Instrument, LineProfile,
    PropertyDriver, SharedPort,
};
use labctl_core::error::LabResult;
use labctl_core::limits::{clamp_with_warning, MIN_POLL_INTERVAL};
use labctl_core::observable::Observable;
use labctl_core::property::{Accessor, PropertyKind, PropertyTable, PropertyValue};
use labctl_core::serial::SerialPort;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Line configuration for the thermometer's serial port.
pub const PROFILE: LineProfile = LineProfile {
    settings: &[
        "9600", "cs8", "-parenb", "-cstopb", "-crtscts", "-ixon", "raw", "-echo",
    ],
    eol: b'\r',
    timeout: Duration::from_secs(1),
};

/// Identification probe.
pub const IDENTIFY: u8 = 0x59;
/// Status query.
pub const STATUS: u8 = 0x64;
/// Advance to the next channel.
pub const NEXT_CHANNEL: u8 = 0x58;

/// Number of input channels.
pub const CHANNEL_COUNT: u8 = 4;

const CHANNEL_OFFSET: usize = 1;
const TEMPERATURE: Range<usize> = 3..10;

/// One parsed status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Active input channel (1-based)
    pub channel: u8,
    /// Temperature in degrees Celsius
    pub temperature: f64,
}

/// Parse a status line by column offsets.
pub fn parse_status(line: &str) -> Option<Reading> {
    let channel = line
        .get(CHANNEL_OFFSET..CHANNEL_OFFSET + 1)?
        .parse::<u8>()
        .ok()?;
    let temperature = line.get(TEMPERATURE)?.trim().parse::<f64>().ok()?;
    Some(Reading {
        channel,
        temperature,
    })
}

// =============================================================================
// ThermometerFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating thermometer driver instances.
pub struct ThermometerFactory;

impl DriverFactory for ThermometerFactory {
    fn driver_type(&self) -> &'static str {
        ThermometerDriver::KIND
    }

    fn name(&self) -> &'static str {
        "Multi-channel Thermometer"
    }

    fn open(
        &self,
        device: String,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = ThermometerDriver::open_with(&device, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }

    fn connect(
        &self,
        port: SerialPort,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = ThermometerDriver::connect(port, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }
}

// =============================================================================
// ThermometerDriver
// =============================================================================

struct Poller {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Driver for a control-byte thermometer.
///
/// Dropping the driver stops the poller and closes the port.
pub struct ThermometerDriver {
    port: SharedPort,
    device: String,
    /// Latest temperature from any status query, including the poller's
    temperature: Observable<Option<f64>>,
    poller: Mutex<Option<Poller>>,
}

impl std::fmt::Debug for ThermometerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThermometerDriver")
            .field("device", &self.device)
            .field("temperature", &self.temperature.get())
            .field("update_interval", &self.update_interval())
            .finish_non_exhaustive()
    }
}

impl ThermometerDriver {
    /// Open the thermometer at `path` with default options.
    pub async fn open(path: &str) -> LabResult<Self> {
        Self::open_with(path, DriverOptions::default()).await
    }

    /// Open the thermometer at `path`.
    ///
    /// # Errors
    /// - `NotAccessible` / `Open` if the device cannot be opened
    /// - `NotRecognized` if the probe byte is not answered with `Y`
    pub async fn open_with(path: &str, options: DriverOptions) -> LabResult<Self> {
        open_device(path, &PROFILE, &options, |port| {
            Self::connect(port, options.clone())
        })
        .await
    }

    /// Identify the thermometer behind an open port and take ownership of it.
    pub async fn connect(mut port: SerialPort, options: DriverOptions) -> LabResult<Self> {
        options.configure(&mut port);

        port.write_raw(&[IDENTIFY]).await?;
        let reply = port.read_line().await?.into_text().unwrap_or_default();
        if reply != "Y" {
            return Err(not_recognized(
                port.device(),
                "control-byte thermometer",
                &reply,
                options.quiet,
            ));
        }
        info!(device = %port.device(), "Thermometer identified");

        Ok(Self {
            device: port.device().to_string(),
            port: Arc::new(tokio::sync::Mutex::new(port)),
            temperature: Observable::new("temperature", None).with_units("°C"),
            poller: Mutex::new(None),
        })
    }

    /// Query the status line and publish the temperature.
    pub async fn status(&self) -> LabResult<Option<Reading>> {
        let reading = read_status(&self.port).await?;
        if let Some(reading) = reading {
            self.temperature.set(Some(reading.temperature));
        }
        Ok(reading)
    }

    /// Current temperature, queried from the instrument.
    pub async fn temperature(&self) -> LabResult<Option<f64>> {
        Ok(self.status().await?.map(|r| r.temperature))
    }

    /// Latest published temperature. No I/O.
    pub fn last_temperature(&self) -> Option<f64> {
        self.temperature.get()
    }

    /// Watch published temperatures.
    pub fn subscribe(&self) -> watch::Receiver<Option<f64>> {
        self.temperature.subscribe()
    }

    /// Active input channel.
    pub async fn channel(&self) -> LabResult<Option<u8>> {
        Ok(self.status().await?.map(|r| r.channel))
    }

    /// Advance to the next input channel.
    pub async fn next_channel(&self) -> LabResult<()> {
        self.port.lock().await.write_raw(&[NEXT_CHANNEL]).await
    }

    /// Cycle channels until `channel` is active. Out-of-range channels are
    /// clamped to [1, CHANNEL_COUNT].
    ///
    /// Returns whether the status line confirmed the selection.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn select_channel(&self, channel: i64) -> LabResult<bool> {
        let target = clamp_with_warning("channel", channel, 1, i64::from(CHANNEL_COUNT));
        for _ in 0..=CHANNEL_COUNT {
            match self.channel().await? {
                Some(active) if i64::from(active) == target => return Ok(true),
                Some(_) => self.next_channel().await?,
                None => return Ok(false),
            }
        }
        warn!(channel = target, "Channel never became active");
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Periodic polling
    // -------------------------------------------------------------------------

    /// Poll interval, or zero when polling is off.
    pub fn update_interval(&self) -> Duration {
        self.poller
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, |p| p.interval)
    }

    /// Start, retune or stop (`Duration::ZERO`) the background poller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_update_interval(&self, interval: Duration) {
        let mut poller = self.poller.lock();
        if let Some(previous) = poller.take() {
            previous.handle.abort();
            debug!(device = %self.device, "Temperature poller stopped");
        }
        if interval.is_zero() {
            return;
        }

        let interval = if interval < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                applied_ms = MIN_POLL_INTERVAL.as_millis() as u64,
                "Poll interval too short, clamped"
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };

        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.port),
            self.temperature.clone(),
            self.device.clone(),
            interval,
        ));
        debug!(device = %self.device, interval_ms = interval.as_millis() as u64, "Temperature poller started");
        *poller = Some(Poller { interval, handle });
    }
}

impl Drop for ThermometerDriver {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.handle.abort();
        }
    }
}

async fn read_status(port: &SharedPort) -> LabResult<Option<Reading>> {
    let mut port = port.lock().await;
    port.write_raw(&[STATUS]).await?;
    let Some(line) = port.read_line().await?.into_text() else {
        warn!(device = %port.device(), "No status line before timeout");
        return Ok(None);
    };
    let reading = parse_status(&line);
    if reading.is_none() {
        warn!(device = %port.device(), line = %line, "Malformed status line");
    }
    Ok(reading)
}

async fn poll_loop(
    port: SharedPort,
    temperature: Observable<Option<f64>>,
    device: String,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match read_status(&port).await {
            Ok(Some(reading)) => temperature.set(Some(reading.temperature)),
            Ok(None) => {}
            Err(e) if e.is_device_loss() => {
                warn!(device = %device, error = %e, "Device lost, temperature poller exiting");
                return;
            }
            Err(e) => warn!(device = %device, error = %e, "Temperature poll failed"),
        }
    }
}

// =============================================================================
// Property table
// =============================================================================

static PROPERTIES: LazyLock<PropertyTable<ThermometerDriver>> = LazyLock::new(|| {
    PropertyTable::new(vec![
        Accessor::new("temperature", "Measured temperature", PropertyKind::Float)
            .unit("°C")
            .getter(|t: &ThermometerDriver| async move { t.temperature().await.map(Into::into) }.boxed()),
        Accessor::new("last_temperature", "Latest published temperature", PropertyKind::Float)
            .unit("°C")
            .getter(|t: &ThermometerDriver| async move { Ok(t.last_temperature().into()) }.boxed()),
        Accessor::new("channel", "Active input channel", PropertyKind::Int)
            .getter(|t: &ThermometerDriver| {
                async move { Ok(t.channel().await?.map(i64::from).into()) }.boxed()
            })
            .setter(|t: &ThermometerDriver, v| {
                async move { t.select_channel(v.as_int("channel")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("update_interval", "Background poll interval, 0 = off", PropertyKind::Int)
            .unit("ms")
            .getter(|t: &ThermometerDriver| {
                async move { Ok(PropertyValue::Int(t.update_interval().as_millis() as i64)) }.boxed()
            })
            .setter(|t: &ThermometerDriver, v| {
                async move {
                    let ms = v.as_int("update_interval")?.max(0);
                    t.set_update_interval(Duration::from_millis(ms as u64));
                    Ok(())
                }
                .boxed()
            }),
    ])
});

impl PropertyDriver for ThermometerDriver {
    const KIND: &'static str = "thermometer";

    fn properties() -> &'static PropertyTable<Self> {
        &PROPERTIES
    }

    fn device_path(&self) -> &str {
        &self.device
    }

    /// Raw commands are control bytes given as text, e.g. `"d"` for 0x64.
    /// The reply line is returned verbatim.
    fn raw_command<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, LabResult<String>> {
        async move {
            let mut port = self.port.lock().await;
            port.write_raw(raw.as_bytes()).await?;
            Ok(port.read_line().await?.into_text().unwrap_or_default())
        }
        .boxed()
    }
}
