//! IPG-style Fiber Laser Driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232, `\r` terminated
//! - Baud: 57600, 8N1, no flow control
//! - Commands: three or four letter verbs, optionally followed by a space and
//!   an argument (`SDC 45.0`)
//! - Replies:
//!   - `VERB: value` for queries and settings (`ROP: 12.5`, `RCT: 24.1`)
//!   - `VERB` echoed alone for actions (`EMON`)
//!   - `ERR: message` when the laser refuses a command
//!   - `BCMD` for an unknown command
//!
//! Refused and unknown commands are logged and read as empty replies.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labctl_driver_laser::LaserDriver;
//!
//! let laser = LaserDriver::open("/dev/ttyUSB1").await?;
//! laser.set_current(35.0).await?;   // clamped to [RNC, 100]
//! laser.set_emission(true).await?;
//! println!("{:?} W", laser.output_power().await?);
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use labctl_core::driver::{
    not_recognized, open_device, DriverFactory, DriverOptions, Instrument, LineProfile,
    PropertyDriver, SharedPort,
};
use labctl_core::error::LabResult;
use labctl_core::limits::clamp_with_warning;
use labctl_core::property::{Accessor, PropertyKind, PropertyTable, PropertyValue};
use labctl_core::serial::SerialPort;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

/// Line configuration for the laser's RS-232 port.
pub const PROFILE: LineProfile = LineProfile {
    settings: &[
        "57600", "cs8", "-parenb", "-cstopb", "-crtscts", "-ixon", "raw", "-echo",
    ],
    eol: b'\r',
    timeout: Duration::from_secs(1),
};

/// Reply to an unknown command.
const INVALID_COMMAND: &str = "BCMD";

/// Upper bound of the current setpoint in percent.
const MAX_CURRENT: f64 = 100.0;

static REPLY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+): ?(.*)$").expect("Invalid reply regex"));

// =============================================================================
// Status word
// =============================================================================

/// Decoded `STA` status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaserStatus(pub u32);

impl LaserStatus {
    const OVERHEAT: u32 = 1 << 1;
    const EMISSION: u32 = 1 << 2;
    const BACK_REFLECTION: u32 = 1 << 3;
    const AIMING_BEAM: u32 = 1 << 8;
    const POWER_SUPPLY_OFF: u32 = 1 << 10;
    const POWER_SUPPLY_FAILURE: u32 = 1 << 19;
    const KEYSWITCH: u32 = 1 << 21;

    /// Raw status bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Emission is on.
    pub fn emission(self) -> bool {
        self.0 & Self::EMISSION != 0
    }

    /// The hardware keyswitch is in the "on" position.
    pub fn keyswitch_on(self) -> bool {
        self.0 & Self::KEYSWITCH != 0
    }

    /// Case temperature alarm.
    pub fn overheat(self) -> bool {
        self.0 & Self::OVERHEAT != 0
    }

    /// Excessive back reflection alarm.
    pub fn back_reflection(self) -> bool {
        self.0 & Self::BACK_REFLECTION != 0
    }

    /// Guide laser is on.
    pub fn aiming_beam(self) -> bool {
        self.0 & Self::AIMING_BEAM != 0
    }

    /// Main power supply is off or has failed.
    pub fn power_supply_fault(self) -> bool {
        self.0 & (Self::POWER_SUPPLY_OFF | Self::POWER_SUPPLY_FAILURE) != 0
    }

    /// Names of the active alarms, in bit order.
    pub fn alarms(self) -> Vec<&'static str> {
        [
            (self.overheat(), "overheat"),
            (self.back_reflection(), "back_reflection"),
            (self.power_supply_fault(), "power_supply"),
        ]
        .into_iter()
        .filter_map(|(active, name)| active.then_some(name))
        .collect()
    }
}

// =============================================================================
// LaserFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating laser driver instances.
pub struct LaserFactory;

impl DriverFactory for LaserFactory {
    fn driver_type(&self) -> &'static str {
        LaserDriver::KIND
    }

    fn name(&self) -> &'static str {
        "IPG Fiber Laser"
    }

    fn open(
        &self,
        device: String,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = LaserDriver::open_with(&device, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }

    fn connect(
        &self,
        port: SerialPort,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = LaserDriver::connect(port, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }
}

// =============================================================================
// LaserDriver
// =============================================================================

/// Driver for an IPG-style fiber laser.
pub struct LaserDriver {
    port: SharedPort,
    device: String,
    /// `RNC` minimum current, queried once
    min_current: OnceCell<f64>,
}

impl std::fmt::Debug for LaserDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaserDriver")
            .field("device", &self.device)
            .field("min_current", &self.min_current.get())
            .finish_non_exhaustive()
    }
}

impl LaserDriver {
    /// Open the laser at `path` with default options.
    pub async fn open(path: &str) -> LabResult<Self> {
        Self::open_with(path, DriverOptions::default()).await
    }

    /// Open the laser at `path`.
    ///
    /// # Errors
    /// - `NotAccessible` / `Open` if the device cannot be opened
    /// - `NotRecognized` if `RFV` is not answered with `RFV: <version>`
    pub async fn open_with(path: &str, options: DriverOptions) -> LabResult<Self> {
        open_device(path, &PROFILE, &options, |port| {
            Self::connect(port, options.clone())
        })
        .await
    }

    /// Identify the laser behind an open port and take ownership of it.
    pub async fn connect(mut port: SerialPort, options: DriverOptions) -> LabResult<Self> {
        options.configure(&mut port);

        let reply = port.query("RFV").await?.into_text().unwrap_or_default();
        let firmware = REPLY_REGEX
            .captures(reply.trim())
            .filter(|caps| &caps[1] == "RFV")
            .map(|caps| caps[2].trim().to_string());

        let Some(firmware) = firmware else {
            return Err(not_recognized(
                port.device(),
                "IPG fiber laser",
                &reply,
                options.quiet,
            ));
        };
        info!(device = %port.device(), firmware = %firmware, "Laser identified");

        Ok(Self {
            device: port.device().to_string(),
            port: Arc::new(tokio::sync::Mutex::new(port)),
            min_current: OnceCell::new(),
        })
    }

    /// Send `cmd` and return the value part of the reply.
    ///
    /// `ERR:` replies, `BCMD`, replies for a different verb and timeouts are
    /// logged and yield an empty string. A bare echo of the verb is returned
    /// as is.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn command(&self, cmd: &str) -> LabResult<String> {
        let reply = self.port.lock().await.query(cmd).await?;
        let Some(text) = reply.into_text() else {
            warn!(command = cmd, "No reply before timeout");
            return Ok(String::new());
        };
        Ok(parse_reply(cmd, text.trim()).unwrap_or_default())
    }

    /// Firmware version (`RFV`).
    pub async fn firmware(&self) -> LabResult<String> {
        self.command("RFV").await
    }

    /// Decoded status word (`STA`).
    pub async fn status(&self) -> LabResult<Option<LaserStatus>> {
        let reply = self.command("STA").await?;
        Ok(parse_number::<u32>("STA", &reply).map(LaserStatus))
    }

    /// Whether emission is on, from the status word.
    pub async fn emission(&self) -> LabResult<Option<bool>> {
        Ok(self.status().await?.map(LaserStatus::emission))
    }

    /// Whether the keyswitch is on, from the status word.
    pub async fn keyswitch(&self) -> LabResult<Option<bool>> {
        Ok(self.status().await?.map(LaserStatus::keyswitch_on))
    }

    /// Whether the aiming beam is on, from the status word.
    pub async fn aiming_beam(&self) -> LabResult<Option<bool>> {
        Ok(self.status().await?.map(LaserStatus::aiming_beam))
    }

    /// Active alarms, from the status word.
    pub async fn alarms(&self) -> LabResult<Option<Vec<&'static str>>> {
        Ok(self.status().await?.map(LaserStatus::alarms))
    }

    /// Switch emission on (`EMON`) or off (`EMOFF`).
    ///
    /// Enabling emission with the keyswitch off logs a warning; the command is
    /// still sent and the laser decides.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn set_emission(&self, on: bool) -> LabResult<bool> {
        if on {
            if let Some(status) = self.status().await? {
                if !status.keyswitch_on() {
                    warn!("Enabling emission while the keyswitch is off");
                }
            }
        }

        let verb = if on { "EMON" } else { "EMOFF" };
        Ok(self.command(verb).await? == verb)
    }

    /// Output power in watts (`ROP`). `Off` reads as zero.
    pub async fn output_power(&self) -> LabResult<Option<f64>> {
        let reply = self.command("ROP").await?;
        if reply.eq_ignore_ascii_case("off") {
            return Ok(Some(0.0));
        }
        Ok(parse_number("ROP", &reply))
    }

    /// Current setpoint in percent (`RCS`).
    pub async fn current(&self) -> LabResult<Option<f64>> {
        let reply = self.command("RCS").await?;
        Ok(parse_number("RCS", &reply))
    }

    /// Set the current setpoint (`SDC`), clamped to `[RNC, 100]`.
    ///
    /// Returns the setpoint echoed by the laser.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn set_current(&self, percent: f64) -> LabResult<Option<f64>> {
        let min = self.minimum_current().await?.unwrap_or(0.0);
        let percent = clamp_with_warning("current", percent, min, MAX_CURRENT);
        let reply = self.command(&format!("SDC {:.1}", percent)).await?;
        Ok(parse_number("SDC", &reply))
    }

    /// Minimum current setpoint (`RNC`). Queried once, then cached.
    pub async fn minimum_current(&self) -> LabResult<Option<f64>> {
        let cached = self
            .min_current
            .get_or_try_init(|| async {
                let reply = self.command("RNC").await.map_err(Some)?;
                parse_number::<f64>("RNC", &reply).ok_or(None)
            })
            .await;

        match cached {
            Ok(min) => Ok(Some(*min)),
            // Unusable reply: nothing cached, ask again next time.
            Err(None) => Ok(None),
            Err(Some(e)) => Err(e),
        }
    }

    /// Case temperature in degrees Celsius (`RCT`).
    pub async fn temperature(&self) -> LabResult<Option<f64>> {
        let reply = self.command("RCT").await?;
        Ok(parse_number("RCT", &reply))
    }
}

/// Extract the value from a reply to `cmd`. `None` for refused or foreign
/// replies, after logging.
fn parse_reply(cmd: &str, reply: &str) -> Option<String> {
    let verb = cmd.split_whitespace().next().unwrap_or(cmd);

    if reply == INVALID_COMMAND {
        warn!(command = cmd, "Invalid command");
        return None;
    }
    if reply == verb {
        return Some(reply.to_string());
    }

    let Some(caps) = REPLY_REGEX.captures(reply) else {
        warn!(command = cmd, reply, "Unrecognized reply");
        return None;
    };
    match &caps[1] {
        "ERR" => {
            warn!(command = cmd, message = %&caps[2], "Laser refused command");
            None
        }
        v if v == verb => Some(caps[2].trim().to_string()),
        other => {
            warn!(command = cmd, verb = other, "Reply for a different command");
            None
        }
    }
}

fn parse_number<T: std::str::FromStr>(cmd: &str, reply: &str) -> Option<T> {
    if reply.is_empty() {
        return None;
    }
    match reply.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(command = cmd, reply, "Unparseable numeric reply");
            None
        }
    }
}

// =============================================================================
// Property table
// =============================================================================

static PROPERTIES: LazyLock<PropertyTable<LaserDriver>> = LazyLock::new(|| {
    PropertyTable::new(vec![
        Accessor::new("emission", "Laser emission", PropertyKind::Bool)
            .getter(|l: &LaserDriver| async move { l.emission().await.map(Into::into) }.boxed())
            .setter(|l: &LaserDriver, v| {
                async move { l.set_emission(v.as_bool("emission")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("current", "Diode current setpoint", PropertyKind::Float)
            .unit("%")
            .getter(|l: &LaserDriver| async move { l.current().await.map(Into::into) }.boxed())
            .setter(|l: &LaserDriver, v| {
                async move { l.set_current(v.as_float("current")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("min_current", "Minimum current setpoint", PropertyKind::Float)
            .unit("%")
            .getter(|l: &LaserDriver| {
                async move { l.minimum_current().await.map(Into::into) }.boxed()
            }),
        Accessor::new("power", "Output power", PropertyKind::Float)
            .unit("W")
            .getter(|l: &LaserDriver| async move { l.output_power().await.map(Into::into) }.boxed()),
        Accessor::new("temperature", "Case temperature", PropertyKind::Float)
            .unit("°C")
            .getter(|l: &LaserDriver| async move { l.temperature().await.map(Into::into) }.boxed()),
        Accessor::new("status", "Raw status word", PropertyKind::Int).getter(|l: &LaserDriver| {
            async move {
                let status = l.status().await?;
                Ok(status.map(|s| i64::from(s.bits())).into())
            }
            .boxed()
        }),
        Accessor::new("keyswitch", "Keyswitch position", PropertyKind::Bool)
            .getter(|l: &LaserDriver| async move { l.keyswitch().await.map(Into::into) }.boxed()),
        Accessor::new("aiming_beam", "Aiming beam", PropertyKind::Bool)
            .getter(|l: &LaserDriver| async move { l.aiming_beam().await.map(Into::into) }.boxed()),
        Accessor::new("alarms", "Active alarms, comma separated", PropertyKind::Text).getter(
            |l: &LaserDriver| {
                async move {
                    let alarms = l.alarms().await?.map(|active| match active.as_slice() {
                        [] => "none".to_string(),
                        names => names.join(","),
                    });
                    Ok(alarms.into())
                }
                .boxed()
            },
        ),
        Accessor::new("firmware", "Firmware version", PropertyKind::Text).getter(
            |l: &LaserDriver| async move { l.firmware().await.map(PropertyValue::Text) }.boxed(),
        ),
    ])
});

impl PropertyDriver for LaserDriver {
    const KIND: &'static str = "laser";

    fn properties() -> &'static PropertyTable<Self> {
        &PROPERTIES
    }

    fn device_path(&self) -> &str {
        &self.device
    }

    fn raw_command<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, LabResult<String>> {
        self.command(raw).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_core::error::LabError;
    use labctl_core::mock_serial::{self, MockDeviceHarness};
    use tracing_test::traced_test;

    fn mock_port() -> (SerialPort, MockDeviceHarness) {
        let (stream, harness) = mock_serial::new();
        let port = SerialPort::from_stream(
            "mock-laser",
            Box::new(stream),
            PROFILE.eol,
            Duration::from_millis(200),
        );
        (port, harness)
    }

    async fn connected() -> (LaserDriver, MockDeviceHarness) {
        let (port, mut harness) = mock_port();
        harness.send_response(b"RFV: 3.5.1\r").unwrap();
        let laser = LaserDriver::connect(port, DriverOptions::default())
            .await
            .unwrap();
        harness.expect_write(b"RFV\r").await;
        (laser, harness)
    }

    #[tokio::test]
    async fn test_identification() {
        let (laser, _harness) = connected().await;
        assert_eq!(laser.kind(), "laser");

        let (port, harness) = mock_port();
        harness.send_response(b"BCMD\r").unwrap();
        let result = LaserDriver::connect(port, DriverOptions::default().quiet(true)).await;
        assert!(matches!(result, Err(LabError::NotRecognized { .. })));
    }

    // =========================================================================
    // Reply parsing
    // =========================================================================

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_command_is_empty_with_one_log_line() {
        let (laser, harness) = connected().await;
        harness.send_response(b"BCMD\r").unwrap();

        assert_eq!(laser.command("RFV").await.unwrap(), "");
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("WARN")).count() {
                1 => Ok(()),
                n => Err(format!("expected one advisory log line, found {}", n)),
            }
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_error_reply_is_empty() {
        let (laser, harness) = connected().await;
        harness.send_response(b"ERR: Emission is off\r").unwrap();
        assert_eq!(laser.command("ROP").await.unwrap(), "");
        assert!(logs_contain("Emission is off"));
    }

    #[test]
    fn test_parse_reply_forms() {
        assert_eq!(parse_reply("RCT", "RCT: 24.5"), Some("24.5".to_string()));
        assert_eq!(parse_reply("RCT", "RCT:24.5"), Some("24.5".to_string()));
        assert_eq!(parse_reply("SDC 40.0", "SDC: 40.0"), Some("40.0".to_string()));
        assert_eq!(parse_reply("EMON", "EMON"), Some("EMON".to_string()));
        assert_eq!(parse_reply("RCT", "ROP: 1.0"), None);
        assert_eq!(parse_reply("RCT", "garbage reply"), None);
    }

    // =========================================================================
    // Typed accessors
    // =========================================================================

    #[tokio::test]
    async fn test_output_power_off_reads_zero() {
        let (laser, mut harness) = connected().await;
        harness.send_responses(&[b"ROP: Off\r", b"ROP: 12.5\r"]).unwrap();
        assert_eq!(laser.output_power().await.unwrap(), Some(0.0));
        assert_eq!(laser.output_power().await.unwrap(), Some(12.5));
        harness.expect_write(b"ROP\rROP\r").await;
    }

    #[tokio::test]
    async fn test_current_is_clamped_to_minimum() {
        let (laser, mut harness) = connected().await;
        harness
            .send_responses(&[b"RNC: 10.0\r", b"SDC: 10.0\r"])
            .unwrap();
        assert_eq!(laser.set_current(2.0).await.unwrap(), Some(10.0));
        harness.expect_write(b"RNC\rSDC 10.0\r").await;
    }

    #[tokio::test]
    async fn test_minimum_current_is_cached() {
        let (laser, mut harness) = connected().await;
        harness
            .send_responses(&[b"RNC: 10.0\r", b"SDC: 100.0\r"])
            .unwrap();
        assert_eq!(laser.minimum_current().await.unwrap(), Some(10.0));
        assert_eq!(laser.set_current(150.0).await.unwrap(), Some(100.0));
        harness.expect_write(b"RNC\rSDC 100.0\r").await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_emission_with_keyswitch_off_warns_and_sends() {
        let (laser, mut harness) = connected().await;
        harness.send_responses(&[b"STA: 0\r", b"EMON\r"]).unwrap();
        assert!(laser.set_emission(true).await.unwrap());
        harness.expect_write(b"STA\rEMON\r").await;
        assert!(logs_contain("keyswitch is off"));
    }

    #[tokio::test]
    async fn test_emission_off_skips_status() {
        let (laser, mut harness) = connected().await;
        harness.send_response(b"EMOFF\r").unwrap();
        assert!(laser.set_emission(false).await.unwrap());
        harness.expect_write(b"EMOFF\r").await;
    }

    #[test]
    fn test_status_bits() {
        let status = LaserStatus((1 << 2) | (1 << 21));
        assert!(status.emission());
        assert!(status.keyswitch_on());
        assert!(!status.overheat());
        assert!(!status.power_supply_fault());
        assert!(LaserStatus(1 << 19).power_supply_fault());
        assert!(status.alarms().is_empty());
        assert_eq!(
            LaserStatus((1 << 1) | (1 << 3) | (1 << 10)).alarms(),
            vec!["overheat", "back_reflection", "power_supply"]
        );
    }

    #[tokio::test]
    async fn test_alarm_and_aiming_beam_properties() {
        let (laser, mut harness) = connected().await;
        harness
            .send_responses(&[b"STA: 524546\r", b"STA: 4\r"])
            .unwrap();
        // overheat | aiming beam | power supply failure
        assert_eq!(
            laser.get_property("aiming_beam").await.unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            laser.get_property("alarms").await.unwrap(),
            PropertyValue::Text("none".to_string())
        );
        harness.expect_write(b"STA\rSTA\r").await;

        harness.send_response(b"STA: 524546\r").unwrap();
        assert_eq!(
            laser.get_property("alarms").await.unwrap(),
            PropertyValue::Text("overheat,power_supply".to_string())
        );
    }

    #[tokio::test]
    async fn test_properties() {
        let (laser, mut harness) = connected().await;
        harness
            .send_responses(&[b"STA: 2097156\r", b"RCT: 24.5\r"])
            .unwrap();
        assert_eq!(
            laser.get_property("emission").await.unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            laser.get_property("temperature").await.unwrap(),
            PropertyValue::Float(24.5)
        );
        harness.expect_write(b"STA\rRCT\r").await;
        assert!(laser.set_property_str("power", "1").await.is_err());
    }

    #[test]
    fn test_factory_driver_type() {
        assert_eq!(LaserFactory.driver_type(), "laser");
    }
}
