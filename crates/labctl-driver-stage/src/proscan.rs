//! ProScan-style Motorized Stage Controller Driver
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232, `\r` terminated
//! - Baud: 9600, 8N1, no flow control
//! - Commands: `VERB[,arg...]`, e.g. `G,100,-200,30` (absolute move)
//! - Replies: a bare value, `R` when a motion command completes, `0` for an
//!   accepted setting, or `E,<code>` on error
//! - Multi-line replies (status dumps) end with a line reading `END`
//!
//! Positions are integer controller units. Fractional targets are truncated
//! toward zero before transmission.
//!
//! # Usage
//!
//! ```rust,ignore
//! use labctl_driver_stage::StageDriver;
//!
//! let stage = StageDriver::open("/dev/ttyUSB0").await?;
//! stage.move_to(&[1000.0, 2000.0], false).await?;  // X and Y only
//! stage.move_to(&[50.0], false).await?;            // Z only, X/Y from cache
//! println!("{:?}", stage.position().await?);
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use labctl_core::driver::{
    not_recognized, open_device, DriverFactory, DriverOptions, Instrument, LineProfile,
    PropertyDriver, SharedPort,
};
use labctl_core::error::{LabError, LabResult};
use labctl_core::limits::{clamp_with_warning, DRAIN_WINDOW, MAX_TEXT_LINES};
use labctl_core::property::{Accessor, PropertyKind, PropertyTable, PropertyValue};
use labctl_core::serial::{LineRead, SerialPort};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Line configuration for the controller's RS-232 port.
pub const PROFILE: LineProfile = LineProfile {
    settings: &[
        "9600", "cs8", "-parenb", "-cstopb", "-crtscts", "-ixon", "raw", "-echo",
    ],
    eol: b'\r',
    timeout: Duration::from_secs(1),
};

/// Terminator line of multi-line replies.
const TEXT_TERMINATOR: &str = "END";

/// Length of the firmware version reply used for identification.
const VERSION_LEN: usize = 3;

/// Legal range of the speed, acceleration and S-curve settings.
const LIMIT_RANGE: (i64, i64) = (1, 100);

/// Description of a ProScan error code.
pub fn error_description(code: u32) -> &'static str {
    match code {
        1 => "NO STAGE",
        2 => "NOT IDLE",
        3 => "NO DRIVE",
        4 => "STRING PARSE",
        5 => "COMMAND NOT FOUND",
        6 => "INVALID SHUTTER",
        7 => "NO FOCUS",
        8 => "VALUE OUT OF RANGE",
        9 => "INVALID WHEEL",
        10 => "ARG1 OUT OF RANGE",
        11 => "ARG2 OUT OF RANGE",
        12 => "ARG3 OUT OF RANGE",
        13 => "ARG4 OUT OF RANGE",
        14 => "ARG5 OUT OF RANGE",
        15 => "ARG6 OUT OF RANGE",
        16 => "INCORRECT STATE",
        17 => "WHEEL NOT FITTED",
        18 => "QUEUE FULL",
        19 => "COMPATIBILITY MODE SET",
        20 => "SHUTTER NOT FITTED",
        21 => "INVALID CHECKSUM",
        60 => "ENCODER ERROR",
        61 => "ENCODER RUN OFF",
        62 => "ENCODER RUN ON",
        _ => "UNKNOWN ERROR",
    }
}

/// Stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// X
    X,
    /// Y
    Y,
    /// Z (focus)
    Z,
}

impl Axis {
    fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

// =============================================================================
// StageFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating stage driver instances.
pub struct StageFactory;

impl DriverFactory for StageFactory {
    fn driver_type(&self) -> &'static str {
        StageDriver::KIND
    }

    fn name(&self) -> &'static str {
        "ProScan Stage Controller"
    }

    fn open(
        &self,
        device: String,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = StageDriver::open_with(&device, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }

    fn connect(
        &self,
        port: SerialPort,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = StageDriver::connect(port, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }
}

// =============================================================================
// StageDriver
// =============================================================================

/// Driver for a ProScan-compatible XYZ stage controller.
pub struct StageDriver {
    /// Serial port protected by Mutex for exclusive access
    port: SharedPort,
    device: String,
    /// Last known position; updated by `P` queries and acknowledged moves
    position: Mutex<[f64; 3]>,
    /// Client-side step sizes used by [`StageDriver::step`]
    steps: Mutex<[f64; 3]>,
    /// A reply timed out and may still arrive
    late_reply: AtomicBool,
}

impl std::fmt::Debug for StageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDriver")
            .field("device", &self.device)
            .field("position", &*self.position.lock())
            .field("steps", &*self.steps.lock())
            .finish_non_exhaustive()
    }
}

impl StageDriver {
    /// Open the controller at `path` with default options.
    pub async fn open(path: &str) -> LabResult<Self> {
        Self::open_with(path, DriverOptions::default()).await
    }

    /// Open the controller at `path`.
    ///
    /// # Errors
    /// - `NotAccessible` / `Open` if the device cannot be opened
    /// - `NotRecognized` if the `VERSION` reply is not three characters
    pub async fn open_with(path: &str, options: DriverOptions) -> LabResult<Self> {
        open_device(path, &PROFILE, &options, |port| {
            Self::connect(port, options.clone())
        })
        .await
    }

    /// Identify the controller behind an open port and take ownership of it.
    pub async fn connect(mut port: SerialPort, options: DriverOptions) -> LabResult<Self> {
        options.configure(&mut port);

        let reply = port.query("VERSION").await?.into_text().unwrap_or_default();
        if reply.trim().len() != VERSION_LEN {
            return Err(not_recognized(
                port.device(),
                "ProScan stage controller",
                &reply,
                options.quiet,
            ));
        }
        info!(device = %port.device(), version = %reply.trim(), "Stage controller identified");

        Ok(Self {
            device: port.device().to_string(),
            port: Arc::new(tokio::sync::Mutex::new(port)),
            position: Mutex::new([0.0; 3]),
            steps: Mutex::new([1.0; 3]),
            late_reply: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Command/response
    // -------------------------------------------------------------------------

    /// Send `cmd` and return the reply.
    ///
    /// A timeout or an `E,<code>` reply with a nonzero code is logged and
    /// yields an empty string. After a timeout, input is drained before the
    /// next command so a late reply is not taken for the next one's.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn command(&self, cmd: &str) -> LabResult<String> {
        let mut port = self.port.lock().await;
        self.discard_late_reply(&mut port).await;
        let reply = port.query(cmd).await?;
        if reply.timed_out {
            self.late_reply.store(true, Ordering::Relaxed);
        }
        Ok(check_reply(cmd, reply))
    }

    async fn discard_late_reply(&self, port: &mut SerialPort) {
        if self.late_reply.swap(false, Ordering::Relaxed) {
            let discarded = port.drain(DRAIN_WINDOW).await;
            if discarded > 0 {
                debug!(bytes = discarded, "Discarded late reply");
            }
        }
    }

    /// Send `cmd` and compare the reply to the literal `expect`.
    pub async fn command_expect(&self, cmd: &str, expect: &str) -> LabResult<bool> {
        let reply = self.command(cmd).await?;
        if reply == expect {
            return Ok(true);
        }
        if !reply.is_empty() {
            warn!(command = cmd, expected = expect, reply = %reply, "Unexpected acknowledgement");
        }
        Ok(false)
    }

    /// Send `cmd` and collect reply lines up to the `END` terminator.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn text_command(&self, cmd: &str) -> LabResult<Vec<String>> {
        let mut port = self.port.lock().await;
        self.discard_late_reply(&mut port).await;
        port.write(cmd).await?;

        let mut lines = Vec::new();
        loop {
            let Some(line) = port.read_line().await?.into_text() else {
                self.late_reply.store(true, Ordering::Relaxed);
                warn!(command = cmd, lines = lines.len(), "Text reply ended without terminator");
                break;
            };
            if line.trim() == TEXT_TERMINATOR {
                break;
            }
            if lines.is_empty() && line.starts_with("E,") {
                check_reply(cmd, LineRead { text: line, timed_out: false });
                break;
            }
            if lines.len() >= MAX_TEXT_LINES {
                warn!(command = cmd, "Text reply too long, truncated");
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }

    /// Firmware version string.
    pub async fn version(&self) -> LabResult<String> {
        self.command("VERSION").await
    }

    // -------------------------------------------------------------------------
    // Motion
    // -------------------------------------------------------------------------

    /// Query the current position. `None` if the reply was unusable.
    pub async fn position(&self) -> LabResult<Option<[f64; 3]>> {
        let reply = self.command("P").await?;
        if reply.is_empty() {
            return Ok(None);
        }
        match parse_position(&reply) {
            Some(position) => {
                *self.position.lock() = position;
                Ok(Some(position))
            }
            None => {
                warn!(reply = %reply, "Unparseable position reply");
                Ok(None)
            }
        }
    }

    /// Position as of the last query or acknowledged move. No I/O.
    pub fn last_position(&self) -> [f64; 3] {
        *self.position.lock()
    }

    /// Move to `target`, or by `target` when `relative` is set.
    ///
    /// - one element: Z only; an absolute move reuses the cached X and Y
    /// - two elements: X and Y
    /// - three elements: X, Y and Z
    ///
    /// Returns whether the controller acknowledged completion. An
    /// acknowledgement slower than the port timeout counts as a failure and
    /// is discarded if it arrives later.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn move_to(&self, target: &[f64], relative: bool) -> LabResult<bool> {
        let cached = self.last_position();
        let axes: Vec<i64> = match (target, relative) {
            ([z], true) => vec![0, 0, *z as i64],
            ([z], false) => vec![cached[0] as i64, cached[1] as i64, *z as i64],
            ([x, y], _) => vec![*x as i64, *y as i64],
            ([x, y, z], _) => vec![*x as i64, *y as i64, *z as i64],
            _ => {
                return Err(LabError::InvalidValue {
                    name: "position".to_string(),
                    message: format!("expected 1 to 3 axes, got {}", target.len()),
                })
            }
        };

        let verb = if relative { "GR" } else { "G" };
        let cmd = format!("{},{}", verb, join(&axes));
        let acknowledged = self.command_expect(&cmd, "R").await?;

        if acknowledged {
            let mut position = self.position.lock();
            for (slot, value) in position.iter_mut().zip(&axes) {
                if relative {
                    *slot += *value as f64;
                } else {
                    *slot = *value as f64;
                }
            }
        }
        Ok(acknowledged)
    }

    /// Redefine the current position as `origin`.
    pub async fn set_origin(&self, origin: [f64; 3]) -> LabResult<bool> {
        let axes = origin.map(|v| v as i64);
        let accepted = self.command_expect(&format!("P,{}", join(&axes)), "0").await?;
        if accepted {
            *self.position.lock() = axes.map(|v| v as f64);
        }
        Ok(accepted)
    }

    /// Emergency stop (`K`).
    pub async fn stop(&self) -> LabResult<bool> {
        self.command_expect("K", "R").await
    }

    /// Clear the command queue (`I`).
    pub async fn clear(&self) -> LabResult<bool> {
        self.command_expect("I", "R").await
    }

    /// Step sizes for X, Y and Z.
    pub fn step_sizes(&self) -> [f64; 3] {
        *self.steps.lock()
    }

    /// Replace the step sizes. Client-side only.
    pub fn set_step_sizes(&self, steps: [f64; 3]) {
        *self.steps.lock() = steps;
    }

    /// Relative move of `count` steps along `axis`.
    pub async fn step(&self, axis: Axis, count: i64) -> LabResult<bool> {
        let mut delta = [0.0; 3];
        delta[axis.index()] = count as f64 * self.step_sizes()[axis.index()];
        self.move_to(&delta, true).await
    }

    // -------------------------------------------------------------------------
    // Motion profile
    // -------------------------------------------------------------------------

    /// Maximum speed in percent.
    pub async fn speed(&self) -> LabResult<Option<i64>> {
        self.get_limit("SMS").await
    }

    /// Set the maximum speed, clamped to [1, 100]. Returns the value the
    /// controller accepted.
    pub async fn set_speed(&self, value: i64) -> LabResult<Option<i64>> {
        self.set_limit("SMS", "speed", value).await
    }

    /// Acceleration in percent.
    pub async fn acceleration(&self) -> LabResult<Option<i64>> {
        self.get_limit("SAS").await
    }

    /// Set the acceleration, clamped to [1, 100].
    pub async fn set_acceleration(&self, value: i64) -> LabResult<Option<i64>> {
        self.set_limit("SAS", "acceleration", value).await
    }

    /// S-curve factor in percent.
    pub async fn scurve(&self) -> LabResult<Option<i64>> {
        self.get_limit("SCS").await
    }

    /// Set the S-curve factor, clamped to [1, 100].
    pub async fn set_scurve(&self, value: i64) -> LabResult<Option<i64>> {
        self.set_limit("SCS", "scurve", value).await
    }

    async fn get_limit(&self, verb: &str) -> LabResult<Option<i64>> {
        let reply = self.command(verb).await?;
        if reply.is_empty() {
            return Ok(None);
        }
        match reply.trim().parse::<i64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(command = verb, reply = %reply, "Unparseable numeric reply");
                Ok(None)
            }
        }
    }

    async fn set_limit(&self, verb: &str, name: &str, value: i64) -> LabResult<Option<i64>> {
        let value = clamp_with_warning(name, value, LIMIT_RANGE.0, LIMIT_RANGE.1);
        let accepted = self.command_expect(&format!("{},{}", verb, value), "0").await?;
        Ok(accepted.then_some(value))
    }
}

/// Apply error-code and timeout handling to a reply.
fn check_reply(cmd: &str, reply: LineRead) -> String {
    let Some(text) = reply.into_text() else {
        warn!(command = cmd, "No reply before timeout");
        return String::new();
    };

    if let Some(code) = text.strip_prefix("E,") {
        match code.trim().parse::<u32>() {
            Ok(0) => {}
            Ok(code) => {
                warn!(command = cmd, code, "Controller error: {}", error_description(code));
                return String::new();
            }
            Err(_) => {
                warn!(command = cmd, reply = %text, "Malformed error reply");
                return String::new();
            }
        }
    }
    text
}

fn parse_position(reply: &str) -> Option<[f64; 3]> {
    let mut fields = reply.split(',').map(|f| f.trim().parse::<f64>());
    let x = fields.next()?.ok()?;
    let y = fields.next()?.ok()?;
    let z = fields.next()?.ok()?;
    Some([x, y, z])
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Property table
// =============================================================================

static PROPERTIES: LazyLock<PropertyTable<StageDriver>> = LazyLock::new(|| {
    PropertyTable::new(vec![
        Accessor::new("position", "Stage position (absolute move on write)", PropertyKind::Vector)
            .getter(|s: &StageDriver| async move { s.position().await.map(Into::into) }.boxed())
            .setter(|s: &StageDriver, v| {
                async move {
                    let target = v.as_vector("position")?;
                    s.move_to(&target, false).await.map(|_| ())
                }
                .boxed()
            }),
        Accessor::new("move_by", "Relative move", PropertyKind::Vector).setter(
            |s: &StageDriver, v| {
                async move {
                    let delta = v.as_vector("move_by")?;
                    s.move_to(&delta, true).await.map(|_| ())
                }
                .boxed()
            },
        ),
        Accessor::new("speed", "Maximum speed", PropertyKind::Int)
            .unit("%")
            .getter(|s: &StageDriver| async move { s.speed().await.map(Into::into) }.boxed())
            .setter(|s: &StageDriver, v| {
                async move { s.set_speed(v.as_int("speed")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("acceleration", "Maximum acceleration", PropertyKind::Int)
            .unit("%")
            .getter(|s: &StageDriver| async move { s.acceleration().await.map(Into::into) }.boxed())
            .setter(|s: &StageDriver, v| {
                async move {
                    s.set_acceleration(v.as_int("acceleration")?)
                        .await
                        .map(|_| ())
                }
                .boxed()
            }),
        Accessor::new("scurve", "S-curve factor", PropertyKind::Int)
            .unit("%")
            .getter(|s: &StageDriver| async move { s.scurve().await.map(Into::into) }.boxed())
            .setter(|s: &StageDriver, v| {
                async move { s.set_scurve(v.as_int("scurve")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("step", "Step sizes dx, dy, dz", PropertyKind::Vector)
            .getter(|s: &StageDriver| async move { Ok(s.step_sizes().into()) }.boxed())
            .setter(|s: &StageDriver, v| {
                async move {
                    let steps: [f64; 3] = v.as_vector("step")?.try_into().map_err(|_| {
                        LabError::InvalidValue {
                            name: "step".to_string(),
                            message: "expected three step sizes".to_string(),
                        }
                    })?;
                    s.set_step_sizes(steps);
                    Ok(())
                }
                .boxed()
            }),
        Accessor::new("version", "Firmware version", PropertyKind::Text).getter(
            |s: &StageDriver| async move { s.version().await.map(PropertyValue::Text) }.boxed(),
        ),
    ])
});

impl PropertyDriver for StageDriver {
    const KIND: &'static str = "stage";

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
    use labctl_core::mock_serial::{self, MockDeviceHarness};
    use tracing_test::traced_test;

    fn mock_port() -> (SerialPort, MockDeviceHarness) {
        let (stream, harness) = mock_serial::new();
        let port = SerialPort::from_stream(
            "mock-stage",
            Box::new(stream),
            PROFILE.eol,
            Duration::from_millis(200),
        );
        (port, harness)
    }

    async fn connected() -> (StageDriver, MockDeviceHarness) {
        let (port, mut harness) = mock_port();
        harness.send_response(b"210\r").unwrap();
        let stage = StageDriver::connect(port, DriverOptions::default())
            .await
            .unwrap();
        harness.expect_write(b"VERSION\r").await;
        (stage, harness)
    }

    // =========================================================================
    // Identification
    // =========================================================================

    #[tokio::test]
    async fn test_three_character_version_is_recognized() {
        let (stage, _harness) = connected().await;
        assert_eq!(stage.device_path(), "mock-stage");
        assert_eq!(stage.kind(), "stage");
    }

    #[tokio::test]
    async fn test_short_version_is_not_recognized() {
        let (port, harness) = mock_port();
        harness.send_response(b"X\r").unwrap();
        let result = StageDriver::connect(port, DriverOptions::default().quiet(true)).await;
        assert!(matches!(result, Err(LabError::NotRecognized { .. })));
    }

    #[tokio::test]
    async fn test_silent_device_is_not_recognized() {
        let (port, _harness) = mock_port();
        let result = StageDriver::connect(port, DriverOptions::default().quiet(true)).await;
        assert!(matches!(result, Err(LabError::NotRecognized { .. })));
    }

    // =========================================================================
    // Reply parsing
    // =========================================================================

    #[tokio::test]
    #[traced_test]
    async fn test_error_code_yields_empty_reply() {
        let (stage, harness) = connected().await;
        harness.send_response(b"E,5\r").unwrap();
        assert_eq!(stage.command("FOO").await.unwrap(), "");
        assert!(logs_contain("COMMAND NOT FOUND"));
    }

    #[tokio::test]
    async fn test_command_expect() {
        let (stage, mut harness) = connected().await;
        harness.send_responses(&[b"R\r", b"0\r"]).unwrap();
        assert!(stage.stop().await.unwrap());
        assert!(!stage.clear().await.unwrap());
        harness.expect_write(b"K\rI\r").await;
    }

    #[tokio::test]
    async fn test_text_command_reads_until_end() {
        let (stage, mut harness) = connected().await;
        harness
            .send_response(b"STAGE = PRIOR\rFOCUS = NONE\rEND\r")
            .unwrap();
        let lines = stage.text_command("?").await.unwrap();
        harness.expect_write(b"?\r").await;
        assert_eq!(lines, vec!["STAGE = PRIOR", "FOCUS = NONE"]);
    }

    #[test]
    fn test_error_descriptions() {
        assert_eq!(error_description(8), "VALUE OUT OF RANGE");
        assert_eq!(error_description(999), "UNKNOWN ERROR");
    }

    // =========================================================================
    // Motion
    // =========================================================================

    #[tokio::test]
    async fn test_single_axis_absolute_move_keeps_cached_xy() {
        let (stage, mut harness) = connected().await;
        harness.send_responses(&[b"10,20,30\r", b"R\r"]).unwrap();

        assert_eq!(stage.position().await.unwrap(), Some([10.0, 20.0, 30.0]));
        assert!(stage.move_to(&[5.0], false).await.unwrap());

        harness.expect_write(b"P\rG,10,20,5\r").await;
        assert_eq!(stage.last_position(), [10.0, 20.0, 5.0]);
    }

    #[tokio::test]
    async fn test_relative_move_sends_truncated_deltas() {
        let (stage, mut harness) = connected().await;
        harness.send_response(b"R\r").unwrap();
        assert!(stage.move_to(&[1.9, -2.7, 300.0], true).await.unwrap());
        harness.expect_write(b"GR,1,-2,300\r").await;
        assert_eq!(stage.last_position(), [1.0, -2.0, 300.0]);
    }

    #[tokio::test]
    async fn test_two_axis_move_and_bad_arity() {
        let (stage, mut harness) = connected().await;
        harness.send_response(b"R\r").unwrap();
        assert!(stage.move_to(&[100.0, 200.0], false).await.unwrap());
        harness.expect_write(b"G,100,200\r").await;

        let err = stage.move_to(&[1.0, 2.0, 3.0, 4.0], false).await.unwrap_err();
        assert!(matches!(err, LabError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_late_acknowledgement_is_not_taken_as_next_reply() {
        let (stage, mut harness) = connected().await;
        assert!(!stage.move_to(&[100.0, 200.0, 0.0], false).await.unwrap());
        harness.expect_write(b"G,100,200,0\r").await;
        assert_eq!(stage.last_position(), [0.0, 0.0, 0.0]);

        // The move's acknowledgement shows up after the timeout.
        harness.send_response(b"R\r").unwrap();
        let (position, ()) = tokio::join!(stage.position(), async {
            harness.expect_write(b"P\r").await;
            harness.send_response(b"1,2,3\r").unwrap();
        });
        assert_eq!(position.unwrap(), Some([1.0, 2.0, 3.0]));
    }

    #[tokio::test]
    async fn test_step_uses_client_side_sizes() {
        let (stage, mut harness) = connected().await;
        stage.set_step_sizes([2.0, 3.0, 0.5]);
        harness.send_responses(&[b"R\r", b"R\r"]).unwrap();
        stage.step(Axis::Y, -3).await.unwrap();
        stage.step(Axis::Z, 3).await.unwrap();
        harness.expect_write(b"GR,0,-9,0\rGR,0,0,1\r").await;
    }

    #[tokio::test]
    async fn test_set_origin() {
        let (stage, mut harness) = connected().await;
        harness.send_response(b"0\r").unwrap();
        assert!(stage.set_origin([0.0, 0.0, 0.0]).await.unwrap());
        harness.expect_write(b"P,0,0,0\r").await;
    }

    // =========================================================================
    // Motion profile
    // =========================================================================

    #[tokio::test]
    async fn test_speed_is_clamped_and_confirmed() {
        let (stage, mut harness) = connected().await;
        harness.send_responses(&[b"0\r", b"100\r"]).unwrap();

        assert_eq!(stage.set_speed(250).await.unwrap(), Some(100));
        assert_eq!(stage.speed().await.unwrap(), Some(100));
        harness.expect_write(b"SMS,100\rSMS\r").await;
    }

    #[tokio::test]
    async fn test_acceleration_and_scurve_clamp_low() {
        let (stage, mut harness) = connected().await;
        harness.send_responses(&[b"0\r", b"0\r"]).unwrap();
        assert_eq!(stage.set_acceleration(0).await.unwrap(), Some(1));
        assert_eq!(stage.set_scurve(-40).await.unwrap(), Some(1));
        harness.expect_write(b"SAS,1\rSCS,1\r").await;
    }

    // =========================================================================
    // Property table
    // =========================================================================

    #[tokio::test]
    async fn test_properties_parse_and_clamp() {
        let (stage, mut harness) = connected().await;
        harness.send_response(b"0\r").unwrap();
        stage.set_property_str("speed", "0").await.unwrap();
        harness.expect_write(b"SMS,1\r").await;

        stage.set_property_str("step", "5, 5, 1").await.unwrap();
        assert_eq!(
            stage.get_property("step").await.unwrap(),
            PropertyValue::Vector(vec![5.0, 5.0, 1.0])
        );
    }

    #[tokio::test]
    async fn test_property_timeout_is_empty_sentinel() {
        let (stage, _harness) = connected().await;
        assert_eq!(
            stage.get_property("position").await.unwrap(),
            PropertyValue::Text(String::new())
        );
    }

    #[tokio::test]
    async fn test_version_is_read_only() {
        let (stage, _harness) = connected().await;
        assert!(matches!(
            stage.set_property_str("version", "999").await,
            Err(LabError::ReadOnlyProperty(_))
        ));
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = StageFactory;
        assert_eq!(factory.driver_type(), "stage");
        assert_eq!(factory.name(), "ProScan Stage Controller");
    }
}
