//! SC10-style Shutter Controller Driver
//!
//! Protocol Overview:
//! - Format: ASCII over RS-232, `\r` terminated
//! - Baud: 9600, 8N1, no flow control
//! - Queries end in `?` (`open?`), settings use `key=value` (`open=250`)
//! - The controller echoes every command line, then sends the reply line for
//!   queries, then an interactive prompt `> ` with no terminator
//! - Rejected commands answer `CMD_NOT_DEFINED` or `CMD_ARG_INVALID`
//!
//! ```text
//! > ens?\r        (echo, prefixed with the previous prompt)
//! 1\r             (payload)
//! >               (prompt, unterminated)
//! ```
//!
//! `ens` toggles the enable state, so [`ShutterDriver::set_enabled`] only
//! sends it when the requested state differs from the last one read.

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
use parking_lot::Mutex;
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

/// Interactive prompt printed after every reply.
const PROMPT: &str = "> ";

/// Error tokens the controller prints instead of a reply.
const ERROR_TOKENS: [&str; 2] = ["CMD_NOT_DEFINED", "CMD_ARG_INVALID"];

/// Lines tolerated before the echo of the current command.
const MAX_STRAY_LINES: usize = 4;

/// Upper bound of the open and shut durations.
const MAX_DURATION_MS: i64 = 999_999;

// =============================================================================
// ShutterFactory - DriverFactory implementation
// =============================================================================

/// Factory for creating shutter driver instances.
pub struct ShutterFactory;

impl DriverFactory for ShutterFactory {
    fn driver_type(&self) -> &'static str {
        ShutterDriver::KIND
    }

    fn name(&self) -> &'static str {
        "SC10 Shutter Controller"
    }

    fn open(
        &self,
        device: String,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = ShutterDriver::open_with(&device, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }

    fn connect(
        &self,
        port: SerialPort,
        options: DriverOptions,
    ) -> BoxFuture<'static, LabResult<Box<dyn Instrument>>> {
        Box::pin(async move {
            let driver = ShutterDriver::connect(port, options).await?;
            Ok(Box::new(driver) as Box<dyn Instrument>)
        })
    }
}

// =============================================================================
// ShutterDriver
// =============================================================================

/// Driver for an SC10-compatible shutter controller.
pub struct ShutterDriver {
    port: SharedPort,
    device: String,
    /// Enable state as last read or toggled
    enabled: Mutex<Option<bool>>,
}

impl std::fmt::Debug for ShutterDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutterDriver")
            .field("device", &self.device)
            .field("enabled", &*self.enabled.lock())
            .finish_non_exhaustive()
    }
}

impl ShutterDriver {
    /// Open the controller at `path` with default options.
    pub async fn open(path: &str) -> LabResult<Self> {
        Self::open_with(path, DriverOptions::default()).await
    }

    /// Open the controller at `path`.
    ///
    /// # Errors
    /// - `NotAccessible` / `Open` if the device cannot be opened
    /// - `NotRecognized` if the `*idn?` reply does not name an SC10
    pub async fn open_with(path: &str, options: DriverOptions) -> LabResult<Self> {
        open_device(path, &PROFILE, &options, |port| {
            Self::connect(port, options.clone())
        })
        .await
    }

    /// Identify the controller behind an open port and take ownership of it.
    ///
    /// Also reads the enable state so the first [`ShutterDriver::set_enabled`]
    /// knows whether a toggle is needed.
    pub async fn connect(mut port: SerialPort, options: DriverOptions) -> LabResult<Self> {
        options.configure(&mut port);
        let device = port.device().to_string();

        let driver = Self {
            device,
            port: Arc::new(tokio::sync::Mutex::new(port)),
            enabled: Mutex::new(None),
        };

        let identity = driver.exchange("*idn?").await?.unwrap_or_default();
        if !identity.contains("SC10") {
            return Err(not_recognized(
                &driver.device,
                "SC10 shutter controller",
                &identity,
                options.quiet,
            ));
        }
        info!(device = %driver.device, identity = %identity, "Shutter controller identified");

        driver.enabled().await?;
        Ok(driver)
    }

    /// Write `cmd`, discard its echo and return the payload.
    ///
    /// Settings have no payload and yield `Some("")`. `None` means the echo
    /// or payload never arrived or the controller rejected the command.
    #[instrument(skip(self), fields(device = %self.device))]
    async fn exchange(&self, cmd: &str) -> LabResult<Option<String>> {
        let mut port = self.port.lock().await;
        port.write(cmd).await?;

        // Error tokens from an earlier setting may arrive before our echo.
        let mut echoed = false;
        for _ in 0..MAX_STRAY_LINES {
            let Some(line) = port.read_line().await?.into_text() else {
                break;
            };
            let line = strip_prompt(&line);
            if line == cmd {
                echoed = true;
                break;
            }
            if is_error_token(line) {
                warn!(command = cmd, reply = line, "Controller rejected a previous command");
            } else {
                debug!(command = cmd, line, "Discarding unexpected line");
            }
        }
        if !echoed {
            warn!(command = cmd, "Command echo not received");
            return Ok(None);
        }

        if !cmd.ends_with('?') {
            return Ok(Some(String::new()));
        }

        let Some(payload) = port.read_line().await?.into_text() else {
            warn!(command = cmd, "No reply before timeout");
            return Ok(None);
        };
        let payload = strip_prompt(&payload);
        if is_error_token(payload) {
            warn!(command = cmd, reply = payload, "Controller rejected command");
            return Ok(None);
        }
        Ok(Some(payload.to_string()))
    }

    /// Raw command passthrough. Faults read as an empty string.
    pub async fn command(&self, cmd: &str) -> LabResult<String> {
        Ok(self.exchange(cmd).await?.unwrap_or_default())
    }

    /// Controller identification string (`*idn?`).
    pub async fn identity(&self) -> LabResult<Option<String>> {
        self.exchange("*idn?").await
    }

    // -------------------------------------------------------------------------
    // Enable state
    // -------------------------------------------------------------------------

    /// Query the enable state and refresh the cache.
    pub async fn enabled(&self) -> LabResult<Option<bool>> {
        let state = self.get_int("ens").await?.map(|v| v != 0);
        if state.is_some() {
            *self.enabled.lock() = state;
        }
        Ok(state)
    }

    /// Request an enable state. Returns whether a toggle was sent.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn set_enabled(&self, on: bool) -> LabResult<bool> {
        let known = *self.enabled.lock();
        let current = match known {
            Some(state) => Some(state),
            None => self.enabled().await?,
        };
        if current == Some(on) {
            debug!(enabled = on, "Enable state unchanged, no toggle");
            return Ok(false);
        }

        if self.exchange("ens").await?.is_none() {
            return Ok(false);
        }
        *self.enabled.lock() = Some(on);
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Timing and mode
    // -------------------------------------------------------------------------

    /// Open duration in milliseconds.
    pub async fn open_duration(&self) -> LabResult<Option<i64>> {
        self.get_int("open").await
    }

    /// Set the open duration, clamped to [0, 999999] ms.
    pub async fn set_open_duration(&self, ms: i64) -> LabResult<Option<i64>> {
        self.set_int("open", "open_ms", ms, 0, MAX_DURATION_MS).await
    }

    /// Shut duration in milliseconds.
    pub async fn shut_duration(&self) -> LabResult<Option<i64>> {
        self.get_int("shut").await
    }

    /// Set the shut duration, clamped to [0, 999999] ms.
    pub async fn set_shut_duration(&self, ms: i64) -> LabResult<Option<i64>> {
        self.set_int("shut", "shut_ms", ms, 0, MAX_DURATION_MS).await
    }

    /// Operating mode: 1 manual, 2 auto, 3 single, 4 repeat, 5 external gate.
    pub async fn mode(&self) -> LabResult<Option<i64>> {
        self.get_int("mode").await
    }

    /// Set the operating mode, clamped to [1, 5].
    pub async fn set_mode(&self, mode: i64) -> LabResult<Option<i64>> {
        self.set_int("mode", "mode", mode, 1, 5).await
    }

    /// Repeat count used in repeat mode.
    pub async fn repeat_count(&self) -> LabResult<Option<i64>> {
        self.get_int("rep").await
    }

    /// Set the repeat count, clamped to [1, 99].
    pub async fn set_repeat_count(&self, count: i64) -> LabResult<Option<i64>> {
        self.set_int("rep", "repeat", count, 1, 99).await
    }

    /// Trigger source: 0 internal, 1 external.
    pub async fn trigger(&self) -> LabResult<Option<i64>> {
        self.get_int("trig").await
    }

    /// Set the trigger source, clamped to [0, 1].
    pub async fn set_trigger(&self, trigger: i64) -> LabResult<Option<i64>> {
        self.set_int("trig", "trigger", trigger, 0, 1).await
    }

    /// Whether the shutter is currently closed.
    pub async fn closed(&self) -> LabResult<Option<bool>> {
        Ok(self.get_int("closed").await?.map(|v| v != 0))
    }

    /// Whether the safety interlock is tripped.
    pub async fn interlock(&self) -> LabResult<Option<bool>> {
        Ok(self.get_int("interlock").await?.map(|v| v != 0))
    }

    async fn get_int(&self, key: &str) -> LabResult<Option<i64>> {
        let cmd = format!("{}?", key);
        let Some(reply) = self.exchange(&cmd).await? else {
            return Ok(None);
        };
        match reply.trim().parse::<i64>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(command = %cmd, reply = %reply, "Unparseable numeric reply");
                Ok(None)
            }
        }
    }

    async fn set_int(
        &self,
        key: &str,
        name: &str,
        value: i64,
        min: i64,
        max: i64,
    ) -> LabResult<Option<i64>> {
        let value = clamp_with_warning(name, value, min, max);
        let sent = self.exchange(&format!("{}={}", key, value)).await?;
        Ok(sent.map(|_| value))
    }
}

fn strip_prompt(line: &str) -> &str {
    let mut line = line.trim();
    while let Some(rest) = line.strip_prefix(PROMPT.trim_end()) {
        line = rest.trim_start();
    }
    line
}

fn is_error_token(line: &str) -> bool {
    ERROR_TOKENS.contains(&line)
}

// =============================================================================
// Property table
// =============================================================================

static PROPERTIES: LazyLock<PropertyTable<ShutterDriver>> = LazyLock::new(|| {
    PropertyTable::new(vec![
        Accessor::new("enabled", "Shutter enabled", PropertyKind::Bool)
            .getter(|s: &ShutterDriver| async move { s.enabled().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_enabled(v.as_bool("enabled")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("open_ms", "Open duration", PropertyKind::Int)
            .unit("ms")
            .getter(|s: &ShutterDriver| async move { s.open_duration().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_open_duration(v.as_int("open_ms")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("shut_ms", "Shut duration", PropertyKind::Int)
            .unit("ms")
            .getter(|s: &ShutterDriver| async move { s.shut_duration().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_shut_duration(v.as_int("shut_ms")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("mode", "Operating mode (1-5)", PropertyKind::Int)
            .getter(|s: &ShutterDriver| async move { s.mode().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_mode(v.as_int("mode")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("repeat", "Repeat count (1-99)", PropertyKind::Int)
            .getter(|s: &ShutterDriver| async move { s.repeat_count().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_repeat_count(v.as_int("repeat")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("trigger", "Trigger source (0 internal, 1 external)", PropertyKind::Int)
            .getter(|s: &ShutterDriver| async move { s.trigger().await.map(Into::into) }.boxed())
            .setter(|s: &ShutterDriver, v| {
                async move { s.set_trigger(v.as_int("trigger")?).await.map(|_| ()) }.boxed()
            }),
        Accessor::new("closed", "Shutter closed", PropertyKind::Bool)
            .getter(|s: &ShutterDriver| async move { s.closed().await.map(Into::into) }.boxed()),
        Accessor::new("interlock", "Interlock tripped", PropertyKind::Bool)
            .getter(|s: &ShutterDriver| async move { s.interlock().await.map(Into::into) }.boxed()),
        Accessor::new("identity", "Controller identification", PropertyKind::Text).getter(
            |s: &ShutterDriver| {
                async move { s.identity().await.map(PropertyValue::from) }.boxed()
            },
        ),
    ])
});

impl PropertyDriver for ShutterDriver {
    const KIND: &'static str = "shutter";

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
