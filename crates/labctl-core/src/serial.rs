//! Serial transport: framed line I/O over a character device.
//!
//! [`SerialPort`] is the only thing a driver talks to. It owns one stream
//! exclusively and offers:
//!
//! - [`SerialPort::write`]: send a string followed by the end-of-line byte
//! - [`SerialPort::read_line`]: accumulate bytes until the end-of-line byte,
//!   giving up once the configured timeout passes with no byte arriving
//! - [`SerialPort::settings`] / [`SerialPort::set_settings`]: query and apply
//!   line-discipline settings through `stty`
//!
//! A read that times out is not an error. It is reported through
//! [`LineRead::timed_out`] and any partial content is discarded.
//!
//! # Example
//!
//! ```rust,ignore
//! use labctl_core::serial;
//! use std::time::Duration;
//!
//! let mut port = serial::new("/dev/ttyUSB0")
//!     .settings(&["9600", "cs8", "-parenb", "raw", "-echo"])
//!     .eol(b'\r')
//!     .timeout(Duration::from_millis(500))
//!     .open()
//!     .await?;
//!
//! port.write("VERSION").await?;
//! let reply = port.read_line().await?;
//! if !reply.timed_out {
//!     println!("firmware {}", reply.text);
//! }
//! ```
//!
//! # Testing
//!
//! Any `AsyncRead + AsyncWrite` stream can stand in for a device through
//! [`SerialPort::from_stream`]; see [`crate::mock_serial`].

use crate::error::{LabError, LabResult};
use crate::stty;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port:
/// - [`crate::tty::TtyStream`] (real hardware)
/// - [`crate::mock_serial::MockSerialPort`] (testing)
/// - `tokio::io::DuplexStream`
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// End-of-line byte used when none is given.
pub const DEFAULT_EOL: u8 = b'\n';

/// Read timeout used when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// LineRead
// =============================================================================

/// Outcome of one [`SerialPort::read_line`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRead {
    /// Received line without the delimiter. Empty when `timed_out` is set.
    pub text: String,
    /// The timeout elapsed before the delimiter arrived.
    pub timed_out: bool,
}

impl LineRead {
    fn complete(text: String) -> Self {
        Self {
            text,
            timed_out: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            text: String::new(),
            timed_out: true,
        }
    }

    /// The line, or `None` on timeout.
    pub fn into_text(self) -> Option<String> {
        if self.timed_out {
            None
        } else {
            Some(self.text)
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Start building a [`SerialPort`] for the device at `path`.
pub fn new(path: impl Into<String>) -> SerialPortBuilder {
    SerialPortBuilder {
        path: path.into(),
        settings: None,
        eol: DEFAULT_EOL,
        timeout: DEFAULT_TIMEOUT,
        debug: false,
    }
}

/// Options for opening a [`SerialPort`].
#[derive(Debug, Clone)]
pub struct SerialPortBuilder {
    path: String,
    settings: Option<Vec<String>>,
    eol: u8,
    timeout: Duration,
    debug: bool,
}

impl SerialPortBuilder {
    /// Line-discipline options passed to `stty` before the device is opened.
    pub fn settings<S: AsRef<str>>(mut self, settings: &[S]) -> Self {
        self.settings = Some(settings.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    /// End-of-line byte for framing.
    pub fn eol(mut self, eol: u8) -> Self {
        self.eol = eol;
        self
    }

    /// Inter-byte read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Echo every write and every received byte to the debug log.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate, configure and open the device.
    ///
    /// # Errors
    /// - [`LabError::NotAccessible`] if the path is not a character device
    ///   this user may read and write
    /// - [`LabError::Open`] if the open fails or the handle is not a terminal
    #[cfg(unix)]
    pub async fn open(self) -> LabResult<SerialPort> {
        use std::io::IsTerminal;
        use std::os::unix::fs::FileTypeExt;

        let metadata = std::fs::metadata(&self.path)
            .map_err(|_| LabError::NotAccessible(self.path.clone()))?;
        if !metadata.file_type().is_char_device() {
            return Err(LabError::NotAccessible(self.path.clone()));
        }

        if let Some(settings) = &self.settings {
            stty::apply(&self.path, settings).await;
        }

        let file = crate::tty::TtyStream::open(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => LabError::NotAccessible(self.path.clone()),
            _ => LabError::Open {
                path: self.path.clone(),
                message: e.to_string(),
            },
        })?;

        if !file.is_terminal() {
            return Err(LabError::Open {
                path: self.path.clone(),
                message: "not an interactive character device".to_string(),
            });
        }

        let stream = crate::tty::TtyStream::new(file).map_err(|e| LabError::Open {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        tracing::info!(
            device = %self.path,
            eol = self.eol,
            timeout_ms = self.timeout.as_millis() as u64,
            "Opened serial device"
        );

        let mut port = SerialPort::from_stream(self.path, Box::new(stream), self.eol, self.timeout);
        port.set_debug(self.debug);
        Ok(port)
    }

    /// Device files are only supported on Unix.
    #[cfg(not(unix))]
    pub async fn open(self) -> LabResult<SerialPort> {
        Err(LabError::Open {
            path: self.path,
            message: "character device access requires a Unix platform".to_string(),
        })
    }
}

// =============================================================================
// SerialPort
// =============================================================================

/// Line-framed serial port owning its stream.
///
/// Dropping the port closes the underlying handle.
pub struct SerialPort {
    device: String,
    stream: BufReader<DynSerial>,
    eol: u8,
    timeout: Duration,
    debug: bool,
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("device", &self.device)
            .field("eol", &self.eol)
            .field("timeout", &self.timeout)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl SerialPort {
    /// Wrap an arbitrary stream. No device checks and no `stty` calls.
    pub fn from_stream(device: impl Into<String>, stream: DynSerial, eol: u8, timeout: Duration) -> Self {
        Self {
            device: device.into(),
            stream: BufReader::new(stream),
            eol,
            timeout,
            debug: false,
        }
    }

    /// Device path given at construction.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// End-of-line byte.
    pub fn eol(&self) -> u8 {
        self.eol
    }

    /// Change the end-of-line byte.
    pub fn set_eol(&mut self, eol: u8) {
        self.eol = eol;
    }

    /// Read timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the read timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Whether traffic is echoed to the debug log.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Enable or disable the traffic echo.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Send `s` followed by the end-of-line byte, then flush.
    pub async fn write(&mut self, s: &str) -> LabResult<()> {
        if self.debug {
            debug!(device = %self.device, tx = %s, "serial write");
        }
        let mut frame = Vec::with_capacity(s.len() + 1);
        frame.extend_from_slice(s.as_bytes());
        frame.push(self.eol);
        self.write_frame(&frame).await
    }

    /// Send bytes verbatim with no end-of-line framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> LabResult<()> {
        if self.debug {
            debug!(device = %self.device, tx = ?bytes, "serial raw write");
        }
        self.write_frame(bytes).await
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> LabResult<()> {
        let writer = self.stream.get_mut();
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one line using the configured timeout.
    pub async fn read_line(&mut self) -> LabResult<LineRead> {
        self.read_line_with_timeout(self.timeout).await
    }

    /// Read one line, waiting at most `timeout` for each byte.
    ///
    /// # Errors
    /// [`LabError::Disconnected`] if the stream reports end-of-file.
    pub async fn read_line_with_timeout(&mut self, timeout: Duration) -> LabResult<LineRead> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match tokio::time::timeout(timeout, self.stream.read(&mut byte)).await {
                Err(_) => {
                    if self.debug {
                        debug!(
                            device = %self.device,
                            discarded = line.len(),
                            "serial read timed out"
                        );
                    }
                    return Ok(LineRead::timed_out());
                }
                Ok(Ok(0)) => return Err(LabError::Disconnected(self.device.clone())),
                Ok(Ok(_)) => {
                    if self.debug {
                        debug!(
                            device = %self.device,
                            rx = %std::ascii::escape_default(byte[0]),
                            "serial read"
                        );
                    }
                    if byte[0] == self.eol {
                        break;
                    }
                    line.push(byte[0]);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(LineRead::complete(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Write `command` and read one line of reply.
    pub async fn query(&mut self, command: &str) -> LabResult<LineRead> {
        self.write(command).await?;
        self.read_line().await
    }

    /// Discard whatever arrives within `window`. Returns the byte count.
    pub async fn drain(&mut self, window: Duration) -> usize {
        let mut discard = [0u8; 256];
        let deadline = tokio::time::Instant::now() + window;
        let mut total_discarded = 0usize;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.stream.read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total_discarded += n,
                Ok(Err(_)) => break,
                Err(_) => break,
            }
        }

        if total_discarded > 0 {
            debug!(device = %self.device, bytes = total_discarded, "Discarded stale input");
        }
        total_discarded
    }

    /// Current line settings of this device, restorable with
    /// [`SerialPort::set_settings`].
    pub async fn settings(&self) -> LabResult<Vec<String>> {
        stty::query(&self.device).await
    }

    /// Apply line settings. Failures are logged, not returned.
    pub async fn set_settings<S: AsRef<str>>(&self, settings: &[S]) {
        stty::apply(&self.device, settings).await
    }

    /// [`SerialPort::settings`] for a path that has no open port yet.
    pub async fn query_settings(path: &str) -> LabResult<Vec<String>> {
        stty::query(path).await
    }

    /// [`SerialPort::set_settings`] for a path that has no open port.
    pub async fn apply_settings<S: AsRef<str>>(path: &str, settings: &[S]) {
        stty::apply(path, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial;
    use tracing_test::traced_test;

    fn port_with_eol(eol: u8) -> (SerialPort, mock_serial::MockDeviceHarness) {
        let (stream, harness) = mock_serial::new();
        let port = SerialPort::from_stream("mock", Box::new(stream), eol, Duration::from_millis(100));
        (port, harness)
    }

    #[tokio::test]
    async fn test_write_then_read_loopback() {
        for eol in [b'\n', b'\r', b'\x03'] {
            let mut port = SerialPort::from_stream(
                "loopback",
                Box::new(mock_serial::loopback()),
                eol,
                Duration::from_millis(100),
            );
            for payload in ["VERSION", "G,100,-200,30", "", "ens?"] {
                port.write(payload).await.unwrap();
                let read = port.read_line().await.unwrap();
                assert_eq!(read, LineRead::complete(payload.to_string()));
            }
        }
    }

    #[tokio::test]
    async fn test_write_appends_eol() {
        let (mut port, mut harness) = port_with_eol(b'\r');
        port.write("P").await.unwrap();
        harness.expect_write(b"P\r").await;
    }

    #[tokio::test]
    async fn test_write_raw_has_no_framing() {
        let (mut port, mut harness) = port_with_eol(b'\r');
        port.write_raw(&[0x64]).await.unwrap();
        port.write("Z").await.unwrap();
        harness.expect_write(&[0x64, b'Z', b'\r']).await;
    }

    #[tokio::test]
    async fn test_read_times_out_without_data() {
        let (mut port, _harness) = port_with_eol(b'\n');
        let read = port.read_line().await.unwrap();
        assert!(read.timed_out);
        assert_eq!(read.into_text(), None);
    }

    #[tokio::test]
    async fn test_partial_line_is_discarded_on_timeout() {
        let (mut port, harness) = port_with_eol(b'\n');
        harness.send_response(b"12,3").unwrap();
        let read = port.read_line().await.unwrap();
        assert!(read.timed_out);
        assert!(read.text.is_empty());
    }

    #[tokio::test]
    async fn test_read_splits_on_eol() {
        let (mut port, harness) = port_with_eol(b'\r');
        harness.send_response(b"R\r0,0,0\r").unwrap();
        assert_eq!(port.read_line().await.unwrap().text, "R");
        assert_eq!(port.read_line().await.unwrap().text, "0,0,0");
    }

    #[tokio::test]
    async fn test_read_override_timeout() {
        let (mut port, _harness) = port_with_eol(b'\n');
        port.set_timeout(Duration::from_secs(30));
        let read = port
            .read_line_with_timeout(Duration::from_millis(20))
            .await
            .unwrap();
        assert!(read.timed_out);
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let (mut port, harness) = port_with_eol(b'\n');
        drop(harness);
        let result = port.read_line().await;
        assert!(matches!(result, Err(LabError::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_drain_discards_stale_input() {
        let (mut port, harness) = port_with_eol(b'\n');
        harness.send_response(b"stale data 12345").unwrap();
        let discarded = port.drain(Duration::from_millis(30)).await;
        assert_eq!(discarded, 16);
        assert!(port.read_line().await.unwrap().timed_out);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_debug_echoes_writes_and_each_byte_read() {
        let mut port = SerialPort::from_stream(
            "loopback",
            Box::new(mock_serial::loopback()),
            b'\r',
            Duration::from_millis(100),
        );
        port.set_debug(true);
        port.write("P").await.unwrap();
        assert_eq!(port.read_line().await.unwrap().text, "P");

        assert!(logs_contain("serial write"));
        logs_assert(|lines: &[&str]| {
            let echoes: Vec<_> = lines.iter().filter(|l| l.contains("serial read")).collect();
            match echoes.len() {
                // 'P' and the end-of-line byte
                2 => {}
                n => return Err(format!("expected 2 read echoes, got {n}")),
            }
            if echoes.iter().all(|l| l.contains("DEBUG")) {
                Ok(())
            } else {
                Err("read echo is not at debug level".to_string())
            }
        });
    }

    #[tokio::test]
    #[traced_test]
    async fn test_no_echo_without_debug() {
        let mut port = SerialPort::from_stream(
            "loopback",
            Box::new(mock_serial::loopback()),
            b'\r',
            Duration::from_millis(100),
        );
        port.write("P").await.unwrap();
        port.read_line().await.unwrap();

        assert!(!logs_contain("serial write"));
        assert!(!logs_contain("serial read"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_settings_round_trip_on_pty() {
        let pty = crate::tty::pty::open().unwrap();
        let port = new(pty.slave.clone())
            .settings(&["raw", "-echo"])
            .open()
            .await
            .unwrap();

        let raw = port.settings().await.unwrap();
        port.set_settings(&["-raw", "echo"]).await;
        assert_ne!(port.settings().await.unwrap(), raw);

        port.set_settings(&raw).await;
        assert_eq!(port.settings().await.unwrap(), raw);
    }

    #[tokio::test]
    async fn test_accessors() {
        let (mut port, _harness) = port_with_eol(b'\n');
        assert_eq!(port.device(), "mock");
        port.set_eol(b'\r');
        port.set_timeout(Duration::from_secs(2));
        port.set_debug(true);
        assert_eq!(port.eol(), b'\r');
        assert_eq!(port.timeout(), Duration::from_secs(2));
        assert!(port.debug());
    }

    #[tokio::test]
    async fn test_open_rejects_regular_file() {
        let path = std::env::temp_dir().join(format!("labctl-serial-{}", std::process::id()));
        std::fs::write(&path, b"").unwrap();
        let result = new(path.to_string_lossy().to_string()).open().await;
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(LabError::NotAccessible(_))));
    }

    #[tokio::test]
    async fn test_open_rejects_missing_path() {
        let result = new("/nonexistent/labctl-tty").open().await;
        assert!(matches!(result, Err(LabError::NotAccessible(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_open_rejects_non_terminal_char_device() {
        // /dev/null is character-special but not a terminal.
        let result = new("/dev/null").open().await;
        assert!(matches!(result, Err(LabError::Open { .. })));
    }
}
