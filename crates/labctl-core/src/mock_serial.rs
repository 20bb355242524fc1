//! Simulated serial streams for driver tests.
//!
//! [`new`] returns a connected pair:
//! - [`MockSerialPort`]: handed to the code under test (wrap it with
//!   [`crate::serial::SerialPort::from_stream`])
//! - [`MockDeviceHarness`]: kept by the test to script the instrument
//!
//! Replies may be queued before the driver asks for them; they are delivered
//! in order, one read at a time, exactly like bytes waiting in a UART FIFO.
//! A read with nothing queued stays pending, so driver timeouts behave as they
//! would against a silent instrument.
//!
//! [`loopback`] returns a stream whose reads yield whatever was written to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use labctl_core::{mock_serial, serial::SerialPort};
//!
//! let (stream, mut harness) = mock_serial::new();
//! let mut port = SerialPort::from_stream("sim", Box::new(stream), b'\r', timeout);
//!
//! harness.send_response(b"210\r")?;
//! let reply = port.query("VERSION").await?;
//! harness.expect_write(b"VERSION\r").await;
//! assert_eq!(reply.text, "210");
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long [`MockDeviceHarness::expect_write`] waits before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side of a simulated port.
#[derive(Debug)]
pub struct MockSerialPort {
    to_device: UnboundedSender<Vec<u8>>,
    from_device: UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Test side of a simulated port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    from_client: UnboundedReceiver<Vec<u8>>,
    to_client: UnboundedSender<Vec<u8>>,
    received: Vec<u8>,
}

/// Create a connected `MockSerialPort` / `MockDeviceHarness` pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_tx, harness_rx) = mpsc::unbounded_channel();
    let (harness_tx, client_rx) = mpsc::unbounded_channel();

    (
        MockSerialPort {
            to_device: client_tx,
            from_device: client_rx,
            pending: VecDeque::new(),
        },
        MockDeviceHarness {
            from_client: harness_rx,
            to_client: harness_tx,
            received: Vec::new(),
        },
    )
}

impl MockSerialPort {
    fn take_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match self.from_device.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending.extend(chunk),
                // Harness dropped: end-of-file.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.take_pending(buf);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.to_device.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the client to read.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.to_client
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Queue several replies at once, in order.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped.
    pub fn send_responses(&self, replies: &[&[u8]]) -> Result<(), &'static str> {
        for reply in replies {
            self.send_response(reply)?;
        }
        Ok(())
    }

    /// Wait until the client has written `expected` and assert on it.
    ///
    /// Bytes beyond `expected` stay buffered for the next expectation.
    ///
    /// # Panics
    /// If the bytes differ or do not arrive within two seconds.
    #[allow(clippy::panic)]
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.received.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.from_client.recv()).await {
                Ok(Some(chunk)) => self.received.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected {:?}, received {:?}.",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.received)
                ),
            }
        }

        let actual: Vec<u8> = self.received.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected {:?}, got {:?}.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    /// Everything written so far that has not been consumed by
    /// [`MockDeviceHarness::expect_write`]. Does not wait.
    pub fn written(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.from_client.try_recv() {
            self.received.extend_from_slice(&chunk);
        }
        std::mem::take(&mut self.received)
    }

    /// [`MockDeviceHarness::written`] as lossy text.
    pub fn written_text(&mut self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }
}

// =============================================================================
// Loopback
// =============================================================================

/// A stream that reads back its own writes.
#[derive(Debug, Default)]
pub struct LoopbackPort {
    buffer: VecDeque<u8>,
    reader: Option<Waker>,
}

/// Create an empty [`LoopbackPort`].
pub fn loopback() -> LoopbackPort {
    LoopbackPort::default()
}

impl AsyncRead for LoopbackPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buffer.is_empty() {
            self.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.remaining().min(self.buffer.len());
        let chunk: Vec<u8> = self.buffer.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for LoopbackPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend(buf.iter().copied());
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_command_response() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        harness.send_response(b"PONG\n").unwrap();
        port.write_all(b"PING\n").await.unwrap();

        let mut response = String::new();
        port.read_line(&mut response).await.unwrap();

        harness.expect_write(b"PING\n").await;
        assert_eq!(response, "PONG\n");
    }

    #[tokio::test]
    async fn test_silent_device_stays_pending() {
        let (port, _harness) = new();
        let mut port = BufReader::new(port);
        let mut response = String::new();
        let result = timeout(Duration::from_millis(50), port.read_line(&mut response)).await;
        assert!(result.is_err(), "Expected timeout");
    }

    #[tokio::test]
    async fn test_written_collects_unasserted_bytes() {
        let (mut port, mut harness) = new();
        port.write_all(b"CMD1\r").await.unwrap();
        port.write_all(b"CMD2\r").await.unwrap();
        harness.expect_write(b"CMD1\r").await;
        assert_eq!(harness.written_text(), "CMD2\r");
        assert!(harness.written().is_empty());
    }

    #[tokio::test]
    async fn test_queued_responses_arrive_in_order() {
        let (port, harness) = new();
        let mut port = BufReader::new(port);
        harness.send_responses(&[b"A\n", b"B\n"]).unwrap();

        let mut first = String::new();
        port.read_line(&mut first).await.unwrap();
        let mut second = String::new();
        port.read_line(&mut second).await.unwrap();

        assert_eq!(first, "A\n");
        assert_eq!(second, "B\n");
    }

    #[tokio::test]
    async fn test_loopback_echoes_writes() {
        let mut port = BufReader::new(loopback());
        port.write_all(b"hello\n").await.unwrap();
        let mut line = String::new();
        port.read_line(&mut line).await.unwrap();
        assert_eq!(line, "hello\n");
    }
}
