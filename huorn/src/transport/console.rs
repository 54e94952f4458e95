//! Serial console over a pair of anonymous pipes.
//!
//! The host keeps the write end of the input pipe and the read end of the
//! output pipe; the opposite ends ([`ConsoleEndpoints`]) are handed to the
//! engine, which wires them to the guest's serial port.

use std::os::fd::OwnedFd;

use tokio::net::unix::pipe;

use super::buffer::BufferLimits;
use super::{Duplex, DuplexTransport, Subscription};
use crate::error::Result;

/// Guest-side pipe ends of a [`SerialConsole`].
#[derive(Debug)]
#[non_exhaustive]
pub struct ConsoleEndpoints {
    /// The guest reads its console input from here.
    pub guest_input: OwnedFd,
    /// The guest writes its console output here.
    pub guest_output: OwnedFd,
}

/// Host side of a VM serial console.
#[derive(Debug)]
pub struct SerialConsole {
    /// Stream core owning the host pipe ends.
    duplex: Duplex,
    /// Guest ends until the engine takes them.
    endpoints: Option<ConsoleEndpoints>,
}

impl SerialConsole {
    /// Creates the pipe pair with default buffer limits.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_limits(BufferLimits::default())
    }

    /// Creates the pipe pair with custom buffer limits.
    pub fn with_limits(limits: BufferLimits) -> Result<Self> {
        let (guest_input, host_input) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        let (host_output, guest_output) = nix::unistd::pipe().map_err(std::io::Error::from)?;

        let reader = pipe::Receiver::from_owned_fd(host_output)?;
        let writer = pipe::Sender::from_owned_fd(host_input)?;

        Ok(Self {
            duplex: Duplex::spawn("console", reader, writer, limits),
            endpoints: Some(ConsoleEndpoints {
                guest_input,
                guest_output,
            }),
        })
    }

    /// Hands the guest pipe ends to the caller (normally the engine).
    ///
    /// Returns `None` after the first call.
    pub fn take_endpoints(&mut self) -> Option<ConsoleEndpoints> {
        self.endpoints.take()
    }

    /// Writes raw bytes to the guest.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.duplex.send(bytes).await
    }

    /// Writes text to the guest.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.duplex.send_text(text).await
    }

    /// Attaches a subscriber to console output.
    pub fn attach(&self) -> Subscription {
        self.duplex.attach()
    }

    /// Detaches the current subscriber.
    pub fn detach(&self) {
        self.duplex.detach();
    }

    /// Copy of the buffered console output.
    pub fn output(&self) -> String {
        self.duplex.snapshot()
    }

    /// Discards the buffered console output.
    pub fn clear_buffer(&self) {
        self.duplex.clear_buffer();
    }

    /// Stops the reader and closes the host pipe ends. Idempotent.
    pub fn stop(&mut self) {
        self.duplex.close();
        self.endpoints = None;
    }
}

impl DuplexTransport for SerialConsole {
    fn duplex(&self) -> &Duplex {
        &self.duplex
    }

    fn close(&self) {
        self.duplex.close();
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn guest_output_reaches_subscriber_and_buffer() {
        let mut console = SerialConsole::new().unwrap();
        let ends = console.take_endpoints().unwrap();
        assert!(console.take_endpoints().is_none());
        let mut sub = console.attach();

        let mut guest_out = File::from(ends.guest_output);
        guest_out.write_all("login: ü".as_bytes()).unwrap();

        let mut got = Vec::new();
        while got.len() < "login: ü".len() {
            got.extend(timeout(WAIT, sub.recv()).await.unwrap().unwrap());
        }
        assert_eq!(String::from_utf8(got).unwrap(), "login: ü");
        assert_eq!(console.output(), "login: ü");

        console.clear_buffer();
        assert_eq!(console.output(), "");
    }

    #[tokio::test]
    async fn host_input_reaches_guest() {
        let mut console = SerialConsole::new().unwrap();
        let ends = console.take_endpoints().unwrap();

        console.send_text("root\n").await.unwrap();

        let mut guest_in = File::from(ends.guest_input);
        let mut buf = [0u8; 5];
        guest_in.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"root\n");
    }

    #[tokio::test]
    async fn stop_twice_is_a_noop() {
        let mut console = SerialConsole::new().unwrap();
        let mut sub = console.attach();

        console.stop();
        console.stop();

        assert!(timeout(WAIT, sub.recv()).await.unwrap().is_none());
        assert!(console.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn close_releases_a_send_blocked_on_a_full_pipe() {
        let mut console = SerialConsole::new().unwrap();
        // Held open and never read, so the input pipe fills up.
        let _ends = console.take_endpoints().unwrap();
        let console = std::sync::Arc::new(console);

        let sender = std::sync::Arc::clone(&console);
        let pending = tokio::spawn(async move { sender.send(&vec![b'x'; 1 << 20]).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pending.is_finished());

        DuplexTransport::close(&*console);
        let sent = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(sent, Err(crate::Error::TransportClosed)));
    }
}
