//! Duplex byte-stream transports: serial console and SSH session.
//!
//! Both transports are built on [`Duplex`]: a writer for the session's input
//! side and a background reader task that drains the output side. Every
//! chunk the reader sees is decoded as UTF-8, appended to a bounded
//! [`OutputBuffer`] and forwarded, in order, to the single attached
//! [`Subscription`] if there is one. Only whole characters are forwarded, so
//! a snapshot followed by the live stream is always valid text. Forwarding goes through an unbounded channel, so a slow subscriber
//! never stalls the reader.
//!
//! ```text
//!  send() ──► writer ──► OS handle ──► peer
//!                                       │
//!  Subscription ◄── channel ◄── reader task ◄── OS handle
//!                                 │
//!                                 └──► OutputBuffer (snapshot on attach)
//! ```

pub mod buffer;
#[cfg(unix)]
pub mod console;
pub mod ssh;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use self::buffer::{BufferLimits, OutputBuffer, Utf8Decoder};
use crate::error::{Error, Result};

/// Bytes read per reader iteration.
const READ_CHUNK: usize = 4096;

/// Boxed input side of a transport.
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Common contract of the console and SSH transports.
pub trait DuplexTransport: Send + Sync {
    /// The underlying stream core.
    fn duplex(&self) -> &Duplex;

    /// Releases every OS resource the transport owns. Idempotent.
    fn close(&self);
}

/// Live view of a transport's output.
///
/// Holds no reference to the transport: dropping the transport ends the
/// stream, and dropping the subscription detaches it.
#[derive(Debug)]
pub struct Subscription {
    /// Buffer contents at the moment of attaching.
    snapshot: String,
    /// UTF-8 chunks read after the snapshot, in arrival order.
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Output buffered before this subscription was attached.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Waits for the next chunk.
    ///
    /// Returns `None` once the transport reaches end-of-stream, is closed,
    /// or this subscription has been replaced or detached.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Returns the next chunk if one is already queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// State touched by both the reader task and callers.
#[derive(Debug)]
struct Shared {
    /// Output history.
    buffer: OutputBuffer,
    /// Current subscriber, if any.
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Reader has exited; new subscribers get a closed stream.
    eof: bool,
}

/// Bidirectional byte stream with buffered history and one subscriber.
pub struct Duplex {
    /// Buffer and subscriber, written by the reader task only.
    shared: Arc<Mutex<Shared>>,
    /// Input side; `None` once closed.
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Tells the reader task to drop its handle and exit.
    shutdown: watch::Sender<bool>,
    /// Set by the first `close`.
    closed: AtomicBool,
    /// Name used in log events.
    label: &'static str,
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Duplex {
    /// Wraps a reader/writer pair and spawns the reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<R, W>(label: &'static str, reader: R, writer: W, limits: BufferLimits) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            buffer: OutputBuffer::new(limits),
            subscriber: None,
            eof: false,
        }));
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(pump(label, reader, Arc::clone(&shared), shutdown_rx));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            shutdown,
            closed: AtomicBool::new(false),
            label,
        }
    }

    /// Writes `bytes` to the input side.
    ///
    /// Waits while the OS pipe is full; there is no internal queue. A
    /// concurrent [`close`](Self::close) aborts the wait with
    /// [`Error::TransportClosed`] and drops the writer.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut closing = self.shutdown.subscribe();

        let mut guard = tokio::select! {
            biased;
            () = closed(&mut closing) => return Err(Error::TransportClosed),
            held = self.writer.lock() => held,
        };
        let writer = guard.as_mut().ok_or(Error::TransportClosed)?;

        let interrupted = tokio::select! {
            biased;
            () = closed(&mut closing) => true,
            written = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => {
                written?;
                false
            }
        };
        if interrupted {
            guard.take();
            return Err(Error::TransportClosed);
        }
        Ok(())
    }

    /// Writes UTF-8 text to the input side.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Attaches a new subscriber, replacing the previous one.
    ///
    /// The snapshot and the start of the live stream are taken under the
    /// same lock, so no character is missed or seen twice. Bytes of a
    /// character still incomplete at that moment arrive on the stream once
    /// it completes.
    pub fn attach(&self) -> Subscription {
        let mut shared = lock(&self.shared);
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = shared.buffer.as_str().to_owned();
        shared.subscriber = (!shared.eof).then_some(tx);
        Subscription { snapshot, rx }
    }

    /// Detaches the current subscriber. No-op if none is attached.
    pub fn detach(&self) {
        lock(&self.shared).subscriber = None;
    }

    /// Returns `true` if a subscriber is attached.
    pub fn has_subscriber(&self) -> bool {
        lock(&self.shared)
            .subscriber
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Copy of the buffered output.
    pub fn snapshot(&self) -> String {
        lock(&self.shared).buffer.as_str().to_owned()
    }

    /// Discards the buffered output.
    pub fn clear_buffer(&self) {
        lock(&self.shared).buffer.clear();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` once the reader task has exited.
    pub fn is_eof(&self) -> bool {
        lock(&self.shared).eof
    }

    /// Stops the reader and closes both OS handles. Idempotent.
    ///
    /// Does not wait for the reader task; it observes the signal, drops its
    /// handle, and ends the subscriber stream on its own. A `send` blocked
    /// on a full pipe observes the same signal and drops the writer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        // A blocked `send` holds the writer and drops it itself.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        tracing::debug!(transport = self.label, "closed");
    }
}

impl Drop for Duplex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader task: drain `reader` into the buffer and subscriber until
/// end-of-stream, a read error, or shutdown.
async fn pump<R>(
    label: &'static str,
    mut reader: R,
    shared: Arc<Mutex<Shared>>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut decoder = Utf8Decoder::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let n = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(transport = label, error = %e, "read failed");
                    break;
                }
            },
        };

        let text = decoder.decode(&buf[..n]);
        if !text.is_empty() {
            deliver(&mut lock(&shared), text);
        }
    }

    drop(reader);
    let mut state = lock(&shared);
    let tail = decoder.finish();
    if !tail.is_empty() {
        deliver(&mut state, tail);
    }
    state.eof = true;
    state.subscriber = None;
    tracing::debug!(transport = label, "reader finished");
}

/// Resolves once the shutdown flag is raised.
async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Appends decoded `text` to the history and forwards it to the subscriber.
fn deliver(state: &mut Shared, text: String) {
    state.buffer.append(&text);
    let gone = state
        .subscriber
        .as_ref()
        .is_some_and(|tx| tx.send(text.into_bytes()).is_err());
    if gone {
        state.subscriber = None;
    }
}

/// Locks `m`, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn delivers_chunks_in_order_and_buffers_them() {
        let (mut peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());
        let mut sub = t.attach();
        assert_eq!(sub.snapshot(), "");

        peer.write_all(b"one ").await.unwrap();
        peer.write_all(b"two").await.unwrap();

        let mut got = Vec::new();
        while got.len() < 7 {
            got.extend(timeout(WAIT, sub.recv()).await.unwrap().unwrap());
        }
        assert_eq!(got, b"one two");
        assert_eq!(t.snapshot(), "one two");
    }

    #[tokio::test]
    async fn unattached_output_is_kept_in_buffer_and_snapshotted() {
        let (mut peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());

        peer.write_all(b"early").await.unwrap();
        timeout(WAIT, async {
            while t.snapshot() != "early" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut sub = t.attach();
        assert_eq!(sub.snapshot(), "early");
        peer.write_all(b"late").await.unwrap();
        assert_eq!(timeout(WAIT, sub.recv()).await.unwrap().unwrap(), b"late");
    }

    #[tokio::test]
    async fn attach_replaces_previous_subscriber() {
        let (_peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());

        let mut first = t.attach();
        let _second = t.attach();
        assert!(timeout(WAIT, first.recv()).await.unwrap().is_none());

        t.detach();
        t.detach();
        assert!(!t.has_subscriber());
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (mut peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());

        t.send_text("ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        tokio::io::AsyncReadExt::read_exact(&mut peer, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"ls\n");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let (_peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());
        let mut sub = t.attach();

        t.close();
        t.close();

        assert!(t.is_closed());
        assert!(timeout(WAIT, sub.recv()).await.unwrap().is_none());
        assert!(matches!(t.send(b"x").await, Err(Error::TransportClosed)));
        // Attaching after end-of-stream yields a closed stream, not a hang.
        timeout(WAIT, async {
            while !t.is_eof() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let mut late = t.attach();
        assert!(timeout(WAIT, late.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attaching_inside_a_split_character_keeps_it_whole() {
        let (mut peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());

        peer.write_all(b"a\xC3").await.unwrap();
        timeout(WAIT, async {
            while t.snapshot() != "a" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let mut sub = t.attach();
        peer.write_all(b"\xA9z").await.unwrap();

        let mut seen = sub.snapshot().as_bytes().to_vec();
        while seen.len() < 4 {
            seen.extend(timeout(WAIT, sub.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, "a\u{e9}z".as_bytes());
    }

    #[tokio::test]
    async fn truncated_character_at_eof_is_replaced() {
        let (mut peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());

        peer.write_all(b"ok\xE2\x82").await.unwrap();
        drop(peer);
        timeout(WAIT, async {
            while !t.is_eof() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(t.snapshot(), "ok\u{FFFD}");
    }

    #[tokio::test]
    async fn close_aborts_a_send_stuck_on_a_full_peer() {
        let (_peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = std::sync::Arc::new(Duplex::spawn("test", r, w, BufferLimits::default()));

        let sender = std::sync::Arc::clone(&t);
        let pending = tokio::spawn(async move { sender.send(&vec![b'x'; 4096]).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        t.close();
        let sent = timeout(WAIT, pending).await.unwrap().unwrap();
        assert!(matches!(sent, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn peer_eof_finishes_reader() {
        let (peer, ours) = duplex(64);
        let (r, w) = tokio::io::split(ours);
        let t = Duplex::spawn("test", r, w, BufferLimits::default());
        let mut sub = t.attach();

        drop(peer);
        assert!(timeout(WAIT, sub.recv()).await.unwrap().is_none());
        assert!(t.is_eof());
    }
}
