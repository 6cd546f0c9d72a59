//! Demultiplexes an asynchronous byte stream into discrete responses.
//!
//! A reader thread appends every inbound chunk to an accumulation buffer and
//! re-evaluates the single pending [`Trigger`]. Once the trigger is satisfied the
//! matched prefix is handed to the waiting caller and the remainder is kept for
//! the next request.
//!
//! Only one request may be pending at a time. Issuing a new one rejects the
//! previous request with [`BoardError::Cancelled`], so two reads are never
//! silently merged or lost.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::DeviceInterface;
use crate::constants::MAX_RESPONSE_SIZE;
use crate::error::{BoardError, BoardResult};

/// What completes a pending receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A fixed number of bytes
    Length(usize),
    /// Everything up to and including the token
    Token(Vec<u8>),
}

impl Trigger {
    pub fn text(token: &str) -> Self {
        Trigger::Token(token.as_bytes().to_vec())
    }
}

type Reply = mpsc::Sender<BoardResult<Vec<u8>>>;

struct Waiter {
    id: u64,
    trigger: Trigger,
    offset: usize,
    reply: Reply,
}

impl Waiter {
    /// Number of bytes this waiter consumes from `buffer`, if it is satisfied.
    fn scan(&mut self, buffer: &[u8]) -> Option<usize> {
        match &self.trigger {
            Trigger::Length(length) => (buffer.len() >= *length).then_some(*length),
            Trigger::Token(token) if token.is_empty() => Some(0),
            Trigger::Token(token) => {
                let start = self.offset.min(buffer.len());
                match find(&buffer[start..], token) {
                    Some(index) => Some(start + index + token.len()),
                    None => {
                        // A partial token may straddle the end of the buffer
                        self.offset = (buffer.len() + 1).saturating_sub(token.len());
                        None
                    }
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Default)]
struct ReceiverState {
    buffer: Vec<u8>,
    waiter: Option<Waiter>,
    next_id: u64,
    closed: Option<String>,
}

impl ReceiverState {
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        self.settle();
    }

    fn settle(&mut self) {
        let Some(consumed) = self
            .waiter
            .as_mut()
            .and_then(|waiter| waiter.scan(&self.buffer))
        else {
            return;
        };

        if let Some(waiter) = self.waiter.take() {
            let rest = self.buffer.split_off(consumed);
            let matched = std::mem::replace(&mut self.buffer, rest);
            trace!("Receive #{} satisfied with {} bytes", waiter.id, matched.len());
            let _ = waiter.reply.send(Ok(matched));
        }
    }

    fn close(&mut self, reason: String) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter
                .reply
                .send(Err(BoardError::Communication(reason.clone())));
        }
        self.closed = Some(reason);
    }
}

fn lock(state: &Mutex<ReceiverState>) -> MutexGuard<'_, ReceiverState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A receive request that has been issued but not yet awaited
#[must_use = "a pending receive does nothing unless waited on"]
pub struct PendingReceive {
    id: u64,
    reply: mpsc::Receiver<BoardResult<Vec<u8>>>,
    timeout: Option<Duration>,
    state: Arc<Mutex<ReceiverState>>,
}

impl PendingReceive {
    /// Block until the trigger is satisfied, superseded, or the timeout elapses
    pub fn wait(self) -> BoardResult<Vec<u8>> {
        let outcome = match self.timeout {
            Some(timeout) => self.reply.recv_timeout(timeout),
            None => self
                .reply
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match outcome {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let mut state = lock(&self.state);
                if state.waiter.as_ref().is_some_and(|w| w.id == self.id) {
                    state.waiter = None;
                }
                drop(state);

                // The reader thread may have resolved us while we were taking the lock
                match self.reply.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(BoardError::Timeout(self.timeout.unwrap_or_default())),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(BoardError::Communication(
                "Receiver dropped the pending request".to_string(),
            )),
        }
    }

    /// Like [`wait`](Self::wait), decoding the result as text
    pub fn wait_text(self) -> BoardResult<String> {
        self.wait()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Owns a duplex transport and the accumulation buffer fed from its read half
pub struct ByteStreamReceiver {
    device: Box<dyn DeviceInterface>,
    state: Arc<Mutex<ReceiverState>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ByteStreamReceiver {
    pub fn new(mut device: Box<dyn DeviceInterface>) -> BoardResult<Self> {
        let mut source = device.reader()?;
        let state = Arc::new(Mutex::new(ReceiverState::default()));
        let running = Arc::new(AtomicBool::new(true));

        let thread_state = Arc::clone(&state);
        let thread_running = Arc::clone(&running);

        // Receiver thread
        let reader = std::thread::spawn(move || {
            let mut chunk = vec![0u8; MAX_RESPONSE_SIZE];
            while thread_running.load(Ordering::Acquire) {
                match source.read(&mut chunk) {
                    Ok(0) => {
                        debug!("Device stream ended");
                        lock(&thread_state).close("Device stream ended".to_string());
                        break;
                    }
                    Ok(size) => {
                        trace!("Received bytes {:?}", &chunk[..size]);
                        lock(&thread_state).feed(&chunk[..size]);
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                        ) => {}
                    Err(e) => {
                        warn!("Error receiving from device: {}", e);
                        lock(&thread_state).close(format!("Read failed: {}", e));
                        break;
                    }
                }
            }
        });

        Ok(ByteStreamReceiver {
            device,
            state,
            running,
            reader: Some(reader),
        })
    }

    pub fn send(&mut self, data: &[u8]) -> BoardResult<()> {
        self.device.send(data)
    }

    /// Install a new waiter, cancelling any request still pending
    pub fn receive(&self, trigger: Trigger, timeout: Option<Duration>) -> PendingReceive {
        let (reply, rx) = mpsc::channel();
        let mut state = lock(&self.state);

        if let Some(previous) = state.waiter.take() {
            debug!("Receive #{} superseded", previous.id);
            let _ = previous.reply.send(Err(BoardError::Cancelled));
        }

        let id = state.next_id;
        state.next_id += 1;

        match state.closed.clone() {
            Some(reason) => {
                let _ = reply.send(Err(BoardError::Communication(reason)));
            }
            None => {
                state.waiter = Some(Waiter {
                    id,
                    trigger,
                    offset: 0,
                    reply,
                });
                // Data may already be buffered
                state.settle();
            }
        }

        PendingReceive {
            id,
            reply: rx,
            timeout,
            state: Arc::clone(&self.state),
        }
    }

    pub fn recv(&self, trigger: Trigger, timeout: Option<Duration>) -> BoardResult<Vec<u8>> {
        self.receive(trigger, timeout).wait()
    }

    pub fn recv_text(&self, token: &str, timeout: Option<Duration>) -> BoardResult<String> {
        self.receive(Trigger::text(token), timeout).wait_text()
    }

    pub fn flush(&mut self) -> BoardResult<()> {
        self.device.flush_buffers()
    }

    /// Drop whatever has been received but not yet consumed
    pub fn discard(&self) -> usize {
        let mut state = lock(&self.state);
        let dropped = state.buffer.len();
        state.buffer.clear();
        dropped
    }

    pub fn device_mut(&mut self) -> &mut dyn DeviceInterface {
        self.device.as_mut()
    }

    /// Stop the reader thread; further receives fail with a communication error
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("Receiver thread panicked");
            }
        }
        lock(&self.state).close("Receiver closed".to_string());
    }
}

impl Drop for ByteStreamReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(trigger: Trigger) -> (Waiter, mpsc::Receiver<BoardResult<Vec<u8>>>) {
        let (reply, rx) = mpsc::channel();
        (
            Waiter {
                id: 0,
                trigger,
                offset: 0,
                reply,
            },
            rx,
        )
    }

    #[test]
    fn length_trigger_waits_for_enough_bytes() {
        let (mut w, _rx) = waiter(Trigger::Length(4));
        assert_eq!(w.scan(b"abc"), None);
        assert_eq!(w.scan(b"abcdef"), Some(4));
    }

    #[test]
    fn token_match_includes_prefix() {
        let (mut w, _rx) = waiter(Trigger::text("OK"));
        assert_eq!(w.scan(b"header OK tail"), Some(9));
    }

    #[test]
    fn token_offset_never_moves_backwards() {
        let (mut w, _rx) = waiter(Trigger::text("END"));
        let mut buffer = Vec::new();
        let mut last = 0;
        for chunk in [&b"aaaa"[..], b"bbbbbb", b"E", b"N", b"cc"] {
            buffer.extend_from_slice(chunk);
            assert_eq!(w.scan(&buffer), None);
            assert!(w.offset >= last);
            assert_eq!(w.offset, buffer.len() + 1 - 3);
            last = w.offset;
        }
        buffer.extend_from_slice(b"xENDyy");
        assert_eq!(w.scan(&buffer), Some(buffer.len() - 2));
    }

    #[test]
    fn token_split_across_chunks_is_found() {
        let (mut w, _rx) = waiter(Trigger::text("\r\n>"));
        let mut buffer = b"hello\r".to_vec();
        assert_eq!(w.scan(&buffer), None);
        buffer.extend_from_slice(b"\n> rest");
        assert_eq!(w.scan(&buffer), Some(8));
    }

    #[test]
    fn settle_keeps_the_remainder() {
        let (w, rx) = waiter(Trigger::text(";"));
        let mut state = ReceiverState {
            waiter: Some(w),
            ..Default::default()
        };
        state.feed(b"one;two");
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"one;");
        assert_eq!(state.buffer, b"two");
        assert!(state.waiter.is_none());
    }
}
