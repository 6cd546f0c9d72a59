//! In-memory devices used in testing and simulation

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{BusIo, DeviceInterface};
use crate::constants::{SERIAL_TIMEOUT_MS, SWI_REG_MESSAGE, SWI_REG_NOTIFY};
use crate::error::{BoardError, BoardResult};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Everything the host did to a [`MockDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Sent(Vec<u8>),
    Reset,
    BaudRate(u32),
}

/// Shared view of the traffic seen by a mock
#[derive(Debug, Clone, Default)]
pub struct MockLog(Arc<Mutex<Vec<MockEvent>>>);

impl MockLog {
    fn push(&self, event: MockEvent) {
        self.entries().push(event);
    }

    fn entries(&self) -> MutexGuard<'_, Vec<MockEvent>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.entries().clone()
    }

    /// All bytes sent so far, concatenated
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.entries()
            .iter()
            .filter_map(|event| match event {
                MockEvent::Sent(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn resets(&self) -> usize {
        self.entries()
            .iter()
            .filter(|event| **event == MockEvent::Reset)
            .count()
    }
}

/// A scripted serial device. Every send is passed to the responder, whose output
/// is delivered back on the read half.
pub struct MockDevice {
    responder: Responder,
    reset_reply: Vec<u8>,
    sink: mpsc::Sender<Vec<u8>>,
    source: Option<mpsc::Receiver<Vec<u8>>>,
    log: MockLog,
}

impl MockDevice {
    pub fn new(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        let (sink, source) = mpsc::channel();
        MockDevice {
            responder: Box::new(responder),
            reset_reply: Vec::new(),
            sink,
            source: Some(source),
            log: MockLog::default(),
        }
    }

    /// A device that never answers
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Bytes the device emits after every RTS/DTR reset
    pub fn with_reset_reply(mut self, reply: &[u8]) -> Self {
        self.reset_reply = reply.to_vec();
        self
    }

    pub fn log(&self) -> MockLog {
        self.log.clone()
    }

    /// Push unsolicited bytes onto the read half
    pub fn injector(&self) -> mpsc::Sender<Vec<u8>> {
        self.sink.clone()
    }

    fn deliver(&self, data: Vec<u8>) -> BoardResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.sink
            .send(data)
            .map_err(|e| BoardError::Communication(format!("Mock reader gone: {:?}", e)))
    }
}

impl DeviceInterface for MockDevice {
    fn send(&mut self, data: &[u8]) -> BoardResult<()> {
        self.log.push(MockEvent::Sent(data.to_vec()));
        let reply = (self.responder)(data);
        self.deliver(reply)
    }

    fn reader(&mut self) -> BoardResult<Box<dyn Read + Send>> {
        let source = self
            .source
            .take()
            .ok_or_else(|| BoardError::Communication("Mock reader already taken".to_string()))?;
        Ok(Box::new(ChannelReader {
            source,
            pending: Vec::new(),
        }))
    }

    fn flush_buffers(&mut self) -> BoardResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> BoardResult<()> {
        self.log.push(MockEvent::Reset);
        self.deliver(self.reset_reply.clone())
    }

    fn set_baud_rate(&mut self, baud: u32) -> BoardResult<()> {
        self.log.push(MockEvent::BaudRate(baud));
        Ok(())
    }
}

/// Read half of a [`MockDevice`], behaving like a serial port with a short timeout
struct ChannelReader {
    source: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self
                .source
                .recv_timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let size = buf.len().min(self.pending.len());
        buf[..size].copy_from_slice(&self.pending[..size]);
        self.pending.drain(..size);
        Ok(size)
    }
}

type MailboxHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// A soft-core bus whose software-interrupt mailbox is serviced by a closure.
///
/// Writing the notify register reads the framed request at the mailbox address,
/// passes its payload to the handler and posts the framed reply at the reply
/// address, which is published through the message register. Clearing the
/// message register afterwards republishes the mailbox.
pub struct MockBus {
    memory: BTreeMap<u32, u8>,
    swi_base: u32,
    mailbox: u32,
    reply_at: u32,
    replied: bool,
    handler: MailboxHandler,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockBus {
    pub fn new(
        swi_base: u32,
        mailbox: u32,
        handler: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Self {
        let mut bus = MockBus {
            memory: BTreeMap::new(),
            swi_base,
            mailbox,
            reply_at: mailbox,
            replied: false,
            handler: Box::new(handler),
            requests: Arc::default(),
        };
        bus.publish_mailbox();
        bus
    }

    fn publish_mailbox(&mut self) {
        self.store(
            self.swi_base + SWI_REG_MESSAGE * 4,
            &self.mailbox.to_le_bytes(),
        );
    }

    /// Post replies at a different address than the request mailbox
    pub fn relocate_replies(mut self, reply_at: u32) -> Self {
        self.reply_at = reply_at;
        self
    }

    /// Payloads of every request serviced so far
    pub fn requests(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.requests)
    }

    pub fn peek(&self, address: u32, length: usize) -> Vec<u8> {
        (0..length as u32)
            .map(|i| self.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    fn store(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, *byte);
        }
    }

    fn service(&mut self) {
        let length = u32::from_le_bytes(
            self.peek(self.mailbox, 4)
                .try_into()
                .unwrap_or([0; 4]),
        ) as usize;
        let request = self.peek(self.mailbox + 4, length);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let reply = (self.handler)(&request);
        let mut frame = (reply.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&reply);
        self.store(self.reply_at, &frame);
        self.store(
            self.swi_base + SWI_REG_MESSAGE * 4,
            &self.reply_at.to_le_bytes(),
        );
        self.replied = true;
    }
}

impl BusIo for MockBus {
    fn read_memory(&mut self, address: u32, length: usize) -> BoardResult<Vec<u8>> {
        Ok(self.peek(address, length))
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> BoardResult<()> {
        self.store(address, data);
        if address == self.swi_base + SWI_REG_NOTIFY * 4 && data.first() == Some(&1) {
            self.service();
        } else if address == self.swi_base + SWI_REG_MESSAGE * 4 && self.replied {
            self.replied = false;
            self.publish_mailbox();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_echoes_responder_output() {
        let mut device = MockDevice::new(|data| data.iter().rev().copied().collect());
        let mut reader = device.reader().unwrap();
        device.send(b"abc").unwrap();

        let mut buf = [0u8; 8];
        let size = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"cba");
        assert_eq!(device.log().sent_bytes(), b"abc");
    }

    #[test]
    fn idle_reader_times_out() {
        let mut device = MockDevice::silent();
        let mut reader = device.reader().unwrap();
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn bus_registers_are_little_endian_words() {
        let mut bus = MockBus::new(0x100, 0x2000, |_| Vec::new());
        bus.iowr(0x100, 3, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.peek(0x10c, 4), [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(bus.iord(0x100, SWI_REG_MESSAGE).unwrap(), 0x2000);
    }
}
