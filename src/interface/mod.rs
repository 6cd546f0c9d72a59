pub mod avalon;
pub mod mock;
pub mod receiver;
pub mod serialport;

use std::io::Read;

use crate::error::{BoardError, BoardResult};

/// Duplex byte transport to a target device
pub trait DeviceInterface: Send {
    /// Send bytes to the target device, in order
    fn send(&mut self, data: &[u8]) -> BoardResult<()>;

    /// Independent read half, handed to the receiver thread.
    /// Reads time out periodically with `ErrorKind::TimedOut`; `Ok(0)` means the stream ended.
    fn reader(&mut self) -> BoardResult<Box<dyn Read + Send>>;

    /// Flush send/receive buffers
    fn flush_buffers(&mut self) -> BoardResult<()>;

    /// Toggle RTS/DTR, resetting or resynchronising the target
    fn reset(&mut self) -> BoardResult<()>;

    /// Change the line rate of an open transport
    fn set_baud_rate(&mut self, baud: u32) -> BoardResult<()>;
}

/// Memory-mapped access to a soft-core bus
pub trait BusIo: Send {
    fn read_memory(&mut self, address: u32, length: usize) -> BoardResult<Vec<u8>>;

    fn write_memory(&mut self, address: u32, data: &[u8]) -> BoardResult<()>;

    /// Read the 32-bit register `reg` of the peripheral at `base`
    fn iord(&mut self, base: u32, reg: u32) -> BoardResult<u32> {
        let bytes = self.read_memory(base + reg * 4, 4)?;
        let word: [u8; 4] = bytes.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(|| {
            BoardError::ProtocolViolation(format!("Short register read ({} bytes)", bytes.len()))
        })?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write the 32-bit register `reg` of the peripheral at `base`
    fn iowr(&mut self, base: u32, reg: u32, value: u32) -> BoardResult<()> {
        self.write_memory(base + reg * 4, &value.to_le_bytes())
    }
}
