//! Avalon-MM master access over a serial byte stream.
//!
//! Bus transactions are framed as Avalon-ST packets:
//!
//! ```plain
//! transaction: | opcode | 0x00 | size (BE16) | address (BE32) | data ... |
//! packet:      | SOP | CHANNEL 0x00 | bytes ... | EOP | last byte |
//! ```
//!
//! Packet control bytes inside the payload are escaped with [`ESCAPE`] and
//! xor [`XOR_PATTERN`]. On the host-to-device direction the bridge also
//! reserves [`CONFIG_COMMAND`] for out-of-band configuration queries, so that
//! byte and [`BRIDGE_ESCAPE`] are escaped a second time.

use std::time::Duration;

use tracing::{debug, trace};

use super::BusIo;
use super::receiver::{ByteStreamReceiver, Trigger};
use crate::constants::{AVALON_TIMEOUT_MS, AVALON_TRANSACTION_SIZE};
use crate::error::{BoardError, BoardResult};

const SOP: u8 = 0x7a;
const EOP: u8 = 0x7b;
const CHANNEL: u8 = 0x7c;
const ESCAPE: u8 = 0x7d;
const XOR_PATTERN: u8 = 0x20;

const CONFIG_COMMAND: u8 = 0x3a;
const BRIDGE_ESCAPE: u8 = 0x3d;
const CONFIG_QUERY: u8 = 0x39;
/// Config reply bit set once the FPGA runs user logic
const CONFIG_USER_MODE: u8 = 0x01;

const OP_WRITE_INCREMENTING: u8 = 0x04;
const OP_READ_INCREMENTING: u8 = 0x14;
const RESPONSE_FLAG: u8 = 0x80;

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if (SOP..=ESCAPE).contains(&byte) {
        out.push(ESCAPE);
        out.push(byte ^ XOR_PATTERN);
    } else {
        out.push(byte);
    }
}

/// Frame a transaction as a packet on channel 0
pub(crate) fn encode_packet(transaction: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(transaction.len() + 8);
    out.push(SOP);
    out.push(CHANNEL);
    out.push(0x00);
    for (i, byte) in transaction.iter().enumerate() {
        if i + 1 == transaction.len() {
            out.push(EOP);
        }
        push_escaped(&mut out, *byte);
    }
    out
}

/// Recover the payload of a single packet
pub(crate) fn decode_packet(packet: &[u8]) -> BoardResult<Vec<u8>> {
    let start = packet
        .iter()
        .position(|b| *b == SOP)
        .ok_or_else(|| BoardError::ProtocolViolation("Packet without SOP".to_string()))?;

    let mut payload = Vec::new();
    let mut escaped = false;
    let mut channel = false;
    let mut ending = false;
    for byte in &packet[start + 1..] {
        match (*byte, escaped) {
            (ESCAPE, false) => escaped = true,
            (CHANNEL, false) => channel = true,
            (EOP, false) => ending = true,
            (SOP, false) => payload.clear(),
            (b, _) => {
                let b = if escaped { b ^ XOR_PATTERN } else { b };
                escaped = false;
                if channel {
                    channel = false;
                    continue;
                }
                payload.push(b);
                if ending {
                    return Ok(payload);
                }
            }
        }
    }
    Err(BoardError::ProtocolViolation(
        "Packet ended before EOP".to_string(),
    ))
}

/// Escape the bridge's reserved bytes for transmission
pub(crate) fn bridge_escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for byte in bytes {
        if *byte == CONFIG_COMMAND || *byte == BRIDGE_ESCAPE {
            out.push(BRIDGE_ESCAPE);
            out.push(byte ^ XOR_PATTERN);
        } else {
            out.push(*byte);
        }
    }
    out
}

fn transaction_header(opcode: u8, size: usize, address: u32) -> Vec<u8> {
    let mut header = vec![opcode, 0x00];
    header.extend_from_slice(&(size as u16).to_be_bytes());
    header.extend_from_slice(&address.to_be_bytes());
    header
}

/// [`BusIo`] over a serial Avalon-MM bridge
pub struct AvalonBridge {
    receiver: ByteStreamReceiver,
    timeout: Duration,
}

impl AvalonBridge {
    pub fn new(receiver: ByteStreamReceiver) -> Self {
        AvalonBridge {
            receiver,
            timeout: Duration::from_millis(AVALON_TIMEOUT_MS),
        }
    }

    /// Query the bridge configuration byte and require user mode
    pub fn negotiate(&mut self) -> BoardResult<u8> {
        self.receiver.discard();
        self.receiver.send(&[CONFIG_COMMAND, CONFIG_QUERY])?;
        let reply = self
            .receiver
            .recv(Trigger::Length(1), Some(self.timeout))
            .map_err(|e| match e {
                BoardError::Timeout(_) => {
                    BoardError::NotResponding("No reply to bridge config query".to_string())
                }
                other => other,
            })?;

        let config = reply[0];
        debug!("Bridge config {:#04x}", config);
        if config & CONFIG_USER_MODE == 0 {
            return Err(BoardError::NotResponding(
                "FPGA is not running user logic".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn receiver_mut(&mut self) -> &mut ByteStreamReceiver {
        &mut self.receiver
    }

    fn exchange(&mut self, transaction: &[u8]) -> BoardResult<Vec<u8>> {
        let packet = bridge_escape(&encode_packet(transaction));
        trace!("Bus transaction {:02x?}", &transaction[..transaction.len().min(8)]);
        let pending = self.receiver.receive(Trigger::Token(vec![EOP]), Some(self.timeout));
        self.receiver.send(&packet)?;

        let mut raw = pending.wait()?;
        let last = self.receiver.recv(Trigger::Length(1), Some(self.timeout))?;
        raw.extend_from_slice(&last);
        if last[0] == ESCAPE {
            raw.extend(self.receiver.recv(Trigger::Length(1), Some(self.timeout))?);
        }
        decode_packet(&raw)
    }
}

impl BusIo for AvalonBridge {
    fn read_memory(&mut self, address: u32, length: usize) -> BoardResult<Vec<u8>> {
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let size = (length - data.len()).min(AVALON_TRANSACTION_SIZE);
            let at = address + data.len() as u32;
            let reply = self.exchange(&transaction_header(OP_READ_INCREMENTING, size, at))?;
            if reply.len() != size {
                return Err(BoardError::Integrity(format!(
                    "Read of {} bytes at {:#010x} returned {}",
                    size,
                    at,
                    reply.len()
                )));
            }
            data.extend(reply);
        }
        Ok(data)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> BoardResult<()> {
        for (index, chunk) in data.chunks(AVALON_TRANSACTION_SIZE).enumerate() {
            let at = address + (index * AVALON_TRANSACTION_SIZE) as u32;
            let mut transaction = transaction_header(OP_WRITE_INCREMENTING, chunk.len(), at);
            transaction.extend_from_slice(chunk);

            let reply = self.exchange(&transaction)?;
            let expected_size = (chunk.len() as u16).to_be_bytes();
            if reply.len() != 4
                || reply[0] != OP_WRITE_INCREMENTING | RESPONSE_FLAG
                || reply[2..4] != expected_size
            {
                return Err(BoardError::ProtocolViolation(format!(
                    "Unexpected write response {:02x?} at {:#010x}",
                    reply, at
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::interface::mock::MockDevice;

    fn bridge_unescape(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut escaped = false;
        for byte in bytes {
            if escaped {
                out.push(byte ^ XOR_PATTERN);
                escaped = false;
            } else if *byte == BRIDGE_ESCAPE {
                escaped = true;
            } else {
                out.push(*byte);
            }
        }
        out
    }

    /// A bridge backed by a sparse memory map
    fn memory_device() -> MockDevice {
        let mut memory: HashMap<u32, u8> = HashMap::new();
        MockDevice::new(move |sent| {
            if sent == [CONFIG_COMMAND, CONFIG_QUERY] {
                return vec![CONFIG_USER_MODE];
            }
            let transaction = decode_packet(&bridge_unescape(sent)).unwrap();
            let size = u16::from_be_bytes([transaction[2], transaction[3]]) as usize;
            let address = u32::from_be_bytes(transaction[4..8].try_into().unwrap());
            let reply = match transaction[0] {
                OP_WRITE_INCREMENTING => {
                    for (i, b) in transaction[8..].iter().enumerate() {
                        memory.insert(address + i as u32, *b);
                    }
                    let mut r = vec![OP_WRITE_INCREMENTING | RESPONSE_FLAG, 0];
                    r.extend_from_slice(&(size as u16).to_be_bytes());
                    r
                }
                _ => (0..size as u32)
                    .map(|i| memory.get(&(address + i)).copied().unwrap_or(0))
                    .collect(),
            };
            encode_packet(&reply)
        })
    }

    #[test]
    fn packet_escapes_control_bytes() {
        let packet = encode_packet(&[0x01, 0x7a, 0x7d]);
        assert_eq!(
            packet,
            [SOP, CHANNEL, 0x00, 0x01, ESCAPE, 0x5a, EOP, ESCAPE, 0x5d]
        );
        assert_eq!(decode_packet(&packet).unwrap(), [0x01, 0x7a, 0x7d]);
    }

    #[test]
    fn bridge_escape_covers_config_bytes() {
        assert_eq!(bridge_escape(&[0x3a, 0x00, 0x3d]), [0x3d, 0x1a, 0x00, 0x3d, 0x1d]);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(decode_packet(&[SOP, CHANNEL, 0x00, 0x01]).is_err());
    }

    #[test]
    fn memory_round_trip_through_bridge() {
        let receiver = ByteStreamReceiver::new(Box::new(memory_device())).unwrap();
        let mut bridge = AvalonBridge::new(receiver);
        assert_eq!(bridge.negotiate().unwrap(), CONFIG_USER_MODE);

        let data: Vec<u8> = (0..=255u8).cycle().take(2500).collect();
        bridge.write_memory(0x0400_0000, &data).unwrap();
        assert_eq!(bridge.read_memory(0x0400_0000, data.len()).unwrap(), data);

        bridge.iowr(0x1000_0000, 2, 0x1234_5678).unwrap();
        assert_eq!(bridge.iord(0x1000_0000, 2).unwrap(), 0x1234_5678);
    }
}
