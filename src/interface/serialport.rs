use tracing::{debug, trace};

use super::DeviceInterface;
use crate::constants::{RESET_DTR_RTS_LOW_MS, SERIAL_TIMEOUT_MS};

use crate::error::{BoardError, BoardResult};
use std::io::{Read, Write};

pub type BaudRate = u32;

/// Serial port device interface layer
pub struct SerialPortDevice {
    pub serial_port: Box<dyn serialport::SerialPort>,
}

impl SerialPortDevice {
    pub fn new(port: &str, baud: BaudRate) -> BoardResult<SerialPortDevice> {
        debug!("Opening {} at {} baud", port, baud);
        let serial_port = serialport::new(port, baud)
            .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .map_err(|e| BoardError::Communication(format!("Failed to open {}: {}", port, e)))?;

        Ok(SerialPortDevice { serial_port })
    }
}

impl DeviceInterface for SerialPortDevice {
    fn send(&mut self, data: &[u8]) -> BoardResult<()> {
        self.serial_port
            .write_all(data)
            .map_err(|e| BoardError::Communication(format!("{:?}", e)))?;
        trace!("Sent bytes {:?}", data);
        Ok(())
    }

    fn reader(&mut self) -> BoardResult<Box<dyn Read + Send>> {
        let clone = self
            .serial_port
            .try_clone()
            .map_err(|e| BoardError::Communication(format!("Failed to clone port: {}", e)))?;
        Ok(Box::new(clone))
    }

    fn flush_buffers(&mut self) -> BoardResult<()> {
        self.serial_port.flush().map_err(|e| {
            BoardError::Communication(format!("Failed to flush send/receive buffers, {}", e))
        })?;
        self.serial_port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| BoardError::Communication(format!("Failed to clear input, {}", e)))?;

        Ok(())
    }

    fn reset(&mut self) -> BoardResult<()> {
        self.serial_port
            .write_request_to_send(false)
            .map_err(|e| BoardError::Communication(format!("Failed to set RTS false: {:?}", e)))?;
        self.serial_port
            .write_data_terminal_ready(false)
            .map_err(|e| BoardError::Communication(format!("Failed to set DTR false: {:?}", e)))?;

        std::thread::sleep(std::time::Duration::from_millis(RESET_DTR_RTS_LOW_MS));

        self.serial_port
            .write_request_to_send(true)
            .map_err(|e| BoardError::Communication(format!("Failed to set RTS true: {:?}", e)))?;
        self.serial_port
            .write_data_terminal_ready(true)
            .map_err(|e| BoardError::Communication(format!("Failed to set DTR true: {:?}", e)))?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> BoardResult<()> {
        debug!("Switching to {} baud", baud);
        self.serial_port
            .set_baud_rate(baud)
            .map_err(|e| BoardError::Communication(format!("Failed to set baud rate: {}", e)))
    }
}
