use tracing::{info, warn};

use crate::boards::BoardClass;
use crate::error::{BoardError, BoardResult};
use crate::interface::DeviceInterface;
use crate::interface::receiver::ByteStreamReceiver;
use crate::interface::serialport::SerialPortDevice;

/// Transport half shared by the boards that talk over a plain serial stream
pub struct SerialLink {
    class: BoardClass,
    baud: u32,
    path: Option<String>,
    receiver: Option<ByteStreamReceiver>,
}

impl SerialLink {
    pub fn new(class: BoardClass, baud: u32) -> Self {
        SerialLink {
            class,
            baud,
            path: None,
            receiver: None,
        }
    }

    /// Open the serial port at `path` at the board's fixed baud rate
    pub fn open(&mut self, path: &str) -> BoardResult<()> {
        let device = SerialPortDevice::new(path, self.baud)?;
        self.attach(Box::new(device), path)
    }

    /// Use an already opened device, e.g. a mock or a bridged port
    pub fn attach(&mut self, device: Box<dyn DeviceInterface>, path: &str) -> BoardResult<()> {
        if self.receiver.is_some() {
            return Err(BoardError::Busy(format!(
                "{} is already connected",
                self.class.name()
            )));
        }
        self.receiver = Some(ByteStreamReceiver::new(device)?);
        self.path = Some(path.to_owned());
        info!("{} connected on {}", self.class.name(), path);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            if let Err(e) = receiver.flush() {
                warn!("Ignoring flush failure on close: {}", e);
            }
            receiver.close();
        }
        if let Some(path) = self.path.take() {
            info!("{} disconnected from {}", self.class.name(), path);
        }
    }

    pub fn is_open(&self) -> bool {
        self.receiver.is_some()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn receiver(&mut self) -> BoardResult<&mut ByteStreamReceiver> {
        self.receiver.as_mut().ok_or(BoardError::NotConnected)
    }
}
