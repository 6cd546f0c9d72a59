use std::collections::BTreeMap;

use clap::ValueEnum;
use tracing::debug;

use crate::error::{BoardError, BoardResult};
use crate::protocols::Board;
use crate::protocols::ascii_hex::AsciiHexBoard;
use crate::protocols::peridot::PeridotBoard;
use crate::protocols::raw_repl::Pyboard;

/// Board families known to boardlink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum BoardClass {
    /// MicroPython pyboard, driven through the raw REPL
    Pyboard,

    /// Wakayama.rb mruby board, ASCII hex console
    WakayamaRb,

    /// GR-CITRUS, same console as Wakayama.rb
    GrCitrus,

    /// PERIDOT Piccolo FPGA board, file RPC over the Avalon-MM bridge
    PeridotPiccolo,
}

impl BoardClass {
    pub const ALL: [BoardClass; 4] = [
        BoardClass::Pyboard,
        BoardClass::WakayamaRb,
        BoardClass::GrCitrus,
        BoardClass::PeridotPiccolo,
    ];

    /// Human readable name
    pub fn name(&self) -> &'static str {
        match self {
            BoardClass::Pyboard => "Pyboard",
            BoardClass::WakayamaRb => "Wakayama.rb",
            BoardClass::GrCitrus => "GR-CITRUS",
            BoardClass::PeridotPiccolo => "PERIDOT Piccolo",
        }
    }

    /// Name the class is registered under
    pub fn key(&self) -> &'static str {
        match self {
            BoardClass::Pyboard => "pyboard",
            BoardClass::WakayamaRb => "wakayama-rb",
            BoardClass::GrCitrus => "gr-citrus",
            BoardClass::PeridotPiccolo => "peridot-piccolo",
        }
    }

    /// USB vendor/product pairs known to work with this class
    pub fn usb_ids(&self) -> &'static [(u16, u16)] {
        match self {
            BoardClass::Pyboard => &[(0xf055, 0x9800), (0xf055, 0x9801), (0xf055, 0x9802)],
            BoardClass::WakayamaRb => &[(0x2129, 0x0531)],
            BoardClass::GrCitrus => &[(0x2a50, 0x0277)],
            BoardClass::PeridotPiccolo => &[(0x0403, 0x6015)],
        }
    }

    pub fn supports(&self, vendor_id: Option<u16>, product_id: Option<u16>) -> bool {
        match (vendor_id, product_id) {
            (Some(vid), Some(pid)) => self.usb_ids().contains(&(vid, pid)),
            _ => false,
        }
    }

    pub fn create(&self) -> Box<dyn Board> {
        match self {
            BoardClass::Pyboard => Box::new(Pyboard::new()),
            BoardClass::WakayamaRb | BoardClass::GrCitrus => Box::new(AsciiHexBoard::new(*self)),
            BoardClass::PeridotPiccolo => Box::new(PeridotBoard::new()),
        }
    }
}

/// A serial port as reported by the operating system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

/// A port that may host a board of a given class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardCandidate {
    pub board_class: BoardClass,
    pub name: String,
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    /// The port's USB ids are not on the class allow-list
    pub unsupported: bool,
}

pub fn available_ports() -> BoardResult<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        BoardError::ConfigurationError(format!("Could not get available ports. Err {:?}", e))
    })?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortInfo {
                path: port.port_name,
                vendor_id: Some(usb.vid),
                product_id: Some(usb.pid),
                serial_number: usb.serial_number,
            },
            _ => PortInfo {
                path: port.port_name,
                ..Default::default()
            },
        })
        .collect())
}

/// Board classes resolvable by name
#[derive(Debug, Clone, Default)]
pub struct BoardRegistry {
    classes: BTreeMap<String, BoardClass>,
}

impl BoardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in class under its key
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for class in BoardClass::ALL {
            registry.register(class.key(), class);
        }
        registry
    }

    pub fn register(&mut self, name: &str, class: BoardClass) {
        debug!("Registering {} as {}", class.name(), name);
        self.classes.insert(name.to_owned(), class);
    }

    pub fn lookup(&self, name: &str) -> BoardResult<BoardClass> {
        self.classes.get(name).copied().ok_or_else(|| {
            BoardError::ConfigurationError(format!(
                "Unknown board class {}; known classes are {}",
                name,
                self.class_names().join(", ")
            ))
        })
    }

    pub fn create(&self, name: &str) -> BoardResult<Box<dyn Board>> {
        Ok(self.lookup(name)?.create())
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.keys().map(String::as_str).collect()
    }

    /// One candidate per registered class and port. Ports with unknown USB ids
    /// stay in the list, marked `unsupported`.
    pub fn enumerate(&self, ports: &[PortInfo]) -> Vec<BoardCandidate> {
        let mut classes: Vec<BoardClass> = self.classes.values().copied().collect();
        classes.sort();
        classes.dedup();

        classes
            .iter()
            .flat_map(|class| {
                ports.iter().map(move |port| BoardCandidate {
                    board_class: *class,
                    name: class.name().to_owned(),
                    path: port.path.clone(),
                    vendor_id: port.vendor_id,
                    product_id: port.product_id,
                    unsupported: !class.supports(port.vendor_id, port.product_id),
                })
            })
            .collect()
    }
}
