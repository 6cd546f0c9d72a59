pub mod ascii_hex;
pub mod peridot;
pub mod raw_repl;
pub mod rpc;
pub mod sector_diff;
pub mod serial;

use std::path::Path;

use crate::boards::BoardClass;
use crate::error::{BoardError, BoardResult};
use crate::events::EventEmitter;

/// Snapshot of what a connected board reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardInformation {
    pub path: String,
    pub serial_number: Option<String>,
    pub repository_uuid: Option<String>,
    pub release: Option<String>,
    pub variation: Option<String>,
    pub firmware_id: Option<String>,
}

/// Firmware write progress, reported per stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareProgress {
    pub stage: String,
    pub done: u64,
    pub total: u64,
}

/// Operations every board offers to a session.
///
/// A board is created per session and is not shared; operations on one board
/// run strictly one after another.
pub trait Board: Send {
    fn class(&self) -> BoardClass;

    fn events(&self) -> &EventEmitter;

    fn connect(&mut self, path: &str) -> BoardResult<()>;

    fn disconnect(&mut self) -> BoardResult<()>;

    fn is_connected(&self) -> bool;

    /// Identification of the connected board, cached until disconnect
    fn get_info(&mut self) -> BoardResult<BoardInformation>;

    fn write_file(&mut self, path: &str, data: &[u8]) -> BoardResult<()>;

    fn read_file(&mut self, path: &str) -> BoardResult<Vec<u8>>;

    /// Names of the files below `dir` (relative to it); an empty `dir` lists the root
    fn enumerate_files(&mut self, dir: &str) -> BoardResult<Vec<String>>;

    fn remove_file(&mut self, _path: &str) -> BoardResult<()> {
        Err(BoardError::Unsupported(self.class().name()))
    }

    fn run_program(&mut self, path: &str) -> BoardResult<()>;

    fn stop_program(&mut self) -> BoardResult<()>;

    fn is_running(&mut self) -> BoardResult<bool>;

    fn write_firmware(
        &mut self,
        _path: &Path,
        _progress: &mut dyn FnMut(FirmwareProgress),
    ) -> BoardResult<()> {
        Err(BoardError::Unsupported(self.class().name()))
    }
}
