use std::path::Path;

use indicatif::ProgressBar;
use tracing::{info, warn};

pub use boards::{BoardClass, BoardRegistry};
use boards::available_ports;
use error::{BoardError, BoardResult};
pub use protocols::{Board, BoardInformation, FirmwareProgress};

pub mod boards;
pub mod constants;
pub mod error;
pub mod events;
pub mod firmware;
pub mod interface;
pub mod protocols;
pub(crate) mod util;

/// Find the first port whose USB ids are on `class`'s allow-list
pub fn find_port(class: BoardClass) -> BoardResult<String> {
    let mut registry = BoardRegistry::new();
    registry.register(class.key(), class);
    registry
        .enumerate(&available_ports()?)
        .into_iter()
        .find(|candidate| !candidate.unsupported)
        .map(|candidate| candidate.path)
        .ok_or_else(|| {
            BoardError::ConfigurationError(format!(
                "Looked at all available serial ports; none matches {} USB ids {:04x?}. \
                 Try specifying a serial port?",
                class.name(),
                class.usb_ids()
            ))
        })
}

/// A connected board, disconnected when dropped
pub struct Session {
    board: Box<dyn Board>,
    progress_bar_enable: bool,
}

impl Session {
    /// Resolve `class_name`, pick a port if none is given, and connect
    pub fn open(registry: &BoardRegistry, class_name: &str, port: Option<&str>) -> BoardResult<Self> {
        let class = registry.lookup(class_name)?;
        let path = match port {
            Some(port) => port.to_owned(),
            None => find_port(class)?,
        };
        let mut board = class.create();
        board.connect(&path)?;
        info!("Session open: {} on {}", class.name(), path);
        Ok(Self::from_board(board))
    }

    /// Wrap a board that is already connected
    pub fn from_board(board: Box<dyn Board>) -> Self {
        Session {
            board,
            progress_bar_enable: false,
        }
    }

    pub fn progress_bar(&mut self, enable: bool) {
        self.progress_bar_enable = enable;
    }

    pub fn board(&mut self) -> &mut dyn Board {
        self.board.as_mut()
    }

    /// Write a firmware bundle, showing one progress bar per stage when enabled
    pub fn write_firmware(&mut self, path: &Path) -> BoardResult<()> {
        let show = self.progress_bar_enable;
        let mut current: Option<(String, ProgressBar)> = None;

        let result = self.board.write_firmware(path, &mut |progress| {
            if !show {
                return;
            }
            let stale = current
                .as_ref()
                .is_none_or(|(stage, _)| *stage != progress.stage);
            if stale {
                if let Some((_, bar)) = current.take() {
                    bar.finish();
                }
                let bar = util::create_progress_bar(progress.total, &progress.stage);
                current = Some((progress.stage.clone(), bar));
            }
            if let Some((_, bar)) = &current {
                bar.set_length(progress.total);
                bar.set_position(progress.done);
            }
        });

        if let Some((_, bar)) = current {
            match result {
                Ok(()) => bar.finish_with_message("done"),
                Err(_) => bar.abandon(),
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.board.disconnect() {
            warn!("Ignoring disconnect failure: {}", e);
        }
    }
}
