//! PERIDOT boards: an FPGA whose Nios II soft-core exposes a small virtual
//! filesystem through the software-interrupt mailbox. Host access goes over
//! the Avalon-MM bridge on the USB serial port.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::rpc::{
    O_NONBLOCK, O_RDONLY, RemoteFileReader, RemoteFileWriter, RemoteFs, RpcMailbox, SharedFs,
    lock_fs,
};
use super::sector_diff::SectorDiffUpdater;
use super::{Board, BoardInformation, FirmwareProgress};
use crate::boards::BoardClass;
use crate::constants::{
    FLASH_READY_DEADLINE_MS, FLASH_READY_RETRY_MS, PERIDOT_BOOT_BAUD_RATE, PERIDOT_FLASH_FILE,
    PERIDOT_INFO_FILE, PERIDOT_RUN_FILE, PERIDOT_RUN_POLL_MS, PERIDOT_STDIN, PERIDOT_STDOUT,
    PERIDOT_USER_BAUD_RATE, RPC_TIMEOUT_MS, SWI_BASE_ADDRESS, SWI_REG_CPU_RESET, SWI_REG_ENTRY,
};
use crate::error::{BoardError, BoardResult};
use crate::events::{BoardEvent, EventEmitter};
use crate::firmware::FirmwareBundle;
use crate::firmware::elf::ElfImage;
use crate::interface::BusIo;
use crate::interface::avalon::AvalonBridge;
use crate::interface::receiver::ByteStreamReceiver;
use crate::interface::serialport::SerialPortDevice;

#[derive(Debug, Clone)]
pub struct PeridotParams {
    pub boot_baud: u32,
    pub user_baud: u32,
    pub swi_base: u32,
    pub rpc_timeout: Duration,
    pub run_poll: Duration,
    pub flash_ready_deadline: Duration,
    pub flash_ready_retry: Duration,
}

impl Default for PeridotParams {
    fn default() -> Self {
        PeridotParams {
            boot_baud: PERIDOT_BOOT_BAUD_RATE,
            user_baud: PERIDOT_USER_BAUD_RATE,
            swi_base: SWI_BASE_ADDRESS,
            rpc_timeout: Duration::from_millis(RPC_TIMEOUT_MS),
            run_poll: Duration::from_millis(PERIDOT_RUN_POLL_MS),
            flash_ready_deadline: Duration::from_millis(FLASH_READY_DEADLINE_MS),
            flash_ready_retry: Duration::from_millis(FLASH_READY_RETRY_MS),
        }
    }
}

/// Decode the `key=value` lines of `/sys/info`
pub(crate) fn parse_info(path: &str, text: &str) -> BoardInformation {
    let mut info = BoardInformation {
        path: path.to_owned(),
        ..Default::default()
    };
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = Some(value.trim().to_owned());
        match key.trim() {
            "serial" => info.serial_number = value,
            "uuid" => info.repository_uuid = value,
            "release" => info.release = value,
            "variation" => info.variation = value,
            "firmware" => info.firmware_id = value,
            other => debug!("Ignoring info key {}", other),
        }
    }
    info
}

/// Hold the soft-core in reset, copy `image` into memory and start it at its entry point
pub fn load_program(
    bus: &mut dyn BusIo,
    swi_base: u32,
    image: &ElfImage,
    progress: &mut dyn FnMut(FirmwareProgress),
) -> BoardResult<()> {
    let total: u64 = image.segments.iter().map(|s| s.data.len() as u64).sum();
    let mut done = 0u64;

    bus.iowr(swi_base, SWI_REG_CPU_RESET, 1)?;
    for segment in &image.segments {
        debug!(
            "Loading {} bytes at {:#010x}",
            segment.data.len(),
            segment.address
        );
        bus.write_memory(segment.address, &segment.data)?;
        done += segment.data.len() as u64;
        progress(FirmwareProgress {
            stage: "load".to_string(),
            done,
            total,
        });
    }
    bus.iowr(swi_base, SWI_REG_ENTRY, image.entry)?;
    bus.iowr(swi_base, SWI_REG_CPU_RESET, 0)?;
    info!("Started program at {:#010x}", image.entry);
    Ok(())
}

/// Watch `/sys/mruby/run` until the program ends, then emit `Stop` once
fn spawn_run_monitor(
    fs: SharedFs,
    running: Arc<AtomicBool>,
    events: EventEmitter,
    poll: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Acquire) {
            thread::sleep(poll);
            if !running.load(Ordering::Acquire) {
                break;
            }
            let ended = match lock_fs(&fs).read_file(PERIDOT_RUN_FILE) {
                Ok(content) => content.first().is_none_or(|b| *b == 0),
                Err(e) => {
                    warn!("Run monitor giving up: {}", e);
                    true
                }
            };
            if ended {
                if running.swap(false, Ordering::AcqRel) {
                    events.emit(BoardEvent::Stop);
                }
                break;
            }
        }
        debug!("Run monitor finished");
    })
}

pub struct PeridotBoard {
    params: PeridotParams,
    events: EventEmitter,
    path: Option<String>,
    fs: Option<SharedFs>,
    info: Option<BoardInformation>,
    running: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl PeridotBoard {
    pub fn new() -> Self {
        Self::with_params(PeridotParams::default())
    }

    pub fn with_params(params: PeridotParams) -> Self {
        PeridotBoard {
            params,
            events: EventEmitter::default(),
            path: None,
            fs: None,
            info: None,
            running: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    /// Use an already negotiated bus, e.g. a simulated soft-core
    pub fn attach_bus(&mut self, bus: Box<dyn BusIo>, path: &str) -> BoardResult<()> {
        if self.fs.is_some() {
            return Err(BoardError::Busy(format!(
                "{} is already connected",
                BoardClass::PeridotPiccolo.name()
            )));
        }
        let mailbox = RpcMailbox::new(bus, self.params.swi_base);
        let fs = RemoteFs::new(mailbox).with_timeout(self.params.rpc_timeout);
        self.fs = Some(Arc::new(Mutex::new(fs)));
        self.path = Some(path.to_owned());
        info!("PERIDOT connected on {}", path);
        self.events.emit(BoardEvent::Connected);
        Ok(())
    }

    fn fs(&self) -> BoardResult<SharedFs> {
        self.fs.clone().ok_or(BoardError::NotConnected)
    }

    /// Writer feeding the running program's standard input
    pub fn stdin(&self) -> BoardResult<RemoteFileWriter> {
        RemoteFileWriter::open(self.fs()?, PERIDOT_STDIN, 0)
    }

    /// Reader draining the running program's standard output
    pub fn stdout(&self) -> BoardResult<RemoteFileReader> {
        RemoteFileReader::open(self.fs()?, PERIDOT_STDOUT, O_NONBLOCK)
    }

    fn join_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                warn!("Run monitor panicked");
            }
        }
    }

    /// Retry opening the flash device until the flash writer answers
    fn wait_flash_ready(&self, fs: &mut RemoteFs) -> BoardResult<()> {
        let deadline = Instant::now() + self.params.flash_ready_deadline;
        loop {
            match fs.open(PERIDOT_FLASH_FILE, O_RDONLY) {
                Ok(file) => {
                    fs.close(file)?;
                    debug!("Flash writer ready");
                    return Ok(());
                }
                Err(e) if Instant::now() >= deadline => {
                    return Err(BoardError::NotResponding(format!(
                        "Flash writer did not come up: {}",
                        e
                    )));
                }
                Err(e) => {
                    debug!("Flash not ready yet: {}", e);
                    thread::sleep(self.params.flash_ready_retry);
                }
            }
        }
    }
}

impl Default for PeridotBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for PeridotBoard {
    fn class(&self) -> BoardClass {
        BoardClass::PeridotPiccolo
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn connect(&mut self, path: &str) -> BoardResult<()> {
        let device = SerialPortDevice::new(path, self.params.boot_baud)?;
        let mut bridge = AvalonBridge::new(ByteStreamReceiver::new(Box::new(device))?);
        bridge.negotiate()?;
        bridge
            .receiver_mut()
            .device_mut()
            .set_baud_rate(self.params.user_baud)?;
        self.attach_bus(Box::new(bridge), path)
    }

    fn disconnect(&mut self) -> BoardResult<()> {
        if self.running.swap(false, Ordering::AcqRel) {
            self.events.emit(BoardEvent::Stop);
        }
        self.join_monitor();
        self.info = None;
        if self.fs.take().is_some() {
            if let Some(path) = self.path.take() {
                info!("PERIDOT disconnected from {}", path);
            }
            self.events.emit(BoardEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.fs.is_some()
    }

    fn get_info(&mut self) -> BoardResult<BoardInformation> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let raw = lock_fs(&self.fs()?).read_file(PERIDOT_INFO_FILE)?;
        let info = parse_info(
            self.path.as_deref().unwrap_or_default(),
            &String::from_utf8_lossy(&raw),
        );
        info!("PERIDOT info {:?}", info);
        self.info = Some(info.clone());
        Ok(info)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> BoardResult<()> {
        lock_fs(&self.fs()?).write_file(path, data)
    }

    fn read_file(&mut self, path: &str) -> BoardResult<Vec<u8>> {
        lock_fs(&self.fs()?).read_file(path)
    }

    fn enumerate_files(&mut self, dir: &str) -> BoardResult<Vec<String>> {
        let dir = if dir.is_empty() { "/" } else { dir };
        lock_fs(&self.fs()?).list(dir)
    }

    fn run_program(&mut self, path: &str) -> BoardResult<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(BoardError::Busy("a program is already running".to_string()));
        }
        let fs = self.fs()?;
        self.join_monitor();
        lock_fs(&fs).write_file(PERIDOT_RUN_FILE, path.as_bytes())?;

        self.running.store(true, Ordering::Release);
        info!("Running {}", path);
        self.events.emit(BoardEvent::Start);
        self.monitor = Some(spawn_run_monitor(
            fs,
            Arc::clone(&self.running),
            self.events.clone(),
            self.params.run_poll,
        ));
        Ok(())
    }

    fn stop_program(&mut self) -> BoardResult<()> {
        let fs = self.fs()?;
        lock_fs(&fs).write_file(PERIDOT_RUN_FILE, b"\0")?;
        if self.running.swap(false, Ordering::AcqRel) {
            self.events.emit(BoardEvent::Stop);
        }
        self.join_monitor();
        Ok(())
    }

    fn is_running(&mut self) -> BoardResult<bool> {
        Ok(self.running.load(Ordering::Acquire))
    }

    fn write_firmware(
        &mut self,
        path: &Path,
        progress: &mut dyn FnMut(FirmwareProgress),
    ) -> BoardResult<()> {
        let bundle = FirmwareBundle::load(path)?;
        let fs = self.fs()?;
        if self.running.load(Ordering::Acquire) {
            self.stop_program()?;
        }

        let mut fs = lock_fs(&fs);
        load_program(
            fs.mailbox_mut().bus_mut(),
            self.params.swi_base,
            &bundle.writer,
            progress,
        )?;
        self.wait_flash_ready(&mut fs)?;

        for (region, image) in [("ufm", &bundle.ufm), ("cfm0", &bundle.cfm0)] {
            let summary = SectorDiffUpdater::new(fs.mailbox_mut()).update(region, image, progress)?;
            info!(
                "Region {}: {} sectors, {} bytes written",
                region, summary.sectors_written, summary.bytes_written
            );
        }
        self.info = None;
        Ok(())
    }
}

impl Drop for PeridotBoard {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("Ignoring disconnect failure: {}", e);
        }
    }
}
