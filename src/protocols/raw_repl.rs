//! MicroPython raw REPL protocol, used by the Pyboard family.
//!
//! Commands are sent after the `>` prompt, terminated by Ctrl-D and answered
//! with `OK`, the command's stdout, `\x04`, its stderr and another `\x04`.
//! File transfers are built from short Python snippets so that no single wire
//! message grows beyond the target's input buffer.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::serial::SerialLink;
use super::{Board, BoardInformation};
use crate::boards::BoardClass;
use crate::constants::{
    CTRL_A, CTRL_B, CTRL_C, CTRL_D, DEFAULT_BAUD_RATE, RAW_REPL_CHUNK_DELAY_MS,
    RAW_REPL_COMMAND_CHUNK, RAW_REPL_FILE_CHUNK, RAW_REPL_INTERRUPT_DELAY_MS, RAW_REPL_PROMPT,
    RAW_REPL_STOP_DRAIN_MS, RAW_REPL_TIMEOUT_MS, RUNNING_POLL_MS, SOFT_REBOOT_BANNER,
};
use crate::error::{BoardError, BoardResult, FileErrorKind};
use crate::events::{BoardEvent, EventEmitter};
use crate::interface::DeviceInterface;
use crate::interface::receiver::{ByteStreamReceiver, Trigger};
use crate::util::{decode_hex, encode_hex};

const NOT_FOUND_SIGNATURE: &str = "OSError: [Errno 2]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawReplState {
    Normal,
    EnteringRaw,
    InRaw,
    LeavingRaw,
}

#[derive(Debug, Clone)]
pub struct PyboardParams {
    pub baud: u32,
    /// Largest piece of a command sent in one write
    pub command_chunk_size: usize,
    /// File bytes carried by one write/read command
    pub file_chunk_size: usize,
    pub chunk_delay: Duration,
    pub interrupt_delay: Duration,
    pub timeout: Duration,
}

impl Default for PyboardParams {
    fn default() -> Self {
        PyboardParams {
            baud: DEFAULT_BAUD_RATE,
            command_chunk_size: RAW_REPL_COMMAND_CHUNK,
            file_chunk_size: RAW_REPL_FILE_CHUNK,
            chunk_delay: Duration::from_millis(RAW_REPL_CHUNK_DELAY_MS),
            interrupt_delay: Duration::from_millis(RAW_REPL_INTERRUPT_DELAY_MS),
            timeout: Duration::from_millis(RAW_REPL_TIMEOUT_MS),
        }
    }
}

/// Captured output of one raw REPL command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Classify a failed command touching `path`
    pub fn check(&self, path: &str) -> BoardResult<()> {
        if self.stderr.is_empty() {
            Ok(())
        } else if self.stderr.contains(NOT_FOUND_SIGNATURE) {
            Err(BoardError::file(path, FileErrorKind::NotFound, &self.stderr))
        } else {
            Err(BoardError::file(path, FileErrorKind::Unknown, &self.stderr))
        }
    }
}

/// Raw REPL state machine over a receiver it does not own
pub struct RawRepl {
    state: RawReplState,
    params: PyboardParams,
}

impl RawRepl {
    pub fn new(params: PyboardParams) -> Self {
        RawRepl {
            state: RawReplState::Normal,
            params,
        }
    }

    pub fn state(&self) -> RawReplState {
        self.state
    }

    /// Enter raw mode. Fails fast if a session is already active.
    pub fn enter(&mut self, rx: &mut ByteStreamReceiver) -> BoardResult<()> {
        if self.state != RawReplState::Normal {
            return Err(BoardError::Busy(format!(
                "raw REPL session already active ({:?})",
                self.state
            )));
        }

        self.state = RawReplState::EnteringRaw;
        let result = self.enter_sequence(rx);
        self.state = match result {
            Ok(()) => RawReplState::InRaw,
            Err(_) => RawReplState::Normal,
        };
        result
    }

    fn enter_sequence(&self, rx: &mut ByteStreamReceiver) -> BoardResult<()> {
        let timeout = Some(self.params.timeout);

        rx.send(&[CTRL_C, CTRL_C])?;
        thread::sleep(self.params.interrupt_delay);
        rx.discard();

        rx.send(&[CTRL_A])?;
        rx.recv_text(RAW_REPL_PROMPT, timeout)
            .map_err(|e| not_responding(e, "no raw REPL prompt"))?;

        rx.send(&[CTRL_D])?;
        rx.recv_text(SOFT_REBOOT_BANNER, timeout)
            .map_err(|e| not_responding(e, "no soft reboot banner"))?;

        // Swallow anything the reboot printed before the prompt comes back
        rx.send(&[CTRL_C])?;
        thread::sleep(self.params.interrupt_delay);
        rx.send(&[CTRL_C])?;
        thread::sleep(self.params.interrupt_delay);

        rx.recv_text(RAW_REPL_PROMPT, timeout)
            .map_err(|e| not_responding(e, "no raw REPL prompt after reboot"))?;

        debug!("Entered raw REPL");
        Ok(())
    }

    /// Leave raw mode. Ctrl-B is not acknowledged, so nothing is awaited.
    pub fn leave(&mut self, rx: &mut ByteStreamReceiver) -> BoardResult<()> {
        if self.state != RawReplState::InRaw {
            return Ok(());
        }
        self.state = RawReplState::LeavingRaw;
        let result = rx.send(&[CTRL_B]);
        self.state = RawReplState::Normal;
        debug!("Left raw REPL");
        result
    }

    /// Run `body` inside a raw REPL session, always leaving it afterwards
    pub fn session<T>(
        &mut self,
        rx: &mut ByteStreamReceiver,
        body: impl FnOnce(&mut Self, &mut ByteStreamReceiver) -> BoardResult<T>,
    ) -> BoardResult<T> {
        self.enter(rx)?;
        let result = body(self, rx);
        match self.leave(rx) {
            Err(e) if result.is_ok() => Err(e),
            Err(e) => {
                warn!("Ignoring failure to leave raw REPL: {}", e);
                result
            }
            Ok(()) => result,
        }
    }

    /// Send a command and check its `OK` acknowledgement without waiting for output
    pub fn send_command(&self, rx: &mut ByteStreamReceiver, command: &str) -> BoardResult<()> {
        if self.state != RawReplState::InRaw {
            return Err(BoardError::ProtocolViolation(
                "Command issued outside raw REPL".to_string(),
            ));
        }
        let timeout = Some(self.params.timeout);

        rx.recv_text(">", timeout)?;
        for chunk in command.as_bytes().chunks(self.params.command_chunk_size) {
            rx.send(chunk)?;
            thread::sleep(self.params.chunk_delay);
        }
        rx.send(&[CTRL_D])?;

        let ack = rx.recv(Trigger::Length(2), timeout)?;
        if ack != b"OK" {
            return Err(BoardError::ProtocolViolation(format!(
                "Expected OK, got {:?}",
                String::from_utf8_lossy(&ack)
            )));
        }
        Ok(())
    }

    /// Collect the stdout and stderr segments of the last command
    pub fn read_output(&self, rx: &mut ByteStreamReceiver) -> BoardResult<ExecOutput> {
        let timeout = Some(self.params.timeout);
        let stdout = rx.recv_text("\x04", timeout)?;
        let stderr = rx.recv_text("\x04", timeout)?;
        Ok(ExecOutput {
            stdout: strip_terminator(stdout),
            stderr: strip_terminator(stderr),
        })
    }

    pub fn exec(&self, rx: &mut ByteStreamReceiver, command: &str) -> BoardResult<ExecOutput> {
        self.send_command(rx, command)?;
        self.read_output(rx)
    }

    /// Execute and fail on any stderr output
    pub fn exec_checked(
        &self,
        rx: &mut ByteStreamReceiver,
        path: &str,
        command: &str,
    ) -> BoardResult<ExecOutput> {
        let output = self.exec(rx, command)?;
        output.check(path)?;
        Ok(output)
    }

    pub fn write_file(
        &self,
        rx: &mut ByteStreamReceiver,
        path: &str,
        data: &[u8],
    ) -> BoardResult<()> {
        self.exec_checked(
            rx,
            path,
            &format!("import ubinascii\nf=open('{}','wb')", quote(path)),
        )?;

        let written = data.chunks(self.params.file_chunk_size).try_for_each(|chunk| {
            self.exec_checked(
                rx,
                path,
                &format!("f.write(ubinascii.unhexlify('{}'))", encode_hex(chunk)),
            )
            .map(|_| ())
        });
        let closed = self.exec_checked(rx, path, "f.close()").map(|_| ());

        written.and(closed)
    }

    pub fn read_file(&self, rx: &mut ByteStreamReceiver, path: &str) -> BoardResult<Vec<u8>> {
        self.exec_checked(
            rx,
            path,
            &format!("import ubinascii\nf=open('{}','rb')", quote(path)),
        )?;

        let command = format!(
            "print(ubinascii.hexlify(f.read({})).decode())",
            self.params.file_chunk_size
        );
        let mut data = Vec::new();
        let read = loop {
            match self.exec_checked(rx, path, &command) {
                Ok(output) => {
                    let line = output.stdout.trim();
                    if line.is_empty() {
                        break Ok(());
                    }
                    match decode_hex(line) {
                        Ok(bytes) => data.extend(bytes),
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => break Err(e),
            }
        };
        let closed = self.exec_checked(rx, path, "f.close()").map(|_| ());

        read.and(closed).map(|_| data)
    }

    pub fn list_dir(&self, rx: &mut ByteStreamReceiver, dir: &str) -> BoardResult<Vec<String>> {
        let argument = if dir.is_empty() {
            String::new()
        } else {
            format!("'{}'", quote(dir))
        };
        let output = self.exec_checked(
            rx,
            dir,
            &format!("import os\nprint('\\n'.join(os.listdir({})))", argument),
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

fn strip_terminator(mut text: String) -> String {
    if text.ends_with('\x04') {
        text.pop();
    }
    text
}

fn not_responding(error: BoardError, what: &str) -> BoardError {
    match error {
        BoardError::Timeout(_) => BoardError::NotResponding(what.to_string()),
        other => other,
    }
}

/// Escape a path for use inside a single-quoted Python string
fn quote(path: &str) -> String {
    path.replace('\\', "\\\\").replace('\'', "\\'")
}

/// MicroPython pyboard over its USB serial REPL
pub struct Pyboard {
    link: SerialLink,
    repl: RawRepl,
    events: EventEmitter,
    info: Option<BoardInformation>,
    running: bool,
}

impl Pyboard {
    pub fn new() -> Self {
        Self::with_params(PyboardParams::default())
    }

    pub fn with_params(params: PyboardParams) -> Self {
        Pyboard {
            link: SerialLink::new(BoardClass::Pyboard, params.baud),
            repl: RawRepl::new(params),
            events: EventEmitter::default(),
            info: None,
            running: false,
        }
    }

    /// Connect over an already opened device
    pub fn attach(&mut self, device: Box<dyn DeviceInterface>, path: &str) -> BoardResult<()> {
        self.link.attach(device, path)?;
        self.events.emit(BoardEvent::Connected);
        Ok(())
    }

    pub fn repl_state(&self) -> RawReplState {
        self.repl.state()
    }

    fn finish_program(&mut self) -> BoardResult<()> {
        self.running = false;
        self.events.emit(BoardEvent::Stop);
        let rx = self.link.receiver()?;
        self.repl.leave(rx)
    }
}

impl Default for Pyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for Pyboard {
    fn class(&self) -> BoardClass {
        BoardClass::Pyboard
    }

    fn events(&self) -> &EventEmitter {
        &self.events
    }

    fn connect(&mut self, path: &str) -> BoardResult<()> {
        self.link.open(path)?;
        self.events.emit(BoardEvent::Connected);
        Ok(())
    }

    fn disconnect(&mut self) -> BoardResult<()> {
        if self.running {
            debug!("Leaving program running on disconnect");
            self.running = false;
        }
        if let Ok(rx) = self.link.receiver() {
            if let Err(e) = self.repl.leave(rx) {
                warn!("Ignoring failure to leave raw REPL on disconnect: {}", e);
            }
        }
        let was_open = self.link.is_open();
        self.link.close();
        self.info = None;
        if was_open {
            self.events.emit(BoardEvent::Disconnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    fn get_info(&mut self) -> BoardResult<BoardInformation> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }

        let path = self.link.path().unwrap_or_default().to_owned();
        let rx = self.link.receiver()?;
        let output = self.repl.session(rx, |repl, rx| {
            repl.exec_checked(
                rx,
                "",
                "import os,machine,ubinascii\nu=os.uname()\nprint(u.release)\nprint(u.machine)\nprint(ubinascii.hexlify(machine.unique_id()).decode())",
            )
        })?;

        let mut lines = output.stdout.lines().map(|l| l.trim().to_owned());
        let info = BoardInformation {
            path,
            release: lines.next().filter(|l| !l.is_empty()),
            variation: lines.next().filter(|l| !l.is_empty()),
            serial_number: lines.next().filter(|l| !l.is_empty()),
            ..Default::default()
        };
        info!("Pyboard info {:?}", info);
        self.info = Some(info.clone());
        Ok(info)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> BoardResult<()> {
        debug!("Writing {} bytes to {}", data.len(), path);
        let rx = self.link.receiver()?;
        self.repl
            .session(rx, |repl, rx| repl.write_file(rx, path, data))
    }

    fn read_file(&mut self, path: &str) -> BoardResult<Vec<u8>> {
        let rx = self.link.receiver()?;
        self.repl.session(rx, |repl, rx| repl.read_file(rx, path))
    }

    fn enumerate_files(&mut self, dir: &str) -> BoardResult<Vec<String>> {
        let rx = self.link.receiver()?;
        self.repl.session(rx, |repl, rx| repl.list_dir(rx, dir))
    }

    fn remove_file(&mut self, path: &str) -> BoardResult<()> {
        let rx = self.link.receiver()?;
        self.repl.session(rx, |repl, rx| {
            repl.exec_checked(rx, path, &format!("import os\nos.remove('{}')", quote(path)))
                .map(|_| ())
        })
    }

    fn run_program(&mut self, path: &str) -> BoardResult<()> {
        let rx = self.link.receiver()?;
        self.repl.enter(rx)?;
        if let Err(e) = self
            .repl
            .send_command(rx, &format!("exec(open('{}').read())", quote(path)))
        {
            if let Err(leave) = self.repl.leave(rx) {
                warn!("Ignoring failure to leave raw REPL: {}", leave);
            }
            return Err(e);
        }

        info!("Started {}", path);
        self.running = true;
        self.events.emit(BoardEvent::Start);
        Ok(())
    }

    /// Interrupt whatever the board is executing, including programs started
    /// by an earlier connection
    fn stop_program(&mut self) -> BoardResult<()> {
        let drain = Some(Duration::from_millis(RAW_REPL_STOP_DRAIN_MS));
        let rx = self.link.receiver()?;
        rx.send(&[CTRL_C])?;
        // The KeyboardInterrupt traceback closes both output segments
        let drained = rx
            .recv(Trigger::Token(vec![CTRL_D]), drain)
            .and_then(|_| rx.recv(Trigger::Token(vec![CTRL_D]), drain));
        match drained {
            Ok(_) => {}
            Err(e) if e.is_timeout() => debug!("No program output to drain"),
            Err(e) => return Err(e),
        }
        rx.discard();

        if self.repl.state() == RawReplState::InRaw {
            self.repl.leave(rx)?;
        } else {
            rx.send(&[CTRL_B])?;
        }
        info!("Stopped program");
        if self.running {
            self.running = false;
            self.events.emit(BoardEvent::Stop);
        }
        Ok(())
    }

    fn is_running(&mut self) -> BoardResult<bool> {
        if !self.running {
            return Ok(false);
        }
        let timeout = self.repl.params.timeout;
        let rx = self.link.receiver()?;
        match rx.recv_text("\x04", Some(Duration::from_millis(RUNNING_POLL_MS))) {
            Ok(stdout) => {
                debug!("Program output: {:?}", strip_terminator(stdout));
                let stderr = strip_terminator(rx.recv_text("\x04", Some(timeout))?);
                if !stderr.is_empty() {
                    warn!("Program ended with error: {}", stderr.trim());
                }
                self.finish_program()?;
                Ok(false)
            }
            Err(e) if e.is_timeout() => Ok(true),
            Err(e) => Err(e),
        }
    }
}
