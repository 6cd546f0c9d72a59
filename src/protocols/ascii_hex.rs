//! Line console of the Wakayama.rb family (Wakayama.rb board, GR-CITRUS).
//!
//! Every command is one letter, space separated arguments and a CR. File
//! contents travel as upper-case ASCII hex since the console cannot pass
//! arbitrary control bytes. The console has no resynchronisation command, so
//! a serial line break precedes each write transaction.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::serial::SerialLink;
use super::{Board, BoardInformation};
use crate::boards::BoardClass;
use crate::constants::{
    ASCII_HEX_BANNER, ASCII_HEX_PROMPT, ASCII_HEX_SAVE_TIMEOUT_MS, ASCII_HEX_TIMEOUT_MS,
    DEFAULT_BAUD_RATE, POST_RESET_BOOTUP_DELAY_MS, RUNNING_POLL_MS,
};
use crate::error::{BoardError, BoardResult, FileErrorKind};
use crate::events::{BoardEvent, EventEmitter};
use crate::interface::DeviceInterface;
use crate::interface::receiver::Trigger;
use crate::util::{decode_hex, encode_hex};

const WAITING_MARKER: &str = "Waiting";
const SAVING_MARKER: &str = "Saving";
const PROGRESS_TICK: u8 = b'.';

#[derive(Debug, Clone)]
pub struct AsciiHexParams {
    pub baud: u32,
    pub timeout: Duration,
    /// Flash writes report progress slowly; each tick must arrive within this
    pub save_timeout: Duration,
    /// How long to wait for the banner prompt after a line break
    pub reset_settle: Duration,
}

impl Default for AsciiHexParams {
    fn default() -> Self {
        AsciiHexParams {
            baud: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(ASCII_HEX_TIMEOUT_MS),
            save_timeout: Duration::from_millis(ASCII_HEX_SAVE_TIMEOUT_MS),
            reset_settle: Duration::from_millis(POST_RESET_BOOTUP_DELAY_MS * 4),
        }
    }
}

/// Parse an `F` response: declared length before `Waiting`, hex payload on
/// the last line before the banner echo.
pub(crate) fn parse_read_response(path: &str, response: &str) -> BoardResult<Vec<u8>> {
    let Some(marker) = response.find(WAITING_MARKER) else {
        return Err(BoardError::file(
            path,
            FileErrorKind::NotFound,
            response.trim(),
        ));
    };

    let declared: usize = response[..marker]
        .split_whitespace()
        .rev()
        .find_map(|token| token.parse().ok())
        .ok_or_else(|| {
            BoardError::ProtocolViolation(format!("No length reported for {}", path))
        })?;

    let after = &response[marker + WAITING_MARKER.len()..];
    let banner = after.find(ASCII_HEX_BANNER).ok_or_else(|| {
        BoardError::ProtocolViolation(format!("No banner after payload of {}", path))
    })?;
    let payload = after[..banner]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();

    let data = decode_hex(payload)?;
    if data.len() != declared {
        return Err(BoardError::Integrity(format!(
            "{} declared {} bytes but carried {}",
            path,
            declared,
            data.len()
        )));
    }
    Ok(data)
}

/// Parse an `L` listing of `<name> <size> byte` lines
pub(crate) fn parse_listing(listing: &str, dir: &str) -> Vec<String> {
    let prefix = match dir.trim_end_matches('/') {
        "" => String::new(),
        trimmed => format!("{}/", trimmed),
    };

    listing
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [name, size, "byte" | "bytes"] if size.parse::<u64>().is_ok() => Some(*name),
                _ => None,
            }
        })
        .filter_map(|name| name.strip_prefix(prefix.as_str()))
        .map(str::to_owned)
        .collect()
}

fn release_from_banner(banner: &str) -> Option<String> {
    let line = banner
        .lines()
        .find(|line| line.contains(ASCII_HEX_BANNER))?
        .trim();
    match line.split_once("Ver.") {
        Some((_, rest)) => rest
            .split(|c: char| c.is_whitespace() || c == ',')
            .next()
            .map(str::to_owned),
        None => Some(line.to_owned()),
    }
}

/// A board speaking the ASCII hex console
pub struct AsciiHexBoard {
    class: BoardClass,
    link: SerialLink,
    params: AsciiHexParams,
    events: EventEmitter,
    info: Option<BoardInformation>,
    running: bool,
}

impl AsciiHexBoard {
    pub fn new(class: BoardClass) -> Self {
        Self::with_params(class, AsciiHexParams::default())
    }

    pub fn with_params(class: BoardClass, params: AsciiHexParams) -> Self {
        AsciiHexBoard {
            class,
            link: SerialLink::new(class, params.baud),
            params,
            events: EventEmitter::default(),
            info: None,
            running: false,
        }
    }

    pub fn attach(&mut self, device: Box<dyn DeviceInterface>, path: &str) -> BoardResult<()> {
        self.link.attach(device, path)?;
        self.events.emit(BoardEvent::Connected);
        Ok(())
    }

    /// Resynchronise the console. Returns the banner if the prompt came back in time.
    fn line_break(&mut self) -> BoardResult<Option<String>> {
        let settle = self.params.reset_settle;
        let rx = self.link.receiver()?;
        rx.device_mut().reset()?;
        match rx.recv_text(ASCII_HEX_PROMPT, Some(settle)) {
            Ok(banner) => Ok(Some(banner)),
            Err(e) if e.is_timeout() => {
                warn!("No prompt after line break, continuing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn command(&mut self, letter: char, args: &[&str]) -> BoardResult<()> {
        let mut line = letter.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        debug!("Console command {:?}", line);
        line.push('\r');
        self.link.receiver()?.send(line.as_bytes())
    }

    /// Send a command and collect everything up to the next prompt
    fn transact(&mut self, letter: char, args: &[&str]) -> BoardResult<String> {
        let timeout = self.params.timeout;
        self.link.receiver()?.discard();
        self.command(letter, args)?;
        self.link
            .receiver()?
            .recv_text(ASCII_HEX_PROMPT, Some(timeout))
    }

    fn finish_program(&mut self) {
        self.running = false;
        self.events.emit(BoardEvent::Stop);
    }
}

impl Board for AsciiHexBoard {
    fn class(&self) -> BoardClass {
        self.class
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
            self.finish_program();
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
        // The banner is only printed after a reset, which would end the program
        if self.running {
            return Err(BoardError::Busy(format!(
                "{} is running a program",
                self.class.name()
            )));
        }
        let banner = self.line_break()?.ok_or_else(|| {
            BoardError::NotResponding(format!("{} printed no banner", self.class.name()))
        })?;

        let info = BoardInformation {
            path: self.link.path().unwrap_or_default().to_owned(),
            release: release_from_banner(&banner),
            ..Default::default()
        };
        info!("{} info {:?}", self.class.name(), info);
        self.info = Some(info.clone());
        Ok(info)
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> BoardResult<()> {
        let hex = encode_hex(data);
        let timeout = Some(self.params.timeout);
        let save_timeout = Some(self.params.save_timeout);

        self.line_break()?;
        self.command('U', &[path, &hex.len().to_string()])?;

        let rx = self.link.receiver()?;
        rx.recv_text(WAITING_MARKER, timeout).map_err(|e| match e {
            BoardError::Timeout(_) => BoardError::NotResponding(format!("Upload of {} refused", path)),
            other => other,
        })?;
        rx.send(hex.as_bytes())?;
        rx.recv_text(SAVING_MARKER, save_timeout)?;

        let mut ticks = 0usize;
        loop {
            let byte = rx.recv(Trigger::Length(1), save_timeout)?;
            match byte[0] {
                PROGRESS_TICK => {
                    ticks += 1;
                    trace!("Saving {} ({} ticks)", path, ticks);
                }
                b'>' => break,
                _ => {}
            }
        }
        debug!("Saved {} bytes to {} after {} ticks", data.len(), path, ticks);
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> BoardResult<Vec<u8>> {
        let response = self.transact('F', &[path])?;
        parse_read_response(path, &response)
    }

    fn enumerate_files(&mut self, dir: &str) -> BoardResult<Vec<String>> {
        let listing = self.transact('L', &[])?;
        Ok(parse_listing(&listing, dir))
    }

    fn remove_file(&mut self, path: &str) -> BoardResult<()> {
        self.transact('Z', &[path]).map(|_| ())
    }

    fn run_program(&mut self, path: &str) -> BoardResult<()> {
        if self.running {
            return Err(BoardError::Busy("a program is already running".to_string()));
        }
        self.link.receiver()?.discard();
        self.command('R', &[path])?;
        info!("Started {}", path);
        self.running = true;
        self.events.emit(BoardEvent::Start);
        Ok(())
    }

    /// The line break resets the board, so it also ends programs this
    /// connection did not start
    fn stop_program(&mut self) -> BoardResult<()> {
        self.line_break()?;
        info!("Stopped program");
        if self.running {
            self.finish_program();
        }
        Ok(())
    }

    fn is_running(&mut self) -> BoardResult<bool> {
        if !self.running {
            return Ok(false);
        }
        let poll = Some(Duration::from_millis(RUNNING_POLL_MS));
        match self.link.receiver()?.recv_text(ASCII_HEX_PROMPT, poll) {
            Ok(output) => {
                debug!("Program output: {:?}", output);
                self.finish_program();
                Ok(false)
            }
            Err(e) if e.is_timeout() => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "WAKAYAMA.RB Board Ver.ARIDA5-1.52(2016/3/14)f3(256KB), mruby 1.2.0 (H [ENTER])";

    #[test]
    fn listing_yields_names() {
        let listing = " a.txt 10 byte\r\n b.txt 20 byte\r\n";
        assert_eq!(parse_listing(listing, ""), ["a.txt", "b.txt"]);
    }

    #[test]
    fn listing_ignores_echo_and_filters_directory() {
        let listing = "L\r\n lib/x.mrb 4 byte\r\n main.mrb 8 byte\r\n>";
        assert_eq!(parse_listing(listing, "lib/"), ["x.mrb"]);
    }

    #[test]
    fn read_response_decodes_payload() {
        let response = format!("F a.txt\r\n5\r\n{}\r\n48656C6C6F\r\n{}\r\n>", WAITING_MARKER, BANNER);
        assert_eq!(parse_read_response("a.txt", &response).unwrap(), b"Hello");
    }

    #[test]
    fn read_response_length_mismatch_fails() {
        let response = format!("F a.txt\r\n6\r\n{}\r\n48656C6C6F\r\n{}\r\n>", WAITING_MARKER, BANNER);
        assert!(matches!(
            parse_read_response("a.txt", &response),
            Err(BoardError::Integrity(_))
        ));
    }

    #[test]
    fn read_response_without_marker_is_not_found() {
        assert!(matches!(
            parse_read_response("nope", "F nope\r\nFile not found\r\n>"),
            Err(BoardError::FileTransfer {
                kind: FileErrorKind::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn banner_release() {
        assert_eq!(
            release_from_banner(&format!("\r\n{}\r\n", BANNER)).as_deref(),
            Some("ARIDA5-1.52(2016/3/14)f3(256KB)")
        );
    }
}
