//! Remote file access through the soft-core's software-interrupt mailbox.
//!
//! A call waits for the message register to publish the mailbox address,
//! writes `[len_le32][payload]` there, clears the message register and pokes
//! the notify register. The device answers by publishing the (possibly
//! relocated) reply address in the message register, where the host reads
//! `[len_le32][payload]` back and then clears the register to release the
//! reply buffer. Every call is bounded by an explicit timeout.
//!
//! File requests are `[method][body]` and replies `[result_i32_le][data]`, a
//! negative result carrying `-errno`.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::constants::{
    RPC_POLL_INTERVAL_MS, RPC_READ_CHUNK, RPC_TIMEOUT_MS, RPC_WRITE_CHUNK, SWI_REG_MESSAGE,
    SWI_REG_NOTIFY,
};
use crate::error::{BoardError, BoardResult, FileErrorKind};
use crate::interface::BusIo;

pub const O_RDONLY: u32 = 0x0000;
pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;
pub const O_CREAT: u32 = 0x0200;
pub const O_TRUNC: u32 = 0x0400;
pub const O_NONBLOCK: u32 = 0x4000;

const ENOENT: i32 = 2;
const EAGAIN: i32 = 11;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Open = 0x01,
    Close = 0x02,
    Read = 0x03,
    Write = 0x04,
    List = 0x05,
}

/// Host side of the mailbox
pub struct RpcMailbox {
    bus: Box<dyn BusIo>,
    swi_base: u32,
    poll_interval: Duration,
}

impl RpcMailbox {
    pub fn new(bus: Box<dyn BusIo>, swi_base: u32) -> Self {
        RpcMailbox {
            bus,
            swi_base,
            poll_interval: Duration::from_millis(RPC_POLL_INTERVAL_MS),
        }
    }

    pub fn bus_mut(&mut self) -> &mut dyn BusIo {
        self.bus.as_mut()
    }

    fn wait_message(&mut self, deadline: Instant, timeout: Duration) -> BoardResult<u32> {
        loop {
            let address = self.bus.iord(self.swi_base, SWI_REG_MESSAGE)?;
            if address != 0 {
                return Ok(address);
            }
            if Instant::now() >= deadline {
                return Err(BoardError::Timeout(timeout));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Exchange one request/response pair
    pub fn call(&mut self, payload: &[u8], timeout: Duration) -> BoardResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        let mailbox = self.wait_message(deadline, timeout)?;
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(payload);
        trace!("RPC request of {} bytes at {:#010x}", payload.len(), mailbox);
        self.bus.write_memory(mailbox, &frame)?;
        self.bus.iowr(self.swi_base, SWI_REG_MESSAGE, 0)?;
        self.bus.iowr(self.swi_base, SWI_REG_NOTIFY, 1)?;

        let reply_at = self.wait_message(deadline, timeout)?;
        let length = self.bus.iord(reply_at, 0)? as usize;
        trace!("RPC reply of {} bytes at {:#010x}", length, reply_at);
        let reply = self.bus.read_memory(reply_at + 4, length)?;
        self.bus.iowr(self.swi_base, SWI_REG_MESSAGE, 0)?;
        Ok(reply)
    }
}

/// Split a reply into its result code and data
pub(crate) fn split_result(reply: &[u8]) -> BoardResult<(i32, &[u8])> {
    let code: [u8; 4] = reply
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| BoardError::ProtocolViolation(format!("Short RPC reply ({} bytes)", reply.len())))?;
    Ok((i32::from_le_bytes(code), &reply[4..]))
}

/// Descriptor of a file opened on the target
#[derive(Debug, PartialEq, Eq)]
pub struct RemoteFile {
    fd: u32,
    path: String,
    flags: u32,
}

impl RemoteFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags & O_NONBLOCK != 0
    }
}

/// Result of one remote read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing available yet on a non-blocking file
    Pending,
    Eof,
}

/// POSIX-style file operations remoted through an [`RpcMailbox`]
pub struct RemoteFs {
    mailbox: RpcMailbox,
    timeout: Duration,
}

impl RemoteFs {
    pub fn new(mailbox: RpcMailbox) -> Self {
        RemoteFs {
            mailbox,
            timeout: Duration::from_millis(RPC_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mailbox_mut(&mut self) -> &mut RpcMailbox {
        &mut self.mailbox
    }

    fn invoke(&mut self, method: RpcMethod, body: &[u8], path: &str) -> BoardResult<(i32, Vec<u8>)> {
        let mut request = vec![method as u8];
        request.extend_from_slice(body);
        let reply = self.mailbox.call(&request, self.timeout)?;
        let (code, data) = split_result(&reply)?;
        if code < 0 && !(method == RpcMethod::Read && -code == EAGAIN) {
            let kind = if -code == ENOENT {
                FileErrorKind::NotFound
            } else {
                FileErrorKind::Unknown
            };
            return Err(BoardError::file(
                path,
                kind,
                format!("{:?} failed with errno {}", method, -code),
            ));
        }
        Ok((code, data.to_vec()))
    }

    pub fn open(&mut self, path: &str, flags: u32) -> BoardResult<RemoteFile> {
        let mut body = flags.to_le_bytes().to_vec();
        body.extend_from_slice(path.as_bytes());
        let (fd, _) = self.invoke(RpcMethod::Open, &body, path)?;
        debug!("Opened {} as fd {} (flags {:#x})", path, fd, flags);
        Ok(RemoteFile {
            fd: fd as u32,
            path: path.to_owned(),
            flags,
        })
    }

    pub fn close(&mut self, file: RemoteFile) -> BoardResult<()> {
        self.invoke(RpcMethod::Close, &file.fd.to_le_bytes(), &file.path)?;
        debug!("Closed {}", file.path);
        Ok(())
    }

    pub fn read(&mut self, file: &RemoteFile, length: usize) -> BoardResult<ReadOutcome> {
        let mut body = file.fd.to_le_bytes().to_vec();
        body.extend_from_slice(&(length as u32).to_le_bytes());
        let (code, data) = self.invoke(RpcMethod::Read, &body, &file.path)?;

        Ok(match (code, data.is_empty(), file.is_nonblocking()) {
            (c, _, _) if c < 0 => ReadOutcome::Pending,
            (_, false, _) => ReadOutcome::Data(data),
            (_, true, true) => ReadOutcome::Pending,
            (_, true, false) => ReadOutcome::Eof,
        })
    }

    pub fn write(&mut self, file: &RemoteFile, data: &[u8]) -> BoardResult<usize> {
        let mut body = file.fd.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        let (written, _) = self.invoke(RpcMethod::Write, &body, &file.path)?;
        Ok(written as usize)
    }

    pub fn list(&mut self, dir: &str) -> BoardResult<Vec<String>> {
        let (_, data) = self.invoke(RpcMethod::List, dir.as_bytes(), dir)?;
        Ok(String::from_utf8_lossy(&data)
            .split('\n')
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Close `file` after `body`, without letting a close failure hide the body's error
    fn closing<T>(
        &mut self,
        file: RemoteFile,
        body: impl FnOnce(&mut Self, &RemoteFile) -> BoardResult<T>,
    ) -> BoardResult<T> {
        let result = body(self, &file);
        match self.close(file) {
            Err(e) if result.is_ok() => Err(e),
            Err(e) => {
                warn!("Ignoring close failure: {}", e);
                result
            }
            Ok(()) => result,
        }
    }

    pub fn read_file(&mut self, path: &str) -> BoardResult<Vec<u8>> {
        let file = self.open(path, O_RDONLY)?;
        self.closing(file, |fs, file| {
            let mut data = Vec::new();
            loop {
                match fs.read(file, RPC_READ_CHUNK)? {
                    ReadOutcome::Data(chunk) => data.extend(chunk),
                    ReadOutcome::Eof => return Ok(data),
                    ReadOutcome::Pending => thread::sleep(fs.mailbox.poll_interval),
                }
            }
        })
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> BoardResult<()> {
        let file = self.open(path, O_WRONLY | O_CREAT | O_TRUNC)?;
        self.closing(file, |fs, file| {
            for chunk in data.chunks(RPC_WRITE_CHUNK) {
                let mut rest = chunk;
                while !rest.is_empty() {
                    let written = fs.write(file, rest)?;
                    if written == 0 {
                        return Err(BoardError::file(
                            file.path(),
                            FileErrorKind::Unknown,
                            "target accepted no bytes",
                        ));
                    }
                    rest = &rest[written.min(rest.len())..];
                }
            }
            Ok(())
        })
    }
}

/// A [`RemoteFs`] shared between a board and its stream adapters or monitors
pub type SharedFs = Arc<Mutex<RemoteFs>>;

pub(crate) fn lock_fs(fs: &SharedFs) -> MutexGuard<'_, RemoteFs> {
    fs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_io(error: BoardError) -> io::Error {
    match error {
        BoardError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, error),
        other => io::Error::other(other),
    }
}

/// Streams a remote file; zero-length non-blocking reads are re-polled, not EOF
pub struct RemoteFileReader {
    fs: SharedFs,
    file: Option<RemoteFile>,
    poll_interval: Duration,
}

impl RemoteFileReader {
    pub fn open(fs: SharedFs, path: &str, flags: u32) -> BoardResult<Self> {
        let file = lock_fs(&fs).open(path, O_RDONLY | flags)?;
        Ok(RemoteFileReader {
            fs,
            file: Some(file),
            poll_interval: Duration::from_millis(RPC_POLL_INTERVAL_MS),
        })
    }
}

impl io::Read for RemoteFileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(file) = &self.file else {
            return Ok(0);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let outcome = lock_fs(&self.fs).read(file, buf.len()).map_err(to_io)?;
            match outcome {
                ReadOutcome::Data(data) => {
                    let size = data.len().min(buf.len());
                    buf[..size].copy_from_slice(&data[..size]);
                    return Ok(size);
                }
                ReadOutcome::Eof => return Ok(0),
                ReadOutcome::Pending => thread::sleep(self.poll_interval),
            }
        }
    }
}

impl Drop for RemoteFileReader {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = lock_fs(&self.fs).close(file) {
                warn!("Ignoring close failure: {}", e);
            }
        }
    }
}

/// Writes to a remote file, one blocking RPC write per chunk
pub struct RemoteFileWriter {
    fs: SharedFs,
    file: Option<RemoteFile>,
}

impl RemoteFileWriter {
    pub fn open(fs: SharedFs, path: &str, flags: u32) -> BoardResult<Self> {
        let file = lock_fs(&fs).open(path, O_WRONLY | flags)?;
        Ok(RemoteFileWriter {
            fs,
            file: Some(file),
        })
    }
}

impl io::Write for RemoteFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(file) = &self.file else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "remote file closed"));
        };
        let chunk = &buf[..buf.len().min(RPC_WRITE_CHUNK)];
        lock_fs(&self.fs).write(file, chunk).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RemoteFileWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = lock_fs(&self.fs).close(file) {
                warn!("Ignoring close failure: {}", e);
            }
        }
    }
}
