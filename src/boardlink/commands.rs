use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use boardlink::boards::available_ports;
use boardlink::error::{BoardError, BoardResult};
use boardlink::events::BoardEvent;
use boardlink::{BoardClass, BoardRegistry, Session};

const WAIT_POLL_MS: u64 = 200;

/// Board and port selected on the command line
pub(crate) struct Target {
    pub board: BoardClass,
    pub port: Option<String>,
}

impl Target {
    fn open(&self) -> BoardResult<Session> {
        Session::open(
            &BoardRegistry::with_builtin(),
            self.board.key(),
            self.port.as_deref(),
        )
    }
}

fn io_error(what: &str, path: &Path, e: io::Error) -> BoardError {
    BoardError::ConfigurationError(format!("Could not {} {}: {}", what, path.display(), e))
}

pub(crate) fn list(all: bool) -> BoardResult<()> {
    let registry = BoardRegistry::with_builtin();
    for candidate in registry.enumerate(&available_ports()?) {
        if candidate.unsupported && !all {
            continue;
        }
        let ids = match (candidate.vendor_id, candidate.product_id) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".to_string(),
        };
        println!(
            "{:<20} {:<16} {:<10}{}",
            candidate.path,
            candidate.name,
            ids,
            if candidate.unsupported { " (unsupported)" } else { "" }
        );
    }
    Ok(())
}

pub(crate) fn info(target: &Target) -> BoardResult<()> {
    let mut session = target.open()?;
    let info = session.board().get_info()?;
    println!("path:       {}", info.path);
    let fields = [
        ("serial:", &info.serial_number),
        ("uuid:", &info.repository_uuid),
        ("release:", &info.release),
        ("variation:", &info.variation),
        ("firmware:", &info.firmware_id),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("{:<11} {}", label, value);
        }
    }
    Ok(())
}

pub(crate) fn ls(target: &Target, dir: &str) -> BoardResult<()> {
    let mut session = target.open()?;
    for name in session.board().enumerate_files(dir)? {
        println!("{}", name);
    }
    Ok(())
}

pub(crate) fn put(target: &Target, local: &Path, remote: Option<&str>) -> BoardResult<()> {
    let data = fs::read(local).map_err(|e| io_error("read", local, e))?;
    let remote = match remote {
        Some(remote) => remote.to_owned(),
        None => local
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                BoardError::ConfigurationError(format!("{} has no file name", local.display()))
            })?,
    };

    let mut session = target.open()?;
    session.board().write_file(&remote, &data)?;
    tracing::info!("Wrote {} bytes to {}", data.len(), remote);
    Ok(())
}

pub(crate) fn get(target: &Target, remote: &str, local: Option<&Path>) -> BoardResult<()> {
    let mut session = target.open()?;
    let data = session.board().read_file(remote)?;
    match local {
        Some(local) => fs::write(local, &data).map_err(|e| io_error("write", local, e))?,
        None => io::stdout()
            .write_all(&data)
            .map_err(|e| BoardError::Communication(format!("stdout: {}", e)))?,
    }
    Ok(())
}

pub(crate) fn rm(target: &Target, remote: &str) -> BoardResult<()> {
    target.open()?.board().remove_file(remote)
}

pub(crate) fn run(target: &Target, remote: &str, wait: bool) -> BoardResult<()> {
    let mut session = target.open()?;
    let events = session.board().events().subscribe();
    session.board().run_program(remote)?;
    if !wait {
        return Ok(());
    }

    loop {
        if events.try_iter().any(|event| event == BoardEvent::Stop) {
            break;
        }
        match session.board().is_running() {
            Ok(false) => break,
            Ok(true) => thread::sleep(Duration::from_millis(WAIT_POLL_MS)),
            Err(e) if e.is_timeout() => {}
            Err(e) => return Err(e),
        }
    }
    tracing::info!("{} finished", remote);
    Ok(())
}

pub(crate) fn stop(target: &Target) -> BoardResult<()> {
    target.open()?.board().stop_program()
}

pub(crate) fn firmware(target: &Target, bundle: &Path) -> BoardResult<()> {
    let mut session = target.open()?;
    session.progress_bar(true);
    session.write_firmware(bundle)
}
