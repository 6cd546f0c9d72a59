use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{BoardError, BoardResult};

/// A firmware bundle: a zip file or an unpacked directory
pub enum FirmwareArchive {
    Zip(ZipArchive<File>),
    Directory(PathBuf),
}

impl FirmwareArchive {
    pub fn open(path: &Path) -> BoardResult<Self> {
        if path.is_dir() {
            return Ok(FirmwareArchive::Directory(path.to_path_buf()));
        }
        let file = File::open(path).map_err(|e| {
            BoardError::FirmwareError(format!("Cannot open {}: {}", path.display(), e))
        })?;
        let archive = ZipArchive::new(file).map_err(|e| {
            BoardError::FirmwareError(format!("{} is not a firmware archive: {}", path.display(), e))
        })?;
        debug!("Opened {} with {} members", path.display(), archive.len());
        Ok(FirmwareArchive::Zip(archive))
    }

    pub fn member(&mut self, name: &str) -> BoardResult<Vec<u8>> {
        let missing = || BoardError::FirmwareError(format!("Archive has no member {}", name));
        match self {
            FirmwareArchive::Directory(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    return Err(missing());
                }
                fs::read(&path).map_err(|e| {
                    BoardError::FirmwareError(format!("Cannot read {}: {}", path.display(), e))
                })
            }
            FirmwareArchive::Zip(archive) => {
                let mut entry = archive.by_name(name).map_err(|e| match e {
                    ZipError::FileNotFound => missing(),
                    other => BoardError::FirmwareError(format!("Cannot read {}: {}", name, other)),
                })?;
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(|e| {
                    BoardError::FirmwareError(format!("Cannot extract {}: {}", name, e))
                })?;
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn zip_members_are_extracted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = ZipWriter::new(file.as_file());
        writer
            .start_file("ufm.rpd", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&[1, 2, 3, 4]).unwrap();
        writer.finish().unwrap();

        let mut archive = FirmwareArchive::open(file.path()).unwrap();
        assert_eq!(archive.member("ufm.rpd").unwrap(), [1, 2, 3, 4]);
        assert!(matches!(
            archive.member("spi.elf"),
            Err(BoardError::FirmwareError(_))
        ));
    }

    #[test]
    fn directory_members_are_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("image1.rpd"), b"cfm").unwrap();

        let mut archive = FirmwareArchive::open(dir.path()).unwrap();
        assert_eq!(archive.member("image1.rpd").unwrap(), b"cfm");
        assert!(archive.member("ufm.rpd").is_err());
    }

    #[test]
    fn non_zip_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"plain text").unwrap();
        assert!(FirmwareArchive::open(file.path()).is_err());
    }
}
