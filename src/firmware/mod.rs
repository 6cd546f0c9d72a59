pub mod archive;
pub mod elf;
pub mod rpd;

use std::path::Path;

use tracing::info;

use crate::error::BoardResult;
use archive::FirmwareArchive;
use elf::ElfImage;

pub const SPI_ELF_MEMBER: &str = "spi.elf";
pub const CFM_MEMBER: &str = "image1.rpd";
pub const UFM_MEMBER: &str = "ufm.rpd";

/// Everything a PERIDOT firmware update needs, decoded and in flash byte order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBundle {
    /// Flash writer program loaded into the soft-core
    pub writer: ElfImage,
    pub cfm0: Vec<u8>,
    pub ufm: Vec<u8>,
}

impl FirmwareBundle {
    pub fn load(path: &Path) -> BoardResult<Self> {
        let mut archive = FirmwareArchive::open(path)?;
        let writer = ElfImage::parse(&archive.member(SPI_ELF_MEMBER)?)?;
        let cfm0 = rpd::transform(&archive.member(CFM_MEMBER)?);
        let ufm = rpd::transform(&archive.member(UFM_MEMBER)?);
        info!(
            "Firmware: cfm0 {} bytes, ufm {} bytes, writer entry {:#010x}",
            cfm0.len(),
            ufm.len(),
            writer.entry
        );
        Ok(FirmwareBundle { writer, cfm0, ufm })
    }
}
