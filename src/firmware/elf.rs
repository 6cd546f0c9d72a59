use object::Endianness;
use object::elf::PT_LOAD;
use object::read::elf::{ElfFile32, FileHeader, ProgramHeader};

use crate::error::{BoardError, BoardResult};

/// Bytes to place at a physical address before starting the soft-core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<LoadSegment>,
}

impl ElfImage {
    /// Collect the `PT_LOAD` segments of a 32-bit ELF, zero-filling up to `p_memsz`
    pub fn parse(data: &[u8]) -> BoardResult<Self> {
        let elf = ElfFile32::<Endianness>::parse(data)
            .map_err(|e| BoardError::FirmwareError(format!("Invalid ELF: {}", e)))?;
        let endian = elf.endian();

        let mut segments = Vec::new();
        for header in elf.elf_program_headers() {
            if header.p_type(endian) != PT_LOAD || header.p_memsz(endian) == 0 {
                continue;
            }
            let contents = header.data(endian, data).map_err(|_| {
                BoardError::FirmwareError(format!(
                    "Segment at {:#010x} lies outside the file",
                    header.p_paddr(endian)
                ))
            })?;
            let mut bytes = contents.to_vec();
            bytes.resize((header.p_memsz(endian) as usize).max(bytes.len()), 0);
            segments.push(LoadSegment {
                address: header.p_paddr(endian),
                data: bytes,
            });
        }

        if segments.is_empty() {
            return Err(BoardError::FirmwareError(
                "ELF has no loadable segments".to_string(),
            ));
        }
        Ok(ElfImage {
            entry: elf.elf_header().e_entry(endian),
            segments,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Little-endian ELF32 executable with one `PT_LOAD` segment
    pub(crate) fn build_elf(entry: u32, paddr: u32, contents: &[u8], memsz: u32) -> Vec<u8> {
        let mut elf = vec![0x7f, b'E', b'L', b'F', 1, 1, 1, 0];
        elf.resize(16, 0);
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&113u16.to_le_bytes()); // EM_ALTERA_NIOS2
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&entry.to_le_bytes());
        elf.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&52u16.to_le_bytes());
        elf.extend_from_slice(&32u16.to_le_bytes());
        elf.extend_from_slice(&1u16.to_le_bytes());
        elf.extend_from_slice(&[0; 6]);

        for word in [
            PT_LOAD,
            84,
            paddr | 0x8000_0000,
            paddr,
            contents.len() as u32,
            memsz,
            5,
            4,
        ] {
            elf.extend_from_slice(&word.to_le_bytes());
        }
        elf.extend_from_slice(contents);
        elf
    }

    #[test]
    fn load_segment_uses_physical_address_and_fills_bss() {
        let image = ElfImage::parse(&build_elf(0x100, 0x0400_0000, &[1, 2, 3], 8)).unwrap();
        assert_eq!(image.entry, 0x100);
        assert_eq!(
            image.segments,
            [LoadSegment {
                address: 0x0400_0000,
                data: vec![1, 2, 3, 0, 0, 0, 0, 0],
            }]
        );
    }

    #[test]
    fn garbage_is_a_firmware_error() {
        assert!(matches!(
            ElfImage::parse(b"not an elf"),
            Err(BoardError::FirmwareError(_))
        ));
    }
}
