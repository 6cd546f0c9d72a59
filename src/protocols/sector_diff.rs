//! Incremental flash update: only sectors whose MD5 differs from the device's
//! copy are sent.

use std::time::Duration;

use tracing::{debug, info};

use super::FirmwareProgress;
use super::rpc::{RpcMailbox, split_result};
use crate::constants::{HASH_TIMEOUT_MS, WRITE_BYTES_PER_MS, WRITE_TIMEOUT_BASE_MS};
use crate::error::{BoardError, BoardResult};

pub type Digest = [u8; 16];

const HASH_REQUEST: u8 = b'H';
const WRITE_REQUEST: u8 = b'W';

fn md5_of(data: &[u8]) -> Digest {
    md5::compute(data).0
}

/// Per-sector hashes reported by the device, and which sectors need writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorTable {
    sector_size: u32,
    expected: Vec<Digest>,
    update: Vec<bool>,
}

/// One contiguous run of sectors to program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub offset: u32,
    pub hash: Digest,
    pub data: Vec<u8>,
}

impl WriteEntry {
    fn new(offset: u32, data: Vec<u8>) -> Self {
        WriteEntry {
            offset,
            hash: md5_of(&data),
            data,
        }
    }
}

impl SectorTable {
    pub fn new(sector_size: u32, expected: Vec<Digest>) -> Self {
        let update = vec![false; expected.len()];
        SectorTable {
            sector_size,
            expected,
            update,
        }
    }

    /// Decode `[result][sector_size][sector_count][md5 x count]`
    pub fn parse(region: &str, reply: &[u8]) -> BoardResult<Self> {
        let (code, body) = split_result(reply)?;
        if code != 0 {
            return Err(BoardError::FirmwareError(format!(
                "Device refused hash request for {} (code {})",
                region, code
            )));
        }
        let word = |at: usize| -> BoardResult<u32> {
            body.get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or_else(|| BoardError::ProtocolViolation("Truncated hash table".to_string()))
        };
        let sector_size = word(0)?;
        let count = word(4)? as usize;
        if sector_size == 0 {
            return Err(BoardError::ProtocolViolation(format!(
                "Region {} reports zero sector size",
                region
            )));
        }

        let hashes = body.get(8..).unwrap_or_default();
        if hashes.len() < count * 16 {
            return Err(BoardError::ProtocolViolation(format!(
                "Hash table for {} holds {} bytes, expected {}",
                region,
                hashes.len(),
                count * 16
            )));
        }
        let expected = hashes
            .chunks_exact(16)
            .take(count)
            .map(|chunk| {
                let mut digest = [0u8; 16];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();
        Ok(Self::new(sector_size, expected))
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn sector_count(&self) -> usize {
        self.expected.len()
    }

    pub fn capacity(&self) -> usize {
        self.sector_size as usize * self.expected.len()
    }

    pub fn update_flags(&self) -> &[bool] {
        &self.update
    }

    /// Zero-pad `image` to whole sectors and flag every sector whose hash differs
    pub fn compare(&mut self, image: &[u8]) -> BoardResult<Vec<u8>> {
        let sector = self.sector_size as usize;
        let padded_len = image.len().div_ceil(sector) * sector;
        if padded_len > self.capacity() {
            return Err(BoardError::Integrity(format!(
                "Image of {} bytes exceeds region of {} bytes",
                image.len(),
                self.capacity()
            )));
        }

        let mut padded = image.to_vec();
        padded.resize(padded_len, 0);
        self.update.iter_mut().for_each(|flag| *flag = false);
        for (index, chunk) in padded.chunks(sector).enumerate() {
            self.update[index] = md5_of(chunk) != self.expected[index];
        }
        Ok(padded)
    }

    /// Coalesce contiguous flagged sectors of a padded image into write entries
    pub fn entries(&self, padded: &[u8]) -> Vec<WriteEntry> {
        let sector = self.sector_size as usize;
        let mut entries = Vec::new();
        let mut run: Option<usize> = None;

        for index in 0..=self.update.len() {
            let flagged = self.update.get(index).copied().unwrap_or(false)
                && index * sector < padded.len();
            match (flagged, run) {
                (true, None) => run = Some(index),
                (false, Some(start)) => {
                    let end = (index * sector).min(padded.len());
                    entries.push(WriteEntry::new(
                        (start * sector) as u32,
                        padded[start * sector..end].to_vec(),
                    ));
                    run = None;
                }
                _ => {}
            }
        }
        entries
    }
}

pub fn encode_hash_request(region: &str) -> Vec<u8> {
    let mut request = vec![HASH_REQUEST];
    request.extend_from_slice(region.as_bytes());
    request.push(0);
    request
}

pub fn encode_write_request(region: &str, entries: &[WriteEntry]) -> Vec<u8> {
    let mut request = vec![WRITE_REQUEST];
    request.extend_from_slice(region.as_bytes());
    request.push(0);
    for entry in entries {
        request.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
        request.extend_from_slice(&entry.offset.to_le_bytes());
        request.extend_from_slice(&entry.hash);
        request.extend_from_slice(&entry.data);
    }
    request.extend_from_slice(&0u32.to_le_bytes());
    request
}

/// Time allowed for the device to program `payload_len` bytes
pub fn write_timeout(payload_len: usize) -> Duration {
    Duration::from_millis(WRITE_TIMEOUT_BASE_MS + payload_len as u64 / WRITE_BYTES_PER_MS)
}

/// What an update changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub sectors_written: usize,
    pub bytes_written: usize,
}

pub struct SectorDiffUpdater<'a> {
    mailbox: &'a mut RpcMailbox,
    hash_timeout: Duration,
}

impl<'a> SectorDiffUpdater<'a> {
    pub fn new(mailbox: &'a mut RpcMailbox) -> Self {
        SectorDiffUpdater {
            mailbox,
            hash_timeout: Duration::from_millis(HASH_TIMEOUT_MS),
        }
    }

    pub fn fetch_table(&mut self, region: &str) -> BoardResult<SectorTable> {
        let reply = self
            .mailbox
            .call(&encode_hash_request(region), self.hash_timeout)?;
        let table = SectorTable::parse(region, &reply)?;
        debug!(
            "Region {}: {} sectors of {} bytes",
            region,
            table.sector_count(),
            table.sector_size()
        );
        Ok(table)
    }

    /// Bring `region` in line with `image`, writing only the sectors that differ
    pub fn update(
        &mut self,
        region: &str,
        image: &[u8],
        progress: &mut dyn FnMut(FirmwareProgress),
    ) -> BoardResult<UpdateSummary> {
        let mut table = self.fetch_table(region)?;
        let padded = table.compare(image)?;
        let entries = table.entries(&padded);

        let sectors_written = table.update_flags().iter().filter(|f| **f).count();
        let bytes_written: usize = entries.iter().map(|e| e.data.len()).sum();
        let total = bytes_written as u64;
        progress(FirmwareProgress {
            stage: region.to_owned(),
            done: 0,
            total,
        });

        if entries.is_empty() {
            info!("Region {} is up to date", region);
            return Ok(UpdateSummary::default());
        }

        let request = encode_write_request(region, &entries);
        info!(
            "Writing {} of {} sectors to {} in {} runs",
            sectors_written,
            table.sector_count(),
            region,
            entries.len()
        );
        let reply = self.mailbox.call(&request, write_timeout(request.len()))?;
        let (code, body) = split_result(&reply)?;
        let address = body
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or(0);
        if code != 0 {
            return Err(BoardError::Rejected { address, code });
        }

        progress(FirmwareProgress {
            stage: region.to_owned(),
            done: total,
            total,
        });
        Ok(UpdateSummary {
            sectors_written,
            bytes_written,
        })
    }
}
