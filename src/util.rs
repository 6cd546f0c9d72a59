use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{BoardError, BoardResult};

pub(crate) fn create_progress_bar(total_steps: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total_steps);

    let style = ProgressStyle::default_bar()
        .template(
            "[{spinner:.green} {elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(msg.to_owned());

    pb
}

/// Upper-case ASCII hex, two characters per byte
pub fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

pub fn decode_hex(text: &str) -> BoardResult<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(BoardError::Integrity(format!(
            "Odd number of hex digits ({})",
            text.len()
        )));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .filter(|pair| pair.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| BoardError::Integrity(format!("Invalid hex at offset {}", i)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_upper_case() {
        assert_eq!(encode_hex(&[0x00, 0xab, 0x7f]), "00AB7F");
    }

    #[test]
    fn hex_decode_accepts_both_cases() {
        assert_eq!(decode_hex("00ab7F\r\n").unwrap(), [0x00, 0xab, 0x7f]);
    }

    #[test]
    fn malformed_hex_is_an_integrity_failure() {
        assert!(matches!(decode_hex("ABC"), Err(BoardError::Integrity(_))));
        assert!(matches!(decode_hex("ZZ"), Err(BoardError::Integrity(_))));
    }

    #[test]
    fn sign_prefixed_pair_is_rejected() {
        assert!(matches!(decode_hex("+F"), Err(BoardError::Integrity(_))));
        assert!(matches!(decode_hex("00-1"), Err(BoardError::Integrity(_))));
    }
}
