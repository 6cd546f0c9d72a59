//! Raw programming data as produced by the FPGA tools is bit-reversed per byte
//! and word-swapped relative to what the configuration flash expects.

const fn bit_reverse_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).reverse_bits();
        i += 1;
    }
    table
}

static BIT_REVERSE: [u8; 256] = bit_reverse_table();

/// Convert between RPD and flash byte order. Applying it twice restores a
/// buffer whose length is a multiple of 4.
pub fn transform(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data.len().div_ceil(4) * 4];
    for (index, byte) in data.iter().enumerate() {
        out[index ^ 3] = BIT_REVERSE[*byte as usize];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverses_bits_and_swaps_words() {
        assert_eq!(transform(&[0x01, 0x02, 0x80, 0xF0]), [0x0F, 0x01, 0x40, 0x80]);
    }

    #[test]
    fn pads_to_whole_words() {
        assert_eq!(transform(&[0xFF]), [0x00, 0x00, 0x00, 0xFF]);
        assert!(transform(&[]).is_empty());
    }

    #[test]
    fn transform_is_an_involution() {
        let data: Vec<u8> = (0..=255u8).chain(0..17).collect();
        let once = transform(&data);
        assert_eq!(once.len() % 4, 0);
        assert_eq!(transform(&once), once_padded(&data));
        assert_eq!(transform(&transform(&once)), once);
    }

    fn once_padded(data: &[u8]) -> Vec<u8> {
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        padded
    }
}
