/// Copy `n_bytes` from `src[src_start..]` into a copy of `old` at
/// `dst_start`, leaving every other byte of `old` untouched.
pub fn shift_and_update_word(
    old: &[u8],
    src: &[u8],
    src_start: usize,
    dst_start: usize,
    n_bytes: usize,
) -> Vec<u8> {
    assert!(src_start + n_bytes <= src.len(),
        "source run {src_start}+{n_bytes} exceeds word of {}", src.len());
    assert!(dst_start + n_bytes <= old.len(),
        "destination run {dst_start}+{n_bytes} exceeds word of {}", old.len());
    let mut out = old.to_vec();
    out[dst_start..dst_start + n_bytes].copy_from_slice(&src[src_start..src_start + n_bytes]);
    out
}

pub fn word_to_u64(word: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..word.len()].copy_from_slice(word);
    u64::from_le_bytes(buf)
}

pub fn u64_to_word(value: u64, word_bytes: usize) -> Vec<u8> {
    value.to_le_bytes()[..word_bytes].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_and_update_word() {
        let old = [0u8; 8];
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let out = shift_and_update_word(&old, &src, 2, 5, 3);
        assert_eq!(out, vec![0, 0, 0, 0, 0, 3, 4, 5]);
    }

    #[test]
    fn test_word_u64_round_trip() {
        let word = u64_to_word(0x0102030405060708, 8);
        assert_eq!(word_to_u64(&word), 0x0102030405060708);
        let short = u64_to_word(0x1234, 4);
        assert_eq!(word_to_u64(&short), 0x1234);
    }
}
