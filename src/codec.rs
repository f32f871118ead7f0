//! Run-length decompression for devices that compress sample memory.
//!
//! Each 4-byte record `(a, b, c, run)` stands for `run + 1` consecutive
//! samples `(a, b, c, 0)`.

/// Size of one compressed record and of one expanded sample, in bytes.
pub const RECORD_SIZE: usize = 4;

/// Expands `input` into `output` and returns the number of bytes written.
///
/// Expansion stops when `output` has no room for another whole sample.
/// A trailing partial record in `input` is ignored.
pub fn decompress(input: &[u8], output: &mut [u8]) -> usize {
    let capacity = output.len() / RECORD_SIZE;
    let mut written = 0;

    'records: for record in input.chunks_exact(RECORD_SIZE) {
        let sample = [record[0], record[1], record[2], 0];
        for _ in 0..=record[3] {
            if written == capacity {
                break 'records;
            }
            let start = written * RECORD_SIZE;
            output[start..start + RECORD_SIZE].copy_from_slice(&sample);
            written += 1;
        }
    }

    written * RECORD_SIZE
}

/// Number of bytes `input` expands to with unbounded output.
pub fn expanded_len(input: &[u8]) -> usize {
    input
        .chunks_exact(RECORD_SIZE)
        .map(|record| (record[3] as usize + 1) * RECORD_SIZE)
        .sum()
}

/// Expands `input` into a freshly allocated buffer.
pub fn decompress_to_vec(input: &[u8]) -> Vec<u8> {
    decompress_at_most(input, usize::MAX)
}

/// Expands at most `max_len` bytes of `input`, allocating no more than that.
pub fn decompress_at_most(input: &[u8], max_len: usize) -> Vec<u8> {
    let mut output = vec![0u8; expanded_len(input).min(max_len)];
    let written = decompress(input, &mut output);
    output.truncate(written);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expands_runs() {
        let input = [0x11, 0x22, 0x33, 2, 0xaa, 0xbb, 0xcc, 0];
        let out = decompress_to_vec(&input);
        assert_eq!(
            out,
            vec![
                0x11, 0x22, 0x33, 0, 0x11, 0x22, 0x33, 0, 0x11, 0x22, 0x33, 0, 0xaa, 0xbb, 0xcc,
                0
            ]
        );
        assert_eq!(expanded_len(&input), 16);
    }

    #[test]
    fn test_truncates_at_capacity() {
        let input = [1, 2, 3, 9];
        let mut out = [0xffu8; 14];
        let written = decompress(&input, &mut out);
        assert_eq!(written, 12);
        assert_eq!(&out[..12], &[1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3, 0]);
        // bytes past the last whole sample are untouched
        assert_eq!(&out[12..], &[0xff, 0xff]);
    }

    #[test]
    fn test_ignores_trailing_partial_record() {
        let input = [5, 6, 7, 0, 9, 9];
        let mut out = [0u8; 64];
        assert_eq!(decompress(&input, &mut out), 4);
        assert_eq!(expanded_len(&input), 4);
    }

    #[test]
    fn test_bounded_expansion() {
        let input = [7, 8, 9, 255];
        let out = decompress_at_most(&input, 10);
        assert_eq!(out, vec![7, 8, 9, 0, 7, 8, 9, 0]);
        assert_eq!(out.capacity(), 10);
        assert!(decompress_at_most(&input, 0).is_empty());
    }

    #[test]
    fn test_maximum_run() {
        let input = [0, 0, 1, 255];
        assert_eq!(decompress_to_vec(&input).len(), 256 * 4);
    }

    #[test]
    fn test_empty_input_or_output() {
        let mut out = [0u8; 8];
        assert_eq!(decompress(&[], &mut out), 0);
        assert_eq!(decompress(&[1, 2, 3, 4], &mut []), 0);
    }
}
