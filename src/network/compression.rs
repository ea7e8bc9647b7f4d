//! Delta-XOR plus run-length encoding for input payloads.
//!
//! Every pending input frame is XORed against a single reference input (the
//! last one the remote acked) and the resulting delta stream is
//! run-length-encoded as `(count, value)` byte pairs. Runs are capped at
//! 255 and deliberately carry across frame boundaries, since consecutive
//! identical inputs produce long zero runs.
//!
//! Both directions work through a fixed scratch buffer. Overflowing it is
//! an error, not a reallocation; the protocol bounds its pending window so
//! this never happens in correct operation.

use std::fmt;

/// Fixed scratch capacity shared by encode and decode.
const MAX_SCRATCH_BYTES: usize = 256 * 1024;

/// An error during input compression or decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// The reference input was empty.
    EmptyReference,
    /// A pending input's length differed from the reference length.
    LengthMismatch {
        /// Length of the reference input in bytes.
        expected: usize,
        /// Length of the offending input in bytes.
        actual: usize,
    },
    /// The fixed scratch buffer would overflow.
    ScratchOverflow,
    /// RLE data did not consist of whole `(count, value)` pairs.
    OddRleLength(usize),
    /// An RLE run claimed a count of zero.
    ZeroRunCount,
    /// Decoded data length was not a multiple of the reference length.
    PartialFrame {
        /// Total decoded length in bytes.
        decoded: usize,
        /// Reference input length in bytes.
        reference: usize,
    },
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::EmptyReference => write!(f, "reference input cannot be empty"),
            CompressionError::LengthMismatch { expected, actual } => write!(
                f,
                "input length {actual} does not match reference length {expected}"
            ),
            CompressionError::ScratchOverflow => {
                write!(f, "compression scratch overflow (>{MAX_SCRATCH_BYTES} bytes)")
            }
            CompressionError::OddRleLength(len) => {
                write!(f, "RLE data length {len} is not a whole number of pairs")
            }
            CompressionError::ZeroRunCount => write!(f, "RLE run count cannot be 0"),
            CompressionError::PartialFrame { decoded, reference } => write!(
                f,
                "decoded length {decoded} is not a multiple of reference length {reference}"
            ),
        }
    }
}

impl std::error::Error for CompressionError {}

/// Reusable codec state. One per protocol endpoint.
#[derive(Debug)]
pub(crate) struct Compression {
    scratch: Box<[u8]>,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            scratch: vec![0u8; MAX_SCRATCH_BYTES].into_boxed_slice(),
        }
    }
}

impl Compression {
    /// Encodes `pending` inputs as an RLE delta stream against `reference`.
    /// Every pending input must have the reference's length.
    pub(crate) fn encode<'a>(
        &mut self,
        reference: &[u8],
        pending: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Vec<u8>, CompressionError> {
        if reference.is_empty() {
            return Err(CompressionError::EmptyReference);
        }

        let mut out_ptr = 0;
        let mut run: Option<(u8, u8)> = None; // (count, value)

        for input in pending {
            if input.len() != reference.len() {
                return Err(CompressionError::LengthMismatch {
                    expected: reference.len(),
                    actual: input.len(),
                });
            }

            for (&reference_byte, &input_byte) in reference.iter().zip(input) {
                let delta = reference_byte ^ input_byte;
                run = match run {
                    None => Some((1, delta)),
                    Some((count, value)) if value == delta && count < u8::MAX => {
                        Some((count + 1, value))
                    }
                    Some(pair) => {
                        self.flush_run(pair, &mut out_ptr)?;
                        Some((1, delta))
                    }
                };
            }
        }

        if let Some(pair) = run {
            self.flush_run(pair, &mut out_ptr)?;
        }

        Ok(self.scratch[..out_ptr].to_vec())
    }

    /// Decodes an RLE delta stream back into whole input frames.
    pub(crate) fn decode(
        &mut self,
        reference: &[u8],
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>, CompressionError> {
        if reference.is_empty() {
            return Err(CompressionError::EmptyReference);
        }

        let decoded_len = self.rle_decode_to_scratch(data)?;
        if decoded_len % reference.len() != 0 {
            return Err(CompressionError::PartialFrame {
                decoded: decoded_len,
                reference: reference.len(),
            });
        }

        let count = decoded_len / reference.len();
        let mut result = Vec::with_capacity(count);
        for chunk in self.scratch[..decoded_len].chunks_exact(reference.len()) {
            result.push(
                reference
                    .iter()
                    .zip(chunk)
                    .map(|(&reference_byte, &delta)| reference_byte ^ delta)
                    .collect(),
            );
        }
        Ok(result)
    }

    fn flush_run(&mut self, (count, value): (u8, u8), out_ptr: &mut usize) -> Result<(), CompressionError> {
        if *out_ptr + 2 > self.scratch.len() {
            return Err(CompressionError::ScratchOverflow);
        }
        self.scratch[*out_ptr] = count;
        self.scratch[*out_ptr + 1] = value;
        *out_ptr += 2;
        Ok(())
    }

    fn rle_decode_to_scratch(&mut self, rle: &[u8]) -> Result<usize, CompressionError> {
        if rle.len() % 2 != 0 {
            return Err(CompressionError::OddRleLength(rle.len()));
        }

        let mut out_ptr = 0;
        for pair in rle.chunks_exact(2) {
            let (count, value) = (pair[0] as usize, pair[1]);
            if count == 0 {
                return Err(CompressionError::ZeroRunCount);
            }
            if out_ptr + count > self.scratch.len() {
                return Err(CompressionError::ScratchOverflow);
            }
            self.scratch[out_ptr..out_ptr + count].fill(value);
            out_ptr += count;
        }
        Ok(out_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identical_inputs_collapse_to_zero_runs() {
        let mut codec = Compression::default();
        let reference = [0u8, 0, 0, 0];
        let pending = [[0u8, 0, 0, 0], [1, 0, 0, 0]];
        let encoded = codec
            .encode(&reference, pending.iter().map(|p| p.as_slice()))
            .unwrap();
        // a run of four zero deltas carries into the second frame's
        // trailing zeroes
        assert_eq!(encoded, vec![4, 0, 1, 1, 3, 0]);
    }

    #[test]
    fn round_trip_restores_inputs() {
        let mut codec = Compression::default();
        let reference = [7u8, 1, 255, 0];
        let pending: Vec<[u8; 4]> = vec![[7, 1, 255, 0], [8, 1, 0, 0], [8, 2, 0, 9]];
        let encoded = codec
            .encode(&reference, pending.iter().map(|p| p.as_slice()))
            .unwrap();
        let decoded = codec.decode(&reference, &encoded).unwrap();
        assert_eq!(decoded.len(), pending.len());
        for (got, expected) in decoded.iter().zip(&pending) {
            assert_eq!(got.as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn runs_are_capped_at_255() {
        let mut codec = Compression::default();
        let reference = vec![0u8; 300];
        let pending = vec![vec![0u8; 300]];
        let encoded = codec
            .encode(&reference, pending.iter().map(|p| p.as_slice()))
            .unwrap();
        assert_eq!(encoded, vec![255, 0, 45, 0]);
    }

    #[test]
    fn empty_reference_is_rejected() {
        let mut codec = Compression::default();
        assert_eq!(
            codec.encode(&[], std::iter::empty()),
            Err(CompressionError::EmptyReference)
        );
        assert_eq!(
            codec.decode(&[], &[1, 0]),
            Err(CompressionError::EmptyReference)
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut codec = Compression::default();
        let reference = [0u8; 4];
        let bad = [0u8; 3];
        assert_eq!(
            codec.encode(&reference, std::iter::once(bad.as_slice())),
            Err(CompressionError::LengthMismatch { expected: 4, actual: 3 })
        );
    }

    #[test]
    fn odd_rle_data_is_rejected() {
        let mut codec = Compression::default();
        assert_eq!(
            codec.decode(&[0u8; 2], &[1, 0, 2]),
            Err(CompressionError::OddRleLength(3))
        );
    }

    #[test]
    fn zero_run_count_is_rejected() {
        let mut codec = Compression::default();
        assert_eq!(
            codec.decode(&[0u8; 2], &[0, 5]),
            Err(CompressionError::ZeroRunCount)
        );
    }

    #[test]
    fn partial_frame_is_rejected() {
        let mut codec = Compression::default();
        assert_eq!(
            codec.decode(&[0u8; 4], &[3, 1]),
            Err(CompressionError::PartialFrame { decoded: 3, reference: 4 })
        );
    }

    #[test]
    fn decode_scratch_overflow_is_an_error() {
        let mut codec = Compression::default();
        // 2048 pairs of 255-byte runs exceed the 256 KiB scratch
        let rle: Vec<u8> = std::iter::repeat([255u8, 0]).take(2048).flatten().collect();
        assert_eq!(
            codec.decode(&[0u8; 4], &rle),
            Err(CompressionError::ScratchOverflow)
        );
    }

    #[test]
    fn empty_pending_encodes_to_nothing() {
        let mut codec = Compression::default();
        let encoded = codec.encode(&[1u8, 2], std::iter::empty()).unwrap();
        assert!(encoded.is_empty());
        let decoded = codec.decode(&[1u8, 2], &encoded).unwrap();
        assert!(decoded.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_inputs_round_trip(
            reference in proptest::collection::vec(any::<u8>(), 1..32),
            frames in proptest::collection::vec(any::<u8>(), 0..8)
        ) {
            let pending: Vec<Vec<u8>> = frames
                .iter()
                .map(|&seed| reference.iter().map(|b| b.wrapping_add(seed)).collect())
                .collect();
            let mut codec = Compression::default();
            let encoded = codec
                .encode(&reference, pending.iter().map(|p| p.as_slice()))
                .unwrap();
            let decoded = codec.decode(&reference, &encoded).unwrap();
            prop_assert_eq!(decoded, pending);
        }
    }
}
