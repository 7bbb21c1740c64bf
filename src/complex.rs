use byte_slice_cast::AsByteSlice;

pub use num_complex::Complex;

/// The type of raw samples out of the radio (sc16 over the wire)
pub type ComplexShort = Complex<i16>;

/// Bytes per complex sample as it lands on disk
pub const SAMPLE_BYTES: usize = std::mem::size_of::<ComplexShort>();

/// View a block of samples as interleaved `[re, im, re, im, ...]`
pub fn interleaved(samples: &[ComplexShort]) -> &[i16] {
    bytemuck::cast_slice(samples)
}

/// Raw native-endian bytes of a block of samples, exactly what gets dumped
pub fn as_bytes(samples: &[ComplexShort]) -> &[u8] {
    interleaved(samples).as_byte_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_size() {
        assert_eq!(SAMPLE_BYTES, 4);
    }

    #[test]
    fn test_interleaved_order() {
        let samples = [ComplexShort::new(1, -2), ComplexShort::new(3, -4)];
        assert_eq!(interleaved(&samples), &[1, -2, 3, -4]);
        assert_eq!(as_bytes(&samples).len(), 2 * SAMPLE_BYTES);
        assert_eq!(&as_bytes(&samples)[..2], &1i16.to_ne_bytes());
    }

    #[test]
    fn test_empty_block() {
        assert!(as_bytes(&[]).is_empty());
    }
}
