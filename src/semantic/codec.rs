//! Compact text encoding for embedding vectors.
//!
//! Each component is packed as a 32-bit float in native byte order and the
//! resulting buffer is base64-encoded (standard alphabet, padded).

use base64::{engine::general_purpose::STANDARD, Engine as _};

const F32_SIZE: usize = std::mem::size_of::<f32>();

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Packed vector length {0} is not a multiple of {F32_SIZE}")]
    Misaligned(usize),
}

/// Encode a vector as base64 of its packed f32 buffer.
pub fn encode_vector(vector: &[f32]) -> String {
    let mut buf = Vec::with_capacity(vector.len() * F32_SIZE);
    for value in vector {
        buf.extend_from_slice(&value.to_ne_bytes());
    }
    STANDARD.encode(buf)
}

/// Decode a vector produced by [`encode_vector`].
pub fn decode_vector(encoded: &str) -> Result<Vec<f32>, CodecError> {
    let buf = STANDARD.decode(encoded)?;
    if buf.len() % F32_SIZE != 0 {
        return Err(CodecError::Misaligned(buf.len()));
    }

    Ok(buf
        .chunks_exact(F32_SIZE)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preserves_components() {
        let vector = vec![0.0, 1.0, -1.5, 3.25e-7, f32::MAX, f32::MIN_POSITIVE];
        let decoded = decode_vector(&encode_vector(&vector)).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn test_empty_vector() {
        assert_eq!(encode_vector(&[]), "");
        assert!(decode_vector("").unwrap().is_empty());
    }

    #[test]
    fn test_smaller_than_json_numbers() {
        let vector: Vec<f32> = (0..384).map(|i| (i as f32 * 0.731).sin() / 7.0).collect();
        let encoded = encode_vector(&vector);
        let as_json = serde_json::to_string(&vector).unwrap();
        assert!(encoded.len() < as_json.len());
    }

    #[test]
    fn test_rejects_misaligned_buffer() {
        let encoded = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_vector(&encoded),
            Err(CodecError::Misaligned(3))
        ));
    }

    #[test]
    fn test_rejects_invalid_base64() {
        assert!(matches!(
            decode_vector("not base64!!"),
            Err(CodecError::Base64(_))
        ));
    }
}
