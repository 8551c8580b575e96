//! Dense float32 vector packing.
//!
//! Vectors travel as base64 text: each component is packed as IEEE-754
//! float32, big-endian, four bytes per component, concatenated in order.

use crate::DeserializationError;

/// Encode a float vector into its base64 wire form.
pub fn encode_float32_vector(values: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_be_bytes());
    }
    base64::encode(bytes)
}

/// Decode the base64 wire form back into a float vector.
///
/// Fails when the input is not valid base64 or the decoded byte length is
/// not a multiple of four.
pub fn decode_float32_vector(text: &str) -> Result<Vec<f32>, DeserializationError> {
    let bytes = base64::decode(text).map_err(|e| DeserializationError {
        message: format!("float32 vector is not valid base64: {e}"),
        data: text.to_owned(),
    })?;
    if bytes.len() % 4 != 0 {
        return Err(DeserializationError {
            message: format!(
                "float32 vector byte length {} is not a multiple of 4",
                bytes.len()
            ),
            data: text.to_owned(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
