//! Raw driver buffer → 8-bit grayscale conversions.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConvertError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected {
        return Err(ConvertError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// GREY buffers are already 1 byte/pixel; drop any driver padding.
pub fn grey_passthrough(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = (width as usize) * (height as usize);
    if buf.len() < expected {
        return Err(ConvertError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].to_vec())
}
