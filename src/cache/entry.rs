//! Decoded image payload shared by the memory and result tiers.
//!
//! # Record Format
//!
//! The result tier persists an [`ImageData`] as:
//!
//! ```text
//! "TSR1" | header length (u32 LE) | JSON header | raw pixels
//! ```
//!
//! The JSON header carries geometry and metadata; pixels follow unpadded.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{ImageInfo, PixelBuffer, PixelFormat};
use crate::error::StoreError;
use crate::source::DataFrom;

const RECORD_MAGIC: &[u8; 4] = b"TSR1";

/// Decoded pixels plus the metadata describing how they were produced.
#[derive(Debug)]
pub struct ImageData {
    /// Decoded (and transformed) pixels
    pub buffer: PixelBuffer,
    /// Source dimensions and MIME type
    pub info: ImageInfo,
    /// Keys of the transformations applied, in order
    pub transformed: Vec<String>,
    /// Where the pixels were produced from
    pub data_from: DataFrom,
}

impl ImageData {
    /// Bytes charged against cache budgets.
    pub fn byte_size(&self) -> usize {
        self.buffer.byte_size()
    }
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    width: u32,
    height: u32,
    format: PixelFormat,
    info: ImageInfo,
    transformed: Vec<String>,
}

/// Serialize `image` for the result tier.
///
/// Fails for a buffer whose storage was already released, since the record
/// could never be read back.
pub fn encode_record(image: &ImageData) -> Result<Bytes, StoreError> {
    if image.buffer.is_released() {
        return Err(StoreError::Malformed("pixel buffer was released".to_string()));
    }
    let header = RecordHeader {
        width: image.buffer.width(),
        height: image.buffer.height(),
        format: image.buffer.format(),
        info: image.info.clone(),
        transformed: image.transformed.clone(),
    };
    let header = serde_json::to_vec(&header).map_err(|e| StoreError::Malformed(e.to_string()))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| StoreError::Malformed("record header too large".to_string()))?;

    let pixels = image.buffer.data();
    let mut out = BytesMut::with_capacity(8 + header.len() + pixels.len());
    out.put_slice(RECORD_MAGIC);
    out.put_u32_le(header_len);
    out.put_slice(&header);
    out.put_slice(pixels);
    Ok(out.freeze())
}

/// Parse a result-tier record. The restored image reports `data_from`.
pub fn decode_record(data: &[u8], data_from: DataFrom) -> Result<ImageData, StoreError> {
    if data.len() < 8 || &data[0..4] != RECORD_MAGIC {
        return Err(StoreError::Malformed("bad record magic".to_string()));
    }
    let header_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let header_end = 8usize
        .checked_add(header_len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| StoreError::Malformed("truncated header".to_string()))?;

    let header: RecordHeader = serde_json::from_slice(&data[8..header_end])
        .map_err(|e| StoreError::Malformed(e.to_string()))?;

    let pixels = data[header_end..].to_vec();
    let buffer = PixelBuffer::from_raw(header.width, header.height, header.format, pixels)
        .ok_or_else(|| StoreError::Malformed("pixel data length mismatch".to_string()))?;

    Ok(ImageData {
        buffer,
        info: header.info,
        transformed: header.transformed,
        data_from,
    })
}
