use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::decoder::{DecodeOptions, PixelDecoder};
use crate::error::DecodeError;
use crate::frame::{FrameMeta, ImageFrame, PixelRepresentation, SampleBuffer};

/// Decoder for uncompressed transfer syntaxes: reinterprets the byte range
/// as typed samples according to bits-allocated and signedness.
pub struct RawDecoder {
    big_endian: bool,
}

impl RawDecoder {
    pub fn little_endian() -> Self {
        Self { big_endian: false }
    }

    pub fn big_endian() -> Self {
        Self { big_endian: true }
    }
}

impl PixelDecoder for RawDecoder {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        _options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError> {
        meta.validate_pixel_data_length(encoded.len())?;

        let signed = meta.pixel_representation == PixelRepresentation::Signed;
        let samples = match meta.bits_allocated {
            1 => SampleBuffer::U8(unpack_bits(encoded, meta.stored_samples())),
            8 => {
                if signed {
                    SampleBuffer::I8(encoded.iter().map(|&b| b as i8).collect())
                } else {
                    SampleBuffer::U8(encoded.to_vec())
                }
            }
            16 => {
                let mut words = vec![0u16; encoded.len() / 2];
                if self.big_endian {
                    BigEndian::read_u16_into(encoded, &mut words);
                } else {
                    LittleEndian::read_u16_into(encoded, &mut words);
                }
                if signed {
                    SampleBuffer::I16(words.into_iter().map(|w| w as i16).collect())
                } else {
                    SampleBuffer::U16(words)
                }
            }
            32 => {
                if meta.float_pixel_data {
                    return Err(DecodeError::FloatPixelDataUnsupported);
                }
                let mut words = vec![0u32; encoded.len() / 4];
                if self.big_endian {
                    BigEndian::read_u32_into(encoded, &mut words);
                } else {
                    LittleEndian::read_u32_into(encoded, &mut words);
                }
                if signed {
                    SampleBuffer::I32(words.into_iter().map(|w| w as i32).collect())
                } else {
                    SampleBuffer::U32(words)
                }
            }
            other => return Err(DecodeError::UnsupportedBitsAllocated(other)),
        };

        Ok(ImageFrame::new(meta.clone(), samples))
    }
}

/// Unpacks 1-bit-per-pixel data into one byte per pixel (0 or 1),
/// least significant bit first within each byte.
fn unpack_bits(packed: &[u8], samples: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples);
    for index in 0..samples {
        let byte = packed[index / 8];
        out.push((byte >> (index % 8)) & 1);
    }
    out
}

/// Re-encodes 16-bit unsigned samples as little-endian bytes.
/// Inverse of the 16-bit little-endian decode path.
pub fn encode_u16_le(samples: &[u16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_u16_into(samples, &mut bytes);
    bytes
}
