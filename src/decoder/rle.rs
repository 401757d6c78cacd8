use log::warn;

use crate::decoder::{DecodeOptions, PixelDecoder};
use crate::error::DecodeError;
use crate::frame::{
    FrameMeta, ImageFrame, PixelRepresentation, PlanarConfiguration, SampleBuffer,
};

const HEADER_LEN: usize = 64;
const MAX_SEGMENTS: usize = 15;

/// Decoder for RLE Lossless (PackBits segments behind a 64-byte header).
pub struct RleDecoder;

impl PixelDecoder for RleDecoder {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        _options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError> {
        if encoded.len() < HEADER_LEN {
            return Err(DecodeError::MalformedBitstream {
                codec: "rle",
                detail: format!("frame holds {} bytes, header needs {HEADER_LEN}", encoded.len()),
            });
        }

        let segment_count = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        if segment_count == 0 || segment_count > MAX_SEGMENTS {
            return Err(DecodeError::MalformedBitstream {
                codec: "rle",
                detail: format!("segment count {segment_count} out of range 1..={MAX_SEGMENTS}"),
            });
        }

        let mut offsets = Vec::with_capacity(segment_count);
        for segment in 0..segment_count {
            let at = 4 + segment * 4;
            let offset = u32::from_le_bytes([
                encoded[at],
                encoded[at + 1],
                encoded[at + 2],
                encoded[at + 3],
            ]) as usize;
            if offset < HEADER_LEN || offset >= encoded.len() {
                return Err(DecodeError::MalformedBitstream {
                    codec: "rle",
                    detail: format!("segment {segment} offset {offset} is out of bounds"),
                });
            }
            offsets.push(offset);
        }
        // Segments are stored back to back, so offsets must ascend.
        if offsets.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(DecodeError::MalformedBitstream {
                codec: "rle",
                detail: "segment offsets are not strictly increasing".to_string(),
            });
        }

        let segment_len = meta.pixel_count();
        let mut planes = Vec::with_capacity(segment_count);
        for (segment, &start) in offsets.iter().enumerate() {
            let end = offsets.get(segment + 1).copied().unwrap_or(encoded.len());
            planes.push(unpack_segment(&encoded[start..end], segment_len, segment)?);
        }

        let bytes_per_sample = meta.bytes_per_sample();
        let samples_per_pixel = meta.samples_per_pixel as usize;
        let expected_segments = samples_per_pixel * bytes_per_sample;
        if segment_count != expected_segments {
            return Err(DecodeError::MalformedBitstream {
                codec: "rle",
                detail: format!(
                    "{segment_count} segment(s) for {samples_per_pixel} sample(s)/pixel \
                     at {} bits allocated (expected {expected_segments})",
                    meta.bits_allocated
                ),
            });
        }

        let signed = meta.pixel_representation == PixelRepresentation::Signed;
        let samples = match bytes_per_sample {
            1 => compose_8bit(&planes, segment_len, samples_per_pixel, signed),
            2 => compose_16bit(&planes, segment_len, samples_per_pixel, signed),
            other => {
                warn!("RLE frame with {other} bytes/sample is not representable");
                return Err(DecodeError::UnsupportedBitsAllocated(meta.bits_allocated));
            }
        };

        // Segments are planar by definition; the composed buffer is interleaved.
        let mut out_meta = meta.clone();
        out_meta.planar_configuration = PlanarConfiguration::Interleaved;
        Ok(ImageFrame::new(out_meta, samples))
    }
}

/// PackBits: a control byte `n` either copies `n + 1` literals (0..=127),
/// repeats the next byte `257 - n` times (129..=255), or is a no-op (128).
fn unpack_segment(data: &[u8], expected: usize, segment: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(expected);
    let mut pos = 0;
    while out.len() < expected {
        let Some(&control) = data.get(pos) else {
            return Err(DecodeError::MalformedBitstream {
                codec: "rle",
                detail: format!(
                    "segment {segment} ended after {} of {expected} bytes",
                    out.len()
                ),
            });
        };
        pos += 1;
        match control {
            0..=127 => {
                let count = control as usize + 1;
                let literals = data.get(pos..pos + count).ok_or_else(|| {
                    DecodeError::MalformedBitstream {
                        codec: "rle",
                        detail: format!("segment {segment} literal run overflows its data"),
                    }
                })?;
                out.extend_from_slice(literals);
                pos += count;
            }
            129..=255 => {
                let count = 257 - control as usize;
                let Some(&value) = data.get(pos) else {
                    return Err(DecodeError::MalformedBitstream {
                        codec: "rle",
                        detail: format!("segment {segment} replicate run has no value byte"),
                    });
                };
                pos += 1;
                out.resize(out.len() + count, value);
            }
            128 => {}
        }
    }
    if out.len() > expected {
        out.truncate(expected);
    }
    Ok(out)
}

fn compose_8bit(
    planes: &[Vec<u8>],
    pixels: usize,
    samples_per_pixel: usize,
    signed: bool,
) -> SampleBuffer {
    if samples_per_pixel == 1 {
        let plane = planes[0].clone();
        return if signed {
            SampleBuffer::I8(plane.into_iter().map(|b| b as i8).collect())
        } else {
            SampleBuffer::U8(plane)
        };
    }
    let mut out = Vec::with_capacity(pixels * samples_per_pixel);
    for pixel in 0..pixels {
        for plane in planes.iter().take(samples_per_pixel) {
            out.push(plane[pixel]);
        }
    }
    SampleBuffer::U8(out)
}

/// 16-bit samples arrive as an MSB segment followed by an LSB segment
/// (per composite sample, per plane).
fn compose_16bit(
    planes: &[Vec<u8>],
    pixels: usize,
    samples_per_pixel: usize,
    signed: bool,
) -> SampleBuffer {
    let mut words = Vec::with_capacity(pixels * samples_per_pixel);
    for pixel in 0..pixels {
        for sample in 0..samples_per_pixel {
            let msb = planes[sample * 2][pixel] as u16;
            let lsb = planes[sample * 2 + 1][pixel] as u16;
            words.push((msb << 8) | lsb);
        }
    }
    if signed {
        SampleBuffer::I16(words.into_iter().map(|w| w as i16).collect())
    } else {
        SampleBuffer::U16(words)
    }
}
