use jpeg2k::{DecodeParameters, Image};
use log::{debug, warn};

use crate::decoder::{DecodeOptions, PixelDecoder};
use crate::error::DecodeError;
use crate::frame::{FrameMeta, ImageFrame, PixelRepresentation, SampleBuffer};

const MARKER_SOC: u8 = 0x4F;
const MARKER_SIZ: u8 = 0x51;
const MARKER_COD: u8 = 0x52;
const MARKER_SOD: u8 = 0x93;

/// Decoder for JPEG 2000 and HTJ2K codestreams.
///
/// Supports partial decode at a caller-requested decomposition level for
/// low-resolution previews; the request is clamped to what the codestream's
/// COD segment advertises.
pub struct Jpeg2000Decoder;

impl PixelDecoder for Jpeg2000Decoder {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError> {
        let available = decomposition_levels(encoded).unwrap_or(0);
        let requested = options.decode_level.unwrap_or(0);
        let reduce = requested.min(available);
        if requested > available {
            debug!("requested decomposition level {requested} clamped to {available}");
        }

        let params = DecodeParameters::new().reduce(reduce as u32);
        let image = Image::from_bytes_with(encoded, params).map_err(|err| {
            DecodeError::MalformedBitstream {
                codec: "jpeg2000",
                detail: err.to_string(),
            }
        })?;

        let components = image.components();
        let signed = meta.pixel_representation == PixelRepresentation::Signed;
        let (samples, samples_per_pixel, bits_allocated, width, height) = match components {
            [] => {
                return Err(DecodeError::MalformedBitstream {
                    codec: "jpeg2000",
                    detail: "codestream decoded to zero components".to_string(),
                })
            }
            [gray] => {
                let width = gray.width();
                let height = gray.height();
                let precision = gray.precision();
                let buffer = if precision <= 8 {
                    SampleBuffer::U8(gray.data().iter().map(|&v| v as u8).collect())
                } else if signed {
                    SampleBuffer::I16(gray.data().iter().map(|&v| v as i16).collect())
                } else {
                    SampleBuffer::U16(gray.data().iter().map(|&v| v as u16).collect())
                };
                let bits = if precision <= 8 { 8 } else { 16 };
                (buffer, 1u16, bits, width, height)
            }
            [r, g, b, ..] => {
                if components.len() > 3 {
                    warn!(
                        "jpeg2000 codestream has {} components; using the first three",
                        components.len()
                    );
                }
                if r.precision() > 8 {
                    return Err(DecodeError::UnsupportedCodecOutput {
                        codec: "jpeg2000",
                        detail: format!("{}-bit color components", r.precision()),
                    });
                }
                let width = r.width();
                let height = r.height();
                // Chroma-subsampled codestreams size each component to its
                // own grid; interleaving needs all three on the same one.
                for component in [g, b] {
                    if component.width() != width || component.height() != height {
                        return Err(DecodeError::UnsupportedCodecOutput {
                            codec: "jpeg2000",
                            detail: format!(
                                "subsampled component ({}x{} vs {width}x{height})",
                                component.width(),
                                component.height()
                            ),
                        });
                    }
                }
                let pixels = width as usize * height as usize;
                let interleaved = interleave_rgb(r.data(), g.data(), b.data(), pixels)?;
                (SampleBuffer::U8(interleaved), 3, 8, width, height)
            }
            [_, _] => {
                return Err(DecodeError::UnsupportedCodecOutput {
                    codec: "jpeg2000",
                    detail: "two-component codestream".to_string(),
                })
            }
        };

        let mut out_meta = meta.clone();
        out_meta.samples_per_pixel = samples_per_pixel;
        out_meta.bits_allocated = bits_allocated;
        out_meta.rows = height;
        out_meta.columns = width;

        // At reduce == 0 the codec geometry must agree with the data set;
        // at reduced levels a smaller grid is expected and not a mismatch.
        let mut mismatch = None;
        if reduce == 0 && (width != meta.columns || height != meta.rows) {
            warn!(
                "jpeg2000 codestream is {width}x{height}, data set declares {}x{}; \
                 using the codestream",
                meta.columns, meta.rows
            );
            mismatch = Some((meta.rows, meta.columns));
        }

        let mut frame = ImageFrame::new(out_meta, samples);
        frame.declared_geometry_mismatch = mismatch;
        Ok(frame)
    }
}

fn interleave_rgb(
    r: &[i32],
    g: &[i32],
    b: &[i32],
    pixels: usize,
) -> Result<Vec<u8>, DecodeError> {
    if r.len() < pixels || g.len() < pixels || b.len() < pixels {
        return Err(DecodeError::UnsupportedCodecOutput {
            codec: "jpeg2000",
            detail: format!(
                "component buffers ({}, {}, {}) hold fewer than {pixels} samples",
                r.len(),
                g.len(),
                b.len()
            ),
        });
    }
    let mut interleaved = Vec::with_capacity(pixels * 3);
    for index in 0..pixels {
        interleaved.push(r[index] as u8);
        interleaved.push(g[index] as u8);
        interleaved.push(b[index] as u8);
    }
    Ok(interleaved)
}

/// Number of decomposition levels advertised by the first COD segment,
/// or `None` when the codestream cannot be walked that far.
pub fn decomposition_levels(encoded: &[u8]) -> Option<u8> {
    let soc = find_soc(encoded)?;
    let mut pos = soc + 2;
    while pos + 4 <= encoded.len() {
        if encoded[pos] != 0xFF {
            return None;
        }
        let code = encoded[pos + 1];
        if code == MARKER_SOD {
            return None;
        }
        let length = u16::from_be_bytes([encoded[pos + 2], encoded[pos + 3]]) as usize;
        if code == MARKER_COD {
            // Scod (1) + SGcod (4), then SPcod starts with the level count.
            return encoded.get(pos + 4 + 5).copied();
        }
        pos += 2 + length;
    }
    None
}

/// Locates the SOC marker, skipping a JP2 container signature when present.
fn find_soc(encoded: &[u8]) -> Option<usize> {
    if encoded.len() >= 4 && encoded[0] == 0xFF && encoded[1] == MARKER_SOC {
        return Some(0);
    }
    // JP2 box wrapping: scan for SOC immediately followed by SIZ.
    encoded.windows(4).position(|window| {
        window[0] == 0xFF && window[1] == MARKER_SOC && window[2] == 0xFF && window[3] == MARKER_SIZ
    })
}
