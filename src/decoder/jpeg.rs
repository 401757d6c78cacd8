use std::io::Cursor;

use jpeg_decoder::PixelFormat;
use log::warn;

use crate::decoder::{DecodeOptions, PixelDecoder};
use crate::error::DecodeError;
use crate::frame::{FrameMeta, ImageFrame, PixelRepresentation, SampleBuffer};

/// Decoder for the JPEG family carried by DICOM: baseline (process 1),
/// extended (2 & 4), and lossless (14 / SV1).
///
/// The codec is authoritative for geometry and precision; DICOM metadata is
/// only consulted for signedness, and a geometry disagreement is surfaced
/// rather than rejected.
pub struct JpegDecoder;

impl PixelDecoder for JpegDecoder {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        _options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError> {
        let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(encoded));
        decoder.read_info().map_err(|err| DecodeError::MalformedBitstream {
            codec: "jpeg",
            detail: err.to_string(),
        })?;
        let info = decoder.info().ok_or_else(|| DecodeError::MalformedBitstream {
            codec: "jpeg",
            detail: "decoder reported no image info".to_string(),
        })?;
        let pixels = decoder.decode().map_err(|err| DecodeError::MalformedBitstream {
            codec: "jpeg",
            detail: err.to_string(),
        })?;

        let signed = meta.pixel_representation == PixelRepresentation::Signed;
        let (samples, samples_per_pixel, bits_allocated) = match info.pixel_format {
            PixelFormat::L8 => (SampleBuffer::U8(pixels), 1, 8),
            PixelFormat::L16 => {
                // 16-bit luminance is emitted as big-endian byte pairs.
                let words: Vec<u16> = pixels
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                let buffer = if signed {
                    SampleBuffer::I16(words.into_iter().map(|w| w as i16).collect())
                } else {
                    SampleBuffer::U16(words)
                };
                (buffer, 1, 16)
            }
            PixelFormat::RGB24 => (SampleBuffer::U8(pixels), 3, 8),
            PixelFormat::CMYK32 => {
                return Err(DecodeError::UnsupportedCodecOutput {
                    codec: "jpeg",
                    detail: "CMYK output has no DICOM photometric mapping".to_string(),
                })
            }
        };

        let mut out_meta = meta.clone();
        out_meta.samples_per_pixel = samples_per_pixel;
        out_meta.bits_allocated = bits_allocated;

        let mut mismatch = None;
        let (width, height) = (info.width as u32, info.height as u32);
        if width != meta.columns || height != meta.rows {
            warn!(
                "jpeg codestream is {width}x{height}, data set declares {}x{}; using the codestream",
                meta.columns, meta.rows
            );
            mismatch = Some((meta.rows, meta.columns));
        }
        out_meta.rows = height;
        out_meta.columns = width;

        let mut frame = ImageFrame::new(out_meta, samples);
        frame.declared_geometry_mismatch = mismatch;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PhotometricInterpretation, PlanarConfiguration};

    fn meta() -> FrameMeta {
        FrameMeta {
            rows: 1,
            columns: 1,
            samples_per_pixel: 1,
            photometric: PhotometricInterpretation::Monochrome2,
            bits_allocated: 8,
            bits_stored: 8,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            float_pixel_data: false,
            palette: None,
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = JpegDecoder
            .decode(&[0u8; 32], &meta(), &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBitstream { codec: "jpeg", .. }));
    }

    #[test]
    fn truncated_marker_is_a_decode_error() {
        // SOI then nothing.
        let err = JpegDecoder
            .decode(&[0xFF, 0xD8], &meta(), &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBitstream { .. }));
    }
}
