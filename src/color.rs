//! Color-space conversion for decoded frames.
//!
//! All converters are pure and allocation-explicit: the caller supplies a
//! pre-sized destination buffer, and a malformed source is rejected before
//! any byte is written.

use crate::error::DecodeError;
use crate::frame::{FrameMeta, PaletteLut, PhotometricInterpretation, SampleBuffer};

/// Whether a stored pixel buffer still needs color conversion.
///
/// Returns `false` when the buffer already matches an expanded RGBA layout
/// (`4 * rows * columns` bytes) regardless of the declared photometric
/// interpretation, so data a codec already expanded is never converted twice.
pub fn is_color_conversion_required(meta: &FrameMeta, pixel_data_length: usize) -> bool {
    let expanded_rgba = meta.pixel_count() * 4;
    if pixel_data_length == expanded_rgba {
        return false;
    }
    matches!(
        meta.photometric,
        PhotometricInterpretation::Rgb
            | PhotometricInterpretation::YbrFull
            | PhotometricInterpretation::YbrFull422
            | PhotometricInterpretation::PaletteColor
    )
}

fn channels(use_rgba: bool) -> usize {
    if use_rgba {
        4
    } else {
        3
    }
}

fn check_destination(dst: &[u8], pixels: usize, use_rgba: bool) -> Result<(), DecodeError> {
    let expected = pixels * channels(use_rgba);
    if dst.len() < expected {
        return Err(DecodeError::DestinationTooSmall {
            expected,
            actual: dst.len(),
        });
    }
    Ok(())
}

/// Reorders interleaved RGB samples into RGB(A).
pub fn rgb_by_pixel(src: &[u8], dst: &mut [u8], use_rgba: bool) -> Result<(), DecodeError> {
    if src.len() % 3 != 0 {
        return Err(DecodeError::BufferNotDivisible {
            context: "RGB by-pixel conversion",
            len: src.len(),
            divisor: 3,
        });
    }
    let pixels = src.len() / 3;
    check_destination(dst, pixels, use_rgba)?;

    let step = channels(use_rgba);
    for (pixel, chunk) in src.chunks_exact(3).enumerate() {
        let out = &mut dst[pixel * step..pixel * step + step];
        out[0] = chunk[0];
        out[1] = chunk[1];
        out[2] = chunk[2];
        if use_rgba {
            out[3] = 255;
        }
    }
    Ok(())
}

/// Reorders planar RGB samples (R plane, G plane, B plane) into RGB(A).
pub fn rgb_by_plane(src: &[u8], dst: &mut [u8], use_rgba: bool) -> Result<(), DecodeError> {
    if src.len() % 3 != 0 {
        return Err(DecodeError::BufferNotDivisible {
            context: "RGB by-plane conversion",
            len: src.len(),
            divisor: 3,
        });
    }
    let pixels = src.len() / 3;
    check_destination(dst, pixels, use_rgba)?;

    let (r_plane, rest) = src.split_at(pixels);
    let (g_plane, b_plane) = rest.split_at(pixels);
    let step = channels(use_rgba);
    for idx in 0..pixels {
        let out = &mut dst[idx * step..idx * step + step];
        out[0] = r_plane[idx];
        out[1] = g_plane[idx];
        out[2] = b_plane[idx];
        if use_rgba {
            out[3] = 255;
        }
    }
    Ok(())
}

// ITU-R BT.601 full-range coefficients.
fn ybr_to_rgb_pixel(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_14 * cb - 0.714_14 * cr;
    let b = y + 1.772 * cb;
    [
        r.clamp(0.0, 255.0).round() as u8,
        g.clamp(0.0, 255.0).round() as u8,
        b.clamp(0.0, 255.0).round() as u8,
    ]
}

/// Converts interleaved YBR_FULL (Y Cb Cr per pixel) samples to RGB(A).
pub fn ybr_full_to_rgb(src: &[u8], dst: &mut [u8], use_rgba: bool) -> Result<(), DecodeError> {
    if src.len() % 3 != 0 {
        return Err(DecodeError::BufferNotDivisible {
            context: "YBR_FULL conversion",
            len: src.len(),
            divisor: 3,
        });
    }
    let pixels = src.len() / 3;
    check_destination(dst, pixels, use_rgba)?;

    let step = channels(use_rgba);
    for (pixel, chunk) in src.chunks_exact(3).enumerate() {
        let rgb = ybr_to_rgb_pixel(chunk[0], chunk[1], chunk[2]);
        let out = &mut dst[pixel * step..pixel * step + step];
        out[..3].copy_from_slice(&rgb);
        if use_rgba {
            out[3] = 255;
        }
    }
    Ok(())
}

/// Converts YBR_FULL_422 (Y0 Y1 Cb Cr groups, 2:1 horizontal chroma
/// subsampling) samples to RGB(A). Both output pixels of a group share the
/// same (Cb, Cr) pair and differ only in their own luma.
pub fn ybr_full_422_to_rgb(src: &[u8], dst: &mut [u8], use_rgba: bool) -> Result<(), DecodeError> {
    if src.len() % 4 != 0 {
        return Err(DecodeError::BufferNotDivisible {
            context: "YBR_FULL_422 conversion",
            len: src.len(),
            divisor: 4,
        });
    }
    let pixels = src.len() / 4 * 2;
    check_destination(dst, pixels, use_rgba)?;

    let step = channels(use_rgba);
    for (group, chunk) in src.chunks_exact(4).enumerate() {
        let (cb, cr) = (chunk[2], chunk[3]);
        for (offset, &y) in chunk[..2].iter().enumerate() {
            let pixel = group * 2 + offset;
            let rgb = ybr_to_rgb_pixel(y, cb, cr);
            let out = &mut dst[pixel * step..pixel * step + step];
            out[..3].copy_from_slice(&rgb);
            if use_rgba {
                out[3] = 255;
            }
        }
    }
    Ok(())
}

fn palette_entry(index: u16, descriptor: &crate::frame::PaletteDescriptor, data: &[u16]) -> u8 {
    let position = index
        .saturating_sub(descriptor.first_mapped)
        .min(descriptor.entries.saturating_sub(1) as u16) as usize;
    let entry = data.get(position).copied().unwrap_or(0);
    if descriptor.bits_per_entry > 8 {
        (entry >> (descriptor.bits_per_entry - 8)) as u8
    } else {
        entry as u8
    }
}

/// Looks up each index sample in the red/green/blue palette tables.
pub fn palette_to_rgb(
    indices: &SampleBuffer,
    lut: &PaletteLut,
    dst: &mut [u8],
    use_rgba: bool,
) -> Result<(), DecodeError> {
    let pixels = indices.len();
    check_destination(dst, pixels, use_rgba)?;

    let index_at = |pixel: usize| -> Result<u16, DecodeError> {
        match indices {
            SampleBuffer::U8(v) => Ok(v[pixel] as u16),
            SampleBuffer::U16(v) => Ok(v[pixel]),
            _ => Err(DecodeError::PaletteLut(
                "palette indices must be 8 or 16-bit unsigned".to_string(),
            )),
        }
    };

    let step = channels(use_rgba);
    for pixel in 0..pixels {
        let index = index_at(pixel)?;
        let out = &mut dst[pixel * step..pixel * step + step];
        out[0] = palette_entry(index, &lut.red, &lut.red_data);
        out[1] = palette_entry(index, &lut.green, &lut.green_data);
        out[2] = palette_entry(index, &lut.blue, &lut.blue_data);
        if use_rgba {
            out[3] = 255;
        }
    }
    Ok(())
}
