//! Final image assembly: presentation transforms over a decoded frame and a
//! lazily rendered RGBA canvas.

use std::sync::OnceLock;

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use crate::color;
use crate::error::DecodeError;
use crate::frame::{ImageFrame, PhotometricInterpretation, PlanarConfiguration};

/// Modality rescale: maps stored values to output units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Rescale {
    pub fn apply(&self, value: f64) -> f64 {
        value * self.slope + self.intercept
    }
}

/// VOI window over rescaled values, using the linear function from the
/// grayscale presentation model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiWindow {
    pub center: f64,
    pub width: f64,
}

impl VoiWindow {
    pub fn apply(&self, value: f64) -> u8 {
        let center = self.center - 0.5;
        let half = (self.width - 1.0) / 2.0;
        if value <= center - half {
            0
        } else if value > center + half {
            255
        } else {
            (((value - center) / (self.width - 1.0) + 0.5) * 255.0)
                .clamp(0.0, 255.0)
                .round() as u8
        }
    }
}

/// Reads rescale and windowing attributes from a data set. Absent attributes
/// fall back to the identity rescale and no window; a multi-valued window
/// uses its first pair.
pub fn presentation_from_object(object: &InMemDicomObject) -> (Rescale, Option<VoiWindow>) {
    let first_f64 = |tag| {
        object
            .element(tag)
            .ok()
            .and_then(|element| element.to_multi_float64().ok())
            .and_then(|values| values.first().copied())
    };

    let rescale = Rescale {
        slope: first_f64(tags::RESCALE_SLOPE).unwrap_or(1.0),
        intercept: first_f64(tags::RESCALE_INTERCEPT).unwrap_or(0.0),
    };
    let window = match (
        first_f64(tags::WINDOW_CENTER),
        first_f64(tags::WINDOW_WIDTH),
    ) {
        (Some(center), Some(width)) if width >= 1.0 => Some(VoiWindow { center, width }),
        _ => None,
    };
    (rescale, window)
}

/// A decoded frame plus its presentation state, rendering to an 8-bit RGBA
/// canvas on first use and caching the result.
#[derive(Debug)]
pub struct DecodedImage {
    frame: ImageFrame,
    pub rescale: Rescale,
    pub window: Option<VoiWindow>,
    rgba_cache: OnceLock<Vec<u8>>,
}

impl DecodedImage {
    pub fn new(frame: ImageFrame) -> Self {
        Self::with_presentation(frame, Rescale::default(), None)
    }

    pub fn with_presentation(frame: ImageFrame, rescale: Rescale, window: Option<VoiWindow>) -> Self {
        Self {
            frame,
            rescale,
            window,
            rgba_cache: OnceLock::new(),
        }
    }

    pub fn rows(&self) -> u32 {
        self.frame.rows()
    }

    pub fn columns(&self) -> u32 {
        self.frame.columns()
    }

    pub fn frame(&self) -> &ImageFrame {
        &self.frame
    }

    /// The frame rendered as interleaved 8-bit RGBA, row-major.
    ///
    /// The canvas is produced on the first call and reused afterwards;
    /// changing `window` or `rescale` after a render has no effect on the
    /// cached canvas.
    pub fn to_rgba8(&self) -> Result<&[u8], DecodeError> {
        if let Some(cached) = self.rgba_cache.get() {
            return Ok(cached);
        }
        let rendered = self.render()?;
        Ok(self.rgba_cache.get_or_init(|| rendered))
    }

    fn render(&self) -> Result<Vec<u8>, DecodeError> {
        if self.frame.meta.photometric.is_monochrome() {
            self.render_monochrome()
        } else {
            self.render_color()
        }
    }

    fn render_monochrome(&self) -> Result<Vec<u8>, DecodeError> {
        let invert = self.frame.meta.photometric == PhotometricInterpretation::Monochrome1;
        let count = self.frame.samples.len();
        let (min, max) = (
            self.rescale.apply(self.frame.min),
            self.rescale.apply(self.frame.max),
        );

        let mut rgba = Vec::with_capacity(count * 4);
        for index in 0..count {
            let value = self
                .frame
                .samples
                .get(index)
                .map(|sample| self.rescale.apply(sample))
                .unwrap_or(0.0);
            let mut gray = match &self.window {
                Some(window) => window.apply(value),
                None => normalize(value, min, max),
            };
            if invert {
                gray = 255 - gray;
            }
            rgba.extend_from_slice(&[gray, gray, gray, 255]);
        }
        Ok(rgba)
    }

    fn render_color(&self) -> Result<Vec<u8>, DecodeError> {
        let meta = &self.frame.meta;
        let pixels = meta.pixel_count();

        // A codec may hand back an already expanded RGBA canvas.
        if let Some(bytes) = self.frame.samples.as_u8() {
            if !color::is_color_conversion_required(meta, bytes.len()) {
                return Ok(bytes.to_vec());
            }
        }

        let mut rgba = vec![0u8; pixels * 4];
        match &meta.photometric {
            PhotometricInterpretation::PaletteColor => {
                let lut = meta
                    .palette
                    .as_ref()
                    .ok_or_else(|| DecodeError::PaletteLut("no lookup table loaded".to_string()))?;
                color::palette_to_rgb(&self.frame.samples, lut, &mut rgba, true)?;
            }
            photometric => {
                let src = self.frame.samples.as_u8().ok_or_else(|| {
                    DecodeError::UnsupportedCodecOutput {
                        codec: "assembly",
                        detail: format!("{}-bit {} samples", meta.bits_allocated, photometric),
                    }
                })?;
                match photometric {
                    PhotometricInterpretation::Rgb => match meta.planar_configuration {
                        PlanarConfiguration::Interleaved => {
                            color::rgb_by_pixel(src, &mut rgba, true)?
                        }
                        PlanarConfiguration::Planar => color::rgb_by_plane(src, &mut rgba, true)?,
                    },
                    PhotometricInterpretation::YbrFull => {
                        color::ybr_full_to_rgb(src, &mut rgba, true)?
                    }
                    PhotometricInterpretation::YbrFull422 => {
                        color::ybr_full_422_to_rgb(src, &mut rgba, true)?
                    }
                    other => {
                        return Err(DecodeError::InvalidAttribute {
                            name: "PhotometricInterpretation",
                            detail: format!("cannot render `{other}`"),
                        })
                    }
                }
            }
        }
        Ok(rgba)
    }
}

fn normalize(value: f64, min: f64, max: f64) -> u8 {
    if max <= min {
        return 0;
    }
    (((value - min) / (max - min)) * 255.0)
        .clamp(0.0, 255.0)
        .round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        FrameMeta, PixelRepresentation, PlanarConfiguration, SampleBuffer,
    };

    fn mono_frame(photometric: PhotometricInterpretation, samples: Vec<u16>) -> ImageFrame {
        let meta = FrameMeta {
            rows: 1,
            columns: samples.len() as u32,
            samples_per_pixel: 1,
            photometric,
            bits_allocated: 16,
            bits_stored: 16,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            float_pixel_data: false,
            palette: None,
        };
        ImageFrame::new(meta, SampleBuffer::U16(samples))
    }

    #[test]
    fn default_render_normalizes_to_full_range() {
        let image = DecodedImage::new(mono_frame(
            PhotometricInterpretation::Monochrome2,
            vec![100, 300, 500],
        ));
        let rgba = image.to_rgba8().unwrap();
        assert_eq!(rgba.len(), 12);
        assert_eq!(&rgba[..4], &[0, 0, 0, 255]);
        assert_eq!(&rgba[4..8], &[128, 128, 128, 255]);
        assert_eq!(&rgba[8..], &[255, 255, 255, 255]);
    }

    #[test]
    fn monochrome1_inverts() {
        let image = DecodedImage::new(mono_frame(
            PhotometricInterpretation::Monochrome1,
            vec![100, 500],
        ));
        let rgba = image.to_rgba8().unwrap();
        assert_eq!(rgba[0], 255);
        assert_eq!(rgba[4], 0);
    }

    #[test]
    fn window_clips_and_centers() {
        let window = VoiWindow {
            center: 100.0,
            width: 101.0,
        };
        assert_eq!(window.apply(0.0), 0);
        assert_eq!(window.apply(200.0), 255);
        assert_eq!(window.apply(99.5), 128);
    }

    #[test]
    fn rescale_shifts_into_window() {
        let frame = mono_frame(PhotometricInterpretation::Monochrome2, vec![0, 1000]);
        let image = DecodedImage::with_presentation(
            frame,
            Rescale {
                slope: 1.0,
                intercept: -1024.0,
            },
            Some(VoiWindow {
                center: -500.0,
                width: 2000.0,
            }),
        );
        let rgba = image.to_rgba8().unwrap();
        // -1024 and -24, both inside the window, in ascending order.
        assert!(rgba[0] < rgba[4]);
        assert!(rgba[0] > 0 && rgba[4] < 255);
    }

    #[test]
    fn canvas_is_rendered_once() {
        let image = DecodedImage::new(mono_frame(
            PhotometricInterpretation::Monochrome2,
            vec![1, 2],
        ));
        let first = image.to_rgba8().unwrap().as_ptr();
        let second = image.to_rgba8().unwrap().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn expanded_rgba_passes_through() {
        let mut meta = mono_frame(PhotometricInterpretation::Rgb, vec![0]).meta;
        meta.rows = 1;
        meta.columns = 2;
        meta.samples_per_pixel = 3;
        meta.bits_allocated = 8;
        let bytes = vec![1, 2, 3, 255, 4, 5, 6, 255];
        let frame = ImageFrame::new(meta, SampleBuffer::U8(bytes.clone()));
        let image = DecodedImage::new(frame);
        assert_eq!(image.to_rgba8().unwrap(), &bytes[..]);
    }

    #[test]
    fn interleaved_rgb_gains_alpha() {
        let mut meta = mono_frame(PhotometricInterpretation::Rgb, vec![0]).meta;
        meta.rows = 1;
        meta.columns = 2;
        meta.samples_per_pixel = 3;
        meta.bits_allocated = 8;
        let frame = ImageFrame::new(meta, SampleBuffer::U8(vec![1, 2, 3, 4, 5, 6]));
        let image = DecodedImage::new(frame);
        assert_eq!(
            image.to_rgba8().unwrap(),
            &[1, 2, 3, 255, 4, 5, 6, 255]
        );
    }

    #[test]
    fn presentation_defaults_when_attributes_absent() {
        let object = InMemDicomObject::new_empty();
        let (rescale, window) = presentation_from_object(&object);
        assert_eq!(rescale, Rescale::default());
        assert!(window.is_none());
    }
}
