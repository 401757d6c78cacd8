use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

use crate::error::DecodeError;

/// How raw samples map to visual color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotometricInterpretation {
    Monochrome1,
    Monochrome2,
    Rgb,
    YbrFull,
    YbrFull422,
    PaletteColor,
    Other(String),
}

impl PhotometricInterpretation {
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.trim_end_matches(['\0', ' ']) {
            "MONOCHROME1" => Self::Monochrome1,
            "MONOCHROME2" => Self::Monochrome2,
            "RGB" => Self::Rgb,
            "YBR_FULL" => Self::YbrFull,
            "YBR_FULL_422" => Self::YbrFull422,
            "PALETTE COLOR" => Self::PaletteColor,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Monochrome1 => "MONOCHROME1",
            Self::Monochrome2 => "MONOCHROME2",
            Self::Rgb => "RGB",
            Self::YbrFull => "YBR_FULL",
            Self::YbrFull422 => "YBR_FULL_422",
            Self::PaletteColor => "PALETTE COLOR",
            Self::Other(keyword) => keyword,
        }
    }

    pub fn is_monochrome(&self) -> bool {
        matches!(self, Self::Monochrome1 | Self::Monochrome2)
    }
}

impl std::fmt::Display for PhotometricInterpretation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelRepresentation {
    #[default]
    Unsigned,
    Signed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanarConfiguration {
    /// Samples interleaved per pixel (R1 G1 B1 R2 G2 B2 ...).
    #[default]
    Interleaved,
    /// One full plane per sample (R1..Rn G1..Gn B1..Bn).
    Planar,
}

/// Per-channel palette lookup table descriptor: (first mapped index,
/// number of entries, bits per entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaletteDescriptor {
    pub first_mapped: u16,
    pub entries: usize,
    pub bits_per_entry: u16,
}

impl PaletteDescriptor {
    fn from_triple(triple: &[i32]) -> Result<Self, DecodeError> {
        if triple.len() < 3 {
            return Err(DecodeError::PaletteLut(format!(
                "descriptor has {} values, expected 3",
                triple.len()
            )));
        }
        // An entry count of 0 means 2^16 entries per the standard.
        let entries = if triple[0] == 0 {
            1 << 16
        } else {
            triple[0] as usize
        };
        Ok(Self {
            first_mapped: triple[1] as u16,
            entries,
            bits_per_entry: triple[2] as u16,
        })
    }
}

/// Red/green/blue lookup tables for PALETTE COLOR frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteLut {
    pub red: PaletteDescriptor,
    pub green: PaletteDescriptor,
    pub blue: PaletteDescriptor,
    pub red_data: Vec<u16>,
    pub green_data: Vec<u16>,
    pub blue_data: Vec<u16>,
}

/// Metadata required to decode one frame's pixel bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub rows: u32,
    pub columns: u32,
    pub samples_per_pixel: u16,
    pub photometric: PhotometricInterpretation,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub pixel_representation: PixelRepresentation,
    pub planar_configuration: PlanarConfiguration,
    /// Set when the instance carries Float/DoubleFloat Pixel Data instead of
    /// integer samples; the raw 32-bit path rejects such frames.
    pub float_pixel_data: bool,
    pub palette: Option<PaletteLut>,
}

impl FrameMeta {
    pub fn pixel_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_allocated as usize).div_ceil(8)
    }

    /// Number of stored samples in one frame, adjusted for chroma subsampling:
    /// YBR_FULL_422 shares one (Cb, Cr) pair between two luma samples, so it
    /// stores two samples per pixel instead of three.
    pub fn stored_samples(&self) -> usize {
        match self.photometric {
            PhotometricInterpretation::YbrFull422 => self.pixel_count() * 2,
            _ => self.pixel_count() * self.samples_per_pixel as usize,
        }
    }

    /// Expected length in bytes of one frame's pixel data.
    pub fn expected_pixel_data_length(&self) -> usize {
        if self.bits_allocated == 1 {
            self.stored_samples().div_ceil(8)
        } else {
            self.stored_samples() * self.bytes_per_sample()
        }
    }

    /// Enforces the frame-length invariant. A mismatch is a decode error,
    /// never a silent truncation.
    pub fn validate_pixel_data_length(&self, actual: usize) -> Result<(), DecodeError> {
        let expected = self.expected_pixel_data_length();
        if actual != expected {
            return Err(DecodeError::PixelDataLength {
                expected,
                actual,
                rows: self.rows,
                columns: self.columns,
                samples: self.samples_per_pixel,
                bits: self.bits_allocated,
            });
        }
        Ok(())
    }

    /// Reads frame metadata from an in-memory DICOM data set, e.g. the output
    /// of the multiframe functional-group combiner.
    pub fn from_object(object: &InMemDicomObject) -> Result<Self, DecodeError> {
        let rows = required_u16(object, tags::ROWS, "Rows")? as u32;
        let columns = required_u16(object, tags::COLUMNS, "Columns")? as u32;
        let bits_allocated = required_u16(object, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let bits_stored =
            optional_u16(object, tags::BITS_STORED, "BitsStored")?.unwrap_or(bits_allocated);
        let samples_per_pixel =
            optional_u16(object, tags::SAMPLES_PER_PIXEL, "SamplesPerPixel")?.unwrap_or(1);

        let photometric = object
            .element(tags::PHOTOMETRIC_INTERPRETATION)
            .ok()
            .and_then(|element| element.to_str().ok())
            .map(|keyword| PhotometricInterpretation::from_keyword(&keyword))
            .unwrap_or(PhotometricInterpretation::Monochrome2);

        let pixel_representation =
            match optional_u16(object, tags::PIXEL_REPRESENTATION, "PixelRepresentation")? {
                Some(1) => PixelRepresentation::Signed,
                _ => PixelRepresentation::Unsigned,
            };
        let planar_configuration =
            match optional_u16(object, tags::PLANAR_CONFIGURATION, "PlanarConfiguration")? {
                Some(1) => PlanarConfiguration::Planar,
                _ => PlanarConfiguration::Interleaved,
            };

        let float_pixel_data = object.element(tags::FLOAT_PIXEL_DATA).is_ok()
            || object.element(tags::DOUBLE_FLOAT_PIXEL_DATA).is_ok();

        let palette = if photometric == PhotometricInterpretation::PaletteColor {
            Some(read_palette(object)?)
        } else {
            None
        };

        Ok(Self {
            rows,
            columns,
            samples_per_pixel,
            photometric,
            bits_allocated,
            bits_stored,
            pixel_representation,
            planar_configuration,
            float_pixel_data,
            palette,
        })
    }
}

fn required_u16(
    object: &InMemDicomObject,
    tag: dicom::core::Tag,
    name: &'static str,
) -> Result<u16, DecodeError> {
    optional_u16(object, tag, name)?.ok_or(DecodeError::MissingAttribute(name))
}

fn optional_u16(
    object: &InMemDicomObject,
    tag: dicom::core::Tag,
    name: &'static str,
) -> Result<Option<u16>, DecodeError> {
    match object.element(tag) {
        Ok(element) => element
            .to_int::<u16>()
            .map(Some)
            .map_err(|err| DecodeError::InvalidAttribute {
                name,
                detail: err.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn read_palette(object: &InMemDicomObject) -> Result<PaletteLut, DecodeError> {
    let red = palette_channel(
        object,
        tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
        tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        "red",
    )?;
    let green = palette_channel(
        object,
        tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
        tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        "green",
    )?;
    let blue = palette_channel(
        object,
        tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
        tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA,
        "blue",
    )?;
    Ok(PaletteLut {
        red: red.0,
        green: green.0,
        blue: blue.0,
        red_data: red.1,
        green_data: green.1,
        blue_data: blue.1,
    })
}

fn palette_channel(
    object: &InMemDicomObject,
    descriptor_tag: dicom::core::Tag,
    data_tag: dicom::core::Tag,
    channel: &str,
) -> Result<(PaletteDescriptor, Vec<u16>), DecodeError> {
    let descriptor = object
        .element(descriptor_tag)
        .map_err(|_| DecodeError::PaletteLut(format!("missing {channel} descriptor")))?
        .to_multi_int::<i32>()
        .map_err(|err| DecodeError::PaletteLut(format!("bad {channel} descriptor: {err}")))?;
    let descriptor = PaletteDescriptor::from_triple(&descriptor)?;

    let raw = object
        .element(data_tag)
        .map_err(|_| DecodeError::PaletteLut(format!("missing {channel} table data")))?
        .to_bytes()
        .map_err(|err| DecodeError::PaletteLut(format!("bad {channel} table data: {err}")))?;

    // Table data is stored as 16-bit little-endian words even for 8-bit entries.
    let mut data = Vec::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        data.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    if data.len() < descriptor.entries {
        // Some writers pack two 8-bit entries per word; unpack in that case.
        if descriptor.bits_per_entry == 8 && raw.len() >= descriptor.entries {
            data = raw.iter().map(|&byte| byte as u16).collect();
        } else {
            return Err(DecodeError::PaletteLut(format!(
                "{channel} table holds {} entries, descriptor declares {}",
                data.len(),
                descriptor.entries
            )));
        }
    }
    Ok((descriptor, data))
}

/// A decoded frame's typed sample storage.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBuffer {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
}

impl SampleBuffer {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        fn fold<T: Copy + PartialOrd + Into<f64>>(values: &[T]) -> Option<(f64, f64)> {
            values.iter().copied().fold(None, |acc, value| match acc {
                None => Some((value.into(), value.into())),
                Some((min, max)) => {
                    let v: f64 = value.into();
                    Some((min.min(v), max.max(v)))
                }
            })
        }
        match self {
            Self::U8(v) => fold(v),
            Self::I8(v) => fold(v),
            Self::U16(v) => fold(v),
            Self::I16(v) => fold(v),
            Self::U32(v) => fold(v),
            Self::I32(v) => fold(v),
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match self {
            Self::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match self {
            Self::U16(v) => Some(v),
            _ => None,
        }
    }

    /// Sample at `index` widened to f64, for presentation transforms.
    pub fn get(&self, index: usize) -> Option<f64> {
        match self {
            Self::U8(v) => v.get(index).map(|&x| x as f64),
            Self::I8(v) => v.get(index).map(|&x| x as f64),
            Self::U16(v) => v.get(index).map(|&x| x as f64),
            Self::I16(v) => v.get(index).map(|&x| x as f64),
            Self::U32(v) => v.get(index).map(|&x| x as f64),
            Self::I32(v) => v.get(index).map(|&x| x as f64),
        }
    }
}

/// One frame's decoded state: geometry, sample storage, and derived min/max.
///
/// Owned exclusively by the decode pipeline for the frame's lifetime; the
/// consuming [`crate::image::DecodedImage`] takes it over on assembly.
#[derive(Debug, Clone)]
pub struct ImageFrame {
    pub meta: FrameMeta,
    pub samples: SampleBuffer,
    pub min: f64,
    pub max: f64,
    /// Set when the codec's reported geometry disagreed with the DICOM
    /// metadata; the codec's geometry is in `meta`, the declared one here.
    pub declared_geometry_mismatch: Option<(u32, u32)>,
}

impl ImageFrame {
    pub fn new(meta: FrameMeta, samples: SampleBuffer) -> Self {
        let (min, max) = samples.min_max().unwrap_or((0.0, 0.0));
        Self {
            meta,
            samples,
            min,
            max,
            declared_geometry_mismatch: None,
        }
    }

    pub fn rows(&self) -> u32 {
        self.meta.rows
    }

    pub fn columns(&self) -> u32 {
        self.meta.columns
    }
}
