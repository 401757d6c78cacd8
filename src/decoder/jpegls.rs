//! JPEG-LS (ITU-T T.87) decoding for the 1.2.840.10008.1.2.4.80/.81
//! transfer syntaxes: lossless and near-lossless, single component,
//! 2 to 16 bits per sample.

use log::warn;

use crate::decoder::{DecodeOptions, PixelDecoder};
use crate::error::DecodeError;
use crate::frame::{FrameMeta, ImageFrame, PixelRepresentation, SampleBuffer};

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOF55: u8 = 0xF7;
const MARKER_LSE: u8 = 0xF8;
const MARKER_SOS: u8 = 0xDA;

const DEFAULT_RESET: i32 = 64;
const MIN_C: i32 = -128;
const MAX_C: i32 = 127;

// Run-length code order table, T.87 A.7.1.1.
const J: [i32; 32] = [
    0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 9, 10, 11, 12, 13,
    14, 15,
];

pub struct JpegLsDecoder;

impl PixelDecoder for JpegLsDecoder {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        _options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError> {
        let header = Header::parse(encoded)?;
        let samples = Scan::new(&header).decode(&encoded[header.data_start..])?;

        let signed = meta.pixel_representation == PixelRepresentation::Signed;
        let buffer = if header.precision <= 8 {
            SampleBuffer::U8(samples.into_iter().map(|v| v as u8).collect())
        } else if signed {
            SampleBuffer::I16(samples.into_iter().map(|v| v as u16 as i16).collect())
        } else {
            SampleBuffer::U16(samples.into_iter().map(|v| v as u16).collect())
        };

        let mut out_meta = meta.clone();
        out_meta.samples_per_pixel = 1;
        out_meta.bits_allocated = if header.precision <= 8 { 8 } else { 16 };
        out_meta.bits_stored = header.precision as u16;
        out_meta.rows = header.height;
        out_meta.columns = header.width;

        let mut mismatch = None;
        if header.width != meta.columns || header.height != meta.rows {
            warn!(
                "jpeg-ls codestream is {}x{}, data set declares {}x{}; using the codestream",
                header.width, header.height, meta.columns, meta.rows
            );
            mismatch = Some((meta.rows, meta.columns));
        }

        let mut frame = ImageFrame::new(out_meta, buffer);
        frame.declared_geometry_mismatch = mismatch;
        Ok(frame)
    }
}

fn malformed(detail: impl Into<String>) -> DecodeError {
    DecodeError::MalformedBitstream {
        codec: "jpeg-ls",
        detail: detail.into(),
    }
}

struct Header {
    width: u32,
    height: u32,
    precision: u8,
    near: i32,
    maxval: i32,
    t1: i32,
    t2: i32,
    t3: i32,
    reset: i32,
    data_start: usize,
}

impl Header {
    fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 || data[0] != 0xFF || data[1] != MARKER_SOI {
            return Err(malformed("missing SOI marker"));
        }

        let mut pos = 2;
        let mut frame: Option<(u32, u32, u8)> = None;
        let mut preset: Option<(i32, i32, i32, i32, i32)> = None;

        loop {
            if pos + 2 > data.len() {
                return Err(malformed("codestream ended before SOS"));
            }
            if data[pos] != 0xFF {
                return Err(malformed(format!("expected marker at offset {pos}")));
            }
            let code = data[pos + 1];
            pos += 2;
            if code == MARKER_EOI {
                return Err(malformed("EOI before any scan"));
            }

            let length = read_u16(data, pos)? as usize;
            if length < 2 || pos + length > data.len() {
                return Err(malformed(format!("marker 0xFF{code:02X} has bad length")));
            }
            let segment = &data[pos + 2..pos + length];

            match code {
                MARKER_SOF55 => {
                    if segment.len() < 6 {
                        return Err(malformed("SOF55 segment too short"));
                    }
                    let precision = segment[0];
                    if !(2..=16).contains(&precision) {
                        return Err(malformed(format!("precision {precision} out of range")));
                    }
                    let height = u16::from_be_bytes([segment[1], segment[2]]) as u32;
                    let width = u16::from_be_bytes([segment[3], segment[4]]) as u32;
                    let component_count = segment[5];
                    if height == 0 || width == 0 {
                        return Err(malformed("deferred line count (DNL) is not supported"));
                    }
                    if component_count != 1 {
                        return Err(DecodeError::UnsupportedCodecOutput {
                            codec: "jpeg-ls",
                            detail: format!(
                                "{component_count}-component scans are not supported"
                            ),
                        });
                    }
                    frame = Some((width, height, precision));
                }
                MARKER_LSE => {
                    if segment.first() == Some(&1) {
                        if segment.len() < 11 {
                            return Err(malformed("LSE preset segment too short"));
                        }
                        preset = Some((
                            read_u16(segment, 1)? as i32,
                            read_u16(segment, 3)? as i32,
                            read_u16(segment, 5)? as i32,
                            read_u16(segment, 7)? as i32,
                            read_u16(segment, 9)? as i32,
                        ));
                    }
                }
                MARKER_SOS => {
                    let (width, height, precision) =
                        frame.ok_or_else(|| malformed("SOS before SOF55"))?;
                    if segment.is_empty() {
                        return Err(malformed("SOS segment too short"));
                    }
                    let component_count = segment[0] as usize;
                    if component_count != 1 {
                        return Err(DecodeError::UnsupportedCodecOutput {
                            codec: "jpeg-ls",
                            detail: "interleaved multi-component scans are not supported"
                                .to_string(),
                        });
                    }
                    if segment.len() < 1 + 2 * component_count + 3 {
                        return Err(malformed("SOS segment too short"));
                    }
                    let near = segment[1 + 2 * component_count] as i32;
                    let default_maxval = (1i32 << precision) - 1;
                    let (maxval, pt1, pt2, pt3, reset) =
                        preset.unwrap_or((0, 0, 0, 0, DEFAULT_RESET));
                    let maxval = if maxval > 0 { maxval } else { default_maxval };
                    if near > maxval {
                        return Err(malformed(format!("NEAR {near} exceeds MAXVAL {maxval}")));
                    }
                    let (dt1, dt2, dt3) = default_thresholds(maxval, near);
                    return Ok(Self {
                        width,
                        height,
                        precision,
                        near,
                        maxval,
                        t1: if pt1 > 0 { pt1 } else { dt1 },
                        t2: if pt2 > 0 { pt2 } else { dt2 },
                        t3: if pt3 > 0 { pt3 } else { dt3 },
                        reset: if reset > 0 { reset } else { DEFAULT_RESET },
                        data_start: pos + length,
                    });
                }
                // COM, APPn, and other fixed-length segments carry no state we need.
                _ => {}
            }
            pos += length;
        }
    }
}

fn read_u16(data: &[u8], at: usize) -> Result<u16, DecodeError> {
    data.get(at..at + 2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .ok_or_else(|| malformed("unexpected end of segment"))
}

/// Default quantization thresholds, T.87 A.1 / C.2.4.1.1.1.
fn default_thresholds(maxval: i32, near: i32) -> (i32, i32, i32) {
    fn clamp(value: i32, low: i32, maxval: i32) -> i32 {
        if value > maxval || value < low {
            low
        } else {
            value
        }
    }
    if maxval >= 128 {
        let factor = (maxval.min(4095) + 128) / 256;
        let t1 = clamp(factor + 2 + 3 * near, near + 1, maxval);
        let t2 = clamp(4 * factor + 3 + 5 * near, t1, maxval);
        let t3 = clamp(17 * factor + 4 + 7 * near, t2, maxval);
        (t1, t2, t3)
    } else {
        let factor = 256 / (maxval + 1);
        let t1 = clamp((3 / factor + 3 * near).max(2), near + 1, maxval);
        let t2 = clamp((7 / factor + 5 * near).max(3), t1, maxval);
        let t3 = clamp((21 / factor + 7 * near).max(4), t2, maxval);
        (t1, t2, t3)
    }
}

/// Bit reader over entropy-coded data, undoing the T.87 marker-emulation
/// rule: a byte following 0xFF carries only 7 payload bits, and 0xFF
/// followed by a byte with its high bit set is a marker ending the scan.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buffer: u64,
    bits: u32,
    prev_ff: bool,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buffer: 0,
            bits: 0,
            prev_ff: false,
        }
    }

    fn fill(&mut self) {
        while self.bits <= 56 {
            let Some(&byte) = self.data.get(self.pos) else {
                break;
            };
            if self.prev_ff {
                if byte & 0x80 != 0 {
                    // Marker: scan data ends here.
                    break;
                }
                self.buffer = (self.buffer << 7) | byte as u64;
                self.bits += 7;
            } else {
                self.buffer = (self.buffer << 8) | byte as u64;
                self.bits += 8;
            }
            self.prev_ff = byte == 0xFF;
            self.pos += 1;
        }
    }

    fn read_bit(&mut self) -> Result<u32, DecodeError> {
        if self.bits == 0 {
            self.fill();
            if self.bits == 0 {
                return Err(malformed("entropy data ended mid-sample"));
            }
        }
        self.bits -= 1;
        Ok(((self.buffer >> self.bits) & 1) as u32)
    }

    fn read_bits(&mut self, count: u32) -> Result<u32, DecodeError> {
        debug_assert!(count <= 32);
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Counts zero bits up to the terminating one bit.
    fn read_unary(&mut self, cap: u32) -> Result<u32, DecodeError> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > cap {
                return Err(malformed("golomb prefix exceeds the coding limit"));
            }
        }
        Ok(zeros)
    }
}

#[derive(Clone, Copy, Default)]
struct RegularContext {
    a: i32,
    b: i32,
    c: i32,
    n: i32,
}

#[derive(Clone, Copy, Default)]
struct RunContext {
    a: i32,
    n: i32,
    nn: i32,
}

struct Scan<'h> {
    header: &'h Header,
    range: i32,
    qbpp: u32,
    limit: i32,
    contexts: [RegularContext; 365],
    run_contexts: [RunContext; 2],
    run_index: usize,
}

impl<'h> Scan<'h> {
    fn new(header: &'h Header) -> Self {
        let near = header.near;
        let range = (header.maxval + 2 * near) / (2 * near + 1) + 1;
        let qbpp = ceil_log2(range);
        let bpp = ceil_log2(header.maxval + 1).max(2);
        let limit = 2 * (bpp + bpp.max(8)) as i32;

        let a_init = ((range + 32) / 64).max(2);
        let contexts = [RegularContext {
            a: a_init,
            b: 0,
            c: 0,
            n: 1,
        }; 365];
        let run_contexts = [RunContext {
            a: a_init,
            n: 1,
            nn: 0,
        }; 2];

        Self {
            header,
            range,
            qbpp,
            limit,
            contexts,
            run_contexts,
            run_index: 0,
        }
    }

    fn decode(&mut self, entropy: &[u8]) -> Result<Vec<i32>, DecodeError> {
        let width = self.header.width as usize;
        let height = self.header.height as usize;
        let mut reader = BitReader::new(entropy);

        let mut out = Vec::with_capacity(width * height);
        let mut prev = vec![0i32; width];
        let mut cur = vec![0i32; width];
        // c neighbor for column 0, two lines up.
        let mut c0 = 0i32;

        for _row in 0..height {
            let next_c0 = prev[0];
            let mut col = 0;
            while col < width {
                let b = prev[col];
                let d = if col + 1 < width { prev[col + 1] } else { b };
                let a = if col > 0 { cur[col - 1] } else { prev[0] };
                let c = if col > 0 { prev[col - 1] } else { c0 };

                let q1 = self.quantize(d - b);
                let q2 = self.quantize(b - c);
                let q3 = self.quantize(c - a);

                if q1 == 0 && q2 == 0 && q3 == 0 {
                    col = self.decode_run(&mut reader, &prev, &mut cur, col, a)?;
                } else {
                    cur[col] = self.decode_regular(&mut reader, a, b, c, q1, q2, q3)?;
                    col += 1;
                }
            }
            out.extend_from_slice(&cur);
            c0 = next_c0;
            std::mem::swap(&mut prev, &mut cur);
        }
        Ok(out)
    }

    fn quantize(&self, d: i32) -> i32 {
        let h = self.header;
        if d <= -h.t3 {
            -4
        } else if d <= -h.t2 {
            -3
        } else if d <= -h.t1 {
            -2
        } else if d < -h.near {
            -1
        } else if d <= h.near {
            0
        } else if d < h.t1 {
            1
        } else if d < h.t2 {
            2
        } else if d < h.t3 {
            3
        } else {
            4
        }
    }

    fn decode_regular(
        &mut self,
        reader: &mut BitReader<'_>,
        a: i32,
        b: i32,
        c: i32,
        q1: i32,
        q2: i32,
        q3: i32,
    ) -> Result<i32, DecodeError> {
        let mut q = q1 * 81 + q2 * 9 + q3;
        let sign = if q < 0 {
            q = -q;
            -1
        } else {
            1
        };
        let near = self.header.near;
        let ctx = &mut self.contexts[q as usize];

        // Median edge-detecting prediction with bias correction.
        let mut px = if c >= a.max(b) {
            a.min(b)
        } else if c <= a.min(b) {
            a.max(b)
        } else {
            a + b - c
        };
        px = (px + sign * ctx.c).clamp(0, self.header.maxval);

        let k = golomb_parameter(ctx.n, ctx.a);
        let mapped = decode_golomb(reader, k, self.limit, self.qbpp)?;

        // For k == 0 in the lossless case the error mapping is inverted
        // when the bias accumulator is sufficiently negative.
        let mut errval = if k == 0 && near == 0 && 2 * ctx.b + ctx.n <= 0 {
            -unmap(mapped) - 1
        } else {
            unmap(mapped)
        };
        errval = modulo_range(errval, self.range);

        // Context update, T.87 A.6.
        ctx.b += errval * (2 * near + 1);
        ctx.a += errval.abs();
        if ctx.n == self.header.reset {
            ctx.a >>= 1;
            ctx.b = if ctx.b >= 0 {
                ctx.b >> 1
            } else {
                -((1 - ctx.b) >> 1)
            };
            ctx.n >>= 1;
        }
        ctx.n += 1;
        if ctx.b <= -ctx.n {
            ctx.b += ctx.n;
            if ctx.c > MIN_C {
                ctx.c -= 1;
            }
            if ctx.b <= -ctx.n {
                ctx.b = -ctx.n + 1;
            }
        } else if ctx.b > 0 {
            ctx.b -= ctx.n;
            if ctx.c < MAX_C {
                ctx.c += 1;
            }
            if ctx.b > 0 {
                ctx.b = 0;
            }
        }

        Ok(self.reconstruct(px, sign * errval))
    }

    /// Decodes a run starting at `col`, returning the first column after it.
    fn decode_run(
        &mut self,
        reader: &mut BitReader<'_>,
        prev: &[i32],
        cur: &mut [i32],
        col: usize,
        ra: i32,
    ) -> Result<usize, DecodeError> {
        let width = cur.len();
        let mut index = col;

        loop {
            if reader.read_bit()? == 1 {
                let full = 1usize << J[self.run_index];
                let count = full.min(width - index);
                cur[index..index + count].fill(ra);
                index += count;
                if count == full && self.run_index < 31 {
                    self.run_index += 1;
                }
                if index == width {
                    return Ok(index);
                }
            } else {
                if J[self.run_index] > 0 {
                    let remainder = reader.read_bits(J[self.run_index] as u32)? as usize;
                    if index + remainder > width {
                        return Err(malformed("run length exceeds the line"));
                    }
                    cur[index..index + remainder].fill(ra);
                    index += remainder;
                }
                if index == width {
                    return Ok(index);
                }
                let rb = prev[index];
                cur[index] = self.decode_run_interruption(reader, ra, rb)?;
                if self.run_index > 0 {
                    self.run_index -= 1;
                }
                return Ok(index + 1);
            }
        }
    }

    fn decode_run_interruption(
        &mut self,
        reader: &mut BitReader<'_>,
        ra: i32,
        rb: i32,
    ) -> Result<i32, DecodeError> {
        let near = self.header.near;
        let ritype = if (ra - rb).abs() <= near { 1 } else { 0 };
        let glimit = self.limit - J[self.run_index] - 1;

        let ctx = &mut self.run_contexts[ritype as usize];
        let temp = ctx.a + (ctx.n >> 1) * ritype;
        let k = golomb_parameter(ctx.n, temp);
        let mapped = decode_golomb(reader, k, glimit, self.qbpp)?;

        // T.87 A.7.2: recover the signed error from the mapped value.
        let combined = mapped + ritype;
        let map = combined & 1 == 1;
        let magnitude = (combined + map as i32) / 2;
        let errval = if ((k != 0 || 2 * ctx.nn >= ctx.n) as i32) == map as i32 {
            -magnitude
        } else {
            magnitude
        };
        let errval = modulo_range(errval, self.range);

        if errval < 0 {
            ctx.nn += 1;
        }
        ctx.a += (mapped + 1 - ritype) >> 1;
        if ctx.n == self.header.reset {
            ctx.a >>= 1;
            ctx.n >>= 1;
            ctx.nn >>= 1;
        }
        ctx.n += 1;

        let (predictor, signed_err) = if ritype == 1 {
            (ra, errval)
        } else if ra > rb {
            (rb, -errval)
        } else {
            (rb, errval)
        };
        Ok(self.reconstruct(predictor, signed_err))
    }

    fn reconstruct(&self, predictor: i32, errval: i32) -> i32 {
        let near = self.header.near;
        let maxval = self.header.maxval;
        let mut rx = predictor + errval * (2 * near + 1);
        if rx < -near {
            rx += self.range * (2 * near + 1);
        } else if rx > maxval + near {
            rx -= self.range * (2 * near + 1);
        }
        rx.clamp(0, maxval)
    }
}

fn ceil_log2(value: i32) -> u32 {
    debug_assert!(value > 0);
    32 - (value - 1).max(1).leading_zeros()
}

fn golomb_parameter(n: i32, a: i32) -> u32 {
    let mut k = 0;
    while (n << k) < a && k < 24 {
        k += 1;
    }
    k
}

fn decode_golomb(
    reader: &mut BitReader<'_>,
    k: u32,
    limit: i32,
    qbpp: u32,
) -> Result<i32, DecodeError> {
    let escape = (limit - qbpp as i32 - 1).max(0) as u32;
    let prefix = reader.read_unary(escape)?;
    if prefix < escape {
        Ok(((prefix << k) | reader.read_bits(k)?) as i32)
    } else {
        Ok(reader.read_bits(qbpp)? as i32 + 1)
    }
}

fn unmap(mapped: i32) -> i32 {
    if mapped & 1 == 0 {
        mapped >> 1
    } else {
        -((mapped + 1) >> 1)
    }
}

fn modulo_range(mut errval: i32, range: i32) -> i32 {
    if errval < 0 {
        errval += range;
    }
    if errval >= (range + 1) / 2 {
        errval -= range;
    }
    errval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{PhotometricInterpretation, PlanarConfiguration};

    fn meta(rows: u32, columns: u32, bits: u16) -> FrameMeta {
        FrameMeta {
            rows,
            columns,
            samples_per_pixel: 1,
            photometric: PhotometricInterpretation::Monochrome2,
            bits_allocated: bits,
            bits_stored: bits,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            float_pixel_data: false,
            palette: None,
        }
    }

    fn minimal_stream(width: u16, height: u16, precision: u8, entropy: &[u8]) -> Vec<u8> {
        let mut stream = vec![0xFF, MARKER_SOI];
        stream.extend_from_slice(&[0xFF, MARKER_SOF55, 0x00, 0x0B]);
        stream.push(precision);
        stream.extend_from_slice(&height.to_be_bytes());
        stream.extend_from_slice(&width.to_be_bytes());
        stream.extend_from_slice(&[0x01, 0x01, 0x11, 0x00]);
        stream.extend_from_slice(&[0xFF, MARKER_SOS, 0x00, 0x08, 0x01, 0x01, 0x00]);
        stream.extend_from_slice(&[0x00, 0x00, 0x00]); // NEAR, ILV, point transform
        stream.extend_from_slice(entropy);
        stream.extend_from_slice(&[0xFF, MARKER_EOI]);
        stream
    }

    #[test]
    fn missing_soi_is_rejected() {
        let err = JpegLsDecoder
            .decode(&[0u8; 16], &meta(1, 1, 8), &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::MalformedBitstream { codec: "jpeg-ls", .. }
        ));
    }

    #[test]
    fn all_zero_image_decodes_from_run_bits() {
        // Two lines of two zero samples: four full-run hits, one bit each.
        let stream = minimal_stream(2, 2, 8, &[0b1111_0000]);
        let frame = JpegLsDecoder
            .decode(&stream, &meta(2, 2, 8), &DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.samples.as_u8().unwrap(), &[0, 0, 0, 0]);
        assert!(frame.declared_geometry_mismatch.is_none());
    }

    #[test]
    fn codec_geometry_wins_over_metadata() {
        let stream = minimal_stream(2, 2, 8, &[0b1111_0000]);
        let frame = JpegLsDecoder
            .decode(&stream, &meta(64, 64, 8), &DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.rows(), 2);
        assert_eq!(frame.columns(), 2);
        assert_eq!(frame.declared_geometry_mismatch, Some((64, 64)));
    }

    #[test]
    fn multi_component_frames_are_rejected() {
        let mut stream = vec![0xFF, MARKER_SOI];
        stream.extend_from_slice(&[0xFF, MARKER_SOF55, 0x00, 0x11, 8, 0, 2, 0, 2, 3]);
        stream.extend_from_slice(&[1, 0x11, 0, 2, 0x11, 0, 3, 0x11, 0]);
        let err = JpegLsDecoder
            .decode(&stream, &meta(2, 2, 8), &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedCodecOutput { .. }));
    }

    #[test]
    fn truncated_entropy_data_is_an_error() {
        // Declares 4x4 but carries almost no entropy data.
        let stream = minimal_stream(4, 4, 8, &[0b0000_0000]);
        let err = JpegLsDecoder
            .decode(&stream, &meta(4, 4, 8), &DecodeOptions::default())
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedBitstream { .. }));
    }

    #[test]
    fn default_thresholds_match_the_8_bit_baseline() {
        // T.87 worked example: MAXVAL=255, NEAR=0 gives (3, 7, 21).
        assert_eq!(default_thresholds(255, 0), (3, 7, 21));
    }

    #[test]
    fn sixteen_bit_output_is_widened() {
        let stream = minimal_stream(2, 1, 12, &[0b1100_0000]);
        let frame = JpegLsDecoder
            .decode(&stream, &meta(1, 2, 16), &DecodeOptions::default())
            .unwrap();
        assert_eq!(frame.samples.as_u16().unwrap(), &[0, 0]);
        assert_eq!(frame.meta.bits_stored, 12);
    }
}
