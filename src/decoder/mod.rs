//! Transfer-syntax dispatch: maps a parsed [`TransferSyntax`] to a decoding
//! strategy and runs it, on the caller's thread or a blocking worker.

pub mod raw;
pub mod rle;

#[cfg(feature = "jpeg")]
pub mod jpeg;
#[cfg(feature = "jpeg2000")]
pub mod jpeg2000;
pub mod jpegls;

use std::sync::OnceLock;

use log::debug;

use crate::error::DecodeError;
use crate::frame::{FrameMeta, ImageFrame};
use crate::syntax::TransferSyntax;

/// Caller-tunable decode behavior.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Decomposition (resolution) level for codecs that support partial
    /// decode: 0 is full resolution, each level halves both dimensions.
    /// Clamped to what the bitstream supports; ignored by other codecs.
    pub decode_level: Option<u8>,
}

/// One decoding strategy. Implementations hold no per-call state, so a
/// single cached instance serves all frames of its transfer syntax.
pub trait PixelDecoder: Send + Sync {
    fn decode(
        &self,
        encoded: &[u8],
        meta: &FrameMeta,
        options: &DecodeOptions,
    ) -> Result<ImageFrame, DecodeError>;
}

fn cached<T: PixelDecoder + 'static>(
    cell: &'static OnceLock<T>,
    name: &'static str,
    build: fn() -> T,
) -> &'static dyn PixelDecoder {
    cell.get_or_init(|| {
        debug!("initializing {name} codec");
        build()
    })
}

/// Resolves the decoder for a transfer syntax.
///
/// Codec instances are initialized lazily, once per decoder type, and reused
/// across calls. An unrecognized UID never reaches this function (parsing
/// already rejects it); a recognized syntax whose codec was disabled at
/// build time is an explicit error, not a fall-through.
pub fn decoder_for(syntax: TransferSyntax) -> Result<&'static dyn PixelDecoder, DecodeError> {
    static RAW_LE: OnceLock<raw::RawDecoder> = OnceLock::new();
    static RAW_BE: OnceLock<raw::RawDecoder> = OnceLock::new();
    static RLE: OnceLock<rle::RleDecoder> = OnceLock::new();
    static JPEG_LS: OnceLock<jpegls::JpegLsDecoder> = OnceLock::new();
    #[cfg(feature = "jpeg")]
    static JPEG: OnceLock<jpeg::JpegDecoder> = OnceLock::new();
    #[cfg(feature = "jpeg2000")]
    static JPEG_2000: OnceLock<jpeg2000::Jpeg2000Decoder> = OnceLock::new();

    match syntax {
        TransferSyntax::ImplicitVrLittleEndian
        | TransferSyntax::ExplicitVrLittleEndian
        | TransferSyntax::DeflatedExplicitVrLittleEndian => {
            Ok(cached(&RAW_LE, "raw little-endian", raw::RawDecoder::little_endian))
        }
        TransferSyntax::ExplicitVrBigEndian => {
            Ok(cached(&RAW_BE, "raw big-endian", raw::RawDecoder::big_endian))
        }
        TransferSyntax::RleLossless => Ok(cached(&RLE, "rle", || rle::RleDecoder)),
        TransferSyntax::JpegLsLossless | TransferSyntax::JpegLsNearLossless => {
            Ok(cached(&JPEG_LS, "jpeg-ls", || jpegls::JpegLsDecoder))
        }
        // A browser-native fast path for 8-bit color baseline JPEG would be
        // an application optimization; the software decoder meets the same
        // output contract.
        TransferSyntax::JpegBaseline
        | TransferSyntax::JpegExtended
        | TransferSyntax::JpegLossless
        | TransferSyntax::JpegLosslessSv1 => {
            #[cfg(feature = "jpeg")]
            {
                Ok(cached(&JPEG, "jpeg", || jpeg::JpegDecoder))
            }
            #[cfg(not(feature = "jpeg"))]
            {
                Err(DecodeError::DecoderNotCompiledIn {
                    uid: syntax.uid().to_string(),
                    feature: "jpeg",
                })
            }
        }
        TransferSyntax::Jpeg2000Lossless
        | TransferSyntax::Jpeg2000
        | TransferSyntax::Htj2kLossless
        | TransferSyntax::Htj2kLosslessRpcl
        | TransferSyntax::Htj2k => {
            #[cfg(feature = "jpeg2000")]
            {
                Ok(cached(&JPEG_2000, "jpeg2000", || jpeg2000::Jpeg2000Decoder))
            }
            #[cfg(not(feature = "jpeg2000"))]
            {
                Err(DecodeError::DecoderNotCompiledIn {
                    uid: syntax.uid().to_string(),
                    feature: "jpeg2000",
                })
            }
        }
    }
}

/// Decodes one frame on the current thread.
pub fn decode_frame(
    uid: &str,
    encoded: &[u8],
    meta: &FrameMeta,
    options: &DecodeOptions,
) -> Result<ImageFrame, DecodeError> {
    let syntax = TransferSyntax::from_uid(uid)?;
    decoder_for(syntax)?.decode(encoded, meta, options)
}

/// Decodes one frame on a blocking worker so the caller never stalls an
/// async runtime. Each request is independent; concurrent decodes share no
/// mutable state.
pub async fn decode_frame_async(
    syntax: TransferSyntax,
    encoded: Vec<u8>,
    meta: FrameMeta,
    options: DecodeOptions,
) -> Result<ImageFrame, DecodeError> {
    let decoder = decoder_for(syntax)?;
    tokio::task::spawn_blocking(move || decoder.decode(&encoded, &meta, &options))
        .await
        .map_err(|err| DecodeError::Worker(err.to_string()))?
}
