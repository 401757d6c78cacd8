//! Pixel decoding, color conversion, and progressive retrieval for DICOM
//! image frames.
//!
//! The pipeline runs in three stages: [`decoder`] turns encoded pixel bytes
//! into typed samples keyed by transfer syntax, [`color`] maps stored color
//! spaces to RGB(A), and [`image`] assembles a presentation-ready canvas.
//! [`retrieve`] streams frames over HTTP range requests with progressively
//! improving previews, and [`multiframe`] resolves per-frame metadata and
//! fragment indexing for multiframe instances.

pub mod color;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod image;
pub mod multiframe;
pub mod retrieve;
pub mod syntax;

pub use decoder::{decode_frame, decode_frame_async, DecodeOptions, PixelDecoder};
pub use error::{DecodeError, RetrieveError};
pub use frame::{FrameMeta, ImageFrame, PhotometricInterpretation, SampleBuffer};
pub use image::{DecodedImage, Rescale, VoiWindow};
pub use retrieve::{DecodeQuality, ProgressiveFetcher, QualityGate};
pub use syntax::TransferSyntax;
