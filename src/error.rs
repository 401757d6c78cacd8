use thiserror::Error;

/// Error type for pixel decoding, color conversion, and frame indexing.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The transfer syntax UID is not recognized by the registry.
    #[error("unsupported transfer syntax `{uid}`")]
    UnsupportedTransferSyntax { uid: String },

    /// The transfer syntax is recognized, but its codec was not compiled in.
    #[error("transfer syntax `{uid}` requires the `{feature}` cargo feature")]
    DecoderNotCompiledIn { uid: String, feature: &'static str },

    /// Declared pixel data length does not match the frame geometry.
    #[error(
        "pixel data length {actual} does not match expected {expected} \
         for {rows}x{columns} ({samples} sample(s)/pixel, {bits} bits allocated)"
    )]
    PixelDataLength {
        expected: usize,
        actual: usize,
        rows: u32,
        columns: u32,
        samples: u16,
        bits: u16,
    },

    /// A color buffer length is not divisible by its channel count.
    #[error("{context}: buffer length {len} is not divisible by {divisor}")]
    BufferNotDivisible {
        context: &'static str,
        len: usize,
        divisor: usize,
    },

    /// The caller-provided destination buffer cannot hold the converted pixels.
    #[error("destination buffer holds {actual} bytes, conversion needs {expected}")]
    DestinationTooSmall { expected: usize, actual: usize },

    #[error("bits allocated {0} is not supported")]
    UnsupportedBitsAllocated(u16),

    #[error("float/double pixel data is not supported by the raw 32-bit path")]
    FloatPixelDataUnsupported,

    #[error("frame {index} requested, but only {available} frame(s) are available")]
    FrameIndexOutOfRange { index: u32, available: u32 },

    /// The codec rejected the encoded byte stream.
    #[error("malformed {codec} bitstream: {detail}")]
    MalformedBitstream {
        codec: &'static str,
        detail: String,
    },

    /// The codec produced output this crate cannot represent.
    #[error("{codec} produced unsupported output: {detail}")]
    UnsupportedCodecOutput {
        codec: &'static str,
        detail: String,
    },

    #[error("palette color lookup table problem: {0}")]
    PaletteLut(String),

    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("attribute {name} could not be read: {detail}")]
    InvalidAttribute { name: &'static str, detail: String },

    /// Encapsulated fragments cannot be aligned with the declared frame count.
    #[error("cannot index frames in fragmented pixel data: {0}")]
    FragmentedFrames(String),

    /// A decode task failed off-thread before producing a result.
    #[error("decode worker failed: {0}")]
    Worker(String),
}

/// Error type for the progressive retrieval layer.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("multipart response error: {0}")]
    Multipart(String),

    #[error("response ended early: received {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("server ignored the range request and returned no content length")]
    UnknownLength,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The consumer dropped its receiver; the retrieval was abandoned.
    #[error("progress channel closed by the consumer")]
    Abandoned,
}
