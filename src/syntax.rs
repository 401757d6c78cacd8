use std::fmt;

use crate::error::DecodeError;

/// A recognized DICOM transfer syntax, parsed from its dotted UID.
///
/// Dispatching on a closed enum keeps the decoder registry exhaustive:
/// an unknown UID fails at parse time with the offending string attached,
/// and every variant maps to exactly one decoding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSyntax {
    ImplicitVrLittleEndian,
    ExplicitVrLittleEndian,
    /// Deflate applies to the data set layer; frame bytes are plain little-endian.
    DeflatedExplicitVrLittleEndian,
    ExplicitVrBigEndian,
    JpegBaseline,
    JpegExtended,
    JpegLossless,
    JpegLosslessSv1,
    JpegLsLossless,
    JpegLsNearLossless,
    Jpeg2000Lossless,
    Jpeg2000,
    Htj2kLossless,
    Htj2kLosslessRpcl,
    Htj2k,
    RleLossless,
}

impl TransferSyntax {
    /// Parses a transfer syntax UID, tolerating the trailing padding DICOM
    /// string values may carry.
    pub fn from_uid(uid: &str) -> Result<Self, DecodeError> {
        let trimmed = uid.trim_end_matches(['\0', ' ']);
        let syntax = match trimmed {
            "1.2.840.10008.1.2" => Self::ImplicitVrLittleEndian,
            "1.2.840.10008.1.2.1" => Self::ExplicitVrLittleEndian,
            "1.2.840.10008.1.2.1.99" => Self::DeflatedExplicitVrLittleEndian,
            "1.2.840.10008.1.2.2" => Self::ExplicitVrBigEndian,
            "1.2.840.10008.1.2.4.50" => Self::JpegBaseline,
            "1.2.840.10008.1.2.4.51" => Self::JpegExtended,
            "1.2.840.10008.1.2.4.57" => Self::JpegLossless,
            "1.2.840.10008.1.2.4.70" => Self::JpegLosslessSv1,
            "1.2.840.10008.1.2.4.80" => Self::JpegLsLossless,
            "1.2.840.10008.1.2.4.81" => Self::JpegLsNearLossless,
            "1.2.840.10008.1.2.4.90" => Self::Jpeg2000Lossless,
            "1.2.840.10008.1.2.4.91" => Self::Jpeg2000,
            "1.2.840.10008.1.2.4.201" => Self::Htj2kLossless,
            "1.2.840.10008.1.2.4.202" => Self::Htj2kLosslessRpcl,
            "1.2.840.10008.1.2.4.203" => Self::Htj2k,
            "1.2.840.10008.1.2.5" => Self::RleLossless,
            _ => {
                return Err(DecodeError::UnsupportedTransferSyntax {
                    uid: trimmed.to_string(),
                })
            }
        };
        Ok(syntax)
    }

    pub fn uid(&self) -> &'static str {
        match self {
            Self::ImplicitVrLittleEndian => "1.2.840.10008.1.2",
            Self::ExplicitVrLittleEndian => "1.2.840.10008.1.2.1",
            Self::DeflatedExplicitVrLittleEndian => "1.2.840.10008.1.2.1.99",
            Self::ExplicitVrBigEndian => "1.2.840.10008.1.2.2",
            Self::JpegBaseline => "1.2.840.10008.1.2.4.50",
            Self::JpegExtended => "1.2.840.10008.1.2.4.51",
            Self::JpegLossless => "1.2.840.10008.1.2.4.57",
            Self::JpegLosslessSv1 => "1.2.840.10008.1.2.4.70",
            Self::JpegLsLossless => "1.2.840.10008.1.2.4.80",
            Self::JpegLsNearLossless => "1.2.840.10008.1.2.4.81",
            Self::Jpeg2000Lossless => "1.2.840.10008.1.2.4.90",
            Self::Jpeg2000 => "1.2.840.10008.1.2.4.91",
            Self::Htj2kLossless => "1.2.840.10008.1.2.4.201",
            Self::Htj2kLosslessRpcl => "1.2.840.10008.1.2.4.202",
            Self::Htj2k => "1.2.840.10008.1.2.4.203",
            Self::RleLossless => "1.2.840.10008.1.2.5",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ImplicitVrLittleEndian => "Implicit VR Little Endian",
            Self::ExplicitVrLittleEndian => "Explicit VR Little Endian",
            Self::DeflatedExplicitVrLittleEndian => "Deflated Explicit VR Little Endian",
            Self::ExplicitVrBigEndian => "Explicit VR Big Endian",
            Self::JpegBaseline => "JPEG Baseline (Process 1)",
            Self::JpegExtended => "JPEG Extended (Process 2 & 4)",
            Self::JpegLossless => "JPEG Lossless (Process 14)",
            Self::JpegLosslessSv1 => "JPEG Lossless SV1",
            Self::JpegLsLossless => "JPEG-LS Lossless",
            Self::JpegLsNearLossless => "JPEG-LS Near-Lossless",
            Self::Jpeg2000Lossless => "JPEG 2000 Lossless Only",
            Self::Jpeg2000 => "JPEG 2000",
            Self::Htj2kLossless => "HTJ2K Lossless",
            Self::Htj2kLosslessRpcl => "HTJ2K Lossless RPCL",
            Self::Htj2k => "HTJ2K",
            Self::RleLossless => "RLE Lossless",
        }
    }

    /// Whether pixel data under this syntax is stored in encapsulated fragments.
    pub fn is_encapsulated(&self) -> bool {
        !matches!(
            self,
            Self::ImplicitVrLittleEndian
                | Self::ExplicitVrLittleEndian
                | Self::DeflatedExplicitVrLittleEndian
                | Self::ExplicitVrBigEndian
        )
    }

    pub fn is_big_endian(&self) -> bool {
        matches!(self, Self::ExplicitVrBigEndian)
    }

    /// Whether the codec supports decoding at a reduced resolution level.
    pub fn supports_partial_decode(&self) -> bool {
        matches!(
            self,
            Self::Jpeg2000Lossless
                | Self::Jpeg2000
                | Self::Htj2kLossless
                | Self::Htj2kLosslessRpcl
                | Self::Htj2k
        )
    }
}

impl fmt::Display for TransferSyntax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.uid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_padded_uid() {
        let syntax = TransferSyntax::from_uid("1.2.840.10008.1.2.4.90\0").unwrap();
        assert_eq!(syntax, TransferSyntax::Jpeg2000Lossless);
    }

    #[test]
    fn unknown_uid_is_named_in_error() {
        let err = TransferSyntax::from_uid("1.2.3.4.5").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1.2.3.4.5"), "got: {message}");
    }

    #[test]
    fn uid_round_trips() {
        for syntax in [
            TransferSyntax::ImplicitVrLittleEndian,
            TransferSyntax::ExplicitVrBigEndian,
            TransferSyntax::JpegBaseline,
            TransferSyntax::JpegLsNearLossless,
            TransferSyntax::Htj2k,
            TransferSyntax::RleLossless,
        ] {
            assert_eq!(TransferSyntax::from_uid(syntax.uid()).unwrap(), syntax);
        }
    }

    #[test]
    fn encapsulation_split() {
        assert!(!TransferSyntax::ExplicitVrLittleEndian.is_encapsulated());
        assert!(TransferSyntax::RleLossless.is_encapsulated());
        assert!(TransferSyntax::Jpeg2000.supports_partial_decode());
        assert!(!TransferSyntax::JpegBaseline.supports_partial_decode());
    }
}
