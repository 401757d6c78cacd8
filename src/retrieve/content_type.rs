//! Content-Type parsing for WADO-RS responses: media type, multipart
//! boundary, and transfer-syntax inference.

use log::debug;

use crate::error::RetrieveError;
use crate::syntax::TransferSyntax;

/// A parsed Content-Type header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: String,
    parameters: Vec<(String, String)>,
}

impl ContentType {
    pub fn parse(header: &str) -> Self {
        let mut parts = header.split(';');
        let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let parameters = parts
            .filter_map(|part| {
                let (name, value) = part.split_once('=')?;
                Some((
                    name.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();
        Self {
            media_type,
            parameters,
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type.starts_with("multipart/")
    }

    /// The multipart boundary. A multipart media type without one is a
    /// protocol violation and is reported as such.
    pub fn boundary(&self) -> Result<&str, RetrieveError> {
        self.parameter("boundary").ok_or_else(|| {
            RetrieveError::Multipart(format!(
                "`{}` response carries no boundary parameter",
                self.media_type
            ))
        })
    }

    /// Transfer syntax of the payload: the explicit `transfer-syntax`
    /// parameter when present, otherwise a guess from the media type.
    pub fn transfer_syntax(&self) -> Option<TransferSyntax> {
        if let Some(uid) = self.parameter("transfer-syntax") {
            return TransferSyntax::from_uid(uid).ok();
        }
        let inferred = match self.media_type.as_str() {
            "application/octet-stream" => TransferSyntax::ExplicitVrLittleEndian,
            "image/jpeg" => TransferSyntax::JpegBaseline,
            "image/jls" => TransferSyntax::JpegLsLossless,
            "image/jp2" | "image/j2c" => TransferSyntax::Jpeg2000,
            "image/jphc" | "image/jph" => TransferSyntax::Htj2k,
            "image/dicom-rle" => TransferSyntax::RleLossless,
            _ => return None,
        };
        debug!(
            "no transfer-syntax parameter; inferred {} from `{}`",
            inferred, self.media_type
        );
        Some(inferred)
    }
}

/// Accept header value requesting frame pixel data in a specific transfer
/// syntax, or in whatever the server prefers when `syntax` is `None`.
pub fn accept_header(syntax: Option<TransferSyntax>) -> String {
    match syntax {
        Some(syntax) => format!(
            "multipart/related; type=\"application/octet-stream\"; transfer-syntax={}",
            syntax.uid()
        ),
        None => "multipart/related; type=\"application/octet-stream\"; transfer-syntax=*"
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_media_type_and_parameters() {
        let parsed = ContentType::parse(
            "multipart/related; type=\"application/octet-stream\"; boundary=frame-7",
        );
        assert_eq!(parsed.media_type, "multipart/related");
        assert!(parsed.is_multipart());
        assert_eq!(parsed.boundary().unwrap(), "frame-7");
        assert_eq!(parsed.parameter("type"), Some("application/octet-stream"));
    }

    #[test]
    fn explicit_transfer_syntax_wins_over_media_type() {
        let parsed = ContentType::parse(
            "image/jpeg; transfer-syntax=1.2.840.10008.1.2.4.90",
        );
        assert_eq!(
            parsed.transfer_syntax(),
            Some(TransferSyntax::Jpeg2000Lossless)
        );
    }

    #[test]
    fn media_type_fallbacks() {
        let cases = [
            ("application/octet-stream", TransferSyntax::ExplicitVrLittleEndian),
            ("image/jpeg", TransferSyntax::JpegBaseline),
            ("image/jls", TransferSyntax::JpegLsLossless),
            ("image/jphc", TransferSyntax::Htj2k),
            ("image/dicom-rle", TransferSyntax::RleLossless),
        ];
        for (media_type, expected) in cases {
            assert_eq!(
                ContentType::parse(media_type).transfer_syntax(),
                Some(expected),
                "{media_type}"
            );
        }
        assert_eq!(ContentType::parse("text/html").transfer_syntax(), None);
    }

    #[test]
    fn accept_header_round_trips_through_the_parser() {
        let header = accept_header(Some(TransferSyntax::JpegLsLossless));
        let parsed = ContentType::parse(&header);
        assert!(parsed.is_multipart());
        assert_eq!(
            parsed.parameter("transfer-syntax"),
            Some("1.2.840.10008.1.2.4.80")
        );
        assert_eq!(
            accept_header(None),
            "multipart/related; type=\"application/octet-stream\"; transfer-syntax=*"
        );
    }

    #[test]
    fn missing_boundary_is_an_error() {
        let err = ContentType::parse("multipart/related; type=\"image/jls\"")
            .boundary()
            .unwrap_err();
        assert!(matches!(err, RetrieveError::Multipart(_)));
    }
}
