//! Splitter for `multipart/related` response bodies.

use crate::error::RetrieveError;
use crate::retrieve::content_type::ContentType;

/// One body part: its headers (lowercased names) and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.header("content-type").map(ContentType::parse)
    }
}

/// Splits a multipart body into its parts using the boundary declared by the
/// outer Content-Type header.
pub fn split(content_type: &ContentType, body: &[u8]) -> Result<Vec<Part>, RetrieveError> {
    let boundary = content_type.boundary()?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut pos = find(body, delimiter, 0).ok_or_else(|| {
        RetrieveError::Multipart(format!("boundary `{boundary}` not found in body"))
    })?;

    loop {
        pos += delimiter.len();
        // A trailing "--" closes the stream.
        if body[pos..].starts_with(b"--") {
            break;
        }
        pos = skip_line_break(body, pos)?;

        let headers_end = find(body, b"\r\n\r\n", pos).ok_or_else(|| {
            RetrieveError::Multipart("part headers are not terminated".to_string())
        })?;
        let headers = parse_headers(&body[pos..headers_end])?;
        let body_start = headers_end + 4;

        let next = find(body, delimiter, body_start).ok_or_else(|| {
            RetrieveError::Multipart("part is not terminated by a boundary".to_string())
        })?;
        // The CRLF before the next delimiter belongs to the framing.
        let body_end = body[..next]
            .strip_suffix(b"\r\n")
            .map(|trimmed| trimmed.len())
            .unwrap_or(next);

        parts.push(Part {
            headers,
            body: body[body_start..body_end].to_vec(),
        });
        pos = next;
    }

    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn skip_line_break(body: &[u8], pos: usize) -> Result<usize, RetrieveError> {
    if body[pos..].starts_with(b"\r\n") {
        Ok(pos + 2)
    } else {
        Err(RetrieveError::Multipart(
            "boundary is not followed by a line break".to_string(),
        ))
    }
}

fn parse_headers(raw: &[u8]) -> Result<Vec<(String, String)>, RetrieveError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| RetrieveError::Multipart("part headers are not valid UTF-8".to_string()))?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                RetrieveError::Multipart(format!("malformed part header `{line}`"))
            })?;
            Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}
