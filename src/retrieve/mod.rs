//! Progressive frame retrieval over HTTP range requests.
//!
//! A frame is fetched in fixed-size byte ranges. For codestreams that decode
//! at reduced resolution (JPEG 2000 / HTJ2K), each fetched prefix is offered
//! to the codec at a level the received fraction supports, and successful
//! renders are delivered through a channel. A quality gate keeps delivery
//! monotone: every update is strictly better than the one before it, and the
//! final full-quality frame is always delivered.

pub mod content_type;
pub mod multipart;

use bytes::BytesMut;
use futures_util::StreamExt;
use log::debug;
use tokio::sync::mpsc;

use crate::decoder::{decode_frame_async, DecodeOptions};
use crate::error::RetrieveError;
use crate::frame::{FrameMeta, ImageFrame};
use crate::syntax::TransferSyntax;

/// Rendering quality of a delivered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeQuality {
    /// Decoded at the given decomposition level; each level halves both
    /// dimensions, so larger levels are coarser.
    Subresolution(u8),
    Full,
}

impl DecodeQuality {
    fn rank(self) -> u32 {
        match self {
            Self::Full => u32::MAX,
            Self::Subresolution(level) => 255 - level.min(255) as u32,
        }
    }

    pub fn decode_level(self) -> Option<u8> {
        match self {
            Self::Full => None,
            Self::Subresolution(level) => Some(level),
        }
    }
}

/// Admits only strictly increasing quality, so a consumer never sees an
/// update worse than one it already rendered. The final delivery may repeat
/// the best quality seen, never regress below it.
#[derive(Debug, Default)]
pub struct QualityGate {
    best: Option<DecodeQuality>,
}

impl QualityGate {
    pub fn admit(&mut self, quality: DecodeQuality, is_final: bool) -> bool {
        let admitted = match self.best {
            None => true,
            Some(best) if is_final => quality.rank() >= best.rank(),
            Some(best) => quality.rank() > best.rank(),
        };
        if admitted {
            self.best = Some(quality);
        }
        admitted
    }

    /// Forgets `quality` when it is the current best, so the same quality
    /// can be admitted again. Used when a decode at an admitted quality
    /// fails on an incomplete prefix and deserves a retry.
    pub fn retract(&mut self, quality: DecodeQuality) {
        if self.best == Some(quality) {
            self.best = None;
        }
    }
}

/// One progressive update: a decoded frame and how good it is.
#[derive(Debug)]
pub struct ProgressiveFrame {
    pub frame: ImageFrame,
    pub quality: DecodeQuality,
    pub bytes_fetched: u64,
    pub complete: bool,
}

/// Byte-range accumulation state for one in-flight retrieval.
#[derive(Debug, Default)]
pub struct StreamingData {
    pub buffer: Vec<u8>,
    pub total_bytes: Option<u64>,
    pub ranges_fetched: u32,
}

impl StreamingData {
    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        match self.total_bytes {
            Some(total) => self.received() >= total,
            None => false,
        }
    }
}

/// Fetches a resource in byte ranges of a fixed chunk size.
#[derive(Debug, Clone)]
pub struct ProgressiveFetcher {
    client: reqwest::Client,
    chunk_size: u64,
}

impl ProgressiveFetcher {
    pub fn new(chunk_size: u64) -> Self {
        Self::with_client(reqwest::Client::new(), chunk_size)
    }

    pub fn with_client(client: reqwest::Client, chunk_size: u64) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Fetches the next range into `state`. Returns `true` when the resource
    /// is fully received after this call.
    ///
    /// A server that ignores the Range header and answers 200 delivers the
    /// whole body at once; that also completes the retrieval.
    pub async fn fetch_next(
        &self,
        url: &str,
        state: &mut StreamingData,
    ) -> Result<bool, RetrieveError> {
        let start = state.received();
        let end = start + self.chunk_size - 1;
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                if start > 0 {
                    // Range not honored; the body restarts from byte zero.
                    state.buffer.clear();
                }
                let body = read_body(response).await?;
                state.buffer.extend_from_slice(&body);
                state.total_bytes = Some(state.received());
                state.ranges_fetched += 1;
                Ok(true)
            }
            206 => {
                let total = response
                    .headers()
                    .get(reqwest::header::CONTENT_RANGE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(content_range_total);
                let body = read_body(response).await?;
                let requested = self.chunk_size;
                state.buffer.extend_from_slice(&body);
                state.ranges_fetched += 1;
                match total {
                    Some(total) => state.total_bytes = Some(total),
                    // Without a total, a short chunk is the only end signal.
                    None if (body.len() as u64) < requested => {
                        state.total_bytes = Some(state.received())
                    }
                    None => return Err(RetrieveError::UnknownLength),
                }
                // An empty body that still claims more data is to come
                // would loop forever; treat it as a broken stream.
                if body.is_empty() && !state.is_complete() {
                    return Err(RetrieveError::Truncated {
                        received: state.received(),
                        expected: state.total_bytes.unwrap_or(state.received()),
                    });
                }
                Ok(state.is_complete())
            }
            416 if start > 0 => {
                // Requested past the end; everything was already received.
                state.total_bytes = Some(start);
                Ok(true)
            }
            status => Err(RetrieveError::Status(status)),
        }
    }

    /// Retrieves the whole resource without progressive decoding.
    pub async fn fetch_all(&self, url: &str) -> Result<Vec<u8>, RetrieveError> {
        let mut state = StreamingData::default();
        while !self.fetch_next(url, &mut state).await? {}
        if let Some(total) = state.total_bytes {
            if state.received() < total {
                return Err(RetrieveError::Truncated {
                    received: state.received(),
                    expected: total,
                });
            }
        }
        Ok(state.buffer)
    }
}

async fn read_body(response: reqwest::Response) -> Result<BytesMut, RetrieveError> {
    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(body)
}

/// Parses the total from a `Content-Range: bytes a-b/total` header. A `*`
/// total means the server does not know it.
fn content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Quality a received prefix can support. Each decomposition level carries
/// roughly a quarter of the codestream, so the level count follows from the
/// received fraction.
fn quality_for(received: u64, total: Option<u64>, complete: bool) -> DecodeQuality {
    if complete {
        return DecodeQuality::Full;
    }
    const COARSEST: u8 = 6;
    match total {
        Some(total) if total > 0 && received > 0 => {
            let fraction = received as f64 / total as f64;
            let level = (1.0 / fraction).log(4.0).ceil() as i64;
            DecodeQuality::Subresolution(level.clamp(1, COARSEST as i64) as u8)
        }
        _ => DecodeQuality::Subresolution(COARSEST),
    }
}

/// Retrieves one frame progressively, delivering intermediate renders
/// through `updates` and returning the final full-quality frame.
///
/// Intermediate decode failures are expected while the codestream is
/// incomplete and never abort the retrieval; renders already delivered
/// remain valid. A stream error aborts with the error, and a dropped
/// receiver abandons the retrieval.
pub async fn retrieve_frame_progressive(
    fetcher: &ProgressiveFetcher,
    url: &str,
    syntax: TransferSyntax,
    meta: FrameMeta,
    updates: mpsc::Sender<ProgressiveFrame>,
) -> Result<ImageFrame, RetrieveError> {
    let mut state = StreamingData::default();
    let mut gate = QualityGate::default();
    let progressive = syntax.supports_partial_decode();

    loop {
        let complete = fetcher.fetch_next(url, &mut state).await?;

        if !complete {
            if !progressive {
                continue;
            }
            let quality = quality_for(state.received(), state.total_bytes, false);
            if !gate.admit(quality, false) {
                continue;
            }
            let options = DecodeOptions {
                decode_level: quality.decode_level(),
            };
            match decode_frame_async(syntax, state.buffer.clone(), meta.clone(), options).await {
                Ok(frame) => {
                    let update = ProgressiveFrame {
                        frame,
                        quality,
                        bytes_fetched: state.received(),
                        complete: false,
                    };
                    if updates.send(update).await.is_err() {
                        return Err(RetrieveError::Abandoned);
                    }
                }
                Err(err) => {
                    // The prefix was not decodable yet; allow a retry at the
                    // same quality once more bytes arrive.
                    debug!(
                        "partial decode at {} of {:?} bytes failed: {err}",
                        state.received(),
                        state.total_bytes
                    );
                    gate.retract(quality);
                }
            }
            continue;
        }

        let frame = decode_frame_async(
            syntax,
            state.buffer.clone(),
            meta.clone(),
            DecodeOptions::default(),
        )
        .await?;
        if gate.admit(DecodeQuality::Full, true) {
            let update = ProgressiveFrame {
                frame: frame.clone(),
                quality: DecodeQuality::Full,
                bytes_fetched: state.received(),
                complete: true,
            };
            if updates.send(update).await.is_err() {
                return Err(RetrieveError::Abandoned);
            }
        }
        return Ok(frame);
    }
}

/// WADO-RS frame endpoint for one instance. Frame numbers are one-based.
pub fn frame_url(
    base: &str,
    study_uid: &str,
    series_uid: &str,
    instance_uid: &str,
    frame_number: u32,
) -> String {
    format!(
        "{}/studies/{study_uid}/series/{series_uid}/instances/{instance_uid}/frames/{frame_number}",
        base.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::decoder::raw::encode_u16_le;
    use crate::frame::{
        PhotometricInterpretation, PixelRepresentation, PlanarConfiguration, SampleBuffer,
    };

    /// Minimal HTTP server honoring `Range: bytes=` requests against a fixed
    /// body, one connection per request.
    async fn spawn_range_server(data: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let data = data.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    let range = request.lines().find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("range: bytes=")
                            .and_then(|spec| {
                                let (start, end) = spec.split_once('-')?;
                                Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                            })
                    });
                    let response = match range {
                        Some((start, end)) if start < data.len() => {
                            let end = end.min(data.len() - 1);
                            let body = &data[start..=end];
                            let mut response = format!(
                                "HTTP/1.1 206 Partial Content\r\n\
                                 Content-Range: bytes {start}-{end}/{}\r\n\
                                 Content-Length: {}\r\nConnection: close\r\n\r\n",
                                data.len(),
                                body.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(body);
                            response
                        }
                        _ => {
                            let mut response = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\
                                 Connection: close\r\n\r\n",
                                data.len()
                            )
                            .into_bytes();
                            response.extend_from_slice(&data);
                            response
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/frames/1")
    }

    /// A broken server: always 206 with an empty body and a total that
    /// promises more.
    async fn spawn_stalling_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    if read_request(&mut socket).await.is_none() {
                        return;
                    }
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 206 Partial Content\r\n\
                              Content-Range: bytes 0-0/100\r\n\
                              Content-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/frames/1")
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
        Some(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn mono_meta(rows: u32, columns: u32) -> FrameMeta {
        FrameMeta {
            rows,
            columns,
            samples_per_pixel: 1,
            photometric: PhotometricInterpretation::Monochrome2,
            bits_allocated: 16,
            bits_stored: 16,
            pixel_representation: PixelRepresentation::Unsigned,
            planar_configuration: PlanarConfiguration::Interleaved,
            float_pixel_data: false,
            palette: None,
        }
    }

    #[tokio::test]
    async fn retrieval_chunks_ranges_and_delivers_a_full_final() {
        let samples: Vec<u16> = (0..16).collect();
        let url = spawn_range_server(encode_u16_le(&samples)).await;
        let fetcher = ProgressiveFetcher::new(5);
        let (updates, mut received) = mpsc::channel(8);

        let frame = retrieve_frame_progressive(
            &fetcher,
            &url,
            TransferSyntax::ExplicitVrLittleEndian,
            mono_meta(4, 4),
            updates,
        )
        .await
        .unwrap();
        assert_eq!(frame.samples, SampleBuffer::U16(samples));

        let update = received.recv().await.unwrap();
        assert!(update.complete);
        assert_eq!(update.quality, DecodeQuality::Full);
        assert_eq!(update.bytes_fetched, 32);
        assert!(received.recv().await.is_none(), "exactly one delivery");
    }

    #[tokio::test]
    async fn dropped_receiver_abandons_the_retrieval() {
        let samples: Vec<u16> = (0..4).collect();
        let url = spawn_range_server(encode_u16_le(&samples)).await;
        let fetcher = ProgressiveFetcher::new(64);
        let (updates, received) = mpsc::channel(1);
        drop(received);

        let err = retrieve_frame_progressive(
            &fetcher,
            &url,
            TransferSyntax::ExplicitVrLittleEndian,
            mono_meta(2, 2),
            updates,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RetrieveError::Abandoned));
    }

    #[tokio::test]
    async fn stalled_empty_206_is_truncated_not_an_infinite_loop() {
        let url = spawn_stalling_server().await;
        let fetcher = ProgressiveFetcher::new(16);
        let err = fetcher.fetch_all(&url).await.unwrap_err();
        match err {
            RetrieveError::Truncated { received, expected } => {
                assert_eq!(received, 0);
                assert_eq!(expected, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gate_retraction_allows_one_retry_at_the_same_quality() {
        let mut gate = QualityGate::default();
        assert!(gate.admit(DecodeQuality::Subresolution(2), false));
        gate.retract(DecodeQuality::Subresolution(2));
        assert!(gate.admit(DecodeQuality::Subresolution(2), false));
        // Retracting a quality that is no longer the best is a no-op.
        assert!(gate.admit(DecodeQuality::Full, false));
        gate.retract(DecodeQuality::Subresolution(2));
        assert!(!gate.admit(DecodeQuality::Subresolution(2), false));
    }

    #[test]
    fn gate_enforces_strictly_increasing_quality() {
        let mut gate = QualityGate::default();
        assert!(gate.admit(DecodeQuality::Subresolution(4), false));
        assert!(!gate.admit(DecodeQuality::Subresolution(4), false));
        assert!(!gate.admit(DecodeQuality::Subresolution(5), false));
        assert!(gate.admit(DecodeQuality::Subresolution(2), false));
        assert!(gate.admit(DecodeQuality::Full, false));
        assert!(!gate.admit(DecodeQuality::Subresolution(1), false));
    }

    #[test]
    fn gate_allows_equal_quality_for_the_final_frame() {
        let mut gate = QualityGate::default();
        assert!(gate.admit(DecodeQuality::Full, false));
        assert!(gate.admit(DecodeQuality::Full, true));
    }

    #[test]
    fn quality_tracks_received_fraction() {
        assert_eq!(quality_for(100, Some(100), true), DecodeQuality::Full);
        assert_eq!(
            quality_for(50, Some(100), false),
            DecodeQuality::Subresolution(1)
        );
        assert_eq!(
            quality_for(25, Some(100), false),
            DecodeQuality::Subresolution(1)
        );
        assert_eq!(
            quality_for(10, Some(100), false),
            DecodeQuality::Subresolution(2)
        );
        assert_eq!(
            quality_for(1, Some(4096), false),
            DecodeQuality::Subresolution(6)
        );
        assert_eq!(
            quality_for(10, None, false),
            DecodeQuality::Subresolution(6)
        );
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(content_range_total("bytes 0-99/1000"), Some(1000));
        assert_eq!(content_range_total("bytes 0-99/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn frame_urls_are_one_based() {
        assert_eq!(
            frame_url("https://pacs.example.org/wado/", "1.2", "3.4", "5.6", 1),
            "https://pacs.example.org/wado/studies/1.2/series/3.4/instances/5.6/frames/1"
        );
    }

    #[test]
    fn streaming_state_reports_completion() {
        let mut state = StreamingData::default();
        assert!(!state.is_complete());
        state.buffer = vec![0; 10];
        state.total_bytes = Some(10);
        assert!(state.is_complete());
    }
}
