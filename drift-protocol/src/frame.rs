//! Header-then-payload framing over a raw byte stream.
//!
//! ```text
//! +--------------------+-------------------------+----------------------+
//! | header_len (u32 BE)| header (header_len)     | payload (size bytes) |
//! |                    | UTF-8 JSON FileHeader   | raw, no envelope     |
//! +--------------------+-------------------------+----------------------+
//! ```
//!
//! The payload is moved in slices of at most [`CHUNK_SIZE`] bytes so neither
//! side ever holds more than one chunk of the file in memory.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::file::{FileHeader, CHUNK_SIZE, MAX_HEADER_LEN};

/// Errors produced while encoding or decoding a transfer frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("header length {len} exceeds maximum of {max} bytes", max = MAX_HEADER_LEN)]
    HeaderTooLarge { len: u64 },
    #[error("stream closed after {received} of {expected} header bytes")]
    TruncatedHeader { expected: usize, received: usize },
    #[error("malformed header metadata: {0}")]
    MalformedMetadata(String),
    #[error("stream closed after {received} of {expected} payload bytes")]
    StreamClosedEarly { expected: u64, received: u64 },
    #[error("source ended after {produced} of {expected} bytes")]
    SourceTruncated { expected: u64, produced: u64 },
    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Read into `buf` until it is full or the reader reports end-of-stream.
///
/// Returns the number of bytes read; anything less than `buf.len()` means
/// the stream ended.
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Write the length prefix and JSON metadata for `header`.
pub async fn write_header<W>(writer: &mut W, header: &FileHeader) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let json = header
        .to_json()
        .map_err(|e| FrameError::MalformedMetadata(e.to_string()))?;
    if json.len() as u64 > MAX_HEADER_LEN as u64 {
        return Err(FrameError::HeaderTooLarge {
            len: json.len() as u64,
        });
    }

    writer.write_u32(json.len() as u32).await?;
    writer.write_all(&json).await?;
    Ok(())
}

/// Read and validate the length prefix and JSON metadata.
///
/// An oversized length is rejected before any metadata byte is consumed.
pub async fn read_header<R>(reader: &mut R) -> Result<FileHeader, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let n = read_full(reader, &mut len_buf).await?;
    if n < len_buf.len() {
        return Err(FrameError::TruncatedHeader {
            expected: len_buf.len(),
            received: n,
        });
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_HEADER_LEN {
        return Err(FrameError::HeaderTooLarge { len: len as u64 });
    }

    let mut json = vec![0u8; len as usize];
    let n = read_full(reader, &mut json).await?;
    if n < json.len() {
        return Err(FrameError::TruncatedHeader {
            expected: json.len(),
            received: n,
        });
    }

    let text = std::str::from_utf8(&json)
        .map_err(|e| FrameError::MalformedMetadata(format!("header is not UTF-8: {e}")))?;
    FileHeader::from_json(text.as_bytes()).map_err(|e| FrameError::MalformedMetadata(e.to_string()))
}

/// Incremental payload reader yielding chunks of at most [`CHUNK_SIZE`] bytes.
#[derive(Debug)]
pub struct PayloadReader {
    expected: u64,
    received: u64,
    buf: Vec<u8>,
}

impl PayloadReader {
    /// Create a reader for a payload of exactly `expected` bytes.
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            received: 0,
            buf: vec![0u8; chunk_capacity(expected)],
        }
    }

    /// Bytes consumed so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Bytes still owed by the peer.
    pub fn remaining(&self) -> u64 {
        self.expected - self.received
    }

    /// Read the next chunk, or `None` once the declared size has been consumed.
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<&[u8]>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let want = self.remaining().min(CHUNK_SIZE as u64) as usize;
        if want == 0 {
            return Ok(None);
        }

        let n = read_full(reader, &mut self.buf[..want]).await?;
        self.received += n as u64;
        if n < want {
            return Err(FrameError::StreamClosedEarly {
                expected: self.expected,
                received: self.received,
            });
        }

        Ok(Some(&self.buf[..n]))
    }
}

/// Copy exactly `size` bytes from `source` to `sink` in [`CHUNK_SIZE`] slices.
///
/// `on_chunk` is called with the running total after each slice is written.
pub async fn write_payload<R, W, F>(
    source: &mut R,
    sink: &mut W,
    size: u64,
    mut on_chunk: F,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; chunk_capacity(size)];
    let mut sent = 0u64;

    while sent < size {
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = read_full(source, &mut buf[..want]).await?;
        if n < want {
            return Err(FrameError::SourceTruncated {
                expected: size,
                produced: sent + n as u64,
            });
        }

        sink.write_all(&buf[..n]).await?;
        sent += n as u64;
        on_chunk(sent);

        tracing::trace!(sent, size, "wrote payload chunk");
    }

    sink.flush().await?;
    Ok(())
}

fn chunk_capacity(size: u64) -> usize {
    size.min(CHUNK_SIZE as u64) as usize
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn test_payload(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    /// Reader that hands out at most `step` bytes per poll.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let end = (self.pos + self.step)
                .min(self.data.len())
                .min(self.pos + buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..end]);
            self.pos = end;
            Poll::Ready(Ok(()))
        }
    }

    async fn roundtrip(filename: &str, size: usize) {
        let payload = test_payload(size);
        let header = FileHeader::new(filename, size as u64);

        let (mut client, mut server) = tokio::io::duplex(16 * 1024);

        let send_payload = payload.clone();
        let send_header = header.clone();
        let writer = tokio::spawn(async move {
            let mut source = Cursor::new(send_payload);
            let mut progress = Vec::new();
            write_header(&mut client, &send_header).await.unwrap();
            write_payload(&mut source, &mut client, size as u64, |sent| {
                progress.push(sent)
            })
            .await
            .unwrap();
            client.shutdown().await.unwrap();
            progress
        });

        let decoded = read_header(&mut server).await.unwrap();
        assert_eq!(decoded, header);

        let mut reader = PayloadReader::new(decoded.size);
        let mut received = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = reader.next_chunk(&mut server).await.unwrap() {
            assert!(chunk.len() <= CHUNK_SIZE);
            received.extend_from_slice(chunk);
            chunks += 1;
        }

        let progress = writer.await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(chunks, size.div_ceil(CHUNK_SIZE));
        assert_eq!(progress.len(), chunks);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last().copied().unwrap_or(0), size as u64);
    }

    #[tokio::test]
    async fn roundtrip_empty_payload() {
        init_test_tracing();
        roundtrip("empty.bin", 0).await;
    }

    #[tokio::test]
    async fn roundtrip_single_byte() {
        init_test_tracing();
        roundtrip("one.bin", 1).await;
    }

    #[tokio::test]
    async fn roundtrip_exact_chunk_boundary() {
        init_test_tracing();
        roundtrip("boundary.bin", 65_536).await;
    }

    #[tokio::test]
    async fn roundtrip_multi_chunk_with_remainder() {
        init_test_tracing();
        roundtrip("résumé – final.pdf", 196_625).await;
    }

    #[tokio::test]
    async fn oversized_header_rejected_before_reading_metadata() {
        init_test_tracing();
        let mut wire = 10_001u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[b'{'; 64]);
        let mut cursor = Cursor::new(wire);

        let err = read_header(&mut cursor).await.unwrap_err();
        assert!(
            matches!(err, FrameError::HeaderTooLarge { len: 10_001 }),
            "unexpected error: {err}"
        );
        assert_eq!(cursor.position(), 4, "only the length prefix may be consumed");
    }

    #[tokio::test]
    async fn header_at_limit_is_accepted() {
        init_test_tracing();
        // {"filename":"<name>","size":1} padded out to exactly MAX_HEADER_LEN bytes
        let overhead = r#"{"filename":"","size":1}"#.len();
        let name = "a".repeat(MAX_HEADER_LEN as usize - overhead);
        let header = FileHeader::new(name, 1);

        let mut wire = Vec::new();
        write_header(&mut wire, &header).await.unwrap();
        assert_eq!(wire.len(), 4 + MAX_HEADER_LEN as usize);

        let decoded = read_header(&mut Cursor::new(wire)).await.unwrap();
        assert_eq!(decoded, header);
    }

    #[tokio::test]
    async fn encoding_oversized_header_is_refused() {
        let header = FileHeader::new("a".repeat(MAX_HEADER_LEN as usize), 1);
        let mut wire = Vec::new();
        let err = write_header(&mut wire, &header).await.unwrap_err();
        assert!(matches!(err, FrameError::HeaderTooLarge { .. }));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn malformed_metadata_rejected() {
        init_test_tracing();
        let cases: [&[u8]; 4] = [
            br#"{"filename":"a.txt"}"#,
            br#"{"filename":"a.txt","size":-5}"#,
            b"not json at all",
            &[0xFF, 0xFE, 0xFD],
        ];

        for json in cases {
            let mut wire = (json.len() as u32).to_be_bytes().to_vec();
            wire.extend_from_slice(json);
            let err = read_header(&mut Cursor::new(wire)).await.unwrap_err();
            assert!(
                matches!(err, FrameError::MalformedMetadata(_)),
                "expected MalformedMetadata for {:?}, got {err}",
                String::from_utf8_lossy(json)
            );
        }
    }

    #[tokio::test]
    async fn truncated_header_reported() {
        let mut wire = 20u32.to_be_bytes().to_vec();
        wire.extend_from_slice(br#"{"filen"#);
        let err = read_header(&mut Cursor::new(wire)).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedHeader {
                expected: 20,
                received: 7
            }
        ));

        let err = read_header(&mut Cursor::new(vec![0u8, 0])).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedHeader { .. }));
    }

    #[tokio::test]
    async fn stream_closed_early_reported() {
        init_test_tracing();
        let mut stream = Cursor::new(test_payload(100_000));
        let mut reader = PayloadReader::new(150_000);

        let mut total = 0;
        let err = loop {
            match reader.next_chunk(&mut stream).await {
                Ok(Some(chunk)) => total += chunk.len(),
                Ok(None) => panic!("payload should not complete"),
                Err(e) => break e,
            }
        };

        assert_eq!(total, CHUNK_SIZE);
        assert!(matches!(
            err,
            FrameError::StreamClosedEarly {
                expected: 150_000,
                received: 100_000
            }
        ));
    }

    #[tokio::test]
    async fn partial_reads_are_accumulated() {
        init_test_tracing();
        let data = test_payload(CHUNK_SIZE + 10);
        let mut trickle = Trickle {
            data: data.clone(),
            pos: 0,
            step: 7,
        };

        let mut reader = PayloadReader::new(data.len() as u64);
        let first = reader.next_chunk(&mut trickle).await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        assert_eq!(first, &data[..CHUNK_SIZE]);

        let second = reader.next_chunk(&mut trickle).await.unwrap().unwrap();
        assert_eq!(second, &data[CHUNK_SIZE..]);
        assert!(reader.next_chunk(&mut trickle).await.unwrap().is_none());
        assert_eq!(reader.received(), data.len() as u64);
    }

    #[tokio::test]
    async fn short_source_is_reported() {
        let mut source = Cursor::new(test_payload(10));
        let mut sink = Vec::new();
        let err = write_payload(&mut source, &mut sink, 20, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::SourceTruncated {
                expected: 20,
                produced: 10
            }
        ));
    }

    #[tokio::test]
    async fn payload_writes_are_chunk_sized() {
        let size = CHUNK_SIZE * 2 + 3;
        let mut source = Cursor::new(test_payload(size));
        let mut sink = Vec::new();
        let mut checkpoints = Vec::new();
        write_payload(&mut source, &mut sink, size as u64, |sent| {
            checkpoints.push(sent)
        })
        .await
        .unwrap();

        assert_eq!(
            checkpoints,
            vec![CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64, size as u64]
        );
        assert_eq!(sink.len(), size);
    }
}
