//! Length-prefixed JSON-RPC framing over async byte streams.
//!
//! The base protocol is a block of HTTP-style headers, a blank line, then
//! `Content-Length` bytes of UTF-8 JSON. [`FrameReader`] and [`FrameWriter`]
//! work over any `AsyncRead`/`AsyncWrite`, so tests can run an endpoint over
//! an in-memory pipe.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body. Guards against a runaway peer.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads framed JSON-RPC messages.
pub struct FrameReader<R> {
    input: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
        }
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream at a
    /// frame boundary; end-of-stream anywhere inside a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES}-byte limit");
        }

        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        let frame = serde_json::from_slice(&body).context("decoding frame body")?;
        Ok(Some(frame))
    }

    /// Consume headers up to the blank separator line and return the
    /// `Content-Length` value. Header names are matched case-insensitively;
    /// `Content-Type` and anything unrecognized is skipped.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut length: Option<usize> = None;
        let mut header_bytes = 0usize;
        let mut line = String::new();

        loop {
            line.clear();
            let n = self
                .input
                .read_line(&mut line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                // EOF between frames is a clean close; EOF after any header
                // byte is a truncated frame, even if Content-Length never
                // appeared.
                if header_bytes == 0 {
                    return Ok(None);
                }
                bail!("stream ended in the middle of a frame header");
            }
            header_bytes += n;

            let header = line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                return match length {
                    Some(length) => Ok(Some(length)),
                    None => bail!("frame header missing Content-Length"),
                };
            }

            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("content-length")
            {
                length = Some(value.trim().parse().context("parsing Content-Length")?);
            }
        }
    }
}

/// Writes framed JSON-RPC messages.
pub struct FrameWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Serialize one frame with its `Content-Length` header and flush it.
    ///
    /// Header and body go out in a single write so a frame reaches the
    /// stream whole.
    pub async fn write_frame(&mut self, frame: &Value) -> Result<()> {
        let body = serde_json::to_string(frame).context("encoding frame body")?;
        let mut message = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        message.extend_from_slice(body.as_bytes());

        self.output
            .write_all(&message)
            .await
            .context("writing frame")?;
        self.output.flush().await.context("flushing frame")?;
        Ok(())
    }
}
