use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Bumped whenever the envelope layout changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame body unless the caller picks another one.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Arguments a secondary launch forwards to the primary instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandoffMessage {
    pub id: String,
    pub pid: u32,
    pub ts_ms: u64,
    /// The full argument vector of the sending process, program name included.
    pub args: Vec<String>,
}

impl HandoffMessage {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            ts_ms: now_ms(),
            args,
        }
    }
}

/// Everything that travels over an instance endpoint connection.
///
/// A connection carries exactly: `Hello` (primary -> secondary), one
/// `Handoff` (secondary -> primary), then an optional `Ack` (primary -> secondary).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Hello { version: u32, pid: u32 },
    Handoff(HandoffMessage),
    Ack { id: String },
}

impl Envelope {
    pub fn hello() -> Self {
        Envelope::Hello {
            version: PROTOCOL_VERSION,
            pid: std::process::id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Handoff(_) => "handoff",
            Envelope::Ack { .. } => "ack",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a frame body. Callers drop the frame on error; nothing here panics.
    pub fn try_from_bytes(b: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(b)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection closed before a frame header arrived")]
    Closed,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("connection closed after {expected}-byte header but before the full body")]
    Truncated { expected: usize },
    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Write one frame: u32 big-endian body length, then the body.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame body.
///
/// The length header is checked against `max_len` before any allocation, and a
/// body cut short by EOF is reported as `Truncated` rather than returned.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(l) => l as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(e) => return Err(FrameError::Io(e)),
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(FrameError::Truncated { expected: len })
        }
        Err(e) => Err(FrameError::Io(e)),
    }
}

pub async fn write_envelope<W>(writer: &mut W, env: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let body = env.to_bytes()?;
    write_frame(writer, &body).await
}

pub async fn read_envelope<R>(reader: &mut R, max_len: usize) -> Result<Envelope, FrameError>
where
    R: AsyncRead + Unpin,
{
    let body = read_frame(reader, max_len).await?;
    Ok(Envelope::try_from_bytes(&body)?)
}

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handoff_survives_awkward_arguments() {
        let args = vec![
            "/usr/bin/jitsi-meet-launcher".to_string(),
            String::new(),
            "line one\nline two".to_string(),
            "jitsi-meet://example.com/a/b:c".to_string(),
            "ünïcødé \u{0}".to_string(),
            "x".repeat(10_000),
        ];
        let msg = HandoffMessage::new(args.clone());
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        write_envelope(&mut a, &Envelope::Handoff(msg.clone()))
            .await
            .unwrap();
        let got = read_envelope(&mut b, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

        match got {
            Envelope::Handoff(m) => {
                assert_eq!(m.args, args);
                assert_eq!(m.id, msg.id);
            }
            other => panic!("expected handoff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn back_to_back_frames_do_not_merge() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_envelope(&mut a, &Envelope::hello()).await.unwrap();
        write_envelope(&mut a, &Envelope::Ack { id: "abc".to_string() })
            .await
            .unwrap();

        let first = read_envelope(&mut b, 1024).await.unwrap();
        let second = read_envelope(&mut b, 1024).await.unwrap();
        assert_eq!(first.kind(), "hello");
        assert_eq!(second, Envelope::Ack { id: "abc".to_string() });
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_before_reading_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10 * 1024 * 1024).await.unwrap();

        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len, max: 1024 } if len == 10 * 1024 * 1024));
    }

    #[tokio::test]
    async fn short_body_is_truncated_not_returned() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(20).await.unwrap();
        a.write_all(b"{\"type\"").await.unwrap();
        drop(a);

        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 20 }));
    }

    #[tokio::test]
    async fn eof_before_header_is_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(read_frame(&mut b, 1024).await, Err(FrameError::Closed)));
    }

    #[test]
    fn unknown_envelope_type_is_a_decode_error() {
        let err = Envelope::try_from_bytes(br#"{"type":"shutdown"}"#).unwrap_err();
        assert!(err.is_data());
    }

    #[test]
    fn handoff_wire_shape_is_tagged_json() {
        let msg = HandoffMessage {
            id: "1".to_string(),
            pid: 42,
            ts_ms: 7,
            args: vec!["app".to_string()],
        };
        let body = Envelope::Handoff(msg).to_bytes().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["type"], "handoff");
        assert_eq!(v["pid"], 42);
        assert_eq!(v["args"][0], "app");
    }
}
