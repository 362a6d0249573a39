//! Wire messages exchanged between the master and its workers.
//!
//! Process workers frame every message as a 4-byte little-endian length
//! followed by a MessagePack body. Thread workers pass the same types over
//! in-memory channels without encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{OffloadError, RemoteError};

/// Token matching a reply to the call that caused it.
pub type CorrelationId = Uuid;

/// Frames larger than this are treated as a corrupted stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Invocation request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub operation: String,
    pub correlation_id: CorrelationId,
    pub args: Vec<Value>,
}

/// Master → worker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Call(Call),
    /// Stop the worker loop after the current call.
    Shutdown,
}

/// Result of one call as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Ok(Value),
    Err(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub outcome: Outcome,
}

impl Reply {
    pub fn ok(correlation_id: CorrelationId, value: Value) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Ok(value),
        }
    }

    pub fn err(correlation_id: CorrelationId, error: RemoteError) -> Self {
        Self {
            correlation_id,
            outcome: Outcome::Err(error),
        }
    }
}

/// Worker → master message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Sent once, after the worker finished loading its operations.
    Ready,
    Reply(Reply),
}

/// Write one length-prefixed MessagePack frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), OffloadError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = rmp_serde::to_vec(message)?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(OffloadError::Protocol(format!(
            "outgoing frame too large: {} bytes",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, OffloadError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(OffloadError::Protocol(format!(
                "truncated length prefix ({filled} of 4 bytes)"
            )));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(OffloadError::Protocol(format!(
            "incoming frame too large: {len} bytes"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        OffloadError::Protocol(format!("truncated frame ({len} bytes expected): {e}"))
    })?;
    Ok(Some(rmp_serde::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn call_survives_framing() {
        let call = Command::Call(Call {
            operation: "say".into(),
            correlation_id: Uuid::new_v4(),
            args: vec![json!(["Mihai"]), json!({"nested": [1, 2.5, null]})],
        });

        let mut buf = Vec::new();
        write_frame(&mut buf, &call).await.unwrap();
        let mut reader = buf.as_slice();
        let decoded: Option<Command> = read_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, Some(call));
    }

    #[tokio::test]
    async fn consecutive_frames_then_eof() {
        let id = Uuid::new_v4();
        let mut buf = Vec::new();
        write_frame(&mut buf, &Event::Ready).await.unwrap();
        let reply = Event::Reply(Reply::err(
            id,
            RemoteError::new(RemoteErrorKind::UnknownOperation, "missing"),
        ));
        write_frame(&mut buf, &reply).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_frame::<_, Event>(&mut reader).await.unwrap(), Some(Event::Ready));
        assert_eq!(read_frame::<_, Event>(&mut reader).await.unwrap(), Some(reply));
        assert_eq!(read_frame::<_, Event>(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let mut reader = &len[..];
        let err = read_frame::<_, Event>(&mut reader).await.unwrap_err();
        assert!(matches!(err, OffloadError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_a_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Event::Ready).await.unwrap();
        buf.extend_from_slice(&[7, 0]);

        let mut reader = buf.as_slice();
        assert_eq!(read_frame::<_, Event>(&mut reader).await.unwrap(), Some(Event::Ready));
        let err = read_frame::<_, Event>(&mut reader).await.unwrap_err();
        assert!(matches!(err, OffloadError::Protocol(msg) if msg.contains("2 of 4")));
    }

    #[tokio::test]
    async fn truncated_body_is_a_protocol_error() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);
        let mut reader = buf.as_slice();
        let err = read_frame::<_, Event>(&mut reader).await.unwrap_err();
        assert!(matches!(err, OffloadError::Protocol(_)));
    }
}
