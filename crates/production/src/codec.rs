//! Wire framing for the transport.
//!
//! # Wire Format
//!
//! ```text
//! [length: u32 BE][version: u8][payload: bincode-encoded message]
//! ```
//!
//! The length covers the version byte and payload. Frames above the size
//! cap are rejected before allocation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Current wire format version.
pub const WIRE_VERSION: u8 = 1;

/// Frames larger than this are assumed hostile or corrupt.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Errors from message encoding and framing.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("encode error: {0}")]
    Encode(bincode::Error),

    #[error("decode error: {0}")]
    Decode(bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a message into a full frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(message).map_err(CodecError::Encode)?;
    let len = payload.len() + 1;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.push(WIRE_VERSION);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the body of a frame (everything after the length prefix).
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    let Some((&version, payload)) = body.split_first() else {
        return Err(CodecError::Decode(Box::new(bincode::ErrorKind::Custom(
            "empty frame".into(),
        ))));
    };
    if version != WIRE_VERSION {
        return Err(CodecError::UnknownVersion(version));
    }
    bincode::deserialize(payload).map_err(CodecError::Decode)
}

/// Write one framed message to an async stream.
pub async fn write_frame<S, T>(stream: &mut S, message: &T) -> Result<(), CodecError>
where
    S: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<T, CodecError>
where
    S: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    decode_body(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filament_messages::{Request, SyncRequest};
    use filament_types::KnownEvents;

    #[test]
    fn frame_round_trip() {
        let request = Request::Sync(SyncRequest {
            from_id: 3,
            known: KnownEvents::new(),
        });
        let frame = encode_frame(&request).unwrap();
        assert_eq!(frame[4], WIRE_VERSION);

        let decoded: Request = decode_body(&frame[4..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let body = [9u8, 1, 2, 3];
        let result: Result<Request, _> = decode_body(&body);
        assert!(matches!(result, Err(CodecError::UnknownVersion(9))));
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Request::FastForward(filament_messages::FastForwardRequest { from_id: 1 });
        write_frame(&mut a, &request).await.unwrap();
        let decoded: Request = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, request);
    }
}
