//! Framing for engine messages on byte streams.
//!
//! Each JSON message travels as a big-endian `u32` byte count followed by
//! that many bytes of UTF-8 JSON:
//!
//! ```text
//! [len: u32 BE][json: len bytes]
//! ```

use crate::config::TransportDefaults;
use crate::error::{EnigmaError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Next engine message from `reader`, or `None` once the stream ends between
/// messages. A stream that ends inside a message is an error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_len(len)?;

    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).await?;
    Ok(Some(message))
}

/// Send one engine message and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, message: &[u8]) -> Result<()> {
    check_len(message.len())?;
    let len = u32::try_from(message.len()).map_err(|_| oversized(message.len()))?;
    writer.write_u32(len).await?;
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}

fn check_len(len: usize) -> Result<()> {
    if len > TransportDefaults::MAX_FRAME_SIZE {
        return Err(oversized(len));
    }
    Ok(())
}

fn oversized(len: usize) -> EnigmaError {
    EnigmaError::Io {
        message: format!(
            "Engine message of {} bytes is over the {} byte limit",
            len,
            TransportDefaults::MAX_FRAME_SIZE
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_survive_the_stream() {
        let messages: [&[u8]; 2] = [br#"{"jsonrpc":"2.0","id":1,"result":{}}"#, b"{}"];
        let mut stream = Vec::new();
        for message in messages {
            write_frame(&mut stream, message).await.unwrap();
        }
        assert_eq!(&stream[..4], &[0, 0, 0, messages[0].len() as u8]);

        let mut reader = stream.as_slice();
        for message in messages {
            assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(message));
        }
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_length_over_limit_is_refused() {
        let len = (TransportDefaults::MAX_FRAME_SIZE + 1) as u32;
        let mut stream = len.to_be_bytes().to_vec();
        stream.extend_from_slice(b"{}");

        let err = read_frame(&mut stream.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("byte limit"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_stream_ending_inside_a_message_fails() {
        let mut stream = 16u32.to_be_bytes().to_vec();
        stream.extend_from_slice(br#"{"id":"#);

        assert!(read_frame(&mut stream.as_slice()).await.is_err());
    }
}
