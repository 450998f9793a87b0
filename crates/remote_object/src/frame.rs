//! The length-prefixed wire `Frame` vocabulary and its read/write halves.
//!
//! A reader/writer task pair per connection, each owning one half of the
//! stream, communicating with the rest of the crate over channels. Frames
//! are `bincode`-encoded for bit-exact peer compatibility.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::TransportError;

/// Maximum frame size accepted on read, guarding against a corrupt or hostile
/// length prefix turning into an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// The `MethodCall`/`DeferredResponse` command vocabulary, folded into one
/// wire enum.
///
/// `id` is the framing layer's own request/response correlation id —
/// distinct from the `uuid` correlation id used for deferred calls —
/// allocated per connection by the sending side. Exactly one
/// `MethodCallOk`/`MethodCallErr` answers each `MethodCallRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    MethodCallRequest {
        id: u64,
        method: String,
        args: Vec<u8>,
        kwargs: Vec<u8>,
    },
    MethodCallOk {
        id: u64,
        result: Vec<u8>,
        deferred: Option<String>,
    },
    MethodCallErr {
        id: u64,
        message: String,
    },
    DeferredResponse {
        uuid: String,
        result: Option<Vec<u8>>,
        failure: Option<String>,
    },
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
}

/// Write one length-prefixed frame to `writer`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    let body = bincode::serde::encode_to_vec(frame, bincode_config())
        .map_err(crate::codec::CodecError::Encode)?;
    let len = u32::try_from(body.len()).map_err(|_| TransportError::Disconnected)?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame from `reader`, or `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, TransportError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Disconnected);
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let (frame, _consumed) = bincode::serde::decode_from_slice(&body, bincode_config())
        .map_err(crate::codec::CodecError::Decode)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_through_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::MethodCallRequest {
            id: 7,
            method: "echo".to_string(),
            args: vec![1, 2, 3],
            kwargs: vec![],
        };
        write_frame(&mut a, &frame).await.unwrap();
        let received = read_frame(&mut b).await.unwrap().unwrap();
        match received {
            Frame::MethodCallRequest { id, method, .. } => {
                assert_eq!(id, 7);
                assert_eq!(method, "echo");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_eof() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);
        let mut b = b;
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
