//! Transport listeners.
//!
//! Two shapes, both presenting the same envelope contract to the broker:
//!
//! - [`duplex`]: strict request/reply over TCP, one newline-delimited JSON
//!   envelope per line, one response per request, answered in send order.
//! - [`ws`]: multi-client WebSocket; each command is answered on its own
//!   connection and broadcast envelopes fan out to every session.
//!
//! A transport failure never crashes the process: the affected connection
//! is dropped, its in-flight work discarded, and the condition logged.

pub mod duplex;
pub mod ws;

use std::io;
use std::net::SocketAddr;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use devbus_core::{encode, DecodeError, Envelope, EnvelopeKind};

use crate::broker::Broker;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Writes one envelope as a single newline-terminated JSON line.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes =
        encode(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Reads one line-framed message. Returns `None` on a clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Error response for a frame that never became an envelope. A decode
/// failure is fatal for that message only; the connection keeps going.
/// There is no request id to echo, so the response carries a broker id.
pub(crate) fn decode_error_response(broker: &Broker, error: &DecodeError) -> Envelope {
    let kind = match error {
        DecodeError::MalformedPayload(_) => "malformed_payload",
        DecodeError::UnsupportedVersion(_) => "unsupported_version",
        DecodeError::InvalidType(_) => "invalid_type",
    };

    let mut detail = Map::new();
    detail.insert("kind".into(), Value::from(kind));
    detail.insert("message".into(), Value::from(error.to_string()));

    let mut payload = Map::new();
    payload.insert("status".into(), Value::from("error"));
    payload.insert("error".into(), Value::Object(detail));

    Envelope::new(
        EnvelopeKind::Response,
        broker.next_id(),
        broker.source(),
        payload,
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devbus_core::decode;
    use serde_json::Map;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_write_then_read_frame_round_trips() {
        let envelope = Envelope::cmd("c-1", "test", "i2c_scan", Map::new());

        let mut wire = Vec::new();
        write_envelope(&mut wire, &envelope).await.unwrap();
        assert_eq!(wire.last(), Some(&b'\n'));

        let mut reader = BufReader::new(wire.as_slice());
        let frame = read_frame(&mut reader).await.unwrap().expect("one frame");
        assert_eq!(decode(frame.as_bytes()).unwrap(), envelope);

        // EOF after the single frame.
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_strips_crlf() {
        let mut reader = BufReader::new(&b"{\"v\":1}\r\n"[..]);
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame, "{\"v\":1}");
    }

    #[tokio::test]
    async fn test_multiple_frames_read_in_order() {
        let a = Envelope::log("a", "t", "info", "first");
        let b = Envelope::log("b", "t", "info", "second");
        let mut wire = Vec::new();
        write_envelope(&mut wire, &a).await.unwrap();
        write_envelope(&mut wire, &b).await.unwrap();

        let mut reader = BufReader::new(wire.as_slice());
        let first = read_frame(&mut reader).await.unwrap().unwrap();
        let second = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decode(first.as_bytes()).unwrap().id, "a");
        assert_eq!(decode(second.as_bytes()).unwrap().id, "b");
    }
}
