//! Frame codec for the tunnel control channel
//!
//! Frame format (9-byte header, big endian, no padding or checksum):
//! ```text
//! +--------+-----------------+-----------------+----------------+
//! |  Type  |  Stream ID (4B) | Payload len (4B)|    Payload     |
//! +--------+-----------------+-----------------+----------------+
//! ```
//!
//! Every frame for every stream of a client travels over the one control
//! channel, so an encoded frame is always a single contiguous buffer: header
//! and payload must never be split across separate writes, or concurrent
//! writers would interleave and corrupt the stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header size in bytes: type (1) + stream id (4) + payload length (4)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default cap on a decoded payload (16 MiB). The wire format itself allows
/// up to `u32::MAX`; the cap protects the decoder against hostile lengths.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Stream ID reserved for the INIT frame; never refers to a real stream.
pub const INIT_STREAM_ID: u32 = 0;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// End of stream on a frame boundary (clean peer close).
    #[error("connection closed")]
    Closed,

    /// End of stream in the middle of a header or payload.
    #[error("short read: connection closed mid-frame")]
    ShortRead,

    #[error("payload too large: {0} bytes exceeds cap of {1}")]
    PayloadTooLarge(usize, usize),

    #[error("invalid init config: {0}")]
    InvalidInitConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// New external connection announced by the server
    NewConn,
    /// Payload chunk for a stream (both directions)
    Data,
    /// Stream termination (both directions)
    Close,
    /// Tunnel configuration sent by the client after connecting
    Init,
    /// Unrecognized type byte, preserved for forward compatibility
    Unknown(u8),
}

impl FrameType {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0x01 => FrameType::NewConn,
            0x02 => FrameType::Data,
            0x03 => FrameType::Close,
            0x04 => FrameType::Init,
            other => FrameType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            FrameType::NewConn => 0x01,
            FrameType::Data => 0x02,
            FrameType::Close => 0x03,
            FrameType::Init => 0x04,
            FrameType::Unknown(other) => other,
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID (0 is reserved for INIT)
    pub stream_id: u32,
    /// Payload data (empty for NEW_CONN and CLOSE)
    pub payload: Bytes,
}

impl Frame {
    /// Create a NEW_CONN frame announcing a stream
    pub fn new_conn(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::NewConn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a DATA frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a CLOSE frame
    pub fn close(stream_id: u32) -> Self {
        Self {
            frame_type: FrameType::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create the INIT frame carrying the tunnel configuration
    pub fn init(config: &InitConfig) -> Self {
        Self {
            frame_type: FrameType::Init,
            stream_id: INIT_STREAM_ID,
            payload: config.encode(),
        }
    }

    /// Encode the frame into a single contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.frame_type.to_wire());
        buf.put_u32(self.stream_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Read exactly one frame from `reader`, blocking until it is complete.
    ///
    /// A clean end-of-stream before the first header byte is
    /// [`ProtocolError::Closed`]; end-of-stream anywhere inside a frame is
    /// [`ProtocolError::ShortRead`]. A declared payload length above
    /// `max_payload` is rejected without reading the payload.
    pub async fn read_from<R>(reader: &mut R, max_payload: usize) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut read = 0;
        while read < FRAME_HEADER_SIZE {
            let n = reader.read(&mut header[read..]).await?;
            if n == 0 {
                return Err(if read == 0 {
                    ProtocolError::Closed
                } else {
                    ProtocolError::ShortRead
                });
            }
            read += n;
        }

        let frame_type = FrameType::from_wire(header[0]);
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let payload_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

        if payload_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge(payload_len, max_payload));
        }

        let payload = if payload_len > 0 {
            let mut buf = vec![0u8; payload_len];
            reader.read_exact(&mut buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ProtocolError::ShortRead
                } else {
                    ProtocolError::Io(e)
                }
            })?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        Ok(Self {
            frame_type,
            stream_id,
            payload,
        })
    }
}

/// Tunnel configuration carried by the INIT frame.
///
/// Textual wire encoding: decimal port, one `:`, then the local address
/// verbatim. The address keeps its own colons (`host:port`), so decoding
/// splits on the first separator only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    /// Port the server should expose for this client (0 = unspecified)
    pub remote_port: u16,
    /// Local service address the client maps, e.g. `127.0.0.1:80`
    pub local_addr: String,
}

impl InitConfig {
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{}:{}", self.remote_port, self.local_addr))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::InvalidInitConfig("not valid UTF-8".to_string()))?;

        let (port, local_addr) = text
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidInitConfig("missing separator".to_string()))?;

        let remote_port = port
            .parse::<u16>()
            .map_err(|e| ProtocolError::InvalidInitConfig(format!("invalid remote port: {e}")))?;

        Ok(Self {
            remote_port,
            local_addr: local_addr.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frames = [
            Frame::new_conn(1),
            Frame::data(42, Bytes::from_static(b"Hello, Reverse Tunnel!")),
            Frame::close(7),
            Frame::init(&InitConfig {
                remote_port: 18080,
                local_addr: "127.0.0.1:80".to_string(),
            }),
        ];

        for original in frames {
            let encoded = original.encode();
            let mut reader: &[u8] = &encoded;
            let decoded = Frame::read_from(&mut reader, MAX_PAYLOAD_SIZE)
                .await
                .unwrap();
            assert_eq!(decoded, original);
            assert_eq!(decoded.encode(), encoded);
        }
    }

    #[tokio::test]
    async fn test_header_layout() {
        let frame = Frame::data(0x01020304, Bytes::from_static(b"ab"));
        let encoded = frame.encode();

        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 2);
        assert_eq!(encoded[0], 0x02);
        assert_eq!(&encoded[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&encoded[5..9], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&encoded[9..], b"ab");
    }

    #[tokio::test]
    async fn test_decode_leaves_remainder_untouched() {
        let first = Frame::data(1, Bytes::from_static(b"first"));
        let second = Frame::close(2);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&first.encode());
        wire.extend_from_slice(&second.encode());

        let mut reader: &[u8] = &wire;
        assert_eq!(
            Frame::read_from(&mut reader, MAX_PAYLOAD_SIZE).await.unwrap(),
            first
        );
        assert_eq!(
            Frame::read_from(&mut reader, MAX_PAYLOAD_SIZE).await.unwrap(),
            second
        );
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_byte_survives_roundtrip() {
        let frame = Frame {
            frame_type: FrameType::Unknown(0x7f),
            stream_id: 3,
            payload: Bytes::from_static(b"future"),
        };

        let encoded = frame.encode();
        let mut reader: &[u8] = &encoded;
        let decoded = Frame::read_from(&mut reader, MAX_PAYLOAD_SIZE)
            .await
            .unwrap();

        assert_eq!(decoded.frame_type, FrameType::Unknown(0x7f));
        assert_eq!(decoded.encode(), encoded);
    }

    #[tokio::test]
    async fn test_clean_eof_vs_short_read() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            Frame::read_from(&mut empty, MAX_PAYLOAD_SIZE).await,
            Err(ProtocolError::Closed)
        ));

        // Truncated header
        let mut partial: &[u8] = &[0x02, 0x00, 0x00];
        assert!(matches!(
            Frame::read_from(&mut partial, MAX_PAYLOAD_SIZE).await,
            Err(ProtocolError::ShortRead)
        ));

        // Header declares more payload than is present
        let full = Frame::data(1, Bytes::from_static(b"hello")).encode();
        let mut truncated: &[u8] = &full[..full.len() - 2];
        assert!(matches!(
            Frame::read_from(&mut truncated, MAX_PAYLOAD_SIZE).await,
            Err(ProtocolError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let frame = Frame::data(1, Bytes::from_static(b"0123456789"));
        let encoded = frame.encode();

        let mut reader: &[u8] = &encoded;
        assert!(matches!(
            Frame::read_from(&mut reader, 4).await,
            Err(ProtocolError::PayloadTooLarge(10, 4))
        ));
    }

    #[test]
    fn test_init_config_roundtrip() {
        let config = InitConfig {
            remote_port: 8080,
            local_addr: "127.0.0.1:3000".to_string(),
        };

        let encoded = config.encode();
        assert_eq!(&encoded[..], b"8080:127.0.0.1:3000");

        let decoded = InitConfig::decode(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_init_config_local_addr_keeps_colons() {
        let decoded = InitConfig::decode(b"0:[::1]:443").unwrap();
        assert_eq!(decoded.remote_port, 0);
        assert_eq!(decoded.local_addr, "[::1]:443");
    }

    #[test]
    fn test_init_config_invalid() {
        assert!(InitConfig::decode(b"no-separator").is_err());
        assert!(InitConfig::decode(b"notaport:127.0.0.1:80").is_err());
        assert!(InitConfig::decode(b"70000:127.0.0.1:80").is_err());
    }
}
