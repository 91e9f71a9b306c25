//! Resumption handshake and framed link codec.
//!
//! Every transport connection starts with exactly one [`Hello`] from the
//! client and one [`Welcome`] from the relay. After that, both directions
//! carry [`Frame`]s: `Data` frames with a piggybacked cumulative ack, and
//! standalone `Ack` frames for when a direction is otherwise idle.
//!
//! ## Frame format
//!
//! Fixed 5-byte header: `[type: 1 byte] [length: 4 bytes little-endian]`,
//! followed by `length` payload bytes. Offsets and acks are cumulative byte
//! counts since session creation, encoded as `u64` little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{SessionId, WireError};

const TYPE_HELLO: u8 = 0x01;
const TYPE_WELCOME: u8 = 0x02;
const TYPE_DATA: u8 = 0x03;
const TYPE_ACK: u8 = 0x04;

const HELLO_FRESH: u8 = 0x00;
const HELLO_RESUME: u8 = 0x01;
const WELCOME_ESTABLISHED: u8 = 0x00;
const WELCOME_RESUMED: u8 = 0x01;

const HEADER_LEN: usize = 5;

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Largest data chunk per `Data` frame (frame payload minus the ack field).
pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - 8;

/// Longest accepted preferred-backend name in a fresh hello.
const MAX_TARGET_LEN: usize = 256;

/// First message on a new transport connection, client to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    /// Start a brand-new session, optionally pinned to a named backend.
    Fresh { target: Option<String> },
    /// Resume a prior session. `received` is the cumulative count of relay
    /// bytes the client has received on that session.
    Resume { id: SessionId, received: u64 },
}

/// Relay's answer to a [`Hello`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Welcome {
    /// A fresh identity was assigned. Also the answer to a resume attempt
    /// that could not be honored.
    Established { id: SessionId },
    /// Resumption confirmed. `received` is the relay's cumulative count of
    /// client bytes; the client replays everything past it.
    Resumed { id: SessionId, received: u64 },
}

/// Steady-state frame, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes plus the sender's cumulative received count.
    Data { ack: u64, payload: Bytes },
    /// Standalone cumulative received count.
    Ack { ack: u64 },
}

/// Read half of a framed session link.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Reads one raw frame into the internal buffer.
    async fn read_raw(&mut self) -> Result<u8, WireError> {
        let mut header = [0u8; HEADER_LEN];
        self.reader.read_exact(&mut header).await?;
        let frame_type = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }

        self.buf.clear();
        self.buf.reserve(len);
        let mut taker = (&mut self.reader).take(len as u64);
        while self.buf.len() < len {
            let n = taker.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
        Ok(frame_type)
    }

    /// Reads the handshake request. Anything other than a hello is a
    /// protocol violation.
    pub async fn read_hello(&mut self) -> Result<Hello, WireError> {
        match self.read_raw().await? {
            TYPE_HELLO => {}
            other => return Err(WireError::UnknownFrame(other)),
        }
        let mut payload = self.buf.split().freeze();
        if payload.is_empty() {
            return Err(WireError::Malformed("empty hello"));
        }
        match payload.get_u8() {
            HELLO_FRESH => {
                if payload.remaining() < 2 {
                    return Err(WireError::Malformed("truncated hello target length"));
                }
                let name_len = payload.get_u16_le() as usize;
                if name_len > MAX_TARGET_LEN {
                    return Err(WireError::Malformed("hello target too long"));
                }
                if payload.remaining() != name_len {
                    return Err(WireError::Malformed("hello target length mismatch"));
                }
                let target = if name_len == 0 {
                    None
                } else {
                    let name = std::str::from_utf8(&payload)
                        .map_err(|_| WireError::Malformed("hello target not utf-8"))?;
                    Some(name.to_string())
                };
                Ok(Hello::Fresh { target })
            }
            HELLO_RESUME => {
                if payload.remaining() != SessionId::LEN + 8 {
                    return Err(WireError::Malformed("bad resume hello length"));
                }
                let mut id = [0u8; SessionId::LEN];
                payload.copy_to_slice(&mut id);
                let received = payload.get_u64_le();
                Ok(Hello::Resume {
                    id: SessionId::from_bytes(id),
                    received,
                })
            }
            _ => Err(WireError::Malformed("unknown hello kind")),
        }
    }

    /// Reads the handshake response (client side of the link).
    pub async fn read_welcome(&mut self) -> Result<Welcome, WireError> {
        match self.read_raw().await? {
            TYPE_WELCOME => {}
            other => return Err(WireError::UnknownFrame(other)),
        }
        let mut payload = self.buf.split().freeze();
        if payload.is_empty() {
            return Err(WireError::Malformed("empty welcome"));
        }
        match payload.get_u8() {
            WELCOME_ESTABLISHED => {
                if payload.remaining() != SessionId::LEN {
                    return Err(WireError::Malformed("bad welcome length"));
                }
                let mut id = [0u8; SessionId::LEN];
                payload.copy_to_slice(&mut id);
                Ok(Welcome::Established {
                    id: SessionId::from_bytes(id),
                })
            }
            WELCOME_RESUMED => {
                if payload.remaining() != SessionId::LEN + 8 {
                    return Err(WireError::Malformed("bad resumed welcome length"));
                }
                let mut id = [0u8; SessionId::LEN];
                payload.copy_to_slice(&mut id);
                let received = payload.get_u64_le();
                Ok(Welcome::Resumed {
                    id: SessionId::from_bytes(id),
                    received,
                })
            }
            _ => Err(WireError::Malformed("unknown welcome kind")),
        }
    }

    /// Reads one steady-state frame.
    pub async fn read_frame(&mut self) -> Result<Frame, WireError> {
        match self.read_raw().await? {
            TYPE_DATA => {
                let mut payload = self.buf.split().freeze();
                if payload.remaining() < 8 {
                    return Err(WireError::Malformed("truncated data frame"));
                }
                let ack = payload.get_u64_le();
                Ok(Frame::Data { ack, payload })
            }
            TYPE_ACK => {
                let mut payload = self.buf.split().freeze();
                if payload.remaining() != 8 {
                    return Err(WireError::Malformed("bad ack frame length"));
                }
                Ok(Frame::Ack {
                    ack: payload.get_u64_le(),
                })
            }
            other => Err(WireError::UnknownFrame(other)),
        }
    }
}

/// Write half of a framed session link.
///
/// Each call issues a single `write_all` so a frame never interleaves with
/// another writer at the syscall level, then flushes.
pub struct FrameWriter<W> {
    writer: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    fn start(&mut self, frame_type: u8) {
        self.buf.clear();
        self.buf.put_u8(frame_type);
        self.buf.put_u32_le(0); // patched in finish()
    }

    async fn finish(&mut self) -> Result<(), WireError> {
        let len = (self.buf.len() - HEADER_LEN) as u32;
        self.buf[1..HEADER_LEN].copy_from_slice(&len.to_le_bytes());
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_hello(&mut self, hello: &Hello) -> Result<(), WireError> {
        self.start(TYPE_HELLO);
        match hello {
            Hello::Fresh { target } => {
                let name = target.as_deref().unwrap_or("");
                if name.len() > MAX_TARGET_LEN {
                    return Err(WireError::Malformed("hello target too long"));
                }
                self.buf.put_u8(HELLO_FRESH);
                self.buf.put_u16_le(name.len() as u16);
                self.buf.put_slice(name.as_bytes());
            }
            Hello::Resume { id, received } => {
                self.buf.put_u8(HELLO_RESUME);
                self.buf.put_slice(&id.to_bytes());
                self.buf.put_u64_le(*received);
            }
        }
        self.finish().await
    }

    pub async fn write_welcome(&mut self, welcome: &Welcome) -> Result<(), WireError> {
        self.start(TYPE_WELCOME);
        match welcome {
            Welcome::Established { id } => {
                self.buf.put_u8(WELCOME_ESTABLISHED);
                self.buf.put_slice(&id.to_bytes());
            }
            Welcome::Resumed { id, received } => {
                self.buf.put_u8(WELCOME_RESUMED);
                self.buf.put_slice(&id.to_bytes());
                self.buf.put_u64_le(*received);
            }
        }
        self.finish().await
    }

    pub async fn write_data(&mut self, ack: u64, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::FrameTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        self.start(TYPE_DATA);
        self.buf.put_u64_le(ack);
        self.buf.put_slice(payload);
        self.finish().await
    }

    pub async fn write_ack(&mut self, ack: u64) -> Result<(), WireError> {
        self.start(TYPE_ACK);
        self.buf.put_u64_le(ack);
        self.finish().await
    }

    /// Half-closes the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        FrameWriter<tokio::io::DuplexStream>,
        FrameReader<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (FrameWriter::new(a), FrameReader::new(b))
    }

    #[tokio::test]
    async fn hello_round_trips() {
        let (mut w, mut r) = pair();

        for hello in [
            Hello::Fresh { target: None },
            Hello::Fresh {
                target: Some("game-3".to_string()),
            },
            Hello::Resume {
                id: SessionId::new(),
                received: 987_654,
            },
        ] {
            w.write_hello(&hello).await.unwrap();
            assert_eq!(r.read_hello().await.unwrap(), hello);
        }
    }

    #[tokio::test]
    async fn welcome_round_trips() {
        let (mut w, mut r) = pair();
        let id = SessionId::new();

        w.write_welcome(&Welcome::Established { id }).await.unwrap();
        assert_eq!(r.read_welcome().await.unwrap(), Welcome::Established { id });

        w.write_welcome(&Welcome::Resumed { id, received: 42 })
            .await
            .unwrap();
        assert_eq!(
            r.read_welcome().await.unwrap(),
            Welcome::Resumed { id, received: 42 }
        );
    }

    #[tokio::test]
    async fn data_and_ack_round_trip() {
        let (mut w, mut r) = pair();

        w.write_data(7, b"hello backend").await.unwrap();
        match r.read_frame().await.unwrap() {
            Frame::Data { ack, payload } => {
                assert_eq!(ack, 7);
                assert_eq!(&payload[..], b"hello backend");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        w.write_ack(99).await.unwrap();
        assert_eq!(r.read_frame().await.unwrap(), Frame::Ack { ack: 99 });
    }

    #[tokio::test]
    async fn empty_data_frame_is_valid() {
        let (mut w, mut r) = pair();
        w.write_data(3, b"").await.unwrap();
        match r.read_frame().await.unwrap() {
            Frame::Data { ack, payload } => {
                assert_eq!(ack, 3);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_on_write() {
        let (mut w, _r) = pair();
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            w.write_data(0, &big).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_on_read() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(1024);
        let mut r = FrameReader::new(b);

        let mut header = vec![TYPE_DATA];
        header.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        raw.write_all(&header).await.unwrap();

        assert!(matches!(
            r.read_frame().await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_frame_type_is_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(1024);
        let mut r = FrameReader::new(b);

        raw.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            r.read_frame().await,
            Err(WireError::UnknownFrame(0x7f))
        ));
    }

    #[tokio::test]
    async fn hello_where_frame_expected_is_rejected() {
        let (mut w, mut r) = pair();
        w.write_hello(&Hello::Fresh { target: None }).await.unwrap();
        assert!(matches!(
            r.read_frame().await,
            Err(WireError::UnknownFrame(TYPE_HELLO))
        ));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_io_error() {
        use tokio::io::AsyncWriteExt;

        let (mut raw, b) = tokio::io::duplex(1024);
        let mut r = FrameReader::new(b);

        // Header promises 10 bytes, only 3 arrive before the close.
        let mut partial = vec![TYPE_DATA];
        partial.extend_from_slice(&10u32.to_le_bytes());
        partial.extend_from_slice(&[1, 2, 3]);
        raw.write_all(&partial).await.unwrap();
        drop(raw);

        assert!(matches!(r.read_frame().await, Err(WireError::Io(_))));
    }
}
