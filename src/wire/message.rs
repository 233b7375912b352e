use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::WireError;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;
/// Message id of extension protocol frames (BEP-10).
pub const EXTENDED: u8 = 20;

/// Frames larger than this are treated as hostile. The fetcher only ever
/// expects extension frames around one metadata piece in size.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The 68-byte BitTorrent handshake.
///
/// The fetcher advertises exactly one capability: the extension protocol
/// (bit 20 of the reserved field, i.e. `reserved[5] & 0x10`), which carries
/// ut_metadata.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(WireError::InvalidHandshake);
        }

        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(WireError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// One length-prefixed peer wire frame.
///
/// The fetcher cares about extension frames only; everything else a peer
/// sends (choke state, bitfields, haves) is surfaced as `Other` and
/// skipped.
#[derive(Debug, Clone)]
pub enum Frame {
    KeepAlive,
    Extended { ext_id: u8, payload: Bytes },
    Other { id: u8 },
}

/// A buffered peer connection speaking length-prefixed frames.
///
/// No internal deadlines: the fetcher wraps the whole session in one
/// timeout.
pub struct Transport {
    stream: TcpStream,
    read_buf: BytesMut,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    async fn fill(&mut self, need: usize) -> Result<(), WireError> {
        while self.read_buf.len() < need {
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(WireError::ConnectionClosed);
            }
        }
        Ok(())
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), WireError> {
        self.stream.write_all(&handshake.encode()).await?;
        Ok(())
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, WireError> {
        self.fill(HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Sends one extension frame: message id 20, then the extension sub-id
    /// and its payload.
    pub async fn send_extended(&mut self, ext_id: u8, payload: &[u8]) -> Result<(), WireError> {
        let mut buf = BytesMut::with_capacity(6 + payload.len());
        buf.put_u32(2 + payload.len() as u32);
        buf.put_u8(EXTENDED);
        buf.put_u8(ext_id);
        buf.put_slice(payload);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Reads the next frame off the wire.
    pub async fn next_frame(&mut self) -> Result<Frame, WireError> {
        self.fill(4).await?;
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(length));
        }

        if length == 0 {
            self.read_buf.advance(4);
            return Ok(Frame::KeepAlive);
        }

        self.fill(4 + length).await?;
        self.read_buf.advance(4);
        let mut frame = self.read_buf.split_to(length);

        let id = frame.get_u8();
        if id != EXTENDED {
            return Ok(Frame::Other { id });
        }

        if frame.is_empty() {
            return Err(WireError::Extension("empty extended frame".into()));
        }

        let ext_id = frame.get_u8();
        Ok(Frame::Extended {
            ext_id,
            payload: frame.freeze(),
        })
    }

    /// Skips frames until the next extension frame.
    pub async fn next_extended(&mut self) -> Result<(u8, Bytes), WireError> {
        loop {
            match self.next_frame().await? {
                Frame::Extended { ext_id, payload } => return Ok((ext_id, payload)),
                Frame::KeepAlive | Frame::Other { .. } => {}
            }
        }
    }
}
