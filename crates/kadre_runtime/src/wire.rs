//! Framed message codec for the client/daemon stream: one byte of opcode,
//! a payload length, a parameter count, then tag-length-value parameters.
//! Opcodes are single printable characters so logs stay greppable.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::ProtocolError;

/// Decode-side cap on one frame's TLV payload.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Stdin = b'i',
    Stdout = b'o',
    Stderr = b'e',
    Cmd = b'c',
    CmdAck = b'C',
    Completion = b'v',
    CompletionAck = b'V',
    Help = b'h',
    HelpAck = b'H',
    Notification = b'n',
    Exit = b'x',
    Auth = b'a',
    AuthAck = b'A',
    Keepalive = b'k',
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            b'i' => Some(Self::Stdin),
            b'o' => Some(Self::Stdout),
            b'e' => Some(Self::Stderr),
            b'c' => Some(Self::Cmd),
            b'C' => Some(Self::CmdAck),
            b'v' => Some(Self::Completion),
            b'V' => Some(Self::CompletionAck),
            b'h' => Some(Self::Help),
            b'H' => Some(Self::HelpAck),
            b'n' => Some(Self::Notification),
            b'x' => Some(Self::Exit),
            b'a' => Some(Self::Auth),
            b'A' => Some(Self::AuthAck),
            b'k' => Some(Self::Keepalive),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

/// Well-known parameter tags.
pub mod tags {
    pub const LINE: u16 = 1;
    pub const RETCODE: u16 = 2;
    pub const ERROR: u16 = 3;
    pub const PREFIX: u16 = 4;
    pub const CANDIDATE: u16 = 5;
    pub const HELP_NAME: u16 = 6;
    pub const HELP_TEXT: u16 = 7;
    pub const USER: u16 = 8;
    pub const CHUNK: u16 = 9;
    pub const REASON: u16 = 10;
    pub const CANCELLED: u16 = 11;
    pub const DONE: u16 = 12;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub params: Vec<(u16, Vec<u8>)>,
}

impl Frame {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    pub fn with_bytes(mut self, tag: u16, value: impl Into<Vec<u8>>) -> Self {
        self.params.push((tag, value.into()));
        self
    }

    pub fn with_str(self, tag: u16, value: impl AsRef<str>) -> Self {
        self.with_bytes(tag, value.as_ref().as_bytes().to_vec())
    }

    pub fn first(&self, tag: u16) -> Option<&[u8]> {
        self.params
            .iter()
            .find(|(found, _)| *found == tag)
            .map(|(_, value)| value.as_slice())
    }

    pub fn first_str(&self, tag: u16) -> Option<&str> {
        self.first(tag).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn all(&self, tag: u16) -> impl Iterator<Item = &[u8]> {
        self.params
            .iter()
            .filter(move |(found, _)| *found == tag)
            .map(|(_, value)| value.as_slice())
    }

    pub fn has(&self, tag: u16) -> bool {
        self.first(tag).is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload_len: usize = self
            .params
            .iter()
            .map(|(_, value)| 2 + 4 + value.len())
            .sum();
        let mut bytes = Vec::with_capacity(1 + 4 + 2 + payload_len);
        bytes.push(self.opcode as u8);
        bytes.extend_from_slice(&(payload_len as u32).to_be_bytes());
        bytes.extend_from_slice(&(self.params.len() as u16).to_be_bytes());
        for (tag, value) in &self.params {
            bytes.extend_from_slice(&tag.to_be_bytes());
            bytes.extend_from_slice(&(value.len() as u32).to_be_bytes());
            bytes.extend_from_slice(value);
        }
        bytes
    }
}

/// Read one frame. Ok(None) means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut opcode_byte = [0u8; 1];
    match reader.read_exact(&mut opcode_byte).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(ProtocolError::Io(err.to_string())),
    }
    let Some(opcode) = Opcode::from_u8(opcode_byte[0]) else {
        return Err(ProtocolError::MalformedFrame(format!(
            "unknown opcode byte 0x{:02x}",
            opcode_byte[0]
        )));
    };

    let mut header = [0u8; 6];
    read_fully(reader, &mut header).await?;
    let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let param_count = u16::from_be_bytes([header[4], header[5]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::MalformedFrame(format!(
            "payload of {payload_len} bytes exceeds cap"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    read_fully(reader, &mut payload).await?;

    let mut params = Vec::with_capacity(param_count);
    let mut offset = 0usize;
    for _ in 0..param_count {
        if offset + 6 > payload.len() {
            return Err(ProtocolError::MalformedFrame(
                "truncated parameter header".to_owned(),
            ));
        }
        let tag = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let len = u32::from_be_bytes([
            payload[offset + 2],
            payload[offset + 3],
            payload[offset + 4],
            payload[offset + 5],
        ]) as usize;
        offset += 6;
        if offset + len > payload.len() {
            return Err(ProtocolError::MalformedFrame(
                "parameter overruns payload".to_owned(),
            ));
        }
        params.push((tag, payload[offset..offset + len].to_vec()));
        offset += len;
    }
    if offset != payload.len() {
        return Err(ProtocolError::MalformedFrame(
            "trailing bytes after parameters".to_owned(),
        ));
    }

    Ok(Some(Frame { opcode, params }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&frame.encode())
        .await
        .map_err(|err| ProtocolError::Io(err.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|err| ProtocolError::Io(err.to_string()))?;
    Ok(())
}

async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::ConnectionClosed)
        }
        Err(err) => Err(ProtocolError::Io(err.to_string())),
    }
}
