use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::transport::constants::{ServerCommand, ServerResponse, RESPONSE_HEADER_SIZE};

/// A frame travelling subscriber to publisher on the command channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandFrame {
    pub command: ServerCommand,
    pub payload: Bytes,
}

impl CommandFrame {
    pub fn new(command: ServerCommand, payload: impl Into<Bytes>) -> CommandFrame {
        CommandFrame { command, payload: payload.into() }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(1 + self.payload.len() as u32);
        buf.put_u8(self.command.into());
        buf.put_slice(&self.payload);
    }

    /// Parses the frame body, i.e. everything after the length prefix.
    pub fn try_read(mut body: impl Buf) -> anyhow::Result<CommandFrame> {
        let code = body.try_get_u8()?;
        let command = match ServerCommand::try_from(code) {
            Ok(command) => command,
            Err(_) => bail!("unknown command code {:#04x}", code),
        };
        Ok(CommandFrame {
            command,
            payload: body.copy_to_bytes(body.remaining()),
        })
    }
}

/// A frame travelling publisher to subscriber, solicited or not. The header
///  echoes the command that triggered the response (zero for unsolicited
///  frames) and repeats the payload size, which readers ignore in favor of
///  the outer length prefix.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResponseFrame {
    pub response: ServerResponse,
    pub command: ServerCommand,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn new(response: ServerResponse, command: ServerCommand, payload: impl Into<Bytes>) -> ResponseFrame {
        ResponseFrame { response, command, payload: payload.into() }
    }

    pub fn unsolicited(response: ServerResponse, payload: impl Into<Bytes>) -> ResponseFrame {
        Self::new(response, ServerCommand::Connect, payload)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32((RESPONSE_HEADER_SIZE + self.payload.len()) as u32);
        self.ser_body(buf);
    }

    /// The body alone is what a UDP datagram carries.
    pub fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.response.into());
        buf.put_u8(self.command.into());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    pub fn try_read(mut body: impl Buf) -> anyhow::Result<ResponseFrame> {
        let response_code = body.try_get_u8()?;
        let response = match ServerResponse::try_from(response_code) {
            Ok(response) => response,
            Err(_) => bail!("unknown response code {:#04x}", response_code),
        };
        let command_code = body.try_get_u8()?;
        let command = match ServerCommand::try_from(command_code) {
            Ok(command) => command,
            Err(_) => bail!("unknown echoed command code {:#04x}", command_code),
        };
        let _embedded_size = body.try_get_u32()?;
        Ok(ResponseFrame {
            response,
            command,
            payload: body.copy_to_bytes(body.remaining()),
        })
    }
}

/// Reads one length-prefixed frame body from the stream. A length beyond
///  `max_packet_size` is a protocol violation and poisons the stream, so the
///  caller must close the connection on any error.
pub async fn read_frame_body(stream: &mut (impl AsyncRead + Unpin), max_packet_size: u32) -> anyhow::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf);

    if frame_len > max_packet_size {
        bail!("frame of {} bytes exceeds the maximum packet size of {}", frame_len, max_packet_size);
    }
    if frame_len == 0 {
        bail!("zero-length frame");
    }

    let mut body = vec![0u8; frame_len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body.into())
}

pub async fn write_frame(stream: &mut (impl AsyncWrite + Unpin), frame: &BytesMut) -> anyhow::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::no_payload(ServerCommand::Unsubscribe, b"".as_slice())]
    #[case::payload(ServerCommand::Subscribe, b"\x02\0\0\0\x03abc".as_slice())]
    #[case::noop(ServerCommand::NoOp, b"".as_slice())]
    fn test_command_frame_round_trip(#[case] command: ServerCommand, #[case] payload: &'static [u8]) {
        let frame = CommandFrame::new(command, payload);
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let mut buf = buf.freeze();
        let frame_len = buf.get_u32() as usize;
        assert_eq!(frame_len, buf.remaining());
        assert_eq!(CommandFrame::try_read(buf).unwrap(), frame);
    }

    #[test]
    fn test_command_frame_unknown_code() {
        assert!(CommandFrame::try_read(&b"\x0bxyz"[..]).is_err());
    }

    #[rstest]
    #[case::succeeded(ServerResponse::Succeeded, ServerCommand::Subscribe, b"ok".as_slice())]
    #[case::unsolicited(ServerResponse::DataPacket, ServerCommand::Connect, b"\x02\0\0\0\x01".as_slice())]
    fn test_response_frame_round_trip(#[case] response: ServerResponse, #[case] command: ServerCommand, #[case] payload: &'static [u8]) {
        let frame = ResponseFrame::new(response, command, payload);
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let mut buf = buf.freeze();
        let frame_len = buf.get_u32() as usize;
        assert_eq!(frame_len, buf.remaining());
        assert_eq!(ResponseFrame::try_read(buf).unwrap(), frame);
    }

    #[test]
    fn test_response_frame_embedded_size_is_ignored() {
        // embedded size lies about the payload length; the parser must not care
        let body: &[u8] = &[0x80, 0x02, 0xff, 0xff, 0xff, 0xff, b'o', b'k'];
        let frame = ResponseFrame::try_read(body).unwrap();
        assert_eq!(frame.response, ServerResponse::Succeeded);
        assert_eq!(frame.command, ServerCommand::Subscribe);
        assert_eq!(&frame.payload[..], b"ok");
    }

    #[tokio::test]
    async fn test_read_frame_body_oversize() {
        let raw: Vec<u8> = [&u32::to_be_bytes(100)[..], &[0u8; 100]].concat();
        let mut stream = &raw[..];
        assert!(read_frame_body(&mut stream, 64).await.is_err());
        assert!(read_frame_body(&mut &raw[..], 128).await.is_ok());
    }
}
