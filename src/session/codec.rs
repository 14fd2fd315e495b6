use std::fmt;
use std::io;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::bgp::{decode_header, BgpError, Capabilities, Message, HEADER_LENGTH};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    Bgp(BgpError),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Io(err) => write!(f, "{}", err),
            CodecError::Bgp(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        CodecError::Io(err)
    }
}

impl From<BgpError> for CodecError {
    fn from(err: BgpError) -> Self {
        CodecError::Bgp(err)
    }
}

/// Frames the TCP byte-stream on the 19-byte BGP header and runs the
/// wire codec. Holds the negotiated capabilities since AS_PATH encoding
/// depends on the 4-octet-ASN capability.
#[derive(Debug, Default)]
pub struct MessageCodec {
    pub capabilities: Capabilities,
}

impl MessageCodec {
    pub fn new() -> Self {
        let mut capabilities = Capabilities::default();
        // Up to the OPEN exchange, encode conservatively
        capabilities.four_octet_asn = false;
        Self { capabilities }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, CodecError> {
        if buf.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let (message_type, _) = decode_header(&buf[..HEADER_LENGTH])?;
        let length = usize::from(NetworkEndian::read_u16(&buf[16..18]));
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        let message = Message::decode(
            message_type,
            &buf[HEADER_LENGTH..length],
            &self.capabilities,
        )?;
        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), CodecError> {
        message.encode(buf, &self.capabilities)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::{HeaderError, Notification};

    #[test]
    fn test_decode_partial_message_waits() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Keepalive, &mut buf).unwrap();
        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        // The remainder arrives; the message completes
        partial.unsplit(buf);
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Keepalive)
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_messages() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Keepalive, &mut buf).unwrap();
        codec
            .encode(Message::Notification(Notification::new(6, 2)), &mut buf)
            .unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Keepalive));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Notification(_))
        ));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_bad_marker_is_typed_error() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::Keepalive, &mut buf).unwrap();
        buf[3] = 0x00;
        match codec.decode(&mut buf) {
            Err(CodecError::Bgp(BgpError::Header(HeaderError::ConnectionNotSynchronized))) => (),
            other => panic!("Expected marker error, got {:?}", other),
        }
    }
}
