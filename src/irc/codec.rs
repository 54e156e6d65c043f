//! CR-LF framing between the socket and [`Message`].
//!
//! Incoming bytes are cut at each LF; the byte before it must be a CR or
//! the frame is rejected. Frames are capped at 512 bytes including the
//! terminator.
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Frame cap including the two terminator bytes.
const MAX_FRAME: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {MAX_FRAME} bytes")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec pairing the CR-LF framing rules with message parsing.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(lf) = src.iter().position(|&b| b == b'\n') else {
            // Nothing terminated yet; a buffer already past the cap can
            // never become a valid frame.
            if src.len() > MAX_FRAME {
                return Err(CodecError::LineTooLong);
            }
            return Ok(None);
        };

        if lf + 1 > MAX_FRAME {
            return Err(CodecError::LineTooLong);
        }

        let frame = src.split_to(lf + 1);
        if lf == 0 || frame[lf - 1] != b'\r' {
            // A bare LF is not a frame boundary.
            return Err(ParseError::FramingViolation.into());
        }

        let line = std::str::from_utf8(&frame[..lf - 1])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(Message::parse(line)?))
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.to_wire().as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(codec: &mut IrcCodec, buf: &mut BytesMut) -> Message {
        codec.decode(buf).unwrap().expect("a complete frame")
    }

    #[test]
    fn frames_split_on_crlf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK tee\r\nUSER tee 0 localhost :tee\r\n");

        assert_eq!(decode_one(&mut codec, &mut buf).command, "NICK");
        let second = decode_one(&mut codec, &mut buf);
        assert_eq!(second.command, "USER");
        assert_eq!(second.params, vec!["tee", "0", "localhost", "tee"]);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK te");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"e\r\n");
        assert_eq!(decode_one(&mut codec, &mut buf).params, vec!["tee"]);
    }

    #[test]
    fn bare_lf_is_a_framing_violation() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK tee\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            CodecError::Parse(ParseError::FramingViolation)
        ));
    }

    #[test]
    fn unterminated_input_past_the_cap_errors() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_FRAME + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            CodecError::LineTooLong
        ));
    }

    #[test]
    fn terminated_frame_past_the_cap_errors() {
        let mut codec = IrcCodec;
        let mut oversized = vec![b'A'; MAX_FRAME];
        oversized.extend_from_slice(b"\r\n");
        let mut buf = BytesMut::from(oversized.as_slice());
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            CodecError::LineTooLong
        ));
    }

    #[test]
    fn embedded_nul_is_rejected() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("PRIVMSG #lobby :he\0llo\r\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap_err(),
            CodecError::Parse(ParseError::FramingViolation)
        ));
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encoder_appends_the_terminator() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("NICK", vec!["tee".into()]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"NICK :tee\r\n");
    }

    #[test]
    fn encoded_frames_decode_back() {
        let mut codec = IrcCodec;
        let original = Message::with_prefix(
            "Anonymous2!Anon@IRC",
            "PRIVMSG",
            vec!["#lobby".into(), "Hello everyone!".into()],
        );

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(original));
    }
}
