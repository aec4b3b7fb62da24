//! Message framing on top of a byte stream.
//!
//! Every frame starts with a 7-byte header: a 32-bit total size (including
//! the size field itself), the message type byte and the 16-bit tag. The
//! codec enforces the framing rules the protocol demands before any body
//! parsing happens: a declared size below the header size or above the
//! negotiated ceiling poisons the stream, as does a type byte that names no
//! known message.

use crate::error::{Error, FramingError, ProtocolError};
use crate::fcall::{HEADER_SIZE, MAX_MESSAGE_SIZE, Msg, MsgType};
use crate::serialize;
use bytes::{BufMut, BytesMut};
use num_traits::FromPrimitive;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

/// Frames [`Msg`] values over a byte stream, bounded by the negotiated
/// maximum message size.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    limit: u32,
}

impl FrameCodec {
    /// A codec limited by the compile-time ceiling, as used before the
    /// version exchange settles on a smaller value.
    pub fn new() -> FrameCodec {
        FrameCodec {
            limit: MAX_MESSAGE_SIZE,
        }
    }

    /// Current frame size ceiling
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Install the negotiated ceiling. Values above the compile-time
    /// maximum are clamped to it.
    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit.min(MAX_MESSAGE_SIZE);
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Msg;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if size < HEADER_SIZE {
            return Err(FramingError::Malformed.into());
        }
        if size > self.limit {
            return Err(FramingError::FrameTooLarge {
                size,
                limit: self.limit,
            }
            .into());
        }
        if src.len() < size as usize {
            src.reserve(size as usize - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size as usize);
        let typ = frame[4];
        if MsgType::from_u8(typ).is_none() {
            return Err(ProtocolError::UnknownMessageType(typ).into());
        }

        // The message body must consume exactly the declared size.
        let body = &frame[4..];
        let mut reader = Cursor::new(body);
        let msg = serialize::read_msg(&mut reader).map_err(|_| FramingError::Malformed)?;
        if reader.position() != body.len() as u64 {
            return Err(FramingError::Malformed.into());
        }

        Ok(Some(msg))
    }
}

impl Encoder<Msg> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), Error> {
        Encoder::<&Msg>::encode(self, &msg, dst)
    }
}

impl Encoder<&Msg> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, msg: &Msg, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = Vec::with_capacity(64);
        serialize::write_msg(&mut body, msg)?;

        let size = 4 + body.len() as u32;
        if size > self.limit {
            return Err(FramingError::FrameTooLarge {
                size,
                limit: self.limit,
            }
            .into());
        }

        dst.reserve(size as usize);
        dst.put_u32_le(size);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcall::*;

    fn encode_frame(msg: &Msg) -> BytesMut {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_declares_its_own_size() {
        let buf = encode_frame(&Msg {
            tag: 1,
            body: FCall::TClunk { fid: 7 },
        });

        let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(size as usize, buf.len());
        assert_eq!(size, HEADER_SIZE + 4);
    }

    #[test]
    fn version_frame_wire_layout() {
        let buf = encode_frame(&Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 4096,
                version: P92000X.to_owned(),
            },
        });

        // size[4] = 21, type = 100, tag = NOTAG, msize = 4096,
        // version = s[2] "9P2000.x", all little-endian.
        let mut expected = vec![21, 0, 0, 0, 100, 0xff, 0xff, 0x00, 0x10, 0, 0, 8, 0];
        expected.extend_from_slice(b"9P2000.x");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn frame_roundtrip() {
        let msg = Msg {
            tag: 3,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["data".to_owned(), "updated".to_owned()],
            },
        };

        let mut buf = encode_frame(&msg);
        let mut codec = FrameCodec::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let full = encode_frame(&Msg {
            tag: 2,
            body: FCall::TRead {
                fid: 1,
                offset: 0,
                count: 100,
            },
        });

        let mut codec = FrameCodec::new();
        for cut in [1, 4, 6, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none());
        }
    }

    #[test]
    fn size_below_header_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_u8(MsgType::TVersion as u8);
        buf.put_u16_le(1);

        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Framing(FramingError::Malformed))
        ));
    }

    #[test]
    fn size_above_negotiated_limit_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(120);
        buf.put_u8(MsgType::TVersion as u8);
        buf.put_u16_le(1);

        let mut codec = FrameCodec::new();
        codec.set_limit(20);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Framing(FramingError::FrameTooLarge { size: 120, limit: 20 }))
        ));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_SIZE);
        buf.put_u8(42);
        buf.put_u16_le(1);

        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::UnknownMessageType(42)))
        ));
    }

    #[test]
    fn header_only_frame_decodes_for_empty_bodies() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_SIZE);
        buf.put_u8(MsgType::RClunk as u8);
        buf.put_u16_le(9);

        let mut codec = FrameCodec::new();
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            msg,
            Msg {
                tag: 9,
                body: FCall::RClunk
            }
        );
    }

    #[test]
    fn header_only_frame_fails_for_non_empty_bodies() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_SIZE);
        buf.put_u8(MsgType::TVersion as u8);
        buf.put_u16_le(NOTAG);

        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Framing(FramingError::Malformed))
        ));
    }

    #[test]
    fn trailing_bytes_in_frame_are_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(HEADER_SIZE + 2);
        buf.put_u8(MsgType::RClunk as u8);
        buf.put_u16_le(1);
        buf.put_u16_le(0xbeef);

        let mut codec = FrameCodec::new();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Framing(FramingError::Malformed))
        ));
    }

    #[test]
    fn encode_refuses_frames_above_the_limit() {
        let mut codec = FrameCodec::new();
        codec.set_limit(32);

        let mut buf = BytesMut::new();
        let res = codec.encode(
            &Msg {
                tag: 1,
                body: FCall::TWrite {
                    fid: 1,
                    offset: 0,
                    data: Data(vec![0; 64]),
                },
            },
            &mut buf,
        );

        assert!(matches!(
            res,
            Err(Error::Framing(FramingError::FrameTooLarge { .. }))
        ));
        assert!(buf.is_empty());
    }
}
