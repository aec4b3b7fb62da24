//! Serialize/deserialize 9P messages into/from binary.

use crate::{fcall::*, io_err};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.size()
            << &self.typ
            << &self.dev
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::FCall::*;

        if let TWalk { ref wnames, .. } = self.body {
            if wnames.len() > MAX_WELEM {
                return Err(io_err!(InvalidInput, "too many walk elements"));
            }
        }

        let typ = MsgType::from(&self.body);
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            RError { ref ename } => buf << ename,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
            } => buf << fid << name << perm << mode,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << stat,
            TWStat { ref fid, ref stat } => buf << fid << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TWalk) => {
                let fid = decode!(buf);
                let newfid = decode!(buf);
                let wnames: Vec<String> = decode!(buf);
                if wnames.len() > MAX_WELEM {
                    return Err(io_err!(InvalidData, "too many walk elements"));
                }
                FCall::TWalk { fid, newfid, wnames }
            }
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => FCall::RStat { stat: decode!(buf) },
            Some(TWStat) => FCall::TWStat {
                fid: decode!(buf),
                stat: decode!(buf),
            },
            Some(RWStat) => FCall::RWStat,
            None => return Err(io_err!(InvalidData, "Invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn assert_roundtrip(expected: Msg) {
        let mut buf = Vec::new();
        let bytes = expected.encode(&mut buf).unwrap();
        assert_eq!(bytes, buf.len());

        let mut readbuf = Cursor::new(buf);
        let actual: Msg = Decodable::decode(&mut readbuf).unwrap();
        assert_eq!(expected, actual);
    }

    fn sample_qid() -> QId {
        QId {
            typ: QIdType::DIR,
            version: 3,
            path: 0xfeed,
        }
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 0,
            dev: 0,
            qid: sample_qid(),
            mode: dm::DIR | 0o755,
            atime: 0,
            mtime: 0,
            length: 0,
            name: "non_empty_dir".to_owned(),
            uid: "u".to_owned(),
            gid: "g".to_owned(),
            muid: "u".to_owned(),
        }
    }

    #[test]
    fn encoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (&(i as u8)).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn decoder_test1() {
        let expected: Vec<u8> = (0..10).collect();
        let mut decoder = Cursor::new(expected.clone());
        let mut actual: Vec<u8> = Vec::new();
        while let Ok(i) = Decodable::decode(&mut decoder) {
            actual.push(i);
        }
        assert_eq!(expected, actual);
    }

    #[test]
    fn string_encoding_is_length_prefixed() {
        let mut buf = Vec::new();
        "hi".to_owned().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![2, 0, b'h', b'i']);
    }

    #[test]
    fn qid_encodes_to_thirteen_bytes() {
        let mut buf = Vec::new();
        let n = sample_qid().encode(&mut buf).unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf[0], 0x80);
    }

    #[test]
    fn stat_leads_with_its_inner_size() {
        let stat = sample_stat();
        let mut buf = Vec::new();
        let n = stat.encode(&mut buf).unwrap();

        assert_eq!(n as u32, stat.wire_size());
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), stat.size());
    }

    #[test]
    fn msg_roundtrip_version() {
        assert_roundtrip(Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 4096,
                version: P92000X.to_owned(),
            },
        });
        assert_roundtrip(Msg {
            tag: NOTAG,
            body: FCall::RVersion {
                msize: 4096,
                version: VERSION_UNKNOWN.to_owned(),
            },
        });
    }

    #[test]
    fn msg_roundtrip_auth_attach() {
        assert_roundtrip(Msg {
            tag: 1,
            body: FCall::TAuth {
                afid: 1,
                uname: "u".to_owned(),
                aname: String::new(),
            },
        });
        assert_roundtrip(Msg {
            tag: 1,
            body: FCall::RAuth { aqid: sample_qid() },
        });
        assert_roundtrip(Msg {
            tag: 2,
            body: FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "u".to_owned(),
                aname: String::new(),
            },
        });
        assert_roundtrip(Msg {
            tag: 2,
            body: FCall::RAttach { qid: sample_qid() },
        });
    }

    #[test]
    fn msg_roundtrip_walk() {
        assert_roundtrip(Msg {
            tag: 3,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["non_empty_dir".to_owned(), "internal".to_owned()],
            },
        });
        assert_roundtrip(Msg {
            tag: 3,
            body: FCall::RWalk {
                wqids: vec![sample_qid(), sample_qid()],
            },
        });
    }

    #[test]
    fn msg_roundtrip_open_create() {
        assert_roundtrip(Msg {
            tag: 4,
            body: FCall::TOpen { fid: 1, mode: om::READ },
        });
        assert_roundtrip(Msg {
            tag: 4,
            body: FCall::ROpen {
                qid: sample_qid(),
                iounit: 0,
            },
        });
        assert_roundtrip(Msg {
            tag: 5,
            body: FCall::TCreate {
                fid: 1,
                name: "updated".to_owned(),
                perm: 0o644,
                mode: om::WRITE,
            },
        });
        assert_roundtrip(Msg {
            tag: 5,
            body: FCall::RCreate {
                qid: sample_qid(),
                iounit: 0,
            },
        });
    }

    #[test]
    fn msg_roundtrip_read_write() {
        assert_roundtrip(Msg {
            tag: 6,
            body: FCall::TRead {
                fid: 1,
                offset: 5,
                count: 100,
            },
        });
        assert_roundtrip(Msg {
            tag: 6,
            body: FCall::RRead {
                data: Data(b"hello".to_vec()),
            },
        });
        assert_roundtrip(Msg {
            tag: 7,
            body: FCall::TWrite {
                fid: 1,
                offset: 0,
                data: Data(b"ABC".to_vec()),
            },
        });
        assert_roundtrip(Msg {
            tag: 7,
            body: FCall::RWrite { count: 3 },
        });
    }

    #[test]
    fn msg_roundtrip_fid_release() {
        assert_roundtrip(Msg {
            tag: 8,
            body: FCall::TClunk { fid: 1 },
        });
        assert_roundtrip(Msg {
            tag: 8,
            body: FCall::RClunk,
        });
        assert_roundtrip(Msg {
            tag: 9,
            body: FCall::TRemove { fid: 1 },
        });
        assert_roundtrip(Msg {
            tag: 9,
            body: FCall::RRemove,
        });
        assert_roundtrip(Msg {
            tag: 10,
            body: FCall::TFlush { oldtag: 3 },
        });
        assert_roundtrip(Msg {
            tag: 10,
            body: FCall::RFlush,
        });
    }

    #[test]
    fn msg_roundtrip_stat() {
        assert_roundtrip(Msg {
            tag: 11,
            body: FCall::TStat { fid: 1 },
        });
        assert_roundtrip(Msg {
            tag: 11,
            body: FCall::RStat {
                stat: sample_stat(),
            },
        });
        assert_roundtrip(Msg {
            tag: 12,
            body: FCall::TWStat {
                fid: 1,
                stat: sample_stat(),
            },
        });
        assert_roundtrip(Msg {
            tag: 12,
            body: FCall::RWStat,
        });
        assert_roundtrip(Msg {
            tag: 13,
            body: FCall::RError {
                ename: "not found".to_owned(),
            },
        });
    }

    #[test]
    fn walk_with_too_many_elements_writes_nothing() {
        let msg = Msg {
            tag: 1,
            body: FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: (0..MAX_WELEM + 1).map(|i| i.to_string()).collect(),
            },
        };

        let mut buf = Vec::new();
        assert!(msg.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
