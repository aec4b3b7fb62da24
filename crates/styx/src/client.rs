//! Asynchronous client side 9P library.
//!
//! # Protocol
//! 9P2000.x

use {
    crate::{
        codec::FrameCodec,
        endpoint::Endpoint,
        error::{Error, FramingError, NamespaceError, ProtocolError, SessionError},
        fcall::*,
        io_err,
        serialize::Decodable,
        session::{FidPool, ProtoState, io_unit},
        tx::{TAG_CAPACITY, TagPool},
        utils::Result,
    },
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{io::Cursor, sync::Arc},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{Mutex, oneshot},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

type Reader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;
type Writer = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

struct Inner {
    /// Requests are framed through a shared writer so each one reaches the
    /// wire atomically
    writer: Mutex<Writer>,
    tags: Mutex<TagPool>,
    fids: Mutex<FidPool>,
    state: ProtoState,
    /// Root fid and qid established by attach
    attach: Mutex<Option<(u32, QId)>>,
    /// Auth fid carried from a successful auth exchange into attach
    auth_fid: Mutex<Option<u32>>,
}

/// A request that has been written to the wire but not yet answered.
///
/// Await it with [`Pending::wait`], or race it against a timer and cancel
/// with [`Client::flush`] using [`Pending::tag`].
pub struct Pending {
    tag: u16,
    receiver: oneshot::Receiver<Result<Msg>>,
}

impl Pending {
    /// The tag correlating this request with its reply
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Wait for the reply. An `RError` reply surfaces as [`Error::Remote`].
    pub async fn wait(self) -> Result<FCall> {
        match self.receiver.await {
            Ok(Ok(msg)) => match msg.body {
                FCall::RError { ename } => Err(Error::Remote(ename)),
                body => Ok(body),
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

/// An attached client connection to a resource server.
///
/// All operations take `&self`; up to the transaction pool size of requests
/// may be outstanding concurrently, and replies are matched to callers by
/// tag regardless of arrival order.
pub struct Client {
    inner: Arc<Inner>,
    demux: JoinHandle<()>,
}

impl Client {
    /// Establish a transport to `endpoint` and negotiate the protocol
    /// version.
    pub async fn connect(endpoint: &Endpoint) -> Result<Client> {
        match *endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                let (reader, writer) = stream.into_split();
                Self::handshake(Box::new(reader), Box::new(writer)).await
            }
            Endpoint::Unix(ref path) => {
                let stream = UnixStream::connect(path).await?;
                let (reader, writer) = stream.into_split();
                Self::handshake(Box::new(reader), Box::new(writer)).await
            }
        }
    }

    /// Run the protocol over an already-connected duplex byte stream.
    pub async fn from_stream<R, W>(reader: R, writer: W) -> Result<Client>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::handshake(Box::new(reader), Box::new(writer)).await
    }

    async fn handshake(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Client> {
        let mut framed_reader = FramedRead::new(reader, FrameCodec::new());
        let mut framed_writer = FramedWrite::new(writer, FrameCodec::new());

        framed_writer
            .send(Msg {
                tag: NOTAG,
                body: FCall::TVersion {
                    msize: MAX_MESSAGE_SIZE,
                    version: P92000X.to_owned(),
                },
            })
            .await?;

        let reply = framed_reader
            .next()
            .await
            .ok_or_else(|| io_err!(UnexpectedEof, "connection closed during version exchange"))??;

        let (msize, version) = match reply {
            Msg {
                tag: NOTAG,
                body: FCall::RVersion { msize, version },
            } => (msize, version),
            _ => return Err(ProtocolError::ProtocolMismatch.into()),
        };

        if version == VERSION_UNKNOWN {
            return Err(ProtocolError::VersionMismatch(version).into());
        }

        let msize = msize.min(MAX_MESSAGE_SIZE);
        framed_reader.decoder_mut().set_limit(msize);
        framed_writer.encoder_mut().set_limit(msize);
        info!("negotiated version {:?}, msize {}", version, msize);

        let inner = Arc::new(Inner {
            writer: Mutex::new(framed_writer),
            tags: Mutex::new(TagPool::new(TAG_CAPACITY)),
            fids: Mutex::new(FidPool::new()),
            state: ProtoState { version, msize },
            attach: Mutex::new(None),
            auth_fid: Mutex::new(None),
        });

        let demux = tokio::spawn(demux(framed_reader, inner.clone()));

        Ok(Client { inner, demux })
    }

    /// Negotiated protocol version
    pub fn version(&self) -> &str {
        &self.inner.state.version
    }

    /// Negotiated maximum message size
    pub fn msize(&self) -> u32 {
        self.inner.state.msize
    }

    /// Effective payload limit for a single read or write
    pub fn io_unit(&self) -> u32 {
        io_unit(self.inner.state.msize)
    }

    /// Write one request to the wire and hand back its pending reply.
    ///
    /// This is the low-level building block behind every operation; use it
    /// directly when a caller needs the tag for cancellation.
    pub async fn send(&self, body: FCall) -> Result<Pending> {
        let treq = MsgType::from(&body);
        let (tag, receiver) = self.inner.tags.lock().await.allocate(treq)?;

        let msg = Msg { tag, body };
        debug!("\t→ {:?}", msg);

        let sent = {
            let mut writer = self.inner.writer.lock().await;
            writer.send(msg).await
        };
        if let Err(e) = sent {
            self.inner.tags.lock().await.release(tag);
            return Err(e);
        }

        Ok(Pending { tag, receiver })
    }

    async fn transact(&self, body: FCall) -> Result<FCall> {
        self.send(body).await?.wait().await
    }

    /// Cancel the outstanding request identified by `oldtag`.
    ///
    /// The caller awaiting that request observes cancellation immediately;
    /// the transaction slot itself is held until the server acknowledges
    /// the flush, so a straggling reply cannot land on a reused tag.
    pub async fn flush(&self, oldtag: u16) -> Result<()> {
        self.inner.tags.lock().await.begin_flush(oldtag);

        let res = self.transact(FCall::TFlush { oldtag }).await;
        self.inner.tags.lock().await.release(oldtag);

        res.map(|_| ())
    }

    /// Offer authentication credentials ahead of attach.
    ///
    /// Servers that require no authentication answer with an error; that
    /// case is reported as `Ok(None)` and attach may proceed directly.
    pub async fn auth(&self, uname: &str, aname: &str) -> Result<Option<QId>> {
        let afid = {
            let mut fids = self.inner.fids.lock().await;
            fids.allocate()?
        };

        let res = self
            .transact(FCall::TAuth {
                afid,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await;

        match res {
            Ok(FCall::RAuth { aqid }) => {
                // The auth channel expects the credential token before the
                // attach that references it.
                let written = self
                    .transact(FCall::TWrite {
                        fid: afid,
                        offset: 0,
                        data: Data(uname.as_bytes().to_vec()),
                    })
                    .await;
                if let Err(e) = written {
                    let _ = self.clunk(afid).await;
                    return Err(e);
                }

                *self.inner.auth_fid.lock().await = Some(afid);
                Ok(Some(aqid))
            }
            Ok(_) => {
                self.inner.fids.lock().await.release(afid);
                Err(ProtocolError::ProtocolMismatch.into())
            }
            Err(Error::Remote(reason)) => {
                debug!("authentication not required: {}", reason);
                self.inner.fids.lock().await.release(afid);
                Ok(None)
            }
            Err(e) => {
                self.inner.fids.lock().await.release(afid);
                Err(e)
            }
        }
    }

    /// Attach to the server's namespace as `uname`, optionally at the
    /// subtree named by `aname`. Must follow the version exchange; stores
    /// the root fid for subsequent walks.
    pub async fn attach(&self, uname: &str, aname: &str) -> Result<QId> {
        let fid = {
            let mut fids = self.inner.fids.lock().await;
            fids.allocate()?
        };
        let afid = self.inner.auth_fid.lock().await.take();

        let res = self
            .transact(FCall::TAttach {
                fid,
                afid: afid.unwrap_or(NOFID),
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await;

        match res {
            Ok(FCall::RAttach { qid }) => {
                *self.inner.attach.lock().await = Some((fid, qid));
                if let Some(afid) = afid {
                    let _ = self.clunk(afid).await;
                }
                Ok(qid)
            }
            Ok(_) => {
                self.release_fids(fid, afid).await;
                Err(ProtocolError::ProtocolMismatch.into())
            }
            Err(e) => {
                self.release_fids(fid, afid).await;
                Err(e)
            }
        }
    }

    async fn release_fids(&self, fid: u32, afid: Option<u32>) {
        self.inner.fids.lock().await.release(fid);
        if let Some(afid) = afid {
            let _ = self.clunk(afid).await;
        }
    }

    async fn root_fid(&self) -> Result<u32> {
        match *self.inner.attach.lock().await {
            Some((fid, _)) => Ok(fid),
            None => Err(SessionError::NoSuchFid(NOFID).into()),
        }
    }

    /// Qid of the attached root, if attach has completed
    pub async fn root_qid(&self) -> Option<QId> {
        self.inner.attach.lock().await.map(|(_, qid)| qid)
    }

    /// Walk from the attached root to `path`, binding a fresh fid.
    ///
    /// Paths longer than the per-message element limit are resolved with a
    /// chain of walks reusing the destination fid. On partial resolution
    /// no fid stays bound and the number of elements walked is reported.
    pub async fn walk(&self, path: &str) -> Result<u32> {
        let from_root = self.root_fid().await?;
        let names: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let newfid = {
            let mut fids = self.inner.fids.lock().await;
            fids.allocate()?
        };

        let mut fid = from_root;
        let mut walked = 0;
        loop {
            let batch: Vec<String> = names[walked..]
                .iter()
                .take(MAX_WELEM)
                .cloned()
                .collect();
            let expected = batch.len();

            let res = self
                .transact(FCall::TWalk {
                    fid,
                    newfid,
                    wnames: batch,
                })
                .await;

            match res {
                Ok(FCall::RWalk { wqids }) if wqids.len() == expected => {
                    walked += expected;
                    if walked >= names.len() {
                        return Ok(newfid);
                    }
                    fid = newfid;
                }
                Ok(FCall::RWalk { wqids }) => {
                    walked += wqids.len();
                    self.abandon_walk(fid, newfid).await;
                    return Err(NamespaceError::NotFound { walked }.into());
                }
                Ok(_) => {
                    self.abandon_walk(fid, newfid).await;
                    return Err(ProtocolError::ProtocolMismatch.into());
                }
                Err(e) => {
                    self.abandon_walk(fid, newfid).await;
                    return Err(e);
                }
            }
        }
    }

    /// Release `newfid` after a failed walk: clunked if an earlier batch
    /// bound it, returned to the pool otherwise.
    async fn abandon_walk(&self, fid: u32, newfid: u32) {
        if fid == newfid {
            let _ = self.clunk(newfid).await;
        } else {
            self.inner.fids.lock().await.release(newfid);
        }
    }

    /// Open `fid` for the operations in `mode`.
    ///
    /// Returns the advisory I/O unit; a server that answers zero leaves
    /// the choice to the client, bounded by the negotiated message size.
    pub async fn open(&self, fid: u32, mode: u8) -> Result<u32> {
        match self.transact(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { iounit: 0, .. } => Ok(self.io_unit()),
            FCall::ROpen { iounit, .. } => Ok(iounit.min(self.io_unit())),
            _ => Err(ProtocolError::ProtocolMismatch.into()),
        }
    }

    /// Read up to `count` bytes from `fid` at `offset`.
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> Result<Data> {
        let count = count.min(self.io_unit());
        match self.transact(FCall::TRead { fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data),
            _ => Err(ProtocolError::ProtocolMismatch.into()),
        }
    }

    /// Write `data` to `fid` at `offset`; returns the number of bytes the
    /// server accepted, which may be less than offered.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let chunk = &data[..data.len().min(self.io_unit() as usize)];
        let res = self
            .transact(FCall::TWrite {
                fid,
                offset,
                data: Data(chunk.to_vec()),
            })
            .await?;

        match res {
            FCall::RWrite { count } => Ok(count),
            _ => Err(ProtocolError::ProtocolMismatch.into()),
        }
    }

    /// Metadata of the resource bound to `fid`
    pub async fn stat(&self, fid: u32) -> Result<Stat> {
        match self.transact(FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(ProtocolError::ProtocolMismatch.into()),
        }
    }

    /// Release `fid`. The fid returns to the pool whether or not the
    /// server acknowledged.
    pub async fn clunk(&self, fid: u32) -> Result<()> {
        let res = self.transact(FCall::TClunk { fid }).await;
        self.inner.fids.lock().await.release(fid);
        res.map(|_| ())
    }

    /// Remove the resource bound to `fid`. Like clunk, the fid is released
    /// unconditionally.
    pub async fn remove(&self, fid: u32) -> Result<()> {
        let res = self.transact(FCall::TRemove { fid }).await;
        self.inner.fids.lock().await.release(fid);
        res.map(|_| ())
    }

    /// Walk to `path`, read it to EOF and clunk the fid, even on failure.
    pub async fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let fid = self.walk(path).await?;
        let res = self.read_to_end(fid).await;
        let _ = self.clunk(fid).await;
        res
    }

    async fn read_to_end(&self, fid: u32) -> Result<Vec<u8>> {
        let iounit = self.open(fid, om::READ).await?;

        let mut bytes = Vec::new();
        let mut offset = 0;
        loop {
            let Data(chunk) = self.read(fid, offset, iounit).await?;
            if chunk.is_empty() {
                return Ok(bytes);
            }
            offset += chunk.len() as u64;
            bytes.extend(chunk);
        }
    }

    /// Walk to `path`, write `content` in I/O-unit-sized chunks and clunk
    /// the fid, even on failure.
    pub async fn write_path(&self, path: &str, content: &[u8]) -> Result<usize> {
        let fid = self.walk(path).await?;
        let res = self.write_all(fid, content).await;
        let _ = self.clunk(fid).await;
        res
    }

    async fn write_all(&self, fid: u32, content: &[u8]) -> Result<usize> {
        self.open(fid, om::WRITE).await?;

        let mut written = 0;
        while written < content.len() {
            let count = self
                .write(fid, written as u64, &content[written..])
                .await? as usize;
            if count == 0 {
                return Err(io_err!(WriteZero, "server accepted no bytes").into());
            }
            written += count;
        }

        Ok(written)
    }

    /// List the directory at `path` as stat records, in listing order.
    pub async fn list(&self, path: &str) -> Result<Vec<Stat>> {
        let bytes = self.read_path(path).await?;

        let mut reader = Cursor::new(&bytes[..]);
        let mut stats = Vec::new();
        while (reader.position() as usize) < bytes.len() {
            let stat =
                Stat::decode(&mut reader).map_err(|_| Error::Framing(FramingError::Malformed))?;
            stats.push(stat);
        }

        Ok(stats)
    }

    /// Number of requests currently in flight
    pub async fn outstanding(&self) -> usize {
        self.inner.tags.lock().await.busy()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Deliver incoming frames to their transactions until the transport ends,
/// then fail whatever is still outstanding.
async fn demux(mut reader: Reader, inner: Arc<Inner>) {
    loop {
        match reader.next().await {
            Some(Ok(msg)) => {
                debug!("\t← {:?}", msg);
                inner.tags.lock().await.complete(msg);
            }
            Some(Err(e)) => {
                error!("receive failed: {}", e);
                break;
            }
            None => {
                debug!("connection closed by peer");
                break;
            }
        }
    }

    inner.tags.lock().await.fail_all();
}
