//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000.x

use {
    crate::{
        codec::FrameCodec,
        endpoint::Endpoint,
        error::{Error, NamespaceError, ProtocolError, SessionError},
        fcall::*,
        nodes::{Namespace, NodeId},
        res,
        session::{io_unit, negotiate_version},
        utils::Result,
    },
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::{Arc, atomic::{AtomicBool, Ordering}},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpSocket, UnixListener},
        sync::RwLock,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Listen backlog for freshly bound acceptors
const BACKLOG: u32 = 16;

/// One accepted connection being served.
///
/// Requests are handled strictly in order: the next frame is not read until
/// the current reply has been written, which preserves per-fid causal order
/// without any locking.
struct Session<R, W> {
    reader: FramedRead<R, FrameCodec>,
    writer: FramedWrite<W, FrameCodec>,
    namespace: Arc<RwLock<Namespace>>,
    fids: HashMap<u32, NodeId>,
    uname: String,
    scratch: Vec<u8>,
    msize: u32,
    negotiated: bool,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(namespace: Arc<RwLock<Namespace>>, reader: R, writer: W) -> Session<R, W> {
        Session {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer: FramedWrite::new(writer, FrameCodec::new()),
            namespace,
            fids: HashMap::new(),
            uname: String::new(),
            scratch: Vec::new(),
            msize: MAX_MESSAGE_SIZE,
            negotiated: false,
        }
    }

    async fn run(mut self) -> Result<()> {
        while let Some(frame) = self.reader.next().await {
            // A frame that cannot be parsed leaves the stream unreliable;
            // only namespace failures are survivable as error replies.
            let msg = frame?;
            info!("\t→ {:?}", msg);

            let tag = msg.tag;
            let (body, negotiated) = self.handle(msg.body).await;

            let reply = Msg { tag, body };
            info!("\t← {:?}", reply);
            self.writer.send(reply).await?;

            if let Some(msize) = negotiated {
                self.reader.decoder_mut().set_limit(msize);
                self.writer.encoder_mut().set_limit(msize);
                self.msize = msize;
            }
        }

        Ok(())
    }

    /// Handle one request, producing the reply body and, after a version
    /// exchange, the frame ceiling to install once the reply is out.
    async fn handle(&mut self, req: FCall) -> (FCall, Option<u32>) {
        match req {
            FCall::TVersion { msize, version } => {
                let negotiated = negotiate_version(P92000X, &version).to_owned();
                let msize = msize.min(MAX_MESSAGE_SIZE);

                // A version exchange resets the connection: stale fids die
                // here.
                self.fids.clear();
                self.negotiated = negotiated != VERSION_UNKNOWN && !negotiated.is_empty();

                let reply = FCall::RVersion {
                    msize,
                    version: negotiated,
                };
                (reply, self.negotiated.then_some(msize))
            }
            other => {
                let body = self.dispatch(other).await.unwrap_or_else(|e| FCall::RError {
                    ename: e.to_string(),
                });
                (body, None)
            }
        }
    }

    fn lookup(&self, fid: u32) -> Result<NodeId> {
        match self.fids.get(&fid) {
            Some(&node) => Ok(node),
            None => res!(SessionError::NoSuchFid(fid)),
        }
    }

    async fn dispatch(&mut self, req: FCall) -> Result<FCall> {
        // A session only exists after a successful version exchange.
        if !self.negotiated {
            return res!(ProtocolError::VersionMismatch(VERSION_UNKNOWN.to_owned()));
        }

        match req {
            FCall::TAuth { uname, .. } => {
                self.uname = uname;
                Err(Error::Auth("not supported".to_owned()))
            }

            FCall::TAttach {
                fid, uname, aname, ..
            } => {
                self.uname = uname;

                let ns = self.namespace.read().await;
                let node = if aname.is_empty() {
                    ns.root()
                } else {
                    let node = ns.lookup(ns.root(), &aname)?;
                    if !ns.is_walkable(node) {
                        return res!(NamespaceError::NotWalkable);
                    }
                    node
                };

                let qid = ns.qid(node);
                drop(ns);

                // Binding an already bound fid replaces the binding.
                self.fids.insert(fid, node);
                Ok(FCall::RAttach { qid })
            }

            FCall::TWalk {
                fid,
                newfid,
                wnames,
            } => {
                let from = self.lookup(fid)?;

                let ns = self.namespace.read().await;
                if !ns.is_walkable(from) {
                    return res!(NamespaceError::NotWalkable);
                }

                let mut wqids = Vec::with_capacity(wnames.len());
                // On partial resolution nothing is bound and the error
                // names the unreached segment's failure.
                let node = ns.walk(from, &wnames, &mut wqids)?;
                drop(ns);

                self.fids.insert(newfid, node);
                Ok(FCall::RWalk { wqids })
            }

            FCall::TOpen { fid, mode } => {
                let node = self.lookup(fid)?;

                let ns = self.namespace.read().await;
                ns.open(node, &self.uname, mode)?;
                Ok(FCall::ROpen {
                    qid: ns.qid(node),
                    iounit: 0,
                })
            }

            FCall::TRead { fid, offset, count } => {
                let node = self.lookup(fid)?;
                let count = count.min(io_unit(self.msize));

                self.scratch.clear();
                let ns = self.namespace.read().await;
                ns.read(node, count, offset, &mut self.scratch)?;
                drop(ns);

                Ok(FCall::RRead {
                    data: Data(std::mem::take(&mut self.scratch)),
                })
            }

            FCall::TWrite { fid, offset, data } => {
                let node = self.lookup(fid)?;

                let mut ns = self.namespace.write().await;
                let count = ns.write(node, offset, &data.0)?;
                Ok(FCall::RWrite { count })
            }

            FCall::TStat { fid } => {
                let node = self.lookup(fid)?;

                let ns = self.namespace.read().await;
                Ok(FCall::RStat {
                    stat: ns.stat(".", node),
                })
            }

            FCall::TClunk { fid } => {
                self.fids
                    .remove(&fid)
                    .map(|_| FCall::RClunk)
                    .ok_or_else(|| SessionError::NoSuchFid(fid).into())
            }

            // Remove always releases the fid, but a synthetic tree keeps
            // its nodes.
            FCall::TRemove { fid } => {
                self.fids
                    .remove(&fid)
                    .ok_or(SessionError::NoSuchFid(fid))?;
                res!(NamespaceError::NotAllowed)
            }

            // Requests are handled synchronously, so by the time a flush
            // is read its target has already been answered.
            FCall::TFlush { .. } => Ok(FCall::RFlush),

            FCall::TCreate { .. } | FCall::TWStat { .. } => res!(NamespaceError::NotAllowed),

            _ => res!(ProtocolError::ProtocolMismatch),
        }
    }
}

/// Serve one connection over an already-established duplex byte stream.
pub async fn serve_stream<R, W>(
    namespace: Arc<RwLock<Namespace>>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Session::new(namespace, reader, writer).run().await
}

async fn serve_tcp(namespace: Arc<RwLock<Namespace>>, addr: std::net::SocketAddr) -> Result<()> {
    let socket = match addr {
        std::net::SocketAddr::V4(_) => TcpSocket::new_v4()?,
        std::net::SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(BACKLOG)?;

    info!("listening on tcp!{}!{}", addr.ip(), addr.port());

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let namespace = namespace.clone();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_stream(namespace, reader, writer).await {
                error!("session from {:?} failed: {}", peer, e);
            }
            info!("session from {:?} closed", peer);
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!("Warning: failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

async fn serve_unix(namespace: Arc<RwLock<Namespace>>, path: impl AsRef<Path>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(path)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let namespace = namespace.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = tokio::io::split(stream);
                            if let Err(e) = serve_stream(namespace, reader, writer).await {
                                error!("session failed: {}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("server shutdown complete");
    Ok(())
}

/// Accept connections on `endpoint` and serve `namespace` to each, one
/// session per connection. The namespace must be assembled before serving
/// starts; sessions share it for the lifetime of the server.
pub async fn serve(namespace: Arc<RwLock<Namespace>>, endpoint: &Endpoint) -> Result<()> {
    match *endpoint {
        Endpoint::Tcp(addr) => serve_tcp(namespace, addr).await,
        Endpoint::Unix(ref path) => serve_unix(namespace, path).await,
    }
}
