//! Peers as processes connected by a TCP mesh.
//!
//! Every rank listens on its own address and keeps one connection to every
//! other rank: it dials the ranks below it and accepts the ranks above it.
//! Nobody coordinates. A collective sends this rank's frame on every link,
//! then reads one frame from every link in rank order.
//!
//! ```text
//!        rank 0 ◄──────► rank 1
//!          ▲  ╲          ╱  ▲
//!          │    ╲      ╱    │
//!          │      ╲  ╱      │
//!          ▼      ╱  ╲      ▼
//!        rank 3 ◄──────► rank 2
//! ```
//!
//! Frames start with a one-byte tag:
//!
//! | Tag | Payload | Meaning |
//! |-----|---------|---------|
//! | `V` | `u64` LE | all-gather contribution |
//! | `A` | `u32` LE length, UTF-8 reason | the group was aborted |
//!
//! A link that closes or fails counts as an abort. The peer that notices
//! forwards the abort on its other links, so a crashed process releases the
//! whole group instead of leaving it blocked.
//!
//! Sockets are driven by a single-threaded tokio runtime owned by each peer;
//! collectives block the calling thread like the other [`PeerGroup`]s.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, trace};

use super::PeerGroup;
use crate::error::{Error, Result};

const TAG_VALUE: u8 = b'V';
const TAG_ABORT: u8 = b'A';

/// First word of the connection handshake ("pdmp").
const HELLO: u32 = 0x7064_6d70;

const MAX_REASON: usize = 4096;
const RETRY_DELAY: Duration = Duration::from_millis(20);
const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// How long [`TcpPeer::connect`] waits for the whole mesh by default.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

enum Frame {
    Value(u64),
    Abort(String),
}

/// One connection to another rank.
struct Link {
    rank: usize,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

impl Link {
    fn new(rank: usize, stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            rank,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
        })
    }

    async fn send_value(&self, value: u64) -> io::Result<()> {
        let mut frame = [0u8; 9];
        frame[0] = TAG_VALUE;
        frame[1..].copy_from_slice(&value.to_le_bytes());
        self.writer.lock().await.write_all(&frame).await
    }

    async fn send_abort(&self, reason: &str) -> io::Result<()> {
        let mut end = reason.len().min(MAX_REASON);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let reason = &reason.as_bytes()[..end];

        let mut frame = Vec::with_capacity(5 + reason.len());
        frame.push(TAG_ABORT);
        frame.extend_from_slice(&(reason.len() as u32).to_le_bytes());
        frame.extend_from_slice(reason);
        self.writer.lock().await.write_all(&frame).await
    }

    async fn recv(&self) -> io::Result<Frame> {
        let mut reader = self.reader.lock().await;
        match reader.read_u8().await? {
            TAG_VALUE => Ok(Frame::Value(reader.read_u64_le().await?)),
            TAG_ABORT => {
                let len = reader.read_u32_le().await? as usize;
                if len > MAX_REASON {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized abort frame"));
                }
                let mut reason = vec![0u8; len];
                reader.read_exact(&mut reason).await?;
                Ok(Frame::Abort(String::from_utf8_lossy(&reason).into_owned()))
            }
            tag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame tag {:#04x}", tag),
            )),
        }
    }
}

fn connect_error(what: impl fmt::Display, err: io::Error) -> Error {
    Error::Connect(format!("{}: {}", what, err))
}

/// One rank of a peer group spread over processes, possibly on several hosts.
///
/// # Examples
///
/// ```rust,no_run
/// use perfdump::peers::TcpPeer;
/// use perfdump::{Session, SessionConfig};
///
/// # fn main() -> perfdump::Result<()> {
/// // PDUMP_RANK=1 PDUMP_PEERS=10.0.0.1:7000,10.0.0.2:7000 PDUMP_EVENTS=MINFLT ./app
/// let peer = TcpPeer::from_env()?;
/// let mut session = Session::new(SessionConfig::from_env()?, peer);
/// session.init()?;
/// # Ok(())
/// # }
/// ```
pub struct TcpPeer {
    rank: usize,
    size: usize,
    /// Every other rank, ascending.
    links: Vec<Link>,
    aborted: Mutex<Option<String>>,
    runtime: Runtime,
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("aborted", &*self.lock())
            .finish()
    }
}

impl TcpPeer {
    /// Joins the group whose rank `r` listens on `addrs[r]`, as `rank`.
    ///
    /// Blocks until every link is up, or fails after
    /// [`DEFAULT_CONNECT_TIMEOUT`].
    pub fn connect(rank: usize, addrs: &[SocketAddr]) -> Result<Self> {
        Self::connect_timeout(rank, addrs, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Like [`connect`](TcpPeer::connect) with an explicit timeout.
    pub fn connect_timeout(rank: usize, addrs: &[SocketAddr], timeout: Duration) -> Result<Self> {
        let addr = *addrs.get(rank).ok_or_else(|| {
            Error::Config(format!("rank {} outside a group of {}", rank, addrs.len()))
        })?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| connect_error(format_args!("binding {}", addr), e))?;
        Self::from_listener(rank, listener, addrs, timeout)
    }

    /// Joins the group with a listener that is already bound to this rank's
    /// address.
    pub fn from_listener(
        rank: usize,
        listener: std::net::TcpListener,
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self> {
        let size = addrs.len();
        if rank >= size {
            return Err(Error::Config(format!("rank {} outside a group of {}", rank, size)));
        }
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| connect_error("starting runtime", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| connect_error("configuring listener", e))?;

        let links = runtime.block_on(async {
            let listener =
                TcpListener::from_std(listener).map_err(|e| connect_error("registering listener", e))?;
            tokio::time::timeout(timeout, mesh(rank, addrs, listener))
                .await
                .map_err(|_| {
                    Error::Connect(format!("rank {}: group not connected after {:?}", rank, timeout))
                })?
        })?;

        debug!(rank, size, "tcp peer group connected");
        Ok(Self {
            rank,
            size,
            links,
            aborted: Mutex::new(None),
            runtime,
        })
    }

    /// Joins the group described by the `PDUMP_RANK`, `PDUMP_PEERS` and
    /// `PDUMP_CONNECT_TIMEOUT` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](TcpPeer::from_env), reading variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (rank, addrs, timeout) = parse_env(lookup)?;
        Self::connect_timeout(rank, &addrs, timeout)
    }

    /// Returns the abort reason once the group has been aborted.
    pub fn aborted(&self) -> Option<String> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.aborted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn gather(&self, value: u64) -> std::result::Result<Vec<u64>, String> {
        for link in &self.links {
            link.send_value(value)
                .await
                .map_err(|e| format!("rank {} unreachable from rank {}: {}", link.rank, self.rank, e))?;
        }

        let mut values = vec![0; self.size];
        values[self.rank] = value;
        for link in &self.links {
            match link.recv().await {
                Ok(Frame::Value(v)) => values[link.rank] = v,
                Ok(Frame::Abort(reason)) => return Err(reason),
                Err(e) => {
                    return Err(format!("rank {} lost rank {}: {}", self.rank, link.rank, e))
                }
            }
        }
        Ok(values)
    }

    /// Records the abort and tells every other rank, once.
    fn shut_down(&self, reason: &str) {
        {
            let mut aborted = self.lock();
            if aborted.is_some() {
                return;
            }
            *aborted = Some(reason.to_string());
        }
        self.runtime.block_on(async {
            for link in &self.links {
                let sent = tokio::time::timeout(ABORT_SEND_TIMEOUT, link.send_abort(reason)).await;
                if !matches!(sent, Ok(Ok(()))) {
                    trace!(rank = self.rank, peer = link.rank, "abort not delivered");
                }
            }
        });
    }
}

impl PeerGroup for TcpPeer {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, value: u64) -> Result<Vec<u64>> {
        if let Some(reason) = self.aborted() {
            return Err(Error::Aborted(reason));
        }
        self.runtime.block_on(self.gather(value)).map_err(|reason| {
            self.shut_down(&reason);
            Error::Aborted(reason)
        })
    }

    fn barrier(&self) -> Result<()> {
        self.all_gather(0).map(|_| ())
    }

    fn abort(&self, reason: &str) {
        error!(rank = self.rank, reason, "aborting peer group");
        self.shut_down(&format!("rank {}: {}", self.rank, reason));
    }
}

async fn mesh(rank: usize, addrs: &[SocketAddr], listener: TcpListener) -> Result<Vec<Link>> {
    let size = addrs.len();
    let mut slots: Vec<Option<Link>> = (0..size).map(|_| None).collect();

    for (peer, &addr) in addrs.iter().enumerate().take(rank) {
        let mut stream = dial(addr).await;
        stream
            .write_all(&hello(rank, size))
            .await
            .map_err(|e| connect_error(format_args!("greeting rank {} at {}", peer, addr), e))?;
        slots[peer] = Some(Link::new(peer, stream).map_err(|e| connect_error(addr, e))?);
    }

    for _ in rank + 1..size {
        let (mut stream, from) = listener
            .accept()
            .await
            .map_err(|e| connect_error("accepting peer", e))?;
        let peer = read_hello(&mut stream, size)
            .await
            .map_err(|e| connect_error(format_args!("handshake with {}", from), e))?;
        if peer <= rank || slots[peer].is_some() {
            return Err(Error::Connect(format!(
                "rank {}: unexpected connection from rank {} at {}",
                rank, peer, from
            )));
        }
        slots[peer] = Some(Link::new(peer, stream).map_err(|e| connect_error(from, e))?);
    }

    Ok(slots.into_iter().flatten().collect())
}

/// Connects to `addr`, retrying until its rank is listening.
async fn dial(addr: SocketAddr) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) => {
                trace!(%addr, error = %e, "peer not listening yet");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

fn hello(rank: usize, size: usize) -> [u8; 20] {
    let mut frame = [0u8; 20];
    frame[..4].copy_from_slice(&HELLO.to_le_bytes());
    frame[4..12].copy_from_slice(&(rank as u64).to_le_bytes());
    frame[12..].copy_from_slice(&(size as u64).to_le_bytes());
    frame
}

async fn read_hello(stream: &mut TcpStream, size: usize) -> io::Result<usize> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
    if stream.read_u32_le().await? != HELLO {
        return Err(invalid("not a perfdump peer".to_string()));
    }
    let rank = stream.read_u64_le().await? as usize;
    let theirs = stream.read_u64_le().await? as usize;
    if theirs != size {
        return Err(invalid(format!(
            "rank {} expects {} peers, this group has {}",
            rank, theirs, size
        )));
    }
    if rank >= size {
        return Err(invalid(format!("rank {} outside a group of {}", rank, size)));
    }
    Ok(rank)
}

/// Reads `PDUMP_RANK`, `PDUMP_PEERS` (`host:port` list, one per rank, in rank
/// order) and `PDUMP_CONNECT_TIMEOUT` (seconds).
fn parse_env<F>(lookup: F) -> Result<(usize, Vec<SocketAddr>, Duration)>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    let rank = get("PDUMP_RANK")
        .ok_or_else(|| Error::Config("PDUMP_RANK is not set".to_string()))?;
    let rank = rank
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("PDUMP_RANK {:?} is not a rank", rank)))?;

    let peers = get("PDUMP_PEERS")
        .ok_or_else(|| Error::Config("PDUMP_PEERS is not set".to_string()))?;
    let addrs = peers
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(|peer| {
            peer.to_socket_addrs()
                .ok()
                .and_then(|mut resolved| resolved.next())
                .ok_or_else(|| Error::Config(format!("cannot resolve peer address {:?}", peer)))
        })
        .collect::<Result<Vec<_>>>()?;

    let timeout = match get("PDUMP_CONNECT_TIMEOUT") {
        Some(secs) => Duration::from_secs(secs.trim().parse().map_err(|_| {
            Error::Config(format!("PDUMP_CONNECT_TIMEOUT {:?} is not a number of seconds", secs))
        })?),
        None => DEFAULT_CONNECT_TIMEOUT,
    };

    if rank >= addrs.len() {
        return Err(Error::Config(format!(
            "PDUMP_RANK {} outside the {} addresses of PDUMP_PEERS",
            rank,
            addrs.len()
        )));
    }
    Ok((rank, addrs, timeout))
}
