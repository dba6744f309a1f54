use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time,
};
use tokio_rustls::TlsConnector;
use trust_dns_proto::op::Message;

use crate::Error;

pub(crate) const DIAL_TIMEOUT: Duration = Duration::from_secs(4);
pub(crate) const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
pub(crate) const MIN_UDP_SIZE: u16 = 512;

/// Wire protocols an upstream exchange can use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => "udp".fmt(f),
            Protocol::Tcp => "tcp".fmt(f),
            Protocol::Tls => "tcp-tls".fmt(f),
        }
    }
}

/// Client-side TLS material for a `tls://` upstream.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: rustls::ServerName,
}

impl TlsClient {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, Error> {
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name: rustls::ServerName::try_from(server_name)?,
        })
    }
}

impl std::fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClient")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// A single pooled upstream connection.
pub(crate) enum DnsConn {
    Udp { socket: UdpSocket, udp_size: u16 },
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl DnsConn {
    pub(crate) fn proto(&self) -> Protocol {
        match self {
            DnsConn::Udp { .. } => Protocol::Udp,
            DnsConn::Tcp(_) => Protocol::Tcp,
            DnsConn::Tls(_) => Protocol::Tls,
        }
    }

    /// Sizes the receive buffer to the client's advertised EDNS payload.
    pub(crate) fn set_udp_size(&mut self, size: u16) {
        if let DnsConn::Udp { udp_size, .. } = self {
            *udp_size = size.max(MIN_UDP_SIZE);
        }
    }

    pub(crate) async fn write_message(&mut self, msg: &Message, deadline: Duration) -> Result<(), Error> {
        let body = msg.to_vec()?;
        time::timeout(deadline, self.write_frame(&body))
            .await
            .map_err(|_| Error::Timeout)?
    }

    pub(crate) async fn read_message(&mut self, deadline: Duration) -> Result<Message, Error> {
        time::timeout(deadline, self.read_frame())
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn write_frame(&mut self, body: &[u8]) -> Result<(), Error> {
        match self {
            DnsConn::Udp { socket, .. } => {
                socket.send(body).await?;
            }
            DnsConn::Tcp(stream) => write_stream(stream, body).await?,
            DnsConn::Tls(stream) => write_stream(stream.as_mut(), body).await?,
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Message, Error> {
        match self {
            DnsConn::Udp { socket, udp_size } => {
                let mut buf = vec![0u8; usize::from((*udp_size).max(MIN_UDP_SIZE))];
                let n = socket.recv(&mut buf).await?;
                decode(&buf[..n])
            }
            DnsConn::Tcp(stream) => decode(&read_stream(stream).await?),
            DnsConn::Tls(stream) => decode(&read_stream(stream.as_mut()).await?),
        }
    }
}

async fn write_stream<S: AsyncWrite + Unpin>(stream: &mut S, body: &[u8]) -> io::Result<()> {
    let len = (body.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn read_stream<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

pub(crate) fn decode(buf: &[u8]) -> Result<Message, Error> {
    match Message::from_vec(buf) {
        Ok(msg) => Ok(msg),
        // An undecodable datagram whose header carries TC is a truncation,
        // not a protocol failure; the caller synthesizes a retry-over-TCP
        // reply for it.
        Err(_) if buf.len() >= 12 && buf[2] & 0x02 != 0 => Err(Error::Truncated),
        Err(error) => Err(error.into()),
    }
}

/// Per-upstream connection cache keyed by protocol.
///
/// Connections idle for longer than `expire` are evicted on access. Callers
/// must not yield a connection back after an I/O error on it.
pub struct Transport {
    addr: SocketAddr,
    expire: Duration,
    tls: Option<TlsClient>,
    pool: Mutex<HashMap<Protocol, Vec<Cached>>>,
}

struct Cached {
    conn: DnsConn,
    idle_since: Instant,
}

// === impl Transport ===

impl Transport {
    pub fn new(addr: SocketAddr, tls: Option<TlsClient>) -> Self {
        Self {
            addr,
            expire: DEFAULT_EXPIRE,
            tls,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_expire(&mut self, expire: Duration) {
        self.expire = expire;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Returns a cached connection for `proto` or opens a new one.
    pub(crate) async fn dial(&self, proto: Protocol) -> Result<DnsConn, Error> {
        if let Some(conn) = self.checkout(proto) {
            return Ok(conn);
        }

        match proto {
            Protocol::Udp => {
                let bind: SocketAddr = if self.addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(self.addr).await?;
                Ok(DnsConn::Udp {
                    socket,
                    udp_size: MIN_UDP_SIZE,
                })
            }
            Protocol::Tcp => {
                let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr))
                    .await
                    .map_err(|_| Error::Timeout)??;
                stream.set_nodelay(true)?;
                Ok(DnsConn::Tcp(stream))
            }
            Protocol::Tls => {
                let tls = self.tls.clone().ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "tls transport without tls configuration",
                    ))
                })?;
                let stream = time::timeout(DIAL_TIMEOUT, async {
                    let tcp = TcpStream::connect(self.addr).await?;
                    tcp.set_nodelay(true)?;
                    tls.connector.connect(tls.server_name.clone(), tcp).await
                })
                .await
                .map_err(|_| Error::Timeout)??;
                Ok(DnsConn::Tls(Box::new(stream)))
            }
        }
    }

    /// Returns a used connection to the pool.
    pub(crate) fn yield_conn(&self, conn: DnsConn) {
        let mut pool = self.pool.lock();
        let conns = pool.entry(conn.proto()).or_default();
        conns.retain(|cached| cached.idle_since.elapsed() < self.expire);
        conns.push(Cached {
            conn,
            idle_since: Instant::now(),
        });
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.pool.lock().values().map(Vec::len).sum()
    }

    /// Drops every pooled connection.
    pub fn close(&self) {
        self.pool.lock().clear();
    }

    fn checkout(&self, proto: Protocol) -> Option<DnsConn> {
        let mut pool = self.pool.lock();
        let conns = pool.get_mut(&proto)?;
        conns.retain(|cached| cached.idle_since.elapsed() < self.expire);
        conns.pop().map(|cached| cached.conn)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("addr", &self.addr)
            .field("expire", &self.expire)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
