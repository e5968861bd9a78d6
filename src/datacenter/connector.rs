use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::datacenter::address::{ConnectionCandidate, DatacenterId};
use crate::session::auth_key::AuthKey;

/// An established connection to a datacenter, carrying serialized [crate::codec::frame::Frame]s.
///  The connection's I/O runs in tasks owned by the connector's implementation; dropping this
///  closes the connection. `incoming` returning `None` means the connection was lost.
#[derive(Debug)]
pub struct TransportConnection {
    pub candidate: ConnectionCandidate,
    pub outgoing: mpsc::Sender<Bytes>,
    pub incoming: mpsc::Receiver<Bytes>,
}

/// Establishes connections, including any handshake and encryption the transport requires. This
///  is where a concrete network stack plugs into the engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    async fn connect(&self, dc: DatacenterId, candidate: &ConnectionCandidate, auth_key: &AuthKey) -> anyhow::Result<TransportConnection>;

    /// A cheap reachability check without a full handshake, returning the round trip time
    async fn probe(&self, candidate: &ConnectionCandidate) -> anyhow::Result<Duration>;
}


const INTERMEDIATE_TAG: [u8; 4] = [0xee, 0xee, 0xee, 0xee];
const CHANNEL_CAPACITY: usize = 64;

const SOCKS_VERSION: u8 = 5;
const SOCKS_NO_AUTH: u8 = 0;
const SOCKS_CMD_CONNECT: u8 = 1;
const SOCKS_SUCCEEDED: u8 = 0;
const SOCKS_ATYP_IPV4: u8 = 1;
const SOCKS_ATYP_DOMAIN: u8 = 3;
const SOCKS_ATYP_IPV6: u8 = 4;

/// Plain TCP transport with 4-byte little endian length framing. Frames are not encrypted, so
///  this is for trusted links (and for tests against local servers).
///
/// Proxy candidates are tunneled through a SOCKS5 proxy (`CONNECT` without authentication).
///  Proxies with a secret expect their own obfuscated handshake, which this transport does not
///  speak, so connecting through them fails.
pub struct TcpTransportConnector {
    max_frame_len: usize,
}

impl TcpTransportConnector {
    pub fn new(max_frame_len: usize) -> TcpTransportConnector {
        TcpTransportConnector { max_frame_len }
    }

    /// A stream to the candidate's datacenter address, through its proxy if it has one
    async fn open_stream(candidate: &ConnectionCandidate) -> anyhow::Result<TcpStream> {
        let Some(proxy) = &candidate.proxy else {
            return Ok(TcpStream::connect(candidate.socket_addr).await?);
        };
        if proxy.secret.is_some() {
            bail!("proxy {}:{} requires a secret based handshake, which the TCP transport does not support", proxy.host, proxy.port);
        }

        let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
        socks5_connect(&mut stream, candidate.socket_addr).await?;
        trace!(proxy = %proxy.host, target = %candidate.socket_addr, "SOCKS5 tunnel established");
        Ok(stream)
    }
}

async fn socks5_connect(stream: &mut TcpStream, target: SocketAddr) -> anyhow::Result<()> {
    stream.write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        bail!("SOCKS proxy does not accept unauthenticated clients: {:?}", method);
    }

    let mut request = BytesMut::with_capacity(22);
    request.put_slice(&[SOCKS_VERSION, SOCKS_CMD_CONNECT, 0]);
    match target.ip() {
        IpAddr::V4(ip) => {
            request.put_u8(SOCKS_ATYP_IPV4);
            request.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.put_u8(SOCKS_ATYP_IPV6);
            request.put_slice(&ip.octets());
        }
    }
    request.put_u16(target.port());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] != SOCKS_SUCCEEDED {
        bail!("SOCKS proxy did not connect to {}: reply {}", target, reply[1]);
    }

    // the proxy's bound address is of no interest
    let addr_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => bail!("SOCKS proxy replied with unknown address type {}", other),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn read_frames(mut read_half: OwnedReadHalf, incoming: &mpsc::Sender<Bytes>, max_frame_len: usize) {
    loop {
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > max_frame_len {
            debug!("received frame of {} bytes exceeds limit - closing", len);
            return;
        }
        let mut frame = BytesMut::zeroed(len);
        if read_half.read_exact(&mut frame).await.is_err() {
            return;
        }
        trace!("received frame of {} bytes", len);
        if incoming.send(frame.freeze()).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl TransportConnector for TcpTransportConnector {
    async fn connect(&self, dc: DatacenterId, candidate: &ConnectionCandidate, _auth_key: &AuthKey) -> anyhow::Result<TransportConnection> {
        let mut stream = Self::open_stream(candidate).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&INTERMEDIATE_TAG).await?;
        debug!(?dc, addr = ?candidate.socket_addr, "TCP connection established");

        let (read_half, mut write_half) = stream.into_split();
        let (outgoing_send, mut outgoing_recv) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (incoming_send, incoming_recv) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outgoing_recv.recv().await {
                let len = (frame.len() as u32).to_le_bytes();
                if write_half.write_all(&len).await.is_err() || write_half.write_all(&frame).await.is_err() {
                    debug!("TCP write failed - closing");
                    break;
                }
            }
        });

        // the read half must not outlive the connection, even if the peer stays silent
        let max_frame_len = self.max_frame_len;
        tokio::spawn(async move {
            select! {
                _ = read_frames(read_half, &incoming_send, max_frame_len) => {}
                _ = incoming_send.closed() => debug!("connection was dropped - closing"),
            }
        });

        Ok(TransportConnection {
            candidate: candidate.clone(),
            outgoing: outgoing_send,
            incoming: incoming_recv,
        })
    }

    async fn probe(&self, candidate: &ConnectionCandidate) -> anyhow::Result<Duration> {
        let start = Instant::now();
        let _stream = Self::open_stream(candidate).await?;
        Ok(start.elapsed())
    }
}
