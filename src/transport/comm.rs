// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::codec::framing::{append_crc, verify_and_strip_crc};
use crate::error::{Error, Result};
use crate::transport::{CidrAllowList, UDP_BUFFER_SIZE};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task;
use tracing::{debug, trace, warn};

/// Length prefix width for framed TCP streams.
const LEN_PREFIX_BYTES: usize = 4;

/// Communication component: UDP datagrams for probes/gossip, TCP streams for
/// push/pull and indirect fallbacks.
pub struct Comm {
    udp: Arc<UdpSocket>,
    advertise_addr: SocketAddr,
    cidr: CidrAllowList,
    stream_timeout: Duration,
}

impl Comm {
    /// Binds a UDP socket at `bind_addr`; the TCP listener is bound
    /// separately via [`Self::listen_requests`] since accepting is a
    /// long-running loop best spawned once the caller has wired up its
    /// dispatch channel.
    pub async fn new(bind_addr: SocketAddr, advertise_addr: SocketAddr, cidr: CidrAllowList, stream_timeout: Duration) -> Result<Self> {
        let udp = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            udp: Arc::new(udp),
            advertise_addr,
            cidr,
            stream_timeout,
        })
    }

    pub fn our_connection_info(&self) -> SocketAddr {
        self.advertise_addr
    }

    /// Sends a single UDP datagram, appending the trailing CRC32 every
    /// datagram carries (§4.A: "CRC32 (UDP only)"). Truncates (and logs)
    /// payloads over [`UDP_BUFFER_SIZE`] rather than fragmenting.
    pub async fn send_packet(&self, addr: SocketAddr, bytes: &[u8]) -> Result<()> {
        let framed = append_crc(bytes.to_vec());
        let framed = if framed.len() > UDP_BUFFER_SIZE {
            warn!(
                "truncating outbound packet to {} of {}, addr={}",
                UDP_BUFFER_SIZE,
                framed.len(),
                addr
            );
            &framed[..UDP_BUFFER_SIZE]
        } else {
            &framed[..]
        };
        self.udp.send_to(framed, addr).await.map_err(|_| Error::SendFailed { addr })?;
        Ok(())
    }

    /// Starts the UDP receive loop. Returns a stream of `(from, bytes)`.
    pub fn packet_stream(&self) -> PacketStream {
        let (tx, rx) = mpsc::channel(256);
        let udp = self.udp.clone();
        let _ = task::spawn(async move {
            let mut buf = vec![0u8; UDP_BUFFER_SIZE];
            loop {
                match udp.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        trace!("received {} byte packet from {}", n, from);
                        match verify_and_strip_crc(&buf[..n]) {
                            Ok(payload) => {
                                if tx.send((from, Bytes::copy_from_slice(payload))).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                warn!("dropping packet from {}: CRC mismatch", from);
                            }
                        }
                    }
                    Err(err) => {
                        debug!("udp recv error: {:?}", err);
                    }
                }
            }
        });
        PacketStream { rx }
    }

    /// Dials a fresh TCP connection, writes `bytes`, and reads back exactly
    /// one framed response. Used for push/pull exchanges, which are
    /// synchronous request/response over a short-lived connection.
    pub async fn request_stream(&self, addr: SocketAddr, bytes: Bytes) -> Result<Bytes> {
        let mut stream = tokio::time::timeout(self.stream_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::DialFailed {
                addr,
                reason: "connect timed out".to_string(),
            })?
            .map_err(|err| Error::DialFailed {
                addr,
                reason: err.to_string(),
            })?;

        write_frame(&mut stream, &bytes)
            .await
            .map_err(|_| Error::SendFailed { addr })?;

        tokio::time::timeout(self.stream_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::DialFailed {
                addr,
                reason: "response timed out".to_string(),
            })?
            .map_err(|err| Error::DialFailed {
                addr,
                reason: err.to_string(),
            })
    }

    /// Accepts inbound TCP connections for request/response exchanges (used
    /// by push/pull): reads one frame, hands `(peer, bytes, reply)` to the
    /// caller, then writes back whatever is sent on `reply` before closing.
    /// A dropped `reply` sender closes the connection with no response.
    pub async fn listen_requests(&self, bind_addr: SocketAddr) -> Result<RequestListener> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (tx, rx) = mpsc::channel(256);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let cidr = self.cidr.clone();

        let _ = task::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, peer)) => {
                                if !cidr.allows(peer.ip()) {
                                    debug!("rejecting connection from {} (CIDR deny)", peer);
                                    continue;
                                }
                                let tx = tx.clone();
                                let _ = task::spawn(async move {
                                    let bytes = match read_frame(&mut stream).await {
                                        Ok(bytes) => bytes,
                                        Err(err) => {
                                            debug!("stream read error from {}: {:?}", peer, err);
                                            return;
                                        }
                                    };
                                    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
                                    if tx.send((peer, bytes, reply_tx)).await.is_err() {
                                        return;
                                    }
                                    if let Ok(reply) = reply_rx.await {
                                        if let Err(err) = write_frame(&mut stream, &reply).await {
                                            debug!("stream write error to {}: {:?}", peer, err);
                                        }
                                    }
                                });
                            }
                            Err(err) => debug!("accept error: {:?}", err),
                        }
                    }
                    _ = cancel_rx.changed() => break,
                }
            }
        });

        Ok(RequestListener { rx, _cancel_tx: cancel_tx })
    }

    pub async fn shutdown(&self) {}
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    let mut framed = BytesMut::with_capacity(LEN_PREFIX_BYTES + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    framed.extend_from_slice(bytes);
    stream.write_all(&framed).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Bytes> {
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Stream of inbound UDP packets.
pub struct PacketStream {
    rx: mpsc::Receiver<(SocketAddr, Bytes)>,
}

impl PacketStream {
    pub async fn next(&mut self) -> Option<(SocketAddr, Bytes)> {
        self.rx.recv().await
    }
}

/// Stream of inbound TCP requests awaiting a response, as produced by
/// [`Comm::listen_requests`].
pub struct RequestListener {
    rx: mpsc::Receiver<(SocketAddr, Bytes, tokio::sync::oneshot::Sender<Bytes>)>,
    _cancel_tx: watch::Sender<bool>,
}

impl RequestListener {
    pub async fn next(&mut self) -> Option<(SocketAddr, Bytes, tokio::sync::oneshot::Sender<Bytes>)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn udp_round_trip() {
        let a = Comm::new(local(0), local(0), CidrAllowList::default(), Duration::from_secs(1))
            .await
            .unwrap();
        let b = Comm::new(local(0), local(0), CidrAllowList::default(), Duration::from_secs(1))
            .await
            .unwrap();

        let a_addr = a.udp.local_addr().unwrap();
        let b_addr = b.udp.local_addr().unwrap();

        let mut b_stream = b.packet_stream();
        a.send_packet(b_addr, b"hello").await.unwrap();

        let (from, bytes) = b_stream.next().await.unwrap();
        assert_eq!(from, a_addr);
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let server = Comm::new(local(0), local(0), CidrAllowList::default(), Duration::from_secs(1))
            .await
            .unwrap();
        let bind_addr = {
            let probe = tokio::net::TcpListener::bind(local(0)).await.unwrap();
            probe.local_addr().unwrap()
        };
        let mut listener = server.listen_requests(bind_addr).await.unwrap();

        let client = Comm::new(local(0), local(0), CidrAllowList::default(), Duration::from_secs(1))
            .await
            .unwrap();
        let request_task = tokio::spawn(async move {
            client.request_stream(bind_addr, Bytes::from_static(b"sync-req")).await
        });

        let (_from, bytes, reply) = listener.next().await.unwrap();
        assert_eq!(&bytes[..], b"sync-req");
        reply.send(Bytes::from_static(b"sync-resp")).unwrap();

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(&response[..], b"sync-resp");
    }
}
