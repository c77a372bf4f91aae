//! The UDP tracker protocol,
//! [BEP 15](http://bittorrent.org/beps/bep_0015.html).
//!
//! Every exchange starts with a connect request that earns a connection
//! id, followed by the announce proper. Both are retransmitted on the
//! canonical `15 * 2^n` second schedule with a fresh transaction id per
//! attempt; replies must echo the transaction id or they are dropped.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use url::Url;

use super::announce::Announce;
use super::response::Response;
use crate::error::tracker::{Result, TrackerError};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// The highest `n` of the `15 * 2^n` retransmit schedule.
const MAX_RETRANSMITS: u32 = 8;

/// A tracker speaking the BEP 15 UDP protocol.
#[derive(Clone)]
pub struct UdpTracker {
  url: Url,
  host: String,
  port: u16,
}

impl UdpTracker {
  /// Returns `None` if the URL has no host or port to send datagrams
  /// to.
  pub fn new(url: Url) -> Option<Self> {
    let host = url.host_str()?.to_string();
    let port = url.port()?;
    Some(UdpTracker { url, host, port })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub async fn announce(&self, params: Announce) -> Result<Response> {
    let socket = self.connect_socket().await?;

    // the connection id dance, then the announce proper
    let connection_id = self.request_connection_id(&socket).await?;
    self.request_announce(&socket, connection_id, &params).await
  }

  async fn connect_socket(&self) -> Result<UdpSocket> {
    let mut addrs =
      tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
    let addr = addrs.next().ok_or(TrackerError::InvalidUrl)?;
    let bind_addr: SocketAddr = if addr.is_ipv4() {
      "0.0.0.0:0".parse().unwrap()
    } else {
      "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    Ok(socket)
  }

  /// Sends connect requests until a matching connect response arrives,
  /// returning the connection id for the announce.
  async fn request_connection_id(&self, socket: &UdpSocket) -> Result<u64> {
    let mut response = [0u8; 1024];
    for n in 0..=MAX_RETRANSMITS {
      let transaction_id: u32 = rand::thread_rng().gen();
      let mut request = BytesMut::with_capacity(16);
      request.put_u64(PROTOCOL_MAGIC);
      request.put_u32(ACTION_CONNECT);
      request.put_u32(transaction_id);
      socket.send(&request).await?;

      match self.recv_with_timeout(socket, &mut response, n).await? {
        Some(len) if len >= 16 => {
          let mut buf = &response[..len];
          let action = buf.get_u32();
          let tid = buf.get_u32();
          if tid != transaction_id {
            log::warn!("Tracker {} transaction id mismatch", self.url);
            return Err(TrackerError::TransactionMismatch);
          }
          if action != ACTION_CONNECT {
            return Err(parse_error_action(action, buf));
          }
          return Ok(buf.get_u64());
        }
        Some(_) => return Err(TrackerError::MalformedResponse),
        // timed out, retransmit with the next backoff
        None => continue,
      }
    }
    Err(TrackerError::Timeout)
  }

  async fn request_announce(
    &self,
    socket: &UdpSocket,
    connection_id: u64,
    params: &Announce,
  ) -> Result<Response> {
    // 20 byte header, 78 byte announce body, room for ~160 peers back
    let mut response = [0u8; 1024];
    for n in 0..=MAX_RETRANSMITS {
      let transaction_id: u32 = rand::thread_rng().gen();
      let mut request = BytesMut::with_capacity(98);
      request.put_u64(connection_id);
      request.put_u32(ACTION_ANNOUNCE);
      request.put_u32(transaction_id);
      request.extend_from_slice(&params.info_hash);
      request.extend_from_slice(&params.peer_id);
      request.put_u64(params.downloaded);
      request.put_u64(params.left);
      request.put_u64(params.uploaded);
      request.put_u32(params.event.map(|e| e.to_udp()).unwrap_or(0));
      // our IP: zero tells the tracker to use the packet source
      request.put_u32(0);
      // a key identifying us across source ports
      request.put_u32(rand::thread_rng().gen());
      let num_want = params
        .peer_count
        .map(|count| count as i32)
        .unwrap_or(-1);
      request.put_i32(num_want);
      request.put_u16(params.port);
      socket.send(&request).await?;

      match self.recv_with_timeout(socket, &mut response, n).await? {
        Some(len) if len >= 20 => {
          let mut buf = &response[..len];
          let action = buf.get_u32();
          let tid = buf.get_u32();
          if tid != transaction_id {
            log::warn!("Tracker {} transaction id mismatch", self.url);
            return Err(TrackerError::TransactionMismatch);
          }
          if action != ACTION_ANNOUNCE {
            return Err(parse_error_action(action, buf));
          }
          return parse_announce_body(buf);
        }
        Some(_) => return Err(TrackerError::MalformedResponse),
        None => continue,
      }
    }
    Err(TrackerError::Timeout)
  }

  async fn recv_with_timeout(
    &self,
    socket: &UdpSocket,
    buf: &mut [u8],
    attempt: u32,
  ) -> Result<Option<usize>> {
    let timeout = Duration::from_secs(15) * 2u32.pow(attempt);
    match tokio::time::timeout(timeout, socket.recv(buf)).await {
      Ok(received) => Ok(Some(received?)),
      Err(_) => Ok(None),
    }
  }
}

/// Parses the fixed announce response body after the 8 byte header:
/// interval, leechers, seeders, then 6 bytes per peer.
fn parse_announce_body(mut buf: &[u8]) -> Result<Response> {
  if buf.len() < 12 {
    return Err(TrackerError::MalformedResponse);
  }
  let interval = buf.get_u32();
  let leechers = buf.get_u32();
  let seeders = buf.get_u32();

  if buf.len() % 6 != 0 {
    return Err(TrackerError::MalformedResponse);
  }
  let mut peers = Vec::with_capacity(buf.len() / 6);
  while buf.has_remaining() {
    let ip = std::net::Ipv4Addr::from(buf.get_u32());
    let port = buf.get_u16();
    peers.push(SocketAddr::new(ip.into(), port));
  }

  Ok(Response {
    interval: Some(Duration::from_secs(interval as u64)),
    leecher_count: Some(leechers as usize),
    seeder_count: Some(seeders as usize),
    peers,
    ..Default::default()
  })
}

fn parse_error_action(action: u32, mut buf: &[u8]) -> TrackerError {
  if action == ACTION_ERROR {
    let mut message = vec![0u8; buf.remaining()];
    buf.copy_to_slice(&mut message);
    TrackerError::Failure(String::from_utf8_lossy(&message).into_owned())
  } else {
    TrackerError::MalformedResponse
  }
}
