//! Tracker clients and peer list ingestion.
//!
//! A torrent holds an ordered list of [`Tracker`]s. Announces are
//! dispatched to the HTTP or UDP client depending on the URL scheme;
//! the per-tracker announce scheduling and failure backoff state lives
//! in [`TrackerEntry`], which the torrent drives from its tick.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::{net::SocketAddr, time::Duration};

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use serde::de;
use serde_derive::Deserialize;
use tokio::time::Instant;
use url::Url;

use crate::error::metainfo::BencodeError;
use crate::error::tracker::TrackerError;

pub mod announce;
pub mod http;
pub mod response;
mod test;
pub mod udp;

pub mod prelude {
  pub use super::announce::*;
  pub use super::response::*;
  pub use super::{deserialize_peers, deserialize_peers6};
  pub use super::{Tracker, TrackerEntry};
  pub use crate::error::tracker::Result;
}

use announce::Announce;
use response::Response;

/// The fallback announce backoff base when a tracker provided no
/// minimum interval.
const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// A tracker reachable at one announce URL.
#[derive(Clone)]
pub enum Tracker {
  Http(http::HttpTracker),
  Udp(udp::UdpTracker),
}

impl Tracker {
  /// Creates the matching client for the URL scheme, or `None` for
  /// schemes we don't speak.
  pub fn from_url(url: Url) -> Option<Self> {
    match url.scheme() {
      "http" | "https" => Some(Self::Http(http::HttpTracker::new(url))),
      "udp" => udp::UdpTracker::new(url).map(Self::Udp),
      _ => None,
    }
  }

  pub fn url(&self) -> &Url {
    match self {
      Self::Http(t) => t.url(),
      Self::Udp(t) => t.url(),
    }
  }

  /// Sends an announce request to the tracker with the given parameters.
  ///
  /// This may be used by a torrent to request peers to download from
  /// and to report its transfer progress and lifecycle events.
  pub async fn announce(
    &self,
    params: Announce,
  ) -> Result<Response, TrackerError> {
    let response = match self {
      Self::Http(t) => t.announce(params).await?,
      Self::Udp(t) => t.announce(params).await?,
    };
    if let Some(reason) = &response.failure_reason {
      return Err(TrackerError::Failure(reason.clone()));
    }
    Ok(response)
  }
}

/// A torrent's per-tracker scheduling state.
pub struct TrackerEntry {
  pub tracker: Tracker,
  /// Number of consecutive failed announces; reset on success.
  pub consecutive_failures: usize,
  /// When the next announce may go out.
  pub next_announce: Option<Instant>,
  /// The interval the tracker asked us to keep between announces.
  pub interval: Option<Duration>,
  /// The tracker's minimum re-announce interval, which doubles as our
  /// backoff base.
  pub min_interval: Option<Duration>,
  /// Whether an announce to this tracker is currently in flight.
  pub in_flight: bool,
  /// Whether we ever told this tracker `started` since the torrent
  /// became active (it needs re-sending after every stop).
  pub sent_started: bool,
}

impl TrackerEntry {
  pub fn new(tracker: Tracker) -> Self {
    Self {
      tracker,
      consecutive_failures: 0,
      next_announce: None,
      interval: None,
      min_interval: None,
      in_flight: false,
      sent_started: false,
    }
  }

  /// Whether an announce to this tracker is due.
  pub fn is_due(&self, now: Instant) -> bool {
    !self.in_flight
      && self.next_announce.map(|at| at <= now).unwrap_or(true)
  }

  /// Records a successful announce and schedules the next one at the
  /// tracker-provided interval.
  pub fn record_success(
    &mut self,
    response: &Response,
    now: Instant,
    default_interval: Duration,
  ) {
    self.consecutive_failures = 0;
    self.interval = response.interval;
    self.min_interval = response.min_interval;
    let interval = response.interval.unwrap_or(default_interval);
    self.next_announce = Some(now + interval);
  }

  /// Records a failed announce: exponential backoff starting at the
  /// tracker's minimum interval (or 30 s), doubling per consecutive
  /// failure, capped.
  pub fn record_failure(&mut self, now: Instant, cap: Duration) {
    self.consecutive_failures += 1;
    let base = self.min_interval.unwrap_or(BACKOFF_BASE);
    let exponent = (self.consecutive_failures - 1).min(16) as u32;
    let backoff = base
      .saturating_mul(2u32.saturating_pow(exponent))
      .min(cap);
    self.next_announce = Some(now + backoff);
  }
}

/// Deserialize an integer representing seconds into a `Duration`.
pub fn deserialize_seconds<'de, D>(
  deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
  D: de::Deserializer<'de>,
{
  let s: Option<u64> = de::Deserialize::deserialize(deserializer)?;
  Ok(s.map(Duration::from_secs))
}

/// Peers can be sent in two ways:
/// - as a bencode list of dicts including full peer metadata, or
/// - as a single bencode string that contains only the peer IP and port
///   in compact representation.
///
/// This helper deserializes both into the same type, discarding the
/// peer id present in the full representation: most trackers send the
/// compact response by default and we don't use the peer id at this
/// stage anyway.
pub fn deserialize_peers<'de, D>(
  deserializer: D,
) -> Result<Vec<SocketAddr>, D::Error>
where
  D: de::Deserializer<'de>,
{
  struct Visitor;

  impl<'de> de::Visitor<'de> for Visitor {
    type Value = Vec<SocketAddr>;
    fn expecting(
      &self,
      formatter: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
      formatter.write_str("a string or list of dicts representing peers")
    }

    /// Deserializes a compact string of peers.
    ///
    /// Each entry is 6 bytes long: the 4 byte IPv4 address and the
    /// 2 byte port, both in network byte order.
    fn visit_bytes<E>(self, mut b: &[u8]) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      const ENTRY_LEN: usize = 6;

      let buf_len = b.len();

      if buf_len % ENTRY_LEN != 0 {
        return Err(TrackerError::Bencode(BencodeError::InvalidValue(
          "peers compact string must be a multiple of 6".into(),
        )))
        .map_err(E::custom);
      }

      let mut peers = Vec::with_capacity(buf_len / ENTRY_LEN);

      for _ in (0..buf_len).step_by(ENTRY_LEN) {
        let addr = Ipv4Addr::from(b.get_u32());
        let port = b.get_u16();
        let peer = SocketAddr::new(IpAddr::V4(addr), port);
        peers.push(peer);
      }
      Ok(peers)
    }

    /// Deserializes a list of dicts containing the peer information.
    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
      A: de::SeqAccess<'de>,
    {
      #[derive(Debug, Deserialize)]
      struct RawPeer {
        ip: String,
        port: u16,
      }
      let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
      while let Some(RawPeer { ip, port }) = seq.next_element()? {
        let ip = if let Ok(ip) = ip.parse() {
          ip
        } else {
          continue;
        };
        peers.push(SocketAddr::new(ip, port));
      }

      Ok(peers)
    }
  }

  deserializer.deserialize_any(Visitor)
}

/// Deserializes the compact IPv6 peer string: 18 bytes per peer, the
/// 16 byte address followed by the port.
pub fn deserialize_peers6<'de, D>(
  deserializer: D,
) -> Result<Vec<SocketAddr>, D::Error>
where
  D: de::Deserializer<'de>,
{
  struct Visitor;

  impl<'de> de::Visitor<'de> for Visitor {
    type Value = Vec<SocketAddr>;
    fn expecting(
      &self,
      formatter: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
      formatter.write_str("a compact string of ipv6 peers")
    }

    fn visit_bytes<E>(self, mut b: &[u8]) -> Result<Self::Value, E>
    where
      E: de::Error,
    {
      const ENTRY_LEN: usize = 18;

      if b.len() % ENTRY_LEN != 0 {
        return Err(TrackerError::Bencode(BencodeError::InvalidValue(
          "peers6 compact string must be a multiple of 18".into(),
        )))
        .map_err(E::custom);
      }

      let mut peers = Vec::with_capacity(b.len() / ENTRY_LEN);
      while b.has_remaining() {
        let mut octets = [0u8; 16];
        b.copy_to_slice(&mut octets);
        let port = b.get_u16();
        peers.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port));
      }
      Ok(peers)
    }
  }

  deserializer.deserialize_any(Visitor)
}

/// Contains the characters that need to be URL encoded according to:
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
pub(crate) const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'~')
  .remove(b'.');

#[cfg(test)]
mod backoff_tests {
  use super::*;

  fn entry() -> TrackerEntry {
    let tracker =
      Tracker::from_url(Url::parse("http://tracker/announce").unwrap())
        .unwrap();
    TrackerEntry::new(tracker)
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_entry_is_due() {
    let entry = entry();
    assert!(entry.is_due(Instant::now()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_doubles_and_caps() {
    let mut entry = entry();
    let now = Instant::now();
    let cap = Duration::from_secs(30 * 60);

    entry.record_failure(now, cap);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(30)));
    entry.record_failure(now, cap);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(60)));
    entry.record_failure(now, cap);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(120)));

    // many failures later the cap holds
    for _ in 0..20 {
      entry.record_failure(now, cap);
    }
    assert_eq!(entry.next_announce, Some(now + cap));
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_resets_backoff() {
    let mut entry = entry();
    let now = Instant::now();
    let cap = Duration::from_secs(30 * 60);
    entry.record_failure(now, cap);
    entry.record_failure(now, cap);

    let response = Response {
      interval: Some(Duration::from_secs(90)),
      ..Default::default()
    };
    entry.record_success(&response, now, Duration::from_secs(1800));
    assert_eq!(entry.consecutive_failures, 0);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(90)));

    // the next failure starts over from the base
    entry.record_failure(now, cap);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(30)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_min_interval_is_backoff_base() {
    let mut entry = entry();
    let now = Instant::now();
    let cap = Duration::from_secs(30 * 60);
    let response = Response {
      interval: Some(Duration::from_secs(90)),
      min_interval: Some(Duration::from_secs(10)),
      ..Default::default()
    };
    entry.record_success(&response, now, Duration::from_secs(1800));
    entry.record_failure(now, cap);
    assert_eq!(entry.next_announce, Some(now + Duration::from_secs(10)));
  }
}
