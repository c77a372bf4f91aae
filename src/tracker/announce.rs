use std::net::IpAddr;

use crate::{PeerId, Sha1Hash};

/// Parameters for announcing to a tracker.
/// [`More details about the key meanings`](http://bittorrent.org/beps/bep_0003.html)
#[derive(Clone, Debug)]
pub struct Announce {
  /// The torrent's info hash.
  pub info_hash: Sha1Hash,
  /// Our own identifier.
  pub peer_id: PeerId,

  /// The port we are listening on.
  pub port: u16,
  /// The true IP address in dotted quad format. Only necessary when the
  /// request originates from a different address than the client's, as
  /// with proxies or when tracker and peer share a NAT'd subnet.
  pub ip: Option<IpAddr>,

  /// Number of payload bytes downloaded so far.
  pub downloaded: u64,
  /// Number of payload bytes uploaded so far.
  pub uploaded: u64,
  /// Number of bytes left to download.
  pub left: u64,

  /// The number of peers the client wishes to receive from the tracker.
  /// If omitted, UDP trackers are signalled to pick a default with -1,
  /// and HTTP trackers typically default to 30 to 50.
  pub peer_count: Option<usize>,

  /// Only set during the lifecycle transitions defined in [`Event`];
  /// plain periodic announces carry no event.
  pub event: Option<Event>,
}

/// The optional announce event.
///
/// When absent, the announce is one of the regular interval ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
  /// The first request to a tracker after a torrent becomes active must
  /// include this value.
  Started,
  /// Sent when the client becomes a seeder. Must not be sent if the
  /// client was already a seeder when it started.
  Completed,
  /// Sent when the torrent stops or the client shuts down gracefully.
  Stopped,
}

impl Event {
  /// The query parameter value in HTTP announces.
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Started => "started",
      Self::Completed => "completed",
      Self::Stopped => "stopped",
    }
  }

  /// The event field value in UDP announces, per BEP 15.
  pub fn to_udp(&self) -> u32 {
    match self {
      Self::Completed => 1,
      Self::Started => 2,
      Self::Stopped => 3,
    }
  }
}
