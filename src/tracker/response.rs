use std::{net::SocketAddr, time::Duration};

use serde_derive::Deserialize;

use super::{deserialize_peers, deserialize_peers6, deserialize_seconds};

/// A tracker's announce response.
#[derive(Debug, Default, Deserialize)]
#[cfg_attr(test, derive(PartialEq, serde_derive::Serialize))]
pub struct Response {
  /// The tracker id. If set, we must send it with each subsequent
  /// announce.
  #[serde(rename = "tracker id")]
  pub tracker_id: Option<String>,

  /// If this is not empty, no other field in the response is valid. It
  /// contains a human-readable error message as to why the request was
  /// invalid.
  #[serde(rename = "failure reason")]
  pub failure_reason: Option<String>,

  /// Optional. Similar to failure reason, but the response is still
  /// processed.
  pub warning_message: Option<String>,

  /// The number of seconds the client should wait before recontacting
  /// the tracker.
  #[serde(default)]
  #[serde(deserialize_with = "deserialize_seconds")]
  pub interval: Option<Duration>,

  /// If present, the client must not re-announce before the end of this
  /// interval.
  #[serde(default)]
  #[serde(rename = "min interval")]
  #[serde(deserialize_with = "deserialize_seconds")]
  pub min_interval: Option<Duration>,

  #[serde(rename = "complete")]
  pub seeder_count: Option<usize>,
  #[serde(rename = "incomplete")]
  pub leecher_count: Option<usize>,

  /// IPv4 peers, either as a compact string or a list of dicts.
  #[serde(default)]
  #[serde(deserialize_with = "deserialize_peers")]
  pub peers: Vec<SocketAddr>,

  /// IPv6 peers in compact form, 18 bytes each.
  #[serde(default)]
  #[serde(rename = "peers6")]
  #[serde(deserialize_with = "deserialize_peers6")]
  pub peers6: Vec<SocketAddr>,
}

impl Response {
  /// All returned peers, both address families.
  pub fn all_peers(&self) -> impl Iterator<Item = SocketAddr> + '_ {
    self.peers.iter().chain(self.peers6.iter()).copied()
  }
}
