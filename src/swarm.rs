//! The swarm: a torrent's address book of known, connected, and banned
//! peers.
//!
//! Addresses arrive from trackers, PEX, magnet hints, and inbound
//! connects, deduplicated by socket address. The torrent tops up its
//! connections from here, choosing candidates by origin rank, score,
//! and how long ago they were last tried. Repeated protocol or hash
//! faults ban an address for a cooldown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Where we learned of a peer address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOrigin {
  Tracker,
  MagnetHint,
  Pex,
  Lpd,
  Accepted,
}

impl PeerOrigin {
  /// Dial priority rank, lower first. Tracker peers are the freshest
  /// signal, hints were explicitly given to us, PEX is hearsay.
  fn rank(&self) -> u8 {
    match self {
      Self::Tracker => 0,
      Self::MagnetHint => 1,
      Self::Pex => 2,
      Self::Lpd => 3,
      Self::Accepted => 4,
    }
  }
}

/// A peer address we know about, with its dial history.
#[derive(Clone, Debug)]
pub struct KnownPeer {
  pub addr: SocketAddr,
  pub origin: PeerOrigin,
  /// Grows with successful connects, shrinks with failures.
  pub score: i32,
  pub last_attempt: Option<Instant>,
  /// Set while the address is resting after an unreachable dial.
  pub cooldown_until: Option<Instant>,
}

/// The address book of one torrent.
#[derive(Default)]
pub struct Swarm {
  known: HashMap<SocketAddr, KnownPeer>,
  /// Banned addresses and when the ban lifts.
  banned: HashMap<SocketAddr, Instant>,
  /// Accumulated fault score per address.
  faults: HashMap<SocketAddr, u32>,
}

impl Swarm {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn known_count(&self) -> usize {
    self.known.len()
  }

  /// Adds an address to the book. Already known or banned addresses are
  /// left as they are.
  pub fn insert(&mut self, addr: SocketAddr, origin: PeerOrigin) {
    if self.banned.contains_key(&addr) {
      return;
    }
    self.known.entry(addr).or_insert(KnownPeer {
      addr,
      origin,
      score: 0,
      last_attempt: None,
      cooldown_until: None,
    });
  }

  /// Picks up to `count` addresses to dial, skipping connected, banned,
  /// and cooling-down addresses, ordered by (origin rank, score, last
  /// attempt age). The picked addresses are stamped as attempted.
  pub fn candidates(
    &mut self,
    count: usize,
    now: Instant,
    connected: &HashSet<SocketAddr>,
  ) -> Vec<SocketAddr> {
    self.expire_bans(now);

    let mut eligible: Vec<&KnownPeer> = self
      .known
      .values()
      .filter(|peer| {
        !connected.contains(&peer.addr)
          && !self.banned.contains_key(&peer.addr)
          && peer.cooldown_until.map(|until| until <= now).unwrap_or(true)
      })
      .collect();

    eligible.sort_by_key(|peer| {
      (
        peer.origin.rank(),
        -peer.score,
        // never-attempted first, then the longest-idle
        peer
          .last_attempt
          .map(|at| now.saturating_duration_since(at))
          .map(std::cmp::Reverse),
      )
    });

    let picked: Vec<SocketAddr> =
      eligible.iter().take(count).map(|peer| peer.addr).collect();
    for addr in picked.iter() {
      if let Some(peer) = self.known.get_mut(addr) {
        peer.last_attempt = Some(now);
      }
    }
    picked
  }

  /// Records a completed handshake with the address.
  pub fn record_success(&mut self, addr: SocketAddr) {
    if let Some(peer) = self.known.get_mut(&addr) {
      peer.score += 1;
      peer.cooldown_until = None;
    }
  }

  /// Marks an address dead for the cooldown after a dial timeout or
  /// refusal. Not a ban.
  pub fn record_unreachable(&mut self, addr: SocketAddr, cooldown: Duration) {
    if let Some(peer) = self.known.get_mut(&addr) {
      peer.score -= 1;
      peer.cooldown_until = Some(Instant::now() + cooldown);
    }
  }

  /// Adds fault weight to an address; once the threshold is reached the
  /// address is banned for `ban_duration`. Returns whether it is now
  /// banned.
  pub fn record_fault(
    &mut self,
    addr: SocketAddr,
    weight: u32,
    threshold: u32,
    ban_duration: Duration,
  ) -> bool {
    let faults = self.faults.entry(addr).or_insert(0);
    *faults += weight;
    log::debug!("Peer {} fault score now {}", addr, faults);
    if *faults >= threshold {
      self.ban(addr, ban_duration);
      true
    } else {
      false
    }
  }

  pub fn fault_score(&self, addr: &SocketAddr) -> u32 {
    self.faults.get(addr).copied().unwrap_or(0)
  }

  /// Bans the address outright for the duration.
  pub fn ban(&mut self, addr: SocketAddr, duration: Duration) {
    log::info!("Banning peer {} for {:?}", addr, duration);
    self.known.remove(&addr);
    self.banned.insert(addr, Instant::now() + duration);
  }

  pub fn is_banned(&self, addr: &SocketAddr) -> bool {
    match self.banned.get(addr) {
      Some(until) => *until > Instant::now(),
      None => false,
    }
  }

  /// A sample of known addresses for PEX, excluding the given peer.
  pub fn pex_sample(
    &self,
    exclude: SocketAddr,
    count: usize,
  ) -> Vec<SocketAddr> {
    self
      .known
      .keys()
      .filter(|addr| **addr != exclude)
      .take(count)
      .copied()
      .collect()
  }

  fn expire_bans(&mut self, now: Instant) {
    let expired: Vec<SocketAddr> = self
      .banned
      .iter()
      .filter(|(_, until)| **until <= now)
      .map(|(addr, _)| *addr)
      .collect();
    for addr in expired {
      self.banned.remove(&addr);
      self.faults.remove(&addr);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(port: u16) -> SocketAddr {
    SocketAddr::new([10, 0, 0, 1].into(), port)
  }

  #[tokio::test(start_paused = true)]
  async fn test_dedup() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Tracker);
    swarm.insert(addr(1), PeerOrigin::Pex);
    assert_eq!(swarm.known_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_candidate_origin_order() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Pex);
    swarm.insert(addr(2), PeerOrigin::Tracker);
    swarm.insert(addr(3), PeerOrigin::MagnetHint);
    let picked =
      swarm.candidates(3, Instant::now(), &HashSet::new());
    assert_eq!(picked, vec![addr(2), addr(3), addr(1)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_connected_and_banned_skipped() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Tracker);
    swarm.insert(addr(2), PeerOrigin::Tracker);
    swarm.insert(addr(3), PeerOrigin::Tracker);
    swarm.ban(addr(2), Duration::from_secs(600));

    let connected: HashSet<SocketAddr> = [addr(1)].into_iter().collect();
    let picked = swarm.candidates(10, Instant::now(), &connected);
    assert_eq!(picked, vec![addr(3)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_ban_expires() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Tracker);
    swarm.ban(addr(1), Duration::from_secs(60));
    assert!(swarm.is_banned(&addr(1)));
    // a banned address is not re-inserted
    swarm.insert(addr(1), PeerOrigin::Pex);
    assert_eq!(swarm.known_count(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!swarm.is_banned(&addr(1)));
    swarm.candidates(1, Instant::now(), &HashSet::new());
    swarm.insert(addr(1), PeerOrigin::Pex);
    assert_eq!(swarm.known_count(), 1);
    // the fault slate was wiped with the ban
    assert_eq!(swarm.fault_score(&addr(1)), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_faults_accumulate_to_ban() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Tracker);
    let threshold = 3;
    let ban = Duration::from_secs(600);
    assert!(!swarm.record_fault(addr(1), 1, threshold, ban));
    assert!(!swarm.record_fault(addr(1), 1, threshold, ban));
    assert!(swarm.record_fault(addr(1), 1, threshold, ban));
    assert!(swarm.is_banned(&addr(1)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_unreachable_cooldown() {
    let mut swarm = Swarm::new();
    swarm.insert(addr(1), PeerOrigin::Tracker);
    swarm.record_unreachable(addr(1), Duration::from_secs(300));
    assert!(swarm
      .candidates(1, Instant::now(), &HashSet::new())
      .is_empty());

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(
      swarm.candidates(1, Instant::now(), &HashSet::new()),
      vec![addr(1)]
    );
  }
}
