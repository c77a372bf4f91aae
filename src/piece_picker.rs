//! The piece picker decides which piece a session should download next.
//!
//! Candidate pieces are the ones we don't have yet. They are ordered
//! rarest first by the number of connected peers advertising them, with
//! ties broken by the stable piece index so repeated picks don't thrash
//! between equally rare pieces.

use crate::{bitfield, Bitfield, PieceIndex};

/// Per-piece bookkeeping of the picker.
#[derive(Clone, Copy, Debug, Default)]
struct PieceState {
  /// The number of connected peers that advertise this piece.
  frequency: usize,
  /// Whether an active download exists for this piece. Pending pieces
  /// are not picked again; sessions join their existing download
  /// through the torrent's download map instead.
  is_pending: bool,
}

/// Shared by a torrent and all its peer sessions behind a lock.
#[derive(Debug)]
pub struct PiecePicker {
  /// Which pieces we have. A bit is only ever set after the piece was
  /// hash-verified and written to disk.
  own_pieces: Bitfield,
  pieces: Vec<PieceState>,
  missing_count: usize,
}

impl PiecePicker {
  /// Creates a picker for a torrent whose metadata is not yet known. It
  /// has no pieces and picks nothing.
  pub fn empty() -> Self {
    Self::new(Bitfield::new())
  }

  /// Creates a picker with the given starting piece availability, e.g.
  /// restored from a previous session.
  pub fn new(own_pieces: Bitfield) -> Self {
    let missing_count = own_pieces.len() - bitfield::cardinality(&own_pieces);
    Self {
      pieces: vec![PieceState::default(); own_pieces.len()],
      own_pieces,
      missing_count,
    }
  }

  pub fn piece_count(&self) -> usize {
    self.own_pieces.len()
  }

  pub fn own_pieces(&self) -> &Bitfield {
    &self.own_pieces
  }

  pub fn have_piece(&self, index: PieceIndex) -> bool {
    self.own_pieces.get(index).map(|b| *b).unwrap_or(false)
  }

  pub fn missing_piece_count(&self) -> usize {
    self.missing_count
  }

  pub fn is_complete(&self) -> bool {
    self.missing_count == 0 && self.piece_count() > 0
  }

  /// The number of connected peers that have the piece.
  pub fn frequency(&self, index: PieceIndex) -> usize {
    self.pieces.get(index).map(|p| p.frequency).unwrap_or(0)
  }

  /// Registers a connected peer's full piece availability.
  pub fn register_peer_pieces(&mut self, pieces: &Bitfield) {
    for index in pieces.iter_ones() {
      self.register_piece_availability(index);
    }
  }

  /// Registers that a connected peer announced having a piece.
  pub fn register_piece_availability(&mut self, index: PieceIndex) {
    if let Some(piece) = self.pieces.get_mut(index) {
      piece.frequency += 1;
    }
  }

  /// Removes a disconnecting peer's piece availability.
  pub fn unregister_peer_pieces(&mut self, pieces: &Bitfield) {
    for index in pieces.iter_ones() {
      self.unregister_piece_availability(index);
    }
  }

  /// Removes a single piece of availability, as announced by
  /// lt_donthave.
  pub fn unregister_piece_availability(&mut self, index: PieceIndex) {
    if let Some(piece) = self.pieces.get_mut(index) {
      piece.frequency = piece.frequency.saturating_sub(1);
    }
  }

  /// Whether the peer has any piece we are still missing. This drives
  /// our interest toward the peer.
  pub fn is_interested_in(&self, peer_pieces: &Bitfield) -> bool {
    peer_pieces
      .iter_ones()
      .any(|index| !self.have_piece(index))
  }

  /// Picks the rarest piece the peer has that we miss and that no
  /// download exists for yet, marking it pending. Ties are broken by
  /// the lower piece index.
  pub fn pick_piece(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
    let mut best: Option<(usize, PieceIndex)> = None;
    for index in peer_pieces.iter_ones() {
      if index >= self.pieces.len() {
        break;
      }
      if self.have_piece(index) || self.pieces[index].is_pending {
        continue;
      }
      let frequency = self.pieces[index].frequency;
      match best {
        Some((best_frequency, _)) if best_frequency <= frequency => {}
        _ => best = Some((frequency, index)),
      }
    }
    let (_, index) = best?;
    self.pieces[index].is_pending = true;
    Some(index)
  }

  /// Marks a verified and stored piece as ours.
  pub fn received_piece(&mut self, index: PieceIndex) {
    if let Some(mut have) = self.own_pieces.get_mut(index) {
      if !*have {
        *have = true;
        self.missing_count -= 1;
      }
    }
    if let Some(piece) = self.pieces.get_mut(index) {
      piece.is_pending = false;
    }
  }

  /// Clears the pending mark of a piece whose download was abandoned or
  /// whose hash check failed, making it pickable again.
  pub fn abort_download(&mut self, index: PieceIndex) {
    if let Some(piece) = self.pieces.get_mut(index) {
      piece.is_pending = false;
    }
  }

  /// Replaces our piece availability wholesale, as after a recheck.
  /// Peer frequencies are retained.
  pub fn reset_own_pieces(&mut self, own_pieces: Bitfield) {
    debug_assert_eq!(own_pieces.len(), self.own_pieces.len());
    self.missing_count =
      own_pieces.len() - bitfield::cardinality(&own_pieces);
    self.own_pieces = own_pieces;
    for piece in self.pieces.iter_mut() {
      piece.is_pending = false;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peer_with(piece_count: usize, pieces: &[PieceIndex]) -> Bitfield {
    let mut bf = bitfield::new(piece_count);
    for &index in pieces {
      bf.set(index, true);
    }
    bf
  }

  #[test]
  fn test_empty_picker_picks_nothing() {
    let mut picker = PiecePicker::empty();
    assert_eq!(picker.piece_count(), 0);
    assert!(!picker.is_complete());
    assert_eq!(picker.pick_piece(&peer_with(0, &[])), None);
  }

  #[test]
  fn test_rarest_first_order() {
    let mut picker = PiecePicker::new(bitfield::new(4));
    // piece 0 is on three peers, 1 on two, 2 on one, 3 on none
    for _ in 0..3 {
      picker.register_piece_availability(0);
    }
    for _ in 0..2 {
      picker.register_piece_availability(1);
    }
    picker.register_piece_availability(2);

    let seed = peer_with(4, &[0, 1, 2]);
    assert_eq!(picker.pick_piece(&seed), Some(2));
    assert_eq!(picker.pick_piece(&seed), Some(1));
    assert_eq!(picker.pick_piece(&seed), Some(0));
    // everything the peer has is now pending
    assert_eq!(picker.pick_piece(&seed), None);
  }

  #[test]
  fn test_tie_broken_by_index() {
    let mut picker = PiecePicker::new(bitfield::new(3));
    let seed = peer_with(3, &[0, 1, 2]);
    picker.register_peer_pieces(&seed);
    assert_eq!(picker.pick_piece(&seed), Some(0));
    assert_eq!(picker.pick_piece(&seed), Some(1));
    assert_eq!(picker.pick_piece(&seed), Some(2));
  }

  #[test]
  fn test_own_pieces_not_picked() {
    let mut own = bitfield::new(2);
    own.set(0, true);
    let mut picker = PiecePicker::new(own);
    assert_eq!(picker.missing_piece_count(), 1);
    let seed = peer_with(2, &[0, 1]);
    assert_eq!(picker.pick_piece(&seed), Some(1));
    assert_eq!(picker.pick_piece(&seed), None);
  }

  #[test]
  fn test_received_and_completion() {
    let mut picker = PiecePicker::new(bitfield::new(2));
    let seed = peer_with(2, &[0, 1]);
    picker.register_peer_pieces(&seed);
    let first = picker.pick_piece(&seed).unwrap();
    picker.received_piece(first);
    assert_eq!(picker.missing_piece_count(), 1);
    assert!(!picker.is_complete());
    let second = picker.pick_piece(&seed).unwrap();
    picker.received_piece(second);
    assert!(picker.is_complete());
    // duplicate completion doesn't underflow
    picker.received_piece(second);
    assert_eq!(picker.missing_piece_count(), 0);
  }

  #[test]
  fn test_abort_makes_piece_pickable_again() {
    let mut picker = PiecePicker::new(bitfield::new(1));
    let seed = peer_with(1, &[0]);
    assert_eq!(picker.pick_piece(&seed), Some(0));
    assert_eq!(picker.pick_piece(&seed), None);
    picker.abort_download(0);
    assert_eq!(picker.pick_piece(&seed), Some(0));
  }

  #[test]
  fn test_donthave_decrements_frequency() {
    let mut picker = PiecePicker::new(bitfield::new(2));
    picker.register_piece_availability(0);
    picker.register_piece_availability(0);
    picker.register_piece_availability(1);
    picker.unregister_piece_availability(0);
    assert_eq!(picker.frequency(0), 1);
    // never goes below zero
    picker.unregister_piece_availability(1);
    picker.unregister_piece_availability(1);
    assert_eq!(picker.frequency(1), 0);
  }

  #[test]
  fn test_interest() {
    let mut own = bitfield::new(2);
    own.set(0, true);
    let picker = PiecePicker::new(own);
    assert!(!picker.is_interested_in(&peer_with(2, &[0])));
    assert!(picker.is_interested_in(&peer_with(2, &[0, 1])));
    assert!(!picker.is_interested_in(&peer_with(2, &[])));
  }

  #[test]
  fn test_reset_after_recheck() {
    let mut picker = PiecePicker::new(bitfield::new(4));
    let seed = peer_with(4, &[0, 1, 2, 3]);
    picker.register_peer_pieces(&seed);
    picker.pick_piece(&seed);

    let mut checked = bitfield::new(4);
    checked.set(0, true);
    checked.set(1, true);
    picker.reset_own_pieces(checked);
    assert_eq!(picker.missing_piece_count(), 2);
    // pending marks were cleared and have bits respected
    assert_eq!(picker.pick_piece(&seed), Some(2));
    assert_eq!(picker.pick_piece(&seed), Some(3));
    assert_eq!(picker.pick_piece(&seed), None);
  }
}
