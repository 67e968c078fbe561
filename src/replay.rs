// replay.rs - sliding replay window with rollover inference across the 32-bit sequence space

/// Width of the replay bitmap.
pub const WINDOW_BITS: i64 = 64;

/// Extended indices are 48 bits: 16-bit rollover code above the 32-bit wire sequence.
pub const EXTENDED_INDEX_BITS: u32 = 48;

const HALF_SPACE: u32 = 1 << 31;

/// Result of mapping a wire sequence onto the extended index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexGuess {
    /// 48-bit extended index.
    pub index: u64,
    /// Rollover code the index was built with.
    pub rollover: u32,
    /// Signed distance from the latest accepted index.
    pub delta: i64,
}

/// Per-session replay state.
///
/// Bit `i` of `window` records that index `latest - i` was accepted. Mutation
/// happens only through [`ReplayGuard::advance`], which callers invoke after the
/// packet authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayGuard {
    window: u64,
    latest: u32,
    rollover: u32,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a guard that has already accepted `latest` within `rollover`.
    pub fn with_state(latest: u32, rollover: u32) -> Self {
        Self {
            window: 1,
            latest,
            rollover,
        }
    }

    pub fn latest(&self) -> u32 {
        self.latest
    }

    pub fn rollover(&self) -> u32 {
        self.rollover
    }

    fn last_index(&self) -> u64 {
        (u64::from(self.rollover) << 32) | u64::from(self.latest)
    }

    /// Infers the extended index of `wire_seq`, assuming at most one wrap either way.
    ///
    /// Returns `None` when the guess would need a negative rollover code or one
    /// beyond the 48-bit index space; such packets are unconditionally stale.
    pub fn guess(&self, wire_seq: u32) -> Option<IndexGuess> {
        let rollover = if self.latest < HALF_SPACE {
            if wire_seq > self.latest && wire_seq - self.latest > HALF_SPACE {
                self.rollover.checked_sub(1)?
            } else {
                self.rollover
            }
        } else if self.latest > wire_seq && self.latest - wire_seq > HALF_SPACE {
            self.rollover.checked_add(1)?
        } else {
            self.rollover
        };

        if rollover >= 1 << (EXTENDED_INDEX_BITS - 32) {
            return None;
        }

        let index = (u64::from(rollover) << 32) | u64::from(wire_seq);
        let delta = index as i64 - self.last_index() as i64;
        Some(IndexGuess {
            index,
            rollover,
            delta,
        })
    }

    /// Returns true when the index at `delta` was already seen or is too old to judge.
    pub fn was_replayed(&self, delta: i64) -> bool {
        if delta > 0 {
            return false;
        }
        if delta <= -WINDOW_BITS {
            return true;
        }
        self.window & (1u64 << (-delta)) != 0
    }

    /// Checks a guess without mutating state.
    pub fn check(&self, wire_seq: u32) -> Option<IndexGuess> {
        let guess = self.guess(wire_seq)?;
        if self.was_replayed(guess.delta) {
            None
        } else {
            Some(guess)
        }
    }

    /// Records an authenticated packet.
    pub fn advance(&mut self, wire_seq: u32, guess: IndexGuess) {
        let delta = guess.delta;
        if delta > 0 {
            self.window = if delta < WINDOW_BITS {
                self.window << delta
            } else {
                0
            };
            self.window |= 1;
            self.latest = wire_seq;
            self.rollover = guess.rollover;
        } else if delta > -WINDOW_BITS {
            self.window |= 1u64 << (-delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver(guard: &mut ReplayGuard, seq: u32) -> bool {
        match guard.check(seq) {
            Some(guess) => {
                guard.advance(seq, guess);
                true
            }
            None => false,
        }
    }

    #[test]
    fn redelivery_of_latest_is_replay() {
        let guard = ReplayGuard::with_state(1000, 0);
        let guess = guard.guess(1000).unwrap();
        assert_eq!(guess.delta, 0);
        assert!(guard.was_replayed(guess.delta));
    }

    #[test]
    fn next_sequence_accepted_once() {
        let mut guard = ReplayGuard::with_state(1000, 0);
        assert!(deliver(&mut guard, 1001));
        assert!(!deliver(&mut guard, 1001));
        assert_eq!(guard.latest(), 1001);
    }

    #[test]
    fn outside_window_is_replay() {
        let guard = ReplayGuard::with_state(1000, 0);
        let guess = guard.guess(1000 - 70).unwrap();
        assert!(guard.was_replayed(guess.delta));
    }

    #[test]
    fn unseen_inside_window_accepted_then_rejected() {
        let mut guard = ReplayGuard::with_state(1000, 0);
        let guess = guard.guess(960).unwrap();
        assert!(!guard.was_replayed(guess.delta));
        guard.advance(960, guess);
        let again = guard.guess(960).unwrap();
        assert!(guard.was_replayed(again.delta));
        // latest is unaffected by an out-of-order packet
        assert_eq!(guard.latest(), 1000);
    }

    #[test]
    fn infers_forward_wrap() {
        let guard = ReplayGuard::with_state(4_294_967_290, 5);
        let before = guard.last_index();
        let guess = guard.guess(10).unwrap();
        assert_eq!(guess.rollover, 6);
        assert!(guess.index > before);
        assert!(guess.delta > 0);
    }

    #[test]
    fn infers_backward_wrap() {
        let guard = ReplayGuard::with_state(5, 3);
        let guess = guard.guess(u32::MAX - 2).unwrap();
        assert_eq!(guess.rollover, 2);
        assert_eq!(guess.delta, -8);
    }

    #[test]
    fn backward_wrap_from_zero_rollover_is_stale() {
        let guard = ReplayGuard::with_state(5, 0);
        assert!(guard.guess(u32::MAX - 2).is_none());
        assert!(guard.check(u32::MAX - 2).is_none());
    }

    #[test]
    fn wrapping_stream_keeps_accepting() {
        let mut guard = ReplayGuard::with_state(u32::MAX - 3, 0);
        for seq in [u32::MAX - 2, u32::MAX - 1, u32::MAX, 0, 1, 2] {
            assert!(deliver(&mut guard, seq), "seq {seq} rejected");
        }
        assert_eq!(guard.rollover(), 1);
        assert_eq!(guard.latest(), 2);
        assert!(!deliver(&mut guard, u32::MAX));
    }

    #[test]
    fn large_jump_clears_window() {
        let mut guard = ReplayGuard::with_state(10, 0);
        assert!(deliver(&mut guard, 500));
        assert!(deliver(&mut guard, 500 + 64 * 3));
        assert!(!deliver(&mut guard, 500));
    }

    #[test]
    fn fresh_guard_accepts_first_packet() {
        let mut guard = ReplayGuard::new();
        assert!(deliver(&mut guard, 1));
        assert!(deliver(&mut guard, 2));
        assert!(!deliver(&mut guard, 1));
    }
}
