// fragment.rs - bounded per-session reassembly of fragmented messages
//
// Fragments of one message occupy consecutive sequence numbers, so the
// extended index of fragment 0 (`index - fragment.index`) keys the message.

use std::{collections::VecDeque, time::Duration, time::Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::{api::DataKind, wire::Fragment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLimits {
    /// Partial messages retained per session; the oldest is evicted beyond this.
    pub max_partial_messages: usize,
    /// Largest fragment count accepted for one message.
    pub max_fragments: u64,
    pub partial_timeout: Duration,
}

impl Default for FragmentLimits {
    fn default() -> Self {
        Self {
            max_partial_messages: 8,
            max_fragments: 64,
            partial_timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment index {index} out of range for count {count}")]
    IndexOutOfRange { index: u64, count: u64 },
    #[error("fragment count {count} exceeds limit {max}")]
    TooManyFragments { count: u64, max: u64 },
    #[error("fragment index {index} precedes extended index {extended}")]
    KeyUnderflow { extended: u64, index: u64 },
    #[error("message {key}: fragment count {actual} disagrees with {expected}")]
    CountMismatch { key: u64, expected: u64, actual: u64 },
    #[error("message {key}: fragment kind changed mid-message")]
    KindMismatch { key: u64 },
    #[error("message {key}: duplicate fragment {index}")]
    Duplicate { key: u64, index: u64 },
}

/// Message completed by [`Reassembly::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub key: u64,
    pub kind: DataKind,
    pub payload: Bytes,
}

/// Result of accepting one fragment.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub complete: Option<Reassembled>,
    /// Partial messages dropped to make room.
    pub evicted: usize,
}

#[derive(Debug)]
struct Partial {
    key: u64,
    kind: DataKind,
    parts: Vec<Option<Bytes>>,
    received: usize,
    started: Instant,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.received == self.parts.len()
    }

    fn assemble(self) -> Reassembled {
        let total = self.parts.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for part in self.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Reassembled {
            key: self.key,
            kind: self.kind,
            payload: out.freeze(),
        }
    }
}

/// Partial messages for one session, oldest first.
#[derive(Debug)]
pub struct Reassembly {
    limits: FragmentLimits,
    partials: VecDeque<Partial>,
}

impl Reassembly {
    pub fn new(limits: FragmentLimits) -> Self {
        Self {
            limits,
            partials: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Accepts the fragment that arrived at `extended_index`.
    ///
    /// A rejected fragment leaves existing partial messages untouched.
    pub fn insert(
        &mut self,
        extended_index: u64,
        kind: DataKind,
        fragment: Fragment,
        payload: &[u8],
        now: Instant,
    ) -> Result<InsertOutcome, FragmentError> {
        if fragment.index >= fragment.count {
            return Err(FragmentError::IndexOutOfRange {
                index: fragment.index,
                count: fragment.count,
            });
        }
        if fragment.count > self.limits.max_fragments {
            return Err(FragmentError::TooManyFragments {
                count: fragment.count,
                max: self.limits.max_fragments,
            });
        }
        let key = extended_index
            .checked_sub(fragment.index)
            .ok_or(FragmentError::KeyUnderflow {
                extended: extended_index,
                index: fragment.index,
            })?;

        let mut outcome = InsertOutcome::default();
        let position = match self.partials.iter().position(|p| p.key == key) {
            Some(position) => {
                let partial = &self.partials[position];
                if partial.parts.len() as u64 != fragment.count {
                    return Err(FragmentError::CountMismatch {
                        key,
                        expected: partial.parts.len() as u64,
                        actual: fragment.count,
                    });
                }
                if partial.kind != kind {
                    return Err(FragmentError::KindMismatch { key });
                }
                if partial.parts[fragment.index as usize].is_some() {
                    return Err(FragmentError::Duplicate {
                        key,
                        index: fragment.index,
                    });
                }
                position
            }
            None => {
                while self.partials.len() >= self.limits.max_partial_messages.max(1) {
                    self.partials.pop_front();
                    outcome.evicted += 1;
                }
                self.partials.push_back(Partial {
                    key,
                    kind,
                    parts: vec![None; fragment.count as usize],
                    received: 0,
                    started: now,
                });
                self.partials.len() - 1
            }
        };

        let partial = &mut self.partials[position];
        partial.parts[fragment.index as usize] = Some(Bytes::copy_from_slice(payload));
        partial.received += 1;

        if partial.is_complete() {
            if let Some(done) = self.partials.remove(position) {
                outcome.complete = Some(done.assemble());
            }
        }
        Ok(outcome)
    }

    pub fn clear(&mut self) {
        self.partials.clear();
    }

    /// Drops partial messages older than the timeout; returns how many.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let before = self.partials.len();
        let timeout = self.limits.partial_timeout;
        self.partials
            .retain(|partial| now.saturating_duration_since(partial.started) < timeout);
        before - self.partials.len()
    }
}
