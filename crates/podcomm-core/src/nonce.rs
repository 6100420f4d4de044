//! Deterministic nonce schedule shared with the pod.
//!
//! Both endpoints seed an identical 16-entry rolling table from the pod's
//! lot and tid at pairing, so the pod can verify that each authenticated
//! command carries the next expected nonce. When the generators drift the
//! pod answers with a sync word, from which [`NonceState::resync`] derives a
//! fresh seed on both sides.

use serde::{Deserialize, Serialize};

use crate::protocol::crc;

const TABLE_LEN: usize = 18;

/// The controller's half of the shared nonce schedule.
///
/// `table[0]` and `table[1]` are the generator seeds; `table[2..]` holds the
/// 16 live nonce entries addressed by `idx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceState {
    lot: u32,
    tid: u32,
    table: [u32; TABLE_LEN],
    idx: u8,
}

impl NonceState {
    /// Seed a generator from the pod identifiers, with the default seed.
    #[must_use]
    pub fn new(lot: u32, tid: u32) -> Self {
        Self::with_seed(lot, tid, 0)
    }

    /// Seed a generator with an explicit 16-bit seed (used after resync).
    #[must_use]
    pub fn with_seed(lot: u32, tid: u32, seed: u16) -> Self {
        let mut state = Self {
            lot,
            tid,
            table: [0; TABLE_LEN],
            idx: 0,
        };
        state.initialize(seed);
        state
    }

    fn initialize(&mut self, seed: u16) {
        self.table[0] = (self.lot & 0xffff)
            .wrapping_add(0x5554_3dc3)
            .wrapping_add(self.lot >> 16)
            .wrapping_add(u32::from(seed & 0xff));
        self.table[1] = (self.tid & 0xffff)
            .wrapping_add(0xaaaa_e44e)
            .wrapping_add(self.tid >> 16)
            .wrapping_add(u32::from(seed >> 8));
        for slot in 2..TABLE_LEN {
            self.table[slot] = self.generate_entry();
        }
        self.idx = ((self.table[0].wrapping_add(self.table[1])) & 0x0f) as u8;
    }

    fn generate_entry(&mut self) -> u32 {
        self.table[0] =
            (self.table[0] >> 16).wrapping_add((self.table[0] & 0xffff).wrapping_mul(0x5d7f));
        self.table[1] =
            (self.table[1] >> 16).wrapping_add((self.table[1] & 0xffff).wrapping_mul(0x8ca0));
        self.table[1].wrapping_add((self.table[0] & 0xffff) << 16)
    }

    /// The nonce the next authenticated command must carry.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.table[2 + usize::from(self.idx)]
    }

    /// Consume the current nonce: replace its table slot with a fresh entry
    /// and jump the index according to the consumed value.
    pub fn advance_to_next(&mut self) {
        let consumed = self.current();
        let next = self.generate_entry();
        self.table[2 + usize::from(self.idx)] = next;
        self.idx = (consumed & 0x0f) as u8;
    }

    /// Reseed the table from a pod sync word after a nonce mismatch.
    ///
    /// `sent_nonce` is the nonce the rejected command carried and
    /// `message_seq` the sequence number of the rejected message; the pod
    /// folds both into its own reseed the same way.
    pub fn resync(&mut self, sync_word: u16, sent_nonce: u32, message_seq: u8) {
        let sum = (sent_nonce & 0xffff)
            .wrapping_add(u32::from(crc::table_entry(message_seq)))
            .wrapping_add(self.lot & 0xffff)
            .wrapping_add(self.tid & 0xffff);
        let seed = ((sum & 0xffff) as u16) ^ sync_word;
        self.initialize(seed);
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The nonce sequence is a pure function of the pod identifiers and
        /// the history of operations applied.
        #[test]
        fn prop_reproducible_from_history(
            lot in any::<u32>(),
            tid in any::<u32>(),
            ops in prop::collection::vec(prop::option::of((any::<u16>(), 0u8..32)), 0..40),
        ) {
            let mut a = NonceState::new(lot, tid);
            let mut b = NonceState::new(lot, tid);
            for op in ops {
                match op {
                    // An advance on both.
                    None => {
                        a.advance_to_next();
                        b.advance_to_next();
                    },
                    // A resync on both, keyed off the shared current nonce.
                    Some((sync_word, message_seq)) => {
                        let sent = a.current();
                        a.resync(sync_word, sent, message_seq);
                        b.resync(sync_word, sent, message_seq);
                    },
                }
                prop_assert_eq!(a.current(), b.current());
            }
            prop_assert_eq!(a, b);
        }

        /// Advancing always lands the index inside the 16-entry window.
        #[test]
        fn prop_index_stays_in_range(
            lot in any::<u32>(),
            tid in any::<u32>(),
            advances in 0usize..64,
        ) {
            let mut state = NonceState::new(lot, tid);
            for _ in 0..advances {
                state.advance_to_next();
                prop_assert!(usize::from(state.idx) < 16);
            }
        }
    }
}
