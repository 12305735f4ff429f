//! Disclosure reports: fixed-layout codec and TCN re-derivation
//!
//! Encoded report (binary, big-endian):
//! ```text
//! [1 byte: version][32 bytes: chain value at start][4 bytes: start][4 bytes: end]
//! [1 byte: memo_len][memo_len bytes: memo]
//! ```

use ito_core::{ItoError, ItoResult, Tcn};

use crate::keys::{advance, derive_tcn, ChainKey};
use crate::{KEY_SIZE, MAX_MEMO_LEN, REPORT_HEADER_SIZE, REPORT_VERSION};

/// A published disclosure of one ratchet's tick range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Chain value at `start_tick`
    pub seed_commitment: [u8; KEY_SIZE],
    pub start_tick: u32,
    /// Inclusive
    pub end_tick: u32,
    /// Opaque application data (e.g. a risk level), at most 255 bytes
    pub memo: Vec<u8>,
}

impl Report {
    pub fn new(
        seed_commitment: [u8; KEY_SIZE],
        start_tick: u32,
        end_tick: u32,
        memo: Vec<u8>,
    ) -> ItoResult<Self> {
        if start_tick > end_tick {
            return Err(ItoError::MalformedReport(format!(
                "start tick {start_tick} after end tick {end_tick}"
            )));
        }
        if memo.len() > MAX_MEMO_LEN {
            return Err(ItoError::MalformedReport(format!(
                "memo is {} bytes (max {MAX_MEMO_LEN})",
                memo.len()
            )));
        }
        Ok(Self {
            seed_commitment,
            start_tick,
            end_tick,
            memo,
        })
    }

    /// Number of TCNs covered (`end - start + 1`).
    pub fn len(&self) -> u64 {
        u64::from(self.end_tick) - u64::from(self.start_tick) + 1
    }

    /// A report always covers at least one tick.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn covers(&self, tick: u32) -> bool {
        (self.start_tick..=self.end_tick).contains(&tick)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPORT_HEADER_SIZE + self.memo.len());
        out.push(REPORT_VERSION);
        out.extend_from_slice(&self.seed_commitment);
        out.extend_from_slice(&self.start_tick.to_be_bytes());
        out.extend_from_slice(&self.end_tick.to_be_bytes());
        // Report::new caps the memo at 255 bytes
        out.push(self.memo.len() as u8);
        out.extend_from_slice(&self.memo);
        out
    }

    /// Decode untrusted bytes. Never panics; every mismatch is an error.
    pub fn decode(data: &[u8]) -> ItoResult<Self> {
        let (&version, rest) = data
            .split_first()
            .ok_or_else(|| ItoError::MalformedReport("empty input".into()))?;
        if version != REPORT_VERSION {
            return Err(ItoError::UnsupportedVersion(version));
        }
        if data.len() < REPORT_HEADER_SIZE {
            return Err(ItoError::MalformedReport(format!(
                "report too short: {} bytes (header is {REPORT_HEADER_SIZE})",
                data.len()
            )));
        }

        let (commitment, rest) = rest.split_at(KEY_SIZE);
        let (start, rest) = rest.split_at(4);
        let (end, rest) = rest.split_at(4);
        let (&memo_len, memo) = rest
            .split_first()
            .ok_or_else(|| ItoError::MalformedReport("missing memo length".into()))?;

        if memo.len() != usize::from(memo_len) {
            return Err(ItoError::MalformedReport(format!(
                "memo length field says {memo_len}, {} bytes present",
                memo.len()
            )));
        }

        let mut seed_commitment = [0u8; KEY_SIZE];
        seed_commitment.copy_from_slice(commitment);
        Report::new(
            seed_commitment,
            u32::from_be_bytes([start[0], start[1], start[2], start[3]]),
            u32::from_be_bytes([end[0], end[1], end[2], end[3]]),
            memo.to_vec(),
        )
    }

    /// Re-derive the disclosed TCNs, in tick order.
    ///
    /// Each call starts a new walk from the commitment; nothing is cached.
    pub fn tcns(&self) -> TcnIter {
        TcnIter {
            chain: ChainKey::from_bytes(self.seed_commitment),
            next_tick: self.start_tick,
            end_tick: self.end_tick,
            done: false,
        }
    }

    /// The TCN at `tick`, or `None` outside `[start_tick, end_tick]`.
    pub fn tcn_at(&self, tick: u32) -> Option<Tcn> {
        if !self.covers(tick) {
            return None;
        }
        self.tcns().nth((tick - self.start_tick) as usize)
    }
}

/// Streaming TCN derivation over a report's range.
pub struct TcnIter {
    chain: ChainKey,
    next_tick: u32,
    end_tick: u32,
    done: bool,
}

impl Iterator for TcnIter {
    type Item = Tcn;

    fn next(&mut self) -> Option<Tcn> {
        if self.done {
            return None;
        }
        let tcn = derive_tcn(&self.chain, self.next_tick);
        if self.next_tick == self.end_tick {
            self.done = true;
        } else {
            self.chain = advance(&self.chain);
            self.next_tick += 1;
        }
        Some(tcn)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let remaining = (self.end_tick - self.next_tick) as usize + 1;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TcnIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::RatchetState;
    use proptest::prelude::*;

    fn sample_report() -> Report {
        Report::new([5u8; KEY_SIZE], 3, 7, b"risk:high".to_vec()).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample_report().encode();
        assert_eq!(bytes.len(), REPORT_HEADER_SIZE + 9);
        assert_eq!(bytes[0], REPORT_VERSION);
        assert_eq!(&bytes[1..33], &[5u8; KEY_SIZE]);
        assert_eq!(&bytes[33..37], &3u32.to_be_bytes());
        assert_eq!(&bytes[37..41], &7u32.to_be_bytes());
        assert_eq!(bytes[41], 9);
        assert_eq!(&bytes[42..], b"risk:high");
    }

    #[test]
    fn test_decode_unknown_version() {
        let mut bytes = sample_report().encode();
        bytes[0] = 0x7f;
        assert!(matches!(
            Report::decode(&bytes),
            Err(ItoError::UnsupportedVersion(0x7f))
        ));
    }

    #[test]
    fn test_decode_truncated_and_padded() {
        let bytes = sample_report().encode();

        assert!(matches!(
            Report::decode(&[]),
            Err(ItoError::MalformedReport(_))
        ));
        assert!(matches!(
            Report::decode(&bytes[..20]),
            Err(ItoError::MalformedReport(_))
        ));
        assert!(matches!(
            Report::decode(&bytes[..bytes.len() - 1]),
            Err(ItoError::MalformedReport(_))
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(
            Report::decode(&padded),
            Err(ItoError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_decode_inverted_range() {
        let mut bytes = sample_report().encode();
        bytes[33..37].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            Report::decode(&bytes),
            Err(ItoError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_memo_too_long() {
        let memo = vec![0u8; MAX_MEMO_LEN + 1];
        assert!(Report::new([0u8; KEY_SIZE], 0, 0, memo).is_err());
    }

    #[test]
    fn test_expand_matches_ticks() {
        let mut state = RatchetState::new(16);
        let generated: Vec<Tcn> = (0..10).map(|_| state.tick().unwrap()).collect();

        let report = state.report_for_range(2, 8, 16, vec![]).unwrap();
        let expanded: Vec<Tcn> = report.tcns().collect();

        assert_eq!(expanded.len() as u64, report.len());
        assert_eq!(expanded, generated[2..=8].to_vec());
    }

    #[test]
    fn test_expand_is_restartable() {
        let report = sample_report();
        let first: Vec<Tcn> = report.tcns().collect();
        let mut partial = report.tcns();
        partial.next();
        let second: Vec<Tcn> = report.tcns().collect();
        assert_eq!(first, second);
        assert_eq!(report.tcns().len(), 5);
    }

    #[test]
    fn test_tcn_at_outside_range() {
        let report = sample_report();
        assert!(report.tcn_at(2).is_none());
        assert!(report.tcn_at(8).is_none());
        assert_eq!(report.tcn_at(3), report.tcns().next());
        assert_eq!(report.tcn_at(7), report.tcns().last());
    }

    #[test]
    fn test_single_tick_report_at_u32_max() {
        let report = Report::new([1u8; KEY_SIZE], u32::MAX, u32::MAX, vec![]).unwrap();
        assert_eq!(report.tcns().count(), 1);
        assert_eq!(report.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            commitment in any::<[u8; KEY_SIZE]>(),
            start in 0u32..1_000,
            span in 0u32..1_000,
            memo in proptest::collection::vec(any::<u8>(), 0..=MAX_MEMO_LEN),
        ) {
            let report = Report::new(commitment, start, start + span, memo).unwrap();
            let decoded = Report::decode(&report.encode()).unwrap();
            prop_assert_eq!(decoded, report);
        }

        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = Report::decode(&data);
        }

        #[test]
        fn prop_rederived_tcn_matches_tick(ticks in 1u32..40, pick in any::<proptest::sample::Index>()) {
            let mut state = RatchetState::new(64);
            let generated: Vec<Tcn> = (0..ticks).map(|_| state.tick().unwrap()).collect();
            let i = pick.index(ticks as usize) as u32;

            let report = state.report_for_range(i, ticks - 1, 64, vec![]).unwrap();
            prop_assert_eq!(report.tcn_at(i), Some(generated[i as usize]));
        }

        #[test]
        fn prop_forward_only_disclosure(ticks in 2u32..40, start in 1u32..39) {
            prop_assume!(start < ticks);
            let mut state = RatchetState::new(64);
            let generated: Vec<Tcn> = (0..ticks).map(|_| state.tick().unwrap()).collect();

            let report = state.report_for_range(start, ticks - 1, 64, vec![]).unwrap();
            let disclosed: std::collections::HashSet<Tcn> = report.tcns().collect();

            for (tick, tcn) in generated.iter().enumerate().take(start as usize) {
                prop_assert!(report.tcn_at(tick as u32).is_none());
                prop_assert!(!disclosed.contains(tcn));
            }
        }
    }
}
