//! Forward-secure TCN ratchet
//!
//! A `RatchetState` owns one hash chain and produces at most `max_ticks` TCNs.
//! Once exhausted it is discarded and a fresh state (with a fresh random seed)
//! takes over, so compromising one state only exposes the TCNs of its own
//! interval.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ito_core::{now_ms, ItoError, ItoResult, Tcn};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{advance, advance_by, derive_tcn, generate_seed, ChainKey};
use crate::report::Report;
use crate::KEY_SIZE;

/// Secret ratchet state. Exclusively owned by the device that created it and
/// never transmitted; only [`Report`]s derived from it leave the device.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RatchetRecord", into = "RatchetRecord")]
pub struct RatchetState {
    id: String,
    seed: ChainKey,
    /// Chain value at `tick_index`, kept so a tick costs one step
    current: ChainKey,
    tick_index: u32,
    max_ticks: u32,
    /// Unix milliseconds
    created_at: u64,
    /// When each generated tick started being advertised, Unix milliseconds.
    /// One entry per tick, so `tick_times.len() == tick_index`.
    tick_times: Vec<u64>,
    /// Disclosed; must never produce another TCN
    retired: bool,
}

impl RatchetState {
    /// Fresh ratchet with a random seed and `tick_index = 0`.
    pub fn new(max_ticks: u32) -> Self {
        Self::from_seed(generate_seed(), max_ticks, now_ms())
    }

    pub fn from_seed(seed: ChainKey, max_ticks: u32, created_at: u64) -> Self {
        let id = format!("{created_at:020}-{}", uuid::Uuid::new_v4().simple());
        Self {
            id,
            current: seed.clone(),
            seed,
            tick_index: 0,
            max_ticks,
            created_at,
            tick_times: Vec::new(),
            retired: false,
        }
    }

    /// Stable identity, ordered by creation time.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of TCNs generated so far (index of the next tick).
    pub fn tick_index(&self) -> u32 {
        self.tick_index
    }

    pub fn max_ticks(&self) -> u32 {
        self.max_ticks
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Advertising start of every generated tick, indexed by tick.
    pub fn tick_times(&self) -> &[u64] {
        &self.tick_times
    }

    /// True once every tick is used up or the ratchet was retired.
    pub fn is_exhausted(&self) -> bool {
        self.retired || self.tick_index >= self.max_ticks
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Stop this chain for good. Reports over already generated ticks can
    /// still be built; `tick` fails from now on.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Produce the next TCN and advance the chain.
    ///
    /// Fails with `RatchetExhausted` once `max_ticks` TCNs have been generated;
    /// the state is left untouched in that case.
    pub fn tick(&mut self) -> ItoResult<Tcn> {
        self.tick_at(now_ms())
    }

    /// [`tick`](Self::tick) with the advertising start given explicitly.
    pub fn tick_at(&mut self, advertised_at: u64) -> ItoResult<Tcn> {
        if self.is_exhausted() {
            return Err(ItoError::RatchetExhausted {
                max_ticks: self.max_ticks,
            });
        }
        let tcn = derive_tcn(&self.current, self.tick_index);
        self.current = advance(&self.current);
        self.tick_index += 1;
        self.tick_times.push(advertised_at);
        Ok(tcn)
    }

    /// Build a report disclosing ticks `[start_tick, end_tick]`.
    ///
    /// The commitment is the chain value at `start_tick`: enough to re-derive
    /// every TCN from `start_tick` on, useless for anything earlier.
    pub fn report_for_range(
        &self,
        start_tick: u32,
        end_tick: u32,
        max_span: u32,
        memo: Vec<u8>,
    ) -> ItoResult<Report> {
        let invalid = |reason: String| ItoError::InvalidRange {
            start: start_tick,
            end: end_tick,
            reason,
        };

        if start_tick > end_tick {
            return Err(invalid("start is after end".into()));
        }
        if end_tick >= self.tick_index {
            return Err(invalid(format!(
                "tick {end_tick} not generated yet (next tick is {})",
                self.tick_index
            )));
        }
        let span = end_tick - start_tick + 1;
        if span > max_span {
            return Err(invalid(format!(
                "span of {span} ticks exceeds retention limit of {max_span}"
            )));
        }

        let commitment = advance_by(&self.seed, start_tick);
        Report::new(*commitment.as_bytes(), start_tick, end_tick, memo)
    }

    /// Report over every tick generated so far, or `None` before the first tick.
    pub fn report_all(&self, max_span: u32, memo: Vec<u8>) -> ItoResult<Option<Report>> {
        if self.tick_index == 0 {
            return Ok(None);
        }
        let end = self.tick_index - 1;
        let start = end.saturating_sub(max_span.saturating_sub(1));
        self.report_for_range(start, end, max_span, memo).map(Some)
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("id", &self.id)
            .field("tick_index", &self.tick_index)
            .field("max_ticks", &self.max_ticks)
            .field("created_at", &self.created_at)
            .field("retired", &self.retired)
            .field("seed", &"[REDACTED]")
            .finish()
    }
}

/// Persisted form of a [`RatchetState`]. The current chain value is not
/// stored; it is recomputed from the seed on load.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct RatchetRecord {
    id: String,
    /// Base64 seed
    seed: String,
    tick_index: u32,
    max_ticks: u32,
    created_at: u64,
    #[serde(default)]
    #[zeroize(skip)]
    tick_times: Vec<u64>,
    #[serde(default)]
    #[zeroize(skip)]
    retired: bool,
}

impl From<RatchetState> for RatchetRecord {
    fn from(state: RatchetState) -> Self {
        Self {
            id: state.id.clone(),
            seed: STANDARD.encode(state.seed.as_bytes()),
            tick_index: state.tick_index,
            max_ticks: state.max_ticks,
            created_at: state.created_at,
            tick_times: state.tick_times.clone(),
            retired: state.retired,
        }
    }
}

impl TryFrom<RatchetRecord> for RatchetState {
    type Error = String;

    fn try_from(record: RatchetRecord) -> Result<Self, Self::Error> {
        let mut raw = STANDARD
            .decode(&record.seed)
            .map_err(|e| format!("ratchet {}: bad seed encoding: {e}", record.id))?;
        if raw.len() != KEY_SIZE {
            raw.zeroize();
            return Err(format!(
                "ratchet {}: seed is {} bytes, expected {KEY_SIZE}",
                record.id,
                raw.len()
            ));
        }
        if record.tick_index > record.max_ticks {
            raw.zeroize();
            return Err(format!(
                "ratchet {}: tick_index {} beyond max_ticks {}",
                record.id, record.tick_index, record.max_ticks
            ));
        }

        if record.tick_times.len() != record.tick_index as usize {
            raw.zeroize();
            return Err(format!(
                "ratchet {}: {} tick times for {} ticks",
                record.id,
                record.tick_times.len(),
                record.tick_index
            ));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        let seed = ChainKey::from_bytes(bytes);
        bytes.zeroize();

        Ok(Self {
            id: record.id.clone(),
            current: advance_by(&seed, record.tick_index),
            seed,
            tick_index: record.tick_index,
            max_ticks: record.max_ticks,
            created_at: record.created_at,
            tick_times: record.tick_times.clone(),
            retired: record.retired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_ratchet(max_ticks: u32) -> RatchetState {
        RatchetState::from_seed(ChainKey::from_bytes([9u8; KEY_SIZE]), max_ticks, 1_000)
    }

    #[test]
    fn test_new_starts_at_zero() {
        let state = RatchetState::new(96);
        assert_eq!(state.tick_index(), 0);
        assert!(!state.is_exhausted());
    }

    #[test]
    fn test_tick_increments_and_differs() {
        let mut state = fixed_ratchet(4);
        let t0 = state.tick().unwrap();
        let t1 = state.tick().unwrap();
        assert_eq!(state.tick_index(), 2);
        assert_ne!(t0, t1, "consecutive TCNs must differ");
    }

    #[test]
    fn test_exhaustion_after_max_ticks() {
        let mut state = fixed_ratchet(3);
        for _ in 0..3 {
            state.tick().unwrap();
        }
        assert!(state.is_exhausted());
        match state.tick() {
            Err(ItoError::RatchetExhausted { max_ticks }) => assert_eq!(max_ticks, 3),
            other => panic!("expected RatchetExhausted, got {other:?}"),
        }
        assert_eq!(state.tick_index(), 3, "failed tick must not advance");
    }

    #[test]
    fn test_ticks_within_interval_are_distinct() {
        let mut state = RatchetState::new(96);
        let mut seen = std::collections::HashSet::new();
        while let Ok(tcn) = state.tick() {
            assert!(seen.insert(tcn), "duplicate TCN within one ratchet");
        }
        assert_eq!(seen.len(), 96);
    }

    #[test]
    fn test_report_rejects_bad_ranges() {
        let mut state = fixed_ratchet(10);
        for _ in 0..5 {
            state.tick().unwrap();
        }

        assert!(matches!(
            state.report_for_range(3, 2, 10, vec![]),
            Err(ItoError::InvalidRange { .. })
        ));
        assert!(matches!(
            state.report_for_range(0, 5, 10, vec![]),
            Err(ItoError::InvalidRange { .. })
        ));
        assert!(matches!(
            state.report_for_range(0, 4, 3, vec![]),
            Err(ItoError::InvalidRange { .. })
        ));
        assert!(state.report_for_range(2, 4, 3, vec![]).is_ok());
    }

    #[test]
    fn test_report_all() {
        let mut state = fixed_ratchet(10);
        assert!(state.report_all(10, vec![]).unwrap().is_none());

        for _ in 0..4 {
            state.tick().unwrap();
        }
        let report = state.report_all(10, vec![]).unwrap().unwrap();
        assert_eq!((report.start_tick, report.end_tick), (0, 3));

        // Clipped to the most recent `max_span` ticks
        let report = state.report_all(2, vec![]).unwrap().unwrap();
        assert_eq!((report.start_tick, report.end_tick), (2, 3));
    }

    #[test]
    fn test_serde_roundtrip_resumes_chain() {
        let mut state = fixed_ratchet(10);
        state.tick().unwrap();
        state.tick().unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let mut restored: RatchetState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id(), state.id());
        assert_eq!(restored.tick_index(), 2);

        // Both continue with the identical next TCN
        assert_eq!(restored.tick().unwrap(), state.tick().unwrap());
    }

    #[test]
    fn test_deserialize_rejects_corrupt_record() {
        let json = r#"{"id":"x","seed":"AAAA","tick_index":0,"max_ticks":4,"created_at":0}"#;
        assert!(serde_json::from_str::<RatchetState>(json).is_err());

        let seed = STANDARD.encode([0u8; KEY_SIZE]);
        let json = format!(
            r#"{{"id":"x","seed":"{seed}","tick_index":5,"max_ticks":4,"created_at":0}}"#
        );
        assert!(serde_json::from_str::<RatchetState>(&json).is_err());
    }

    #[test]
    fn test_retired_ratchet_stops_but_still_reports() {
        let mut state = fixed_ratchet(10);
        state.tick().unwrap();
        state.tick().unwrap();
        state.retire();

        assert!(state.is_exhausted());
        assert!(matches!(
            state.tick(),
            Err(ItoError::RatchetExhausted { .. })
        ));
        assert!(state.report_for_range(0, 1, 10, vec![]).is_ok());

        let json = serde_json::to_string(&state).unwrap();
        let restored: RatchetState = serde_json::from_str(&json).unwrap();
        assert!(restored.is_retired());
    }

    #[test]
    fn test_tick_times_survive_resume() {
        let mut state = fixed_ratchet(10);
        state.tick_at(1_000).unwrap();
        state.tick_at(61_000).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let mut restored: RatchetState = serde_json::from_str(&json).unwrap();
        // Resumed a day later
        restored.tick_at(86_461_000).unwrap();
        assert_eq!(restored.tick_times(), &[1_000, 61_000, 86_461_000]);

        // A failed tick records nothing
        restored.retire();
        assert!(restored.tick_at(90_000_000).is_err());
        assert_eq!(restored.tick_times().len(), 3);
    }

    #[test]
    fn test_deserialize_rejects_missing_tick_times() {
        let seed = STANDARD.encode([0u8; KEY_SIZE]);
        let json = format!(
            r#"{{"id":"x","seed":"{seed}","tick_index":2,"max_ticks":4,"created_at":0,"tick_times":[5]}}"#
        );
        assert!(serde_json::from_str::<RatchetState>(&json).is_err());
    }

    #[test]
    fn test_debug_hides_seed() {
        let state = fixed_ratchet(4);
        let rendered = format!("{state:?}");
        assert!(rendered.contains("REDACTED"));
    }
}
