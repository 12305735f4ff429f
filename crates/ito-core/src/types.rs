use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of a temporary contact number in bytes.
pub const TCN_LENGTH: usize = 16;

/// A temporary contact number: the unlinkable identifier broadcast over BLE.
///
/// Serialized as lowercase hex so persisted sessions stay human-readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tcn([u8; TCN_LENGTH]);

impl Tcn {
    pub fn from_bytes(bytes: [u8; TCN_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Build a TCN from the first `TCN_LENGTH` bytes of `bytes`, if long enough.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..TCN_LENGTH)?;
        let mut out = [0u8; TCN_LENGTH];
        out.copy_from_slice(head);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; TCN_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Tcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Tcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tcn({})", self.to_hex())
    }
}

impl FromStr for Tcn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TCN_LENGTH * 2 {
            return Err(format!(
                "TCN hex must be {} chars, got {}",
                TCN_LENGTH * 2,
                s.len()
            ));
        }
        let mut out = [0u8; TCN_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| format!("non-ascii TCN hex: {s}"))?;
            *byte = u8::from_str_radix(pair, 16).map_err(|e| format!("bad TCN hex {pair}: {e}"))?;
        }
        Ok(Self(out))
    }
}

impl Serialize for Tcn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Tcn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single scan result handed over by the platform scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedBeacon {
    pub tcn: Tcn,
    /// Received signal strength in dBm
    pub rssi: i8,
    /// Calibrated transmit power at 1m, when the peer appended it to the payload
    pub tx_power: Option<i8>,
    /// Unix timestamp in milliseconds
    pub observed_at: u64,
}

impl ObservedBeacon {
    pub fn new(tcn: Tcn, rssi: i8, observed_at: u64) -> Self {
        Self {
            tcn,
            rssi,
            tx_power: None,
            observed_at,
        }
    }

    /// Parse a raw advertisement payload: `[tcn: 16 bytes][tx_power: 1 byte, optional]`.
    ///
    /// Returns `None` for any other payload length.
    pub fn from_payload(payload: &[u8], rssi: i8, observed_at: u64) -> Option<Self> {
        let tx_power = match payload.len() {
            TCN_LENGTH => None,
            len if len == TCN_LENGTH + 1 => Some(i8::from_be_bytes([payload[TCN_LENGTH]])),
            _ => return None,
        };
        Some(Self {
            tcn: Tcn::from_slice(payload)?,
            rssi,
            tx_power,
            observed_at,
        })
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
