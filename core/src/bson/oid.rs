use super::error::{BsonError, BsonResult};
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

lazy_static! {
    static ref PROCESS_GENERATOR: OidGenerator = OidGenerator::new();
}

/// 12-byte object identifier: big-endian creation seconds, a per-process
/// fuzz value, then a big-endian counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid([u8; 12]);

impl Oid {
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Oid(bytes)
    }

    /// Generates a fresh identifier from the process-wide generator.
    pub fn generate() -> Self {
        PROCESS_GENERATOR.next_oid()
    }

    pub fn from_hex(hex_str: &str) -> BsonResult<Self> {
        if hex_str.len() != 24 {
            return Err(BsonError::InvalidOid(format!(
                "expected 24 hex digits, got {}",
                hex_str.len()
            )));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| BsonError::InvalidOid(format!("{}: {}", hex_str, e)))?;
        Ok(Oid(bytes))
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Creation time in seconds since the epoch.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn fuzz(&self) -> u32 {
        u32::from_le_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }

    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    pub fn generation_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp() as i64, 0).single()
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

impl FromStr for Oid {
    type Err = BsonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Oid::from_hex(s)
    }
}

/// Produces identifiers that share one fuzz value and a strictly
/// increasing counter.
#[derive(Debug)]
pub struct OidGenerator {
    fuzz: u32,
    counter: AtomicU32,
}

impl OidGenerator {
    pub fn new() -> Self {
        Self::with_fuzz(rand::random::<u32>(), 0)
    }

    pub fn with_fuzz(fuzz: u32, counter_start: u32) -> Self {
        Self {
            fuzz,
            counter: AtomicU32::new(counter_start),
        }
    }

    pub fn fuzz(&self) -> u32 {
        self.fuzz
    }

    pub fn next_oid(&self) -> Oid {
        let seconds = Utc::now().timestamp() as u32;
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.fuzz.to_le_bytes());
        bytes[8..12].copy_from_slice(&counter.to_be_bytes());
        Oid(bytes)
    }
}

impl Default for OidGenerator {
    fn default() -> Self {
        Self::new()
    }
}
