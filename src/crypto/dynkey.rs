//! Time-rotating dynamic keys derived from a pre-shared key.
//!
//! Both peers derive the same key from the pre-shared key and the current
//! coarse time bucket. Matching accepts the neighbouring buckets as well,
//! which tolerates one bucket of clock skew in either direction.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Default number of cached buckets.
pub const DEFAULT_CACHE_SIZE: usize = 5;

const MIN_BUCKET_SECS: f64 = 0.001;

/// Shape of the derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlavor {
    /// 64-byte key, used for the challenge-masked authentication key.
    Wide64,
    /// 16-byte key, used for pre-authentication.
    Compact16,
}

impl KeyFlavor {
    pub const fn key_len(self) -> usize {
        match self {
            KeyFlavor::Wide64 => 64,
            KeyFlavor::Compact16 => 16,
        }
    }
}

pub struct DynamicKeyGenerator {
    key: Vec<u8>,
    flavor: KeyFlavor,
    flush_rounds: u32,
    bucket_secs: f64,
    cache_max: usize,
    cache: Mutex<BTreeMap<i64, Vec<u8>>>,
}

impl DynamicKeyGenerator {
    /// Create a [`KeyFlavor::Wide64`] generator. `flush_rounds` below one is
    /// raised to one.
    pub fn new(key: impl AsRef<[u8]>, flush_rounds: u32, bucket_secs: f64) -> Self {
        let bucket_secs = if bucket_secs.is_finite() {
            bucket_secs.max(MIN_BUCKET_SECS)
        } else {
            MIN_BUCKET_SECS
        };

        Self {
            key: key.as_ref().to_vec(),
            flavor: KeyFlavor::Wide64,
            flush_rounds: flush_rounds.max(1),
            bucket_secs,
            cache_max: DEFAULT_CACHE_SIZE,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_flavor(mut self, flavor: KeyFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    pub fn with_cache_size(mut self, cache_max: usize) -> Self {
        self.cache_max = cache_max.max(1);
        self
    }

    pub fn flavor(&self) -> KeyFlavor {
        self.flavor
    }

    pub fn key_len(&self) -> usize {
        self.flavor.key_len()
    }

    pub fn bucket_secs(&self) -> f64 {
        self.bucket_secs
    }

    /// Bucket index for the current wall-clock time.
    pub fn current_bucket(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        (now / self.bucket_secs).floor() as i64
    }

    /// Key for the current bucket shifted by `offset` buckets.
    pub fn generate(&self, offset: i64) -> Vec<u8> {
        self.generate_at(self.current_bucket().saturating_add(offset))
    }

    /// Key for an explicit bucket index.
    pub fn generate_at(&self, bucket: i64) -> Vec<u8> {
        if let Some(key) = self.cached(bucket) {
            return key;
        }

        let key = match self.flavor {
            KeyFlavor::Wide64 => self.derive_wide(bucket),
            KeyFlavor::Compact16 => self.derive_compact(bucket),
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(bucket, key.clone());
        while cache.len() > self.cache_max {
            cache.pop_first();
        }
        key
    }

    /// Whether `candidate` is the key of the current or a neighbouring bucket.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        if candidate.len() != self.key_len() {
            return false;
        }
        let bucket = self.current_bucket();
        (-1..=1).any(|offset| self.generate_at(bucket + offset) == candidate)
    }

    fn cached(&self, bucket: i64) -> Option<Vec<u8>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&bucket).cloned()
    }

    #[cfg(test)]
    fn cached_buckets(&self) -> Vec<i64> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.keys().copied().collect()
    }

    fn derive_wide(&self, bucket: i64) -> Vec<u8> {
        let multiplier = 1.0 / self.bucket_secs;
        let time_unit = digest16(bucket.to_string().as_bytes());
        let key_unit = digest16(&self.key);

        let mut sub: Vec<u8> = [time_unit, key_unit].concat();
        for _ in 0..self.flush_rounds {
            let mut head = digest16(&sub);
            head.reverse();

            let core: Vec<u8> = head[..3]
                .iter()
                .map(|&num| ((num as f64 + multiplier) % 255.0 + 1.0) as u8)
                .collect();
            let conv: Vec<u8> = (0..head.len() - 5)
                .map(|i| {
                    let sum: u32 = (0..3).map(|c| head[3 + i + c] as u32 * core[c] as u32).sum();
                    (sum % 256) as u8
                })
                .collect();

            let mut mixed = digest16(&[&head[..3], &core[..]].concat());
            mixed.reverse();
            let mut next = mixed.to_vec();
            next.extend_from_slice(&digest16(&[&mixed[..], &conv[..]].concat()));
            next.extend_from_slice(&digest16(&conv));
            next.extend_from_slice(&digest16(&[&conv[..], &self.key[..]].concat()));
            next.extend_from_slice(&key_unit);
            sub = next;
        }

        let mut key = sub;
        for round in 0..4 {
            let pivot = multiplier
                + ((key_unit[round] as u32
                    + key_unit[round + 4] as u32
                    + key_unit[round + 8] as u32
                    + key_unit[round + 12] as u32)
                    / 4) as f64;
            let core = [
                time_unit[4 * round] as f64,
                time_unit[4 * round + 1] as f64,
                pivot,
                time_unit[4 * round + 2] as f64,
                time_unit[4 * round + 3] as f64,
            ];
            key = (0..key.len() - 4)
                .map(|i| {
                    let sum: f64 = (0..5).map(|c| key[i + c] as f64 * core[c]).sum();
                    (sum % 256.0) as u8
                })
                .collect();
        }
        key
    }

    fn derive_compact(&self, bucket: i64) -> Vec<u8> {
        let key_unit = digest16(&self.key);
        let divisor = (self.bucket_secs as u64 % 4 + 1) as u32;

        let stamp = digest16(&(bucket as u32).to_be_bytes());
        let mut sub = digest16(&[&stamp[..], &key_unit[..]].concat());
        for _ in 0..self.flush_rounds {
            sub = digest16(&sub);
            sub.reverse();

            let core: Vec<u8> = sub[..3]
                .iter()
                .map(|&num| {
                    let num = num as u32;
                    ((num + (num % 32) / divisor) % 255 + 1) as u8
                })
                .collect();
            for i in 0..sub.len() - 5 {
                let sum: u32 = (0..3).map(|c| sub[3 + i + c] as u32 * core[c] as u32).sum();
                sub[3 + i] = (sum % 256) as u8;
            }
            sub = digest16(&[&sub[..], &core[..], &key_unit[..]].concat());
        }
        sub.to_vec()
    }
}

impl std::fmt::Debug for DynamicKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicKeyGenerator")
            .field("flavor", &self.flavor)
            .field("flush_rounds", &self.flush_rounds)
            .field("bucket_secs", &self.bucket_secs)
            .finish_non_exhaustive()
    }
}

/// SHA-256 truncated to a 16-byte unit.
pub(crate) fn digest16(data: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}
