//! # RNG streams
//!
//! Deterministic randomness with one generator per named stream, derived
//! from the master seed so that streams never perturb each other: a
//! worldgen draw MUST NOT change the next simulation draw.
//!
//! ## MT19937
//! A vendored 32-bit Mersenne Twister. The full state (624-word key vector
//! plus cursor) serializes into every save and restores bit-exactly; the
//! generator's sequence is part of the determinism contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use hx_api::{EngineError, SimResult};
use hx_types::MasterSeed;

/// Stream advanced only by simulation logic.
pub const RNG_SIM_STREAM: &str = "rng_sim";
/// Stream advanced only by world generation.
pub const RNG_WORLDGEN_STREAM: &str = "rng_worldgen";

const N: usize = 624;
const M: usize = 397;
const MATRIX_A: u32 = 0x9908_b0df;
const UPPER_MASK: u32 = 0x8000_0000;
const LOWER_MASK: u32 = 0x7fff_ffff;

/// Derive a deterministic child stream seed from `(master_seed, stream_name)`:
/// the first 8 bytes of `SHA-256("<master_seed>:<stream_name>")`, big-endian.
pub fn derive_stream_seed(master_seed: MasterSeed, stream_name: &str) -> u64 {
    let digest = Sha256::digest(format!("{}:{}", master_seed.as_u64(), stream_name).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// 32-bit Mersenne Twister with fully serializable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mt19937 {
    key: Vec<u32>,
    pos: usize,
}

impl Mt19937 {
    /// Seed via `init_by_array` from the 64-bit derived seed split into two
    /// 32-bit words (low word first).
    pub fn from_seed_u64(seed: u64) -> Self {
        let mut rng = Mt19937 {
            key: vec![0; N],
            pos: N,
        };
        rng.init_by_array(&[seed as u32, (seed >> 32) as u32]);
        rng
    }

    fn init_genrand(&mut self, seed: u32) {
        self.key[0] = seed;
        for index in 1..N {
            self.key[index] = 1_812_433_253u32
                .wrapping_mul(self.key[index - 1] ^ (self.key[index - 1] >> 30))
                .wrapping_add(index as u32);
        }
        self.pos = N;
    }

    fn init_by_array(&mut self, init_key: &[u32]) {
        self.init_genrand(19_650_218);
        let mut i = 1usize;
        let mut j = 0usize;
        let mut k = N.max(init_key.len());
        while k > 0 {
            self.key[i] = (self.key[i]
                ^ (self.key[i - 1] ^ (self.key[i - 1] >> 30)).wrapping_mul(1_664_525))
            .wrapping_add(init_key[j])
            .wrapping_add(j as u32);
            i += 1;
            j += 1;
            if i >= N {
                self.key[0] = self.key[N - 1];
                i = 1;
            }
            if j >= init_key.len() {
                j = 0;
            }
            k -= 1;
        }
        k = N - 1;
        while k > 0 {
            self.key[i] = (self.key[i]
                ^ (self.key[i - 1] ^ (self.key[i - 1] >> 30)).wrapping_mul(1_566_083_941))
            .wrapping_sub(i as u32);
            i += 1;
            if i >= N {
                self.key[0] = self.key[N - 1];
                i = 1;
            }
            k -= 1;
        }
        self.key[0] = 0x8000_0000;
    }

    fn refill(&mut self) {
        for index in 0..N {
            let y =
                (self.key[index] & UPPER_MASK) | (self.key[(index + 1) % N] & LOWER_MASK);
            let mut next = self.key[(index + M) % N] ^ (y >> 1);
            if y & 1 != 0 {
                next ^= MATRIX_A;
            }
            self.key[index] = next;
        }
        self.pos = 0;
    }

    pub fn next_u32(&mut self) -> u32 {
        if self.pos >= N {
            self.refill();
        }
        let mut y = self.key[self.pos];
        self.pos += 1;

        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        y
    }

    pub fn next_u64(&mut self) -> u64 {
        let hi = self.next_u32() as u64;
        let lo = self.next_u32() as u64;
        (hi << 32) | lo
    }

    /// Uniform draw in `[0, upper)` via rejection sampling (unbiased).
    /// `upper` must be positive.
    pub fn randrange(&mut self, upper: u64) -> u64 {
        debug_assert!(upper > 0, "randrange upper bound must be positive");
        if upper <= 1 {
            return 0;
        }
        // 2^64 mod upper: draws below this threshold would bias the tail.
        let threshold = (u64::MAX - upper + 1) % upper;
        loop {
            let draw = self.next_u64();
            if draw >= threshold {
                return draw % upper;
            }
        }
    }

    /// Validate a deserialized state vector.
    pub fn validate(&self) -> SimResult<()> {
        if self.key.len() != N {
            return Err(EngineError::InvalidPayload(format!(
                "mt19937 state must contain {N} words, found {}",
                self.key.len()
            )));
        }
        if self.pos > N {
            return Err(EngineError::InvalidPayload(format!(
                "mt19937 cursor out of range: {}",
                self.pos
            )));
        }
        Ok(())
    }
}

/// Lazily-derived named generator streams, all serialized in the save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngStreams {
    master_seed: MasterSeed,
    streams: BTreeMap<String, Mt19937>,
}

impl RngStreams {
    /// The two mandatory streams exist from the start; others derive on
    /// first use.
    pub fn new(master_seed: MasterSeed) -> Self {
        let mut streams = RngStreams {
            master_seed,
            streams: BTreeMap::new(),
        };
        streams.stream(RNG_SIM_STREAM);
        streams.stream(RNG_WORLDGEN_STREAM);
        streams
    }

    pub fn master_seed(&self) -> MasterSeed {
        self.master_seed
    }

    /// Named stream, created from its derived seed on first access.
    pub fn stream(&mut self, name: &str) -> &mut Mt19937 {
        let master_seed = self.master_seed;
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Mt19937::from_seed_u64(derive_stream_seed(master_seed, name)))
    }

    pub fn to_payload(&self) -> Value {
        let mut streams = serde_json::Map::new();
        for (name, rng) in &self.streams {
            streams.insert(
                name.clone(),
                serde_json::to_value(rng).expect("rng state serialization is infallible"),
            );
        }
        serde_json::json!({
            "master_seed": self.master_seed.as_u64(),
            "streams": streams,
        })
    }

    pub fn from_payload(payload: &Value) -> SimResult<Self> {
        let root = payload
            .as_object()
            .ok_or_else(|| EngineError::InvalidPayload("rng_state must be an object".into()))?;
        let master_seed = root
            .get("master_seed")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                EngineError::InvalidPayload("rng_state.master_seed must be an integer".into())
            })?;
        let raw_streams = root.get("streams").and_then(Value::as_object).ok_or_else(|| {
            EngineError::InvalidPayload("rng_state.streams must be an object".into())
        })?;

        let mut streams = BTreeMap::new();
        for (name, raw) in raw_streams {
            let rng: Mt19937 = serde_json::from_value(raw.clone()).map_err(|err| {
                EngineError::InvalidPayload(format!("rng_state.streams.{name}: {err}"))
            })?;
            rng.validate()?;
            streams.insert(name.clone(), rng);
        }

        Ok(RngStreams {
            master_seed: MasterSeed(master_seed),
            streams,
        })
    }
}
