//! Simulated Object Store with Fault Injection
//!
//! Wraps any `ObjectStore` and injects failures from a seeded RNG, so a
//! failing run can be replayed from its seed.
//!
//! Fault kinds:
//! - put failure: rejected before anything is stored
//! - timeout: rejected before anything is stored, after the latency
//! - lost ack: the object is stored but the caller sees an error, so the
//!   uploader retries a put that already succeeded

use crate::spool::object_store::{read_body, ObjectMetadata, ObjectStore, ObjectStoreError};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedStoreConfig {
    /// Probability of a PUT failing before storing
    pub put_fail_prob: f64,
    /// Probability of a PUT timing out before storing
    pub timeout_prob: f64,
    /// Probability of a stored PUT reporting failure
    pub lost_ack_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.05,          // 5%
            timeout_prob: 0.01,           // 1%
            lost_ack_prob: 0.01,          // 1%
            latency_range_us: (0, 1_000), // up to 1ms
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.3,
            timeout_prob: 0.05,
            lost_ack_prob: 0.05,
            latency_range_us: (100, 2_000),
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            put_fail_prob: 0.0,
            timeout_prob: 0.0,
            lost_ack_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub put_attempts: u64,
    pub put_successes: u64,
    pub put_failures: u64,
    pub timeouts: u64,
    pub lost_acks: u64,
    pub forced_failures: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
    /// Next N puts fail regardless of probabilities
    fail_next: u64,
}

enum Fault {
    Forced,
    PutFail,
    Timeout,
    LostAck,
}

/// Simulated object store that wraps another store and injects faults
pub struct SimulatedObjectStore<S: ObjectStore> {
    inner_store: S,
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl<S: ObjectStore> std::fmt::Debug for SimulatedObjectStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedObjectStore")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: ObjectStore> SimulatedObjectStore<S> {
    pub fn new(inner_store: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedObjectStore {
            inner_store,
            config,
            state: Arc::new(Mutex::new(SimulatedStoreInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedStoreStats::default(),
                fail_next: 0,
            })),
        }
    }

    pub fn stats(&self) -> SimulatedStoreStats {
        self.state.lock().stats.clone()
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = SimulatedStoreStats::default();
    }

    /// Force the next `n` puts to fail
    pub fn fail_next(&self, n: u64) {
        self.state.lock().fail_next = n;
    }

    pub fn inner(&self) -> &S {
        &self.inner_store
    }

    /// Roll the dice for one put. Returns the fault (if any) and latency.
    fn roll(&self) -> (Option<Fault>, Duration) {
        let mut state = self.state.lock();
        state.stats.put_attempts += 1;

        let (min, max) = self.config.latency_range_us;
        let latency_us = if max > min {
            state.rng.gen_range(min..max)
        } else {
            min
        };

        let fault = if state.fail_next > 0 {
            state.fail_next -= 1;
            state.stats.forced_failures += 1;
            Some(Fault::Forced)
        } else if state.rng.gen_bool(self.config.put_fail_prob) {
            state.stats.put_failures += 1;
            Some(Fault::PutFail)
        } else if state.rng.gen_bool(self.config.timeout_prob) {
            state.stats.timeouts += 1;
            Some(Fault::Timeout)
        } else if state.rng.gen_bool(self.config.lost_ack_prob) {
            state.stats.lost_acks += 1;
            Some(Fault::LostAck)
        } else {
            None
        };

        (fault, Duration::from_micros(latency_us))
    }
}

impl<S: ObjectStore> ObjectStore for SimulatedObjectStore<S> {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let (fault, latency) = self.roll();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        match fault {
            Some(Fault::Forced) => Err(ObjectStoreError::Unavailable(
                "simulated forced failure".to_string(),
            )),
            Some(Fault::PutFail) => Err(ObjectStoreError::Unavailable(
                "simulated put failure".to_string(),
            )),
            Some(Fault::Timeout) => Err(ObjectStoreError::Unavailable(
                "simulated timeout".to_string(),
            )),
            Some(Fault::LostAck) => {
                let data = read_body(body, metadata)?;
                self.inner_store
                    .put_object(bucket, key, &mut &data[..], metadata)?;
                Err(ObjectStoreError::Unavailable(
                    "simulated lost acknowledgement".to_string(),
                ))
            }
            None => {
                self.inner_store.put_object(bucket, key, body, metadata)?;
                self.state.lock().stats.put_successes += 1;
                Ok(())
            }
        }
    }

    fn shutdown(&self) {
        self.inner_store.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::object_store::InMemoryObjectStore;

    fn meta(len: usize) -> ObjectMetadata {
        ObjectMetadata {
            content_length: len as u64,
            server_side_encryption: None,
        }
    }

    #[test]
    fn test_no_faults_passes_through() {
        let inner = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(inner.clone(), 1, SimulatedStoreConfig::no_faults());

        for i in 0..50 {
            store
                .put_object("b", &format!("k{}", i), &mut &b"data"[..], &meta(4))
                .unwrap();
        }
        assert_eq!(inner.len(), 50);
        let stats = store.stats();
        assert_eq!(stats.put_attempts, 50);
        assert_eq!(stats.put_successes, 50);
    }

    #[test]
    fn test_fail_next_forces_failures_before_storing() {
        let inner = InMemoryObjectStore::new();
        let store = SimulatedObjectStore::new(inner.clone(), 1, SimulatedStoreConfig::no_faults());
        store.fail_next(2);

        assert!(store.put_object("b", "k", &mut &b"x"[..], &meta(1)).is_err());
        assert!(store.put_object("b", "k", &mut &b"x"[..], &meta(1)).is_err());
        assert!(inner.is_empty());
        store.put_object("b", "k", &mut &b"x"[..], &meta(1)).unwrap();
        assert_eq!(store.stats().forced_failures, 2);
    }

    #[test]
    fn test_same_seed_same_faults() {
        let config = SimulatedStoreConfig {
            latency_range_us: (0, 0),
            ..SimulatedStoreConfig::high_chaos()
        };
        let outcomes = |seed| {
            let store = SimulatedObjectStore::new(InMemoryObjectStore::new(), seed, config.clone());
            (0..100)
                .map(|_| store.put_object("b", "k", &mut &b"x"[..], &meta(1)).is_ok())
                .collect::<Vec<_>>()
        };

        assert_eq!(outcomes(42), outcomes(42));
        assert!(outcomes(42).iter().any(|ok| !ok));
    }

    #[test]
    fn test_lost_ack_stores_object() {
        let inner = InMemoryObjectStore::new();
        let config = SimulatedStoreConfig {
            lost_ack_prob: 1.0,
            ..SimulatedStoreConfig::no_faults()
        };
        let store = SimulatedObjectStore::new(inner.clone(), 7, config);

        assert!(store.put_object("b", "k", &mut &b"abc"[..], &meta(3)).is_err());
        assert_eq!(&inner.get("b", "k").unwrap().data[..], b"abc");
        assert_eq!(store.stats().lost_acks, 1);
    }
}
