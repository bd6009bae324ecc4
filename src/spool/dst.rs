//! Simulation Testing for the Spool
//!
//! Runs concurrent writers against a spool whose object store injects
//! faults, restarts it with recovery, then checks what reached the store
//! against a shadow record of everything delivered.
//!
//! ## Design
//!
//! ```text
//! for seed in seeds {
//!     phase 1: N writer threads deliver seeded batches, rotating and
//!              sweeping along the way; uploads may give up under faults
//!     phase 2: restart on the same staging dir with recovery, no faults
//!     check:   every record in the store exactly once, whole lines only,
//!              per-writer order kept inside each object, staging dir empty
//! }
//! ```
//!
//! Thread interleaving is not controlled, but the workload and the store
//! faults are derived from the seed.

use crate::spool::clock::SimulatedClock;
use crate::spool::config::{Encoding, OutputConfig, RotationStrategy};
use crate::spool::event::Event;
use crate::spool::object_store::InMemoryObjectStore;
use crate::spool::output::SpoolOutput;
use crate::spool::simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SpoolDSTConfig {
    pub writers: usize,
    pub batches_per_writer: usize,
    pub max_batch_size: usize,
    /// Number of distinct routing keys
    pub keys: usize,
    pub size_rotate: u64,
    pub encoding: Encoding,
    pub store_config: SimulatedStoreConfig,
    /// Bounded retries in phase 1 leave files behind for recovery
    pub max_upload_attempts: Option<u32>,
    /// Probability that a writer advances time and runs the timers after a batch
    pub tick_probability: f64,
}

impl Default for SpoolDSTConfig {
    fn default() -> Self {
        SpoolDSTConfig {
            writers: 4,
            batches_per_writer: 50,
            max_batch_size: 8,
            keys: 3,
            size_rotate: 512,
            encoding: Encoding::None,
            store_config: SimulatedStoreConfig::no_faults(),
            max_upload_attempts: None,
            tick_probability: 0.1,
        }
    }
}

impl SpoolDSTConfig {
    /// Minimal fault injection
    pub fn calm() -> Self {
        Self::default()
    }

    /// Transient store failures, retried until they succeed
    pub fn moderate() -> Self {
        SpoolDSTConfig {
            store_config: SimulatedStoreConfig {
                latency_range_us: (0, 200),
                ..SimulatedStoreConfig::default()
            },
            ..Self::default()
        }
    }

    /// Frequent failures and bounded retries, so recovery has work to do
    pub fn chaos() -> Self {
        SpoolDSTConfig {
            store_config: SimulatedStoreConfig {
                latency_range_us: (0, 200),
                ..SimulatedStoreConfig::high_chaos()
            },
            max_upload_attempts: Some(2),
            ..Self::default()
        }
    }
}

/// Result of one seed
#[derive(Debug, Clone, Default)]
pub struct SpoolDSTResult {
    pub seed: u64,
    pub records_delivered: u64,
    pub objects_stored: u64,
    pub records_found: u64,
    pub uploads_given_up: u64,
    pub files_recovered: u64,
    pub leftover_entries: u64,
    pub store_stats: SimulatedStoreStats,
    pub violations: Vec<String>,
}

impl SpoolDSTResult {
    pub fn new(seed: u64) -> Self {
        SpoolDSTResult {
            seed,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} records delivered, {} found in {} objects, {} gave up, {} recovered, {} put failures, {} violations",
            self.seed,
            self.records_delivered,
            self.records_found,
            self.objects_stored,
            self.uploads_given_up,
            self.files_recovered,
            self.store_stats.put_failures + self.store_stats.timeouts + self.store_stats.lost_acks,
            self.violations.len()
        )
    }
}

pub struct SpoolDSTHarness {
    seed: u64,
    config: SpoolDSTConfig,
    staging: StagingDir,
    store: InMemoryObjectStore,
    clock: SimulatedClock,
    result: SpoolDSTResult,
}

impl SpoolDSTHarness {
    pub fn new(seed: u64, config: SpoolDSTConfig) -> std::io::Result<Self> {
        Ok(SpoolDSTHarness {
            seed,
            config,
            staging: StagingDir::new(seed)?,
            store: InMemoryObjectStore::new(),
            clock: SimulatedClock::default(),
            result: SpoolDSTResult::new(seed),
        })
    }

    fn output_config(&self, recover: bool, max_upload_attempts: Option<u32>) -> OutputConfig {
        OutputConfig {
            prefix: "dst/%{type}".to_string(),
            rotation_strategy: RotationStrategy::SizeAndTime,
            size_rotate: self.config.size_rotate,
            time_rotate: Duration::from_secs(60),
            encoding: self.config.encoding,
            recover,
            upload_workers_count: 2,
            upload_queue_size: 2,
            retry_delay: Duration::from_millis(1),
            max_upload_attempts,
            rotate_check_interval: Duration::from_secs(3600),
            stale_sweep_interval: Duration::from_secs(3600),
            stale_file_age: Duration::from_secs(120),
            ..OutputConfig::test(self.staging.path().to_path_buf())
        }
    }

    pub fn run(mut self) -> SpoolDSTResult {
        if let Err(e) = self.run_phases() {
            self.result.violations.push(e);
        }
        self.result
    }

    fn run_phases(&mut self) -> Result<(), String> {
        // Phase 1: concurrent writers against a faulty store
        let faulty = Arc::new(SimulatedObjectStore::new(
            self.store.clone(),
            self.seed,
            self.config.store_config.clone(),
        ));
        let output = Arc::new(
            SpoolOutput::start_with(
                self.output_config(false, self.config.max_upload_attempts),
                faulty.clone(),
                Arc::new(self.clock.clone()),
            )
            .map_err(|e| format!("phase 1 start failed: {}", e))?,
        );

        let handles: Vec<_> = (0..self.config.writers)
            .map(|writer| {
                let output = output.clone();
                let clock = self.clock.clone();
                let config = self.config.clone();
                let seed = self.seed;
                std::thread::spawn(move || run_writer(writer, seed, &config, &output, &clock))
            })
            .collect();

        for handle in handles {
            let delivered = handle
                .join()
                .map_err(|_| "writer thread panicked".to_string())??;
            self.result.records_delivered += delivered;
        }
        output.stop();
        self.result.uploads_given_up = output.uploader_stats().gave_up;
        self.result.store_stats = faulty.stats();
        drop(output);

        // Phase 2: restart with recovery against a healthy store
        let restarted = SpoolOutput::start_with(
            self.output_config(true, None),
            Arc::new(self.store.clone()),
            Arc::new(self.clock.clone()),
        )
        .map_err(|e| format!("phase 2 start failed: {}", e))?;
        self.result.files_recovered = restarted
            .recovery_stats()
            .map_or(0, |stats| stats.queued as u64);
        restarted.stop();

        self.check_invariants()
    }

    fn check_invariants(&mut self) -> Result<(), String> {
        let objects = self.store.objects("spool");
        self.result.objects_stored = objects.len() as u64;

        let mut seen: HashMap<String, u32> = HashMap::new();
        for (key, data) in &objects {
            let text = decode(self.config.encoding, data)
                .map_err(|e| format!("object {} does not decode: {}", key, e))?;
            if !text.is_empty() && !text.ends_with('\n') {
                self.result
                    .violations
                    .push(format!("object {} ends with a partial record", key));
            }

            let mut last_seq: HashMap<String, u64> = HashMap::new();
            for line in text.lines() {
                let Some((route, writer, seq)) = parse_line(line) else {
                    self.result
                        .violations
                        .push(format!("object {} has a malformed record {:?}", key, line));
                    continue;
                };
                if !key.starts_with(&format!("dst/{}/", route)) {
                    self.result
                        .violations
                        .push(format!("record {:?} stored under wrong key {}", line, key));
                }
                if let Some(previous) = last_seq.insert(writer.clone(), seq) {
                    if previous >= seq {
                        self.result.violations.push(format!(
                            "object {}: writer {} records out of order ({} after {})",
                            key, writer, seq, previous
                        ));
                    }
                }
                *seen.entry(line.to_string()).or_default() += 1;
            }
        }

        self.result.records_found = seen.values().map(|&n| n as u64).sum();
        let duplicates = seen.values().filter(|&&n| n > 1).count();
        if duplicates > 0 {
            self.result
                .violations
                .push(format!("{} records stored more than once", duplicates));
        }
        if seen.len() as u64 != self.result.records_delivered {
            self.result.violations.push(format!(
                "{} records delivered but {} distinct records stored",
                self.result.records_delivered,
                seen.len()
            ));
        }

        let leftovers = std::fs::read_dir(self.staging.path())
            .map_err(|e| format!("cannot list staging dir: {}", e))?
            .count() as u64;
        self.result.leftover_entries = leftovers;
        if leftovers > 0 {
            self.result
                .violations
                .push(format!("{} entries left in the staging dir", leftovers));
        }
        Ok(())
    }
}

/// Scratch staging root, removed when the harness is dropped
struct StagingDir(PathBuf);

impl StagingDir {
    fn new(seed: u64) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "spool-dst-{}-{}",
            seed,
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&path)?;
        Ok(StagingDir(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// One writer thread. Returns how many records it delivered.
fn run_writer(
    writer: usize,
    seed: u64,
    config: &SpoolDSTConfig,
    output: &SpoolOutput,
    clock: &SimulatedClock,
) -> Result<u64, String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_mul(1_000_003).wrapping_add(writer as u64));
    let mut seq: u64 = 0;

    for _ in 0..config.batches_per_writer {
        let size = rng.gen_range(1..=config.max_batch_size);
        let batch: Vec<(Event, Bytes)> = (0..size)
            .map(|_| {
                let route = format!("k{}", rng.gen_range(0..config.keys));
                let padding = "p".repeat(rng.gen_range(0..64));
                let line = format!("{}|w{}|{}|{}\n", route, writer, seq, padding);
                seq += 1;

                let mut fields = Map::new();
                fields.insert("type".to_string(), Value::String(route));
                (Event::new(fields), Bytes::from(line))
            })
            .collect();

        output
            .deliver(&batch)
            .map_err(|e| format!("writer {} deliver failed: {}", writer, e))?;

        if rng.gen_bool(config.tick_probability) {
            clock.advance(Duration::from_secs(rng.gen_range(1..90)));
            output.rotate_all();
            output.registry().sweep_stale();
        }
    }
    Ok(seq)
}

fn decode(encoding: Encoding, data: &[u8]) -> std::io::Result<String> {
    let mut text = String::new();
    match encoding {
        Encoding::None => {
            text = String::from_utf8(data.to_vec())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        }
        Encoding::Gzip => {
            flate2::read::MultiGzDecoder::new(data).read_to_string(&mut text)?;
        }
    }
    Ok(text)
}

/// `route|writer|seq|padding`
fn parse_line(line: &str) -> Option<(String, String, u64)> {
    let mut parts = line.split('|');
    let route = parts.next()?;
    let writer = parts.next()?;
    let seq = parts.next()?.parse().ok()?;
    let padding = parts.next()?;
    if parts.next().is_some() || padding.chars().any(|c| c != 'p') {
        return None;
    }
    Some((route.to_string(), writer.to_string(), seq))
}

/// Run one harness per seed
pub fn run_spool_dst_batch(
    seeds: std::ops::Range<u64>,
    config: SpoolDSTConfig,
) -> Vec<SpoolDSTResult> {
    seeds
        .map(|seed| match SpoolDSTHarness::new(seed, config.clone()) {
            Ok(harness) => harness.run(),
            Err(e) => SpoolDSTResult {
                violations: vec![format!("harness setup failed: {}", e)],
                ..SpoolDSTResult::new(seed)
            },
        })
        .collect()
}

pub fn summarize_spool_dst_batch(results: &[SpoolDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let delivered: u64 = results.iter().map(|r| r.records_delivered).sum();
    let objects: u64 = results.iter().map(|r| r.objects_stored).sum();
    let gave_up: u64 = results.iter().map(|r| r.uploads_given_up).sum();
    let recovered: u64 = results.iter().map(|r| r.files_recovered).sum();

    let mut summary = format!(
        "Spool DST Batch: {}/{} passed ({} failed)\n\
         Records: {}, Objects: {}, Gave up: {}, Recovered: {}",
        passed,
        total,
        total - passed,
        delivered,
        objects,
        gave_up,
        recovered
    );

    if passed < total {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("\n  Seed {}: {}", r.seed, r.violations.join("; ")));
        }
    }
    summary
}
