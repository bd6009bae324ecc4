//! Rotating Staging Spool
//!
//! Buffers a stream of records into local staging files, one per routing
//! key, and ships finished files to an object store. Delivery is
//! at-least-once: a file is deleted locally only after the store accepted
//! it, and files left behind by a crash are re-uploaded on the next start.
//!
//! ## Architecture
//!
//! ```text
//! (Event, Bytes) ──> SpoolOutput ──> FileRegistry ──> FileGenerator ──> StagingFile
//!                        │                                  │
//!                  RotationPolicy ◄─────────────────────────┘
//!                        │ seal
//!                        ▼
//!                    Uploader ──> ObjectStore (in-memory / local fs / S3)
//!                        │
//!                  delete temp dir
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! {staging_dir}/{uuid}/{routing key}/spool.{uuid}.{%Y-%m-%dT%H.%M}.part-{n}.{data|gz}
//! ```

pub mod clock;
pub mod config;
pub mod dst;
pub mod event;
pub mod file_generator;
pub mod file_registry;
pub mod object_store;
pub mod output;
pub mod periodic;
pub mod recovery;
pub mod rotation;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod simulated_store;
pub mod staging_file;
pub mod uploader;

pub use clock::{Clock, SimulatedClock, SystemClock, Timestamp};
pub use config::{ConfigError, Encoding, OutputConfig, RotationStrategy, StoreConfig, StoreKind};
pub use dst::{
    run_spool_dst_batch, summarize_spool_dst_batch, SpoolDSTConfig, SpoolDSTHarness,
    SpoolDSTResult,
};
pub use event::{Event, KeyTemplate};
pub use file_generator::{FileFactory, FileGenerator, GeneratorGuard};
pub use file_registry::FileRegistry;
pub use object_store::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectMetadata, ObjectStore, ObjectStoreError,
};
pub use output::{build_store, OutputError, SpoolOutput};
pub use periodic::PeriodicTask;
pub use recovery::{recover_staging_dir, RecoveryStats};
pub use rotation::RotationPolicy;
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use staging_file::{normalize_routing_key, SealedFile, StagingError, StagingFile};
pub use uploader::{
    delete_on_complete, CompletionCallback, UploadError, UploadOutcome, Uploader, UploaderConfig,
    UploaderStats,
};
