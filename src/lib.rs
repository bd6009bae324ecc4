pub mod observability;
pub mod spool;

pub use spool::{Event, OutputConfig, OutputError, SpoolOutput};
