//! Import worker: leases jobs from the queue, runs the fetch/upload
//! pipeline, supervises recovery and notifies the catalog.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod recovery;

pub use catalog::{CatalogClient, CatalogConfig, SuccessCall};
pub use config::ImportConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::ImportExecutor;
pub use logging::JobLogger;
pub use memory::MemoryWatchdog;
