//! Source fetchers for the import pipeline.
//!
//! Four fetch strategies behind one dispatch:
//! - Direct URL download (streaming, redirect-capped)
//! - Cloud-drive share links (OAuth / API key / public interstitial)
//! - Platform ids via the external downloader binary with egress
//!   identity rotation
//! - Local passthrough for pre-staged resumable uploads
//!
//! Plus the egress identity pool and the downloader-binary settings
//! hook.

pub mod drive;
pub mod egress;
pub mod error;
pub mod fetcher;
pub mod local;
pub mod platform;
pub mod probe;
pub mod retry;
pub mod updater;
pub mod url;

pub use egress::{EgressIdentity, EgressPool, EgressPoolConfig};
pub use error::{FetchError, FetchResult};
pub use fetcher::{FetchContext, FetchedFile, SourceFetcher};
pub use retry::{retry_async, RetryConfig, RetryResult};
pub use updater::{DownloaderSettings, DownloaderUpdater};
