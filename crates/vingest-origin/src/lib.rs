//! Streaming client for the CDN object origin.
//!
//! A single `PUT` per object with a bounded read buffer, throttled
//! progress callbacks and strict cleanup; plus delete, a three-valued
//! existence probe and best-effort CDN verification.

pub mod client;
pub mod error;

pub use client::{normalize_cdn_base, ObjectPresence, OriginClient, OriginConfig, UploadProgress};
pub use error::{OriginError, OriginResult};
