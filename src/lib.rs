//! The service-discovery core of a metrics scraping platform: a manager
//! multiplexing any number of discovery providers into throttled, coalesced
//! snapshots of scrape targets, and the providers feeding it.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod discoverer;
pub mod kubernetes;
pub mod manager;
pub mod target;

pub use config::{Config, StaticConfig};
pub use discoverer::{Discoverer, DiscovererOptions, StaticDiscoverer};
pub use manager::{Manager, TargetSets};
pub use target::{sanitize_label_name, Labels, TargetGroup, ADDRESS_LABEL};

/// Boxed error type, dynamically dispatched and safe to send across threads.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type defined in terms of [`Error`] and generic over `T`.
pub type Result<T> = std::result::Result<T, Error>;
