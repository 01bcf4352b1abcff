//! Physician directory core: registry expansion over postal codes, adaptive
//! pacing, geographic containment and a reconciled local cache.

pub mod args;
pub mod common;
pub mod config;
pub mod constants;
pub mod enrichment;
pub mod error;
pub mod expander;
pub mod fanout;
pub mod geo;
pub mod geocode;
pub mod models;
pub mod postal;
pub mod rate_limiter;
pub mod registry;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
