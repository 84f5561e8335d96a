//! Chainable multi-tier expiring value cache.
//!
//! A chain is a list of tiers (memory, file, origin) where each tier falls
//! through to the next on a miss and shares one daily freshness ceiling.

pub mod cache;
pub mod config;
pub mod error;
pub mod origin;
