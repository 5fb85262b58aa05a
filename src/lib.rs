//! Near-duplicate prompt detection with multi-resolution SimHash.
//!
//! Prompts are fingerprinted at several token budgets, matched against learned templates,
//! and each template learns the smallest working context window and batch size that
//! served it.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod fingerprint;
pub mod infra;
pub mod matching;
