//! Core of the johnnybot automation engine: reminders, calendar feeds, the
//! voice chaperone and message archives, independent of any chat platform.
//!
//! Platform access goes through [`messaging::port::PlatformPort`]; the `jb`
//! binary supplies an implementation over its host protocol.

pub mod archive;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod feeds;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod persistence;
pub mod reminders;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
