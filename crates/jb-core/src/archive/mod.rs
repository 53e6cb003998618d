//! Downloadable message archives: collection, compression and the
//! short-lived HTTP links that serve them.

mod request;
mod server;

pub use request::{ArchiveOutcome, ArchiveRequest, ArchiveRequests, HistorySettings};
pub use server::{ArchiveJob, ArchiveLink, EphemeralArchiveServer, RecoveryReport, ServerSettings};
