//! sbx-sync: moving vault archives between devices and the server
//!
//! - [`store`]: server-side archive store; merges an uploaded archive into
//!   the stored one without a live vault
//! - [`protocol`]: routes, content types and JSON bodies shared by both ends
//! - [`client`]: HTTP client and the client-side sync pipeline

pub mod client;
pub mod error;
pub mod protocol;
pub mod store;

pub use client::{sync_vault, RemoteClient, SyncOutcome, UploadOutcome};
pub use error::{SyncError, SyncResult};
pub use store::{ArchiveStore, MergeStats};
