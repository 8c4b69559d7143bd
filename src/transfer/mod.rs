//! Resumable transfer execution.
//!
//! Workers claim jobs, stream content from the external fetch capability
//! into spooled artifacts, and checkpoint progress so interrupted
//! transfers continue where they stopped.

mod artifact_store;
mod coordinator;
mod fetch_source;
mod http_source;

pub use artifact_store::{ArtifactStore, FsArtifactStore};
pub use coordinator::TransferWorker;
pub use fetch_source::{FetchChunk, FetchSource, FetchStream};
pub use http_source::HttpFetchSource;
