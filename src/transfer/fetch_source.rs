//! The external fetch capability seam.
//!
//! The orchestrator treats content acquisition as an opaque collaborator:
//! given a resource identifier and a byte offset, it streams chunks and
//! reports classified failures. Implementations live behind this trait so
//! tests can script arbitrary transfer behavior.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::job_store::FetchFailure;

/// One chunk of fetched content. `cursor` is the resume position after
/// this chunk has been persisted.
#[derive(Debug, Clone)]
pub struct FetchChunk {
    pub bytes: Vec<u8>,
    pub cursor: u64,
}

/// Lazy sequence of chunks; errors carry the transient/permanent split
/// via [`FetchFailure::is_permanent`].
pub type FetchStream = BoxStream<'static, Result<FetchChunk, FetchFailure>>;

/// External content-fetch capability.
#[async_trait]
pub trait FetchSource: Send + Sync {
    /// Open a content stream for `resource`, resuming from `resume_cursor`
    /// (0 starts fresh). Failing to open counts like any other fetch
    /// failure: transient kinds retry, permanent kinds are terminal.
    async fn fetch(&self, resource: &str, resume_cursor: u64) -> Result<FetchStream, FetchFailure>;
}
