//! Storage collaborator seam.
//!
//! Transfers accumulate into a per-job spool; completion promotes the
//! spool to a final artifact reference. The orchestrator never interprets
//! artifact contents.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Artifact storage used by transfer workers.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read the current spool contents for integrity verification on
    /// resume. Missing spool reads as empty.
    async fn read_spool(&self, job_id: &str) -> anyhow::Result<Vec<u8>>;

    /// Append fetched bytes to the job's spool.
    async fn append_spool(&self, job_id: &str, bytes: &[u8]) -> anyhow::Result<()>;

    /// Truncate the spool to its first `len` bytes (0 removes it). Used to
    /// realign the spool with a verified checkpoint before resuming.
    async fn truncate_spool(&self, job_id: &str, len: u64) -> anyhow::Result<()>;

    /// Promote the spool to a final artifact; returns the artifact
    /// reference.
    async fn finalize(&self, job_id: &str) -> anyhow::Result<String>;

    /// Remove the spool of an abandoned transfer.
    async fn discard_spool(&self, job_id: &str) -> anyhow::Result<()>;

    /// Delete a finalized artifact.
    async fn delete(&self, artifact_ref: &str) -> anyhow::Result<()>;
}

/// Filesystem-backed artifact store: spools under `<spool_dir>/<job>.part`,
/// finalized artifacts under `<spool_dir>/artifacts/<job>`.
pub struct FsArtifactStore {
    spool_dir: PathBuf,
    artifact_dir: PathBuf,
}

impl FsArtifactStore {
    pub async fn new(spool_dir: PathBuf) -> anyhow::Result<Self> {
        let artifact_dir = spool_dir.join("artifacts");
        tokio::fs::create_dir_all(&spool_dir).await?;
        tokio::fs::create_dir_all(&artifact_dir).await?;
        Ok(Self {
            spool_dir,
            artifact_dir,
        })
    }

    fn spool_path(&self, job_id: &str) -> PathBuf {
        self.spool_dir.join(format!("{}.part", job_id))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn read_spool(&self, job_id: &str) -> anyhow::Result<Vec<u8>> {
        match tokio::fs::read(self.spool_path(job_id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_spool(&self, job_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.spool_path(job_id))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn truncate_spool(&self, job_id: &str, len: u64) -> anyhow::Result<()> {
        let path = self.spool_path(job_id);
        if len == 0 {
            return match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(len).await?;
        Ok(())
    }

    async fn finalize(&self, job_id: &str) -> anyhow::Result<String> {
        let target = self.artifact_dir.join(job_id);
        tokio::fs::rename(self.spool_path(job_id), &target).await?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn discard_spool(&self, job_id: &str) -> anyhow::Result<()> {
        self.truncate_spool(job_id, 0).await
    }

    async fn delete(&self, artifact_ref: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(artifact_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
