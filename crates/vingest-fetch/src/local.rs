//! Local passthrough fetcher.
//!
//! The source is a file already staged by the resumable uploader; no
//! network I/O happens here.

use std::path::PathBuf;

use tracing::info;

use vingest_models::{sanitize_file_name, ProgressStage};

use crate::error::{FetchError, FetchResult};
use crate::fetcher::{FetchContext, FetchedFile};

pub struct LocalFetcher;

impl LocalFetcher {
    pub fn new() -> Self {
        Self
    }

    pub async fn fetch(
        &self,
        spec: &vingest_models::ImportSpec,
        ctx: &FetchContext,
    ) -> FetchResult<FetchedFile> {
        ctx.check_cancelled()?;

        let path = PathBuf::from(&spec.source_ref);
        let metadata = tokio::fs::metadata(&path).await.map_err(|_| {
            FetchError::not_found(format!("staged file not found: {}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(FetchError::invalid_source(format!(
                "staged path is not a file: {}",
                path.display()
            )));
        }
        let size = metadata.len();
        if size > ctx.max_file_size {
            return Err(FetchError::SizeExceeded {
                declared: size,
                max: ctx.max_file_size,
            });
        }

        let file_name = spec
            .file_name
            .clone()
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "upload.mp4".to_string());
        let file_name = sanitize_file_name(&file_name);

        // The pre-stager hands ownership of the file to the pipeline.
        ctx.track_temp_file(&path).await;
        ctx.report_stage(ProgressStage::Downloading, 100.0, "Using pre-staged upload");

        info!(path = %path.display(), size, "Local passthrough source");
        Ok(FetchedFile::new(path, file_name, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::test_support::context;
    use vingest_models::{ImportSpec, SourceKind};

    #[tokio::test]
    async fn passes_through_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = dir.path().join("upload-1.mp4");
        tokio::fs::write(&staged, vec![0u8; 1024]).await.expect("write");

        let spec = ImportSpec::new(SourceKind::Local, staged.to_string_lossy())
            .with_file_name("original.mp4");
        let fetched = LocalFetcher::new()
            .fetch(&spec, &context(dir.path()))
            .await
            .expect("fetch");

        assert_eq!(fetched.file_name, "original.mp4");
        assert_eq!(fetched.size, 1024);
        assert_eq!(fetched.local_path, staged);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = ImportSpec::new(SourceKind::Local, "/nonexistent/upload.mp4");
        let err = LocalFetcher::new()
            .fetch(&spec, &context(dir.path()))
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let staged = dir.path().join("big.mp4");
        tokio::fs::write(&staged, vec![0u8; 2048]).await.expect("write");

        let mut ctx = context(dir.path());
        ctx.max_file_size = 1024;
        let spec = ImportSpec::new(SourceKind::Local, staged.to_string_lossy());
        let err = LocalFetcher::new()
            .fetch(&spec, &ctx)
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::SizeExceeded { .. }));
    }
}
