//! Upload of a day's aggregation outputs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::layout::DayLayout;
use super::reports::{day_artifacts, file_name};

/// Destination for published artifacts, addressed by key.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;
}

pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        S3Sink {
            client,
            bucket: bucket.into(),
        }
    }

    /// Client configured from the standard AWS environment.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        S3Sink::new(aws_sdk_s3::Client::new(&config), bucket)
    }
}

#[async_trait]
impl ArtifactSink for S3Sink {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type)
            .send()
            .await
            .with_context(|| format!("uploading s3://{}/{}", self.bucket, key))?;
        Ok(())
    }
}

/// Mirrors keys as relative paths under a directory.
pub struct LocalDirSink {
    root: PathBuf,
}

impl LocalDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalDirSink { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSink for LocalDirSink {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Key of an artifact of `date` in the published tree.
pub fn artifact_key(layout: &DayLayout, name: &str) -> String {
    format!("date={}/{}", layout.date.format("%Y-%m-%d"), name)
}

/// Sends every JSON output in the day's `agg/` folder. Returns the count.
#[tracing::instrument(skip_all, fields(date = %layout.date))]
pub async fn publish_day(layout: &DayLayout, sink: &dyn ArtifactSink) -> Result<usize> {
    let files = day_artifacts(layout)?;
    for path in &files {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let key = artifact_key(layout, &file_name(path));
        sink.put(&key, body, "application/json").await?;
        info!(key = %key, "Artifact published");
    }
    info!(count = files.len(), "Publish complete");
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    use crate::error::PipelineError;

    fn layout(root: &std::path::Path) -> DayLayout {
        DayLayout::new(root, NaiveDate::from_ymd_opt(2024, 7, 3).unwrap())
    }

    #[tokio::test]
    async fn test_local_sink_mirrors_agg_json() {
        let root = std::env::temp_dir().join(format!("bus_stress_publish_{}", std::process::id()));
        let day = layout(&root.join("data"));
        fs::create_dir_all(day.agg_dir()).unwrap();
        fs::write(day.agg_dir().join("summary.json"), b"{}").unwrap();
        fs::write(day.agg_dir().join("notes.txt"), b"skip").unwrap();

        let sink = LocalDirSink::new(root.join("site"));
        let count = publish_day(&day, &sink).await.unwrap();
        assert_eq!(count, 1);
        let published = fs::read_to_string(root.join("site/date=2024-07-03/summary.json")).unwrap();
        assert_eq!(published, "{}");

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_missing_agg_dir_is_missing_input() {
        let root = std::env::temp_dir().join(format!("bus_stress_publish_none_{}", std::process::id()));
        let sink = LocalDirSink::new(root.join("site"));
        let err = publish_day(&layout(&root), &sink).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingInput { stage: "publish", .. })
        ));
    }
}
