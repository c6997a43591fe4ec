use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Source-derived directory components prepended to every destination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootDirPart {
    /// The directory holding the archive, e.g. `uploads/2024` for `uploads/2024/a.zip`.
    Dirname,
    /// The archive's file name without extension, e.g. `a` for `uploads/2024/a.zip`.
    Basename,
}

/// Where extracted entries are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
}

/// Options recognised by one extraction batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtractConfig {
    /// Entries per batch.
    pub range_limit: u64,
    /// Size of the archive tail cached on local disk.
    pub local_size_limit: u64,
    pub extra_root_dir: Vec<RootDirPart>,
    pub path_traversal_protection: bool,
    /// Extract even when the source is itself extraction output.
    pub recursive: bool,
    pub concurrency: usize,
    pub block_size: u64,
    pub max_queued_blocks: usize,
    /// Largest object the destination store accepts in a single upload.
    pub max_object_size: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub target: TargetConfig,
    pub temp_dir: Option<PathBuf>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            range_limit: 1000,
            local_size_limit: 100 * MIB,
            extra_root_dir: Vec::new(),
            path_traversal_protection: true,
            recursive: false,
            concurrency: 6,
            block_size: MIB,
            max_queued_blocks: 4,
            max_object_size: 5 * GIB,
            retry_attempts: 3,
            retry_delay_ms: 500,
            target: TargetConfig::default(),
            temp_dir: None,
        }
    }
}

impl ExtractConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| Err(Error::permanent(format!("invalid config: {what}")));
        if self.range_limit == 0 {
            return invalid("rangeLimit must be greater than 0");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be greater than 0");
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return invalid("concurrency exceeds the worker pool limit");
        }
        if self.block_size == 0 {
            return invalid("blockSize must be greater than 0");
        }
        if self.max_queued_blocks == 0 {
            return invalid("maxQueuedBlocks must be greater than 0");
        }
        if self.target.bucket.is_empty() {
            return invalid("target.bucket is required");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_style_json_is_accepted() {
        let config: ExtractConfig = serde_json::from_str(
            r#"{
                "rangeLimit": 100,
                "extraRootDir": ["dirname", "basename"],
                "pathTraversalProtection": false,
                "target": { "bucket": "out-1250000000", "region": "ap-guangzhou", "prefix": "unzipped/" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.range_limit, 100);
        assert_eq!(
            config.extra_root_dir,
            vec![RootDirPart::Dirname, RootDirPart::Basename]
        );
        assert!(!config.path_traversal_protection);
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.target.prefix, "unzipped/");
        config.validate().unwrap();
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = ExtractConfig {
            target: TargetConfig {
                bucket: "b".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        config.range_limit = 0;
        assert!(config.validate().is_err());
        config.range_limit = 1;
        config.concurrency = 0;
        assert!(config.validate().is_err());
        assert!(ExtractConfig::default().validate().is_err());
    }

    #[test]
    fn concurrency_beyond_the_permit_limit_is_rejected() {
        let mut config = ExtractConfig {
            concurrency: Semaphore::MAX_PERMITS,
            target: TargetConfig {
                bucket: "b".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        config.concurrency = usize::MAX;
        assert!(config.validate().is_err());
    }
}
