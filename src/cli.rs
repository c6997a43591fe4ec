use std::path::PathBuf;

use clap::Parser;

use crate::config::{ExtractConfig, RootDirPart};
use crate::range::IndexRange;

#[derive(Parser, Debug)]
#[command(name = "remote-unzip")]
#[command(version)]
#[command(about = "Extract a ZIP object into a bucket in resumable batches", long_about = None)]
#[command(after_help = "Examples:\n  \
  remote-unzip -b src -r ap-guangzhou uploads/a.zip --target-bucket out\n  \
  remote-unzip -b src -r ap-guangzhou uploads/a.zip --target-bucket out --range 1000-1999\n  \
  remote-unzip -b src -r ap-guangzhou uploads/a.zip --target-bucket out --follow --time-budget-secs 900")]
pub struct Cli {
    /// Key of the ZIP object
    #[arg(value_name = "KEY")]
    pub key: String,

    /// Bucket holding the ZIP object
    #[arg(short = 'b', long = "bucket")]
    pub bucket: String,

    /// Region of the source bucket
    #[arg(short = 'r', long = "region", default_value = "")]
    pub region: String,

    /// Endpoint template; `{bucket}` and `{region}` are substituted
    #[arg(
        short = 'e',
        long = "endpoint",
        default_value = "https://{bucket}.cos.{region}.myqcloud.com"
    )]
    pub endpoint: String,

    /// Header prefix for user metadata
    #[arg(long = "meta-prefix", default_value = crate::store::DEFAULT_META_PREFIX)]
    pub meta_prefix: String,

    /// JSON file with extraction options
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Entry range to process, e.g. `100-199` (default: first batch)
    #[arg(long = "range", value_name = "START-END")]
    pub range: Option<IndexRange>,

    /// Entries per batch
    #[arg(short = 'n', long = "range-limit")]
    pub range_limit: Option<u64>,

    /// Concurrent entry uploads
    #[arg(short = 'j', long = "concurrency")]
    pub concurrency: Option<usize>,

    /// Destination bucket
    #[arg(long = "target-bucket")]
    pub target_bucket: Option<String>,

    /// Destination region (default: source region)
    #[arg(long = "target-region")]
    pub target_region: Option<String>,

    /// Destination key prefix
    #[arg(long = "target-prefix")]
    pub target_prefix: Option<String>,

    /// Prefix keys with the archive's directory
    #[arg(long = "with-dirname")]
    pub with_dirname: bool,

    /// Prefix keys with the archive's name
    #[arg(long = "with-basename")]
    pub with_basename: bool,

    /// Keep `..` and `.` segments of entry names
    #[arg(long = "no-path-protection")]
    pub no_path_protection: bool,

    /// Extract even if the archive is itself extraction output
    #[arg(long = "recursive")]
    pub recursive: bool,

    /// Directory for the tail cache file
    #[arg(long = "temp-dir", value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Cancel the batch this many seconds after start, minus a safety margin
    #[arg(long = "time-budget-secs", value_name = "SECS")]
    pub time_budget_secs: Option<u64>,

    /// Keep running batches for the next range while every batch succeeds
    #[arg(short = 'f', long = "follow")]
    pub follow: bool,
}

impl Cli {
    /// Overlay command-line flags on `config`.
    pub fn apply(&self, config: &mut ExtractConfig) {
        if let Some(limit) = self.range_limit {
            config.range_limit = limit;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(bucket) = &self.target_bucket {
            config.target.bucket = bucket.clone();
        }
        if let Some(region) = &self.target_region {
            config.target.region = region.clone();
        }
        if config.target.region.is_empty() {
            config.target.region = self.region.clone();
        }
        if let Some(prefix) = &self.target_prefix {
            config.target.prefix = prefix.clone();
        }
        for (enabled, part) in [
            (self.with_dirname, RootDirPart::Dirname),
            (self.with_basename, RootDirPart::Basename),
        ] {
            if enabled && !config.extra_root_dir.contains(&part) {
                config.extra_root_dir.push(part);
            }
        }
        if self.no_path_protection {
            config.path_traversal_protection = false;
        }
        if self.recursive {
            config.recursive = true;
        }
        if let Some(dir) = &self.temp_dir {
            config.temp_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "remote-unzip",
            "-b",
            "src",
            "-r",
            "ap-guangzhou",
            "a.zip",
            "--target-bucket",
            "out",
            "--range",
            "100-199",
            "-n",
            "100",
            "--with-basename",
        ]);
        let mut config = ExtractConfig::default();
        cli.apply(&mut config);

        assert_eq!(cli.range, Some(IndexRange::new(100, 199).unwrap()));
        assert_eq!(config.range_limit, 100);
        assert_eq!(config.target.bucket, "out");
        assert_eq!(config.target.region, "ap-guangzhou");
        assert_eq!(config.extra_root_dir, vec![RootDirPart::Basename]);
        assert!(config.validate().is_ok());
    }
}
