//! The cache command: maintenance of the normalization cache.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use xbasemesh::cache::{NormalizationCache, VerifyMode};
use xbasemesh::BuildError;

use super::common::Common;

#[derive(Args)]
pub struct CacheArgs {
    #[command(subcommand)]
    action: CacheAction,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Evict least-recently-used entries down to a byte budget.
    Clean {
        /// Output directory the cache lives under.
        #[arg(long)]
        output: PathBuf,

        /// Target cache size in bytes (0 clears everything).
        #[arg(long, default_value_t = 0)]
        max_bytes: u64,
    },
}

pub fn run(common: &Common, args: CacheArgs) -> i32 {
    match execute(common, args) {
        Ok(code) => code,
        Err(e) => common.fail(&e),
    }
}

fn execute(common: &Common, args: CacheArgs) -> Result<i32, BuildError> {
    match args.action {
        CacheAction::Clean { output, max_bytes } => {
            let cache = NormalizationCache::new(&output, VerifyMode::Fingerprint);
            let report = cache.clean(max_bytes)?;
            if common.json_logs {
                let line = serde_json::json!({
                    "entries_removed": report.entries_removed,
                    "bytes_freed": report.bytes_freed,
                });
                println!("{line}");
            } else {
                println!("{report}");
            }
            Ok(0)
        }
    }
}
