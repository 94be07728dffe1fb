//! `pyrun fingerprint`: the hash the type-check scheduler compares.

use pyrun_core::{
    ChangeDetectionCache, ChangeOutcome, FileStore, LocalStore, RunnerConfig, StorageConfig,
    WatchPattern, NO_SOURCES_INFO,
};
use std::path::Path;
use std::process::ExitCode;

use crate::CliError;

pub fn run(project: &Path) -> Result<ExitCode, CliError> {
    let storage = StorageConfig::from_home()?;
    let config = RunnerConfig::load(&storage)?;
    let pattern = WatchPattern::new(&config.watch_pattern)?;
    let store = LocalStore::open(project)?;

    let files = store.enumerate(&pattern)?;
    let mut cache = ChangeDetectionCache::new(pattern);
    match cache.poll(Some(&store as &dyn FileStore))? {
        ChangeOutcome::Changed(fingerprint) => {
            println!("{}  ({} files)", fingerprint, files.len());
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            eprintln!("pyrun: {}", NO_SOURCES_INFO);
            Ok(ExitCode::FAILURE)
        }
    }
}
