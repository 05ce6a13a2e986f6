//! Phoenix - self-upgrading process supervision core
//!
//! Detects that a newer build of an executable is available over HTTP or
//! S3-compatible object storage, retrieves it, and installs it atomically.
//! A parent watchdog terminates subordinate processes whose supervisor died.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod install;
pub mod updater;
pub mod utils;
pub mod watchdog;

pub use config::Config;
pub use error::{PhoenixError, Result};
pub use fetcher::{ArtifactStream, Fetcher, HttpFetcher, ObjectStorageFetcher, RetrievalMode};
pub use install::{overwrite, StagedArtifact};
pub use updater::{answer_bin_check, UpdateOutcome, Updater};
pub use watchdog::{LivenessProbe, Watchdog, WATCHDOG_EXIT_CODE};
