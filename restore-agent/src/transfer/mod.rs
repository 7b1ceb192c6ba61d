//! Fetching backup archives from the artifact store.

pub mod downloader;
pub mod progress;
pub mod progress_stream;

pub use downloader::{ArtifactStore, HttpDownloader, Presence};
