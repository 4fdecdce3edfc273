//! # mass-dl
//!
//! Orchestration engine for archiving whole channels: turns a list of channel
//! URLs into concurrent, resource-bounded, failure-tolerant download jobs.
//!
//! ## Design Philosophy
//!
//! mass-dl is designed to be:
//! - **Bounded** - Two nested worker pools (channels, then items per channel),
//!   both gated on live CPU and memory pressure
//! - **Failure tolerant** - Transient errors are retried behind per-operation
//!   circuit breakers; one bad channel never aborts its siblings
//! - **Restart safe** - Processed items are tracked (and optionally persisted)
//!   so repeated runs never download the same item twice
//! - **Library-first** - Enumeration, transfer and storage clients are traits
//!   the embedding application implements
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mass_dl::{Collaborators, Config, MassDownloadCoordinator, PersonRecord};
//! # use mass_dl::clients::{ChannelEnumerator, LocalDownloader, RemoteStorage};
//! # async fn clients() -> (Arc<dyn ChannelEnumerator>, Arc<dyn LocalDownloader>, Arc<dyn RemoteStorage>) { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (enumerator, local, remote) = clients().await;
//!     let mut config = Config::default();
//!     config.download.remote_bucket = Some("archive".to_string());
//!     config.coordinator.download_videos = true;
//!
//!     let coordinator = MassDownloadCoordinator::new(
//!         config,
//!         Collaborators { enumerator, local, remote: Some(remote), sampler: None },
//!     )
//!     .await?;
//!
//!     let mut events = coordinator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let person = PersonRecord::new("Jane", "jane@example.com", "creator", "https://www.youtube.com/@jane");
//!     let url = person.channel_url.clone();
//!     coordinator.process_channels_with_downloads(vec![(person, url)]).await?;
//!     println!("{:?}", coordinator.get_progress_report().await);
//!     coordinator.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Per-operation circuit breaker
pub mod circuit_breaker;
/// Capability traits for external clients
pub mod clients;
/// Configuration types
pub mod config;
/// Mass download coordinator (decomposed into focused submodules)
pub mod coordinator;
/// Database persistence layer
pub mod db;
/// Duplicate-aware channel discovery
pub mod discovery;
/// Download integration
pub mod download;
/// Duplicate tracking
pub mod duplicates;
/// Error types
pub mod error;
/// Progress accounting
pub mod progress;
/// Dead-letter queue and recovery reporting
pub mod recovery;
/// Resource monitoring and admission control
pub mod resources;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, DownloadMode};
pub use coordinator::{Collaborators, MassDownloadCoordinator};
pub use db::Database;
pub use duplicates::DuplicateTracker;
pub use error::{DatabaseError, Error, Result};
pub use progress::ProgressReport;
pub use recovery::{DeadLetterEntry, RecoveryReport};
pub use types::{
    ChannelInfo, ChannelProcessingResult, DownloadResult, DownloadStatus, Event,
    PendingItemRecord, PersonRecord, ProcessingStatus, VideoMetadata,
};

/// Wait for a termination signal, then shut the coordinator down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Typically spawned next to a long run so an operator can stop it cleanly:
///
/// ```no_run
/// # use mass_dl::MassDownloadCoordinator;
/// # async fn example(coordinator: MassDownloadCoordinator) {
/// let handle = coordinator.clone();
/// tokio::spawn(mass_dl::run_with_shutdown(handle));
/// # }
/// ```
pub async fn run_with_shutdown(coordinator: MassDownloadCoordinator) -> Result<()> {
    wait_for_signal().await;
    coordinator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
