//! Over-the-air update engine for Updraft.
//!
//! This crate drives the update lifecycle on a device:
//! - Selection policies for launching, fetching and reaping
//! - Loading remote manifests and their assets with retries and timeouts
//! - Launching the best local update, falling back when blobs vanish
//! - Crash-loop recovery and at-most-once diagnostics
//! - Garbage collection of superseded updates

pub mod embedded;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod host;
pub mod launcher;
pub mod loader;
pub mod metrics;
pub mod reaper;
pub mod recovery;
pub mod retry;
pub mod selection;

pub use engine::{EngineBuilder, EngineStatus, UpdateEngine, UpdateSummary};
pub use error::{EngineError, EngineResult, LaunchError, LaunchResult, LoadError, LoadResult};
pub use fetch::{FetchResponse, HttpFetcher, ProgressFn, ReqwestFetcher, body_too_large};
pub use host::{HostCallbacks, NoopCallbacks};
pub use launcher::{LaunchDescriptor, LaunchSelection, Launcher};
pub use loader::{Loader, LoaderState, UpdateSource};
pub use reaper::{ReapReport, Reaper};
pub use recovery::{
    DiagnosticEntry, DiagnosticLog, ErrorRecoveryCoordinator, RecoveryDecision, RecoveryState,
};
pub use selection::{
    DefaultSelectionPolicy, LauncherSelectionPolicy, LoaderSelectionPolicy, ReaperSelectionPolicy,
};
