//! Callbacks into the host application.

use crate::launcher::LaunchDescriptor;
use crate::recovery::DiagnosticEntry;
use updraft_core::Manifest;

/// Notifications the engine sends to the host. Every method defaults to a no-op.
///
/// Launch outcomes flow the other way, through
/// [`UpdateEngine::report_launch_outcome`](crate::UpdateEngine::report_launch_outcome).
pub trait HostCallbacks: Send + Sync + 'static {
    /// Last say on a remote manifest the selection policy accepted.
    /// Returning `false` skips the download.
    fn accept_manifest(&self, _manifest: &Manifest) -> bool {
        true
    }

    /// A launch descriptor is ready to run.
    fn on_launch_descriptor_ready(&self, _descriptor: &LaunchDescriptor) {}

    /// Something went wrong that the host may want to report.
    fn on_diagnostic(&self, _entry: &DiagnosticEntry) {}
}

/// Host callbacks that ignore everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallbacks;

impl HostCallbacks for NoopCallbacks {}
