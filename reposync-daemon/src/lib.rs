//! reposync daemon: periodic sync runtime, control socket, status store,
//! and webhook notifications.

mod error;
pub mod lock;
pub mod log_rotation;
pub mod notifier;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod status_store;

pub use error::DaemonError;
pub use notifier::{NoopNotifier, Notifier, WebhookNotifier};
pub use protocol::{
    request_status, request_stop, request_sync, send_request, BatchReport, DaemonRequest,
    DaemonResponse, DaemonStatus, FailureReport, RepositoryState, SyncReport,
};
pub use runtime::{run, start_blocking, ConfigCache};
