pub mod api;
pub mod config;
pub mod drive;
pub mod driver;
mod error;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod relay;
pub mod task;
pub mod transport;

pub const APP_NAME: &str = "DriveDeck";

pub use config::{DriveCredentials, DriveSettings, RelaySettings, UploadLimits};
pub use drive::DriveClient;
pub use driver::{DriverOutcome, UploadContext, UploadDriver};
pub use error::{Error, Result};
pub use progress::{BatchOutcome, Eta, ProgressReport, ProgressSink, TaskReport};
pub use queue::{EnqueueReport, ListingRefresher, UploadQueue};
pub use relay::RelayClient;
pub use task::UploadTask;
pub use transport::{ChunkOutcome, ChunkRequest, ChunkTransport, SessionInitiator, UploadSession};
