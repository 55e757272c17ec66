// Library interface for testing

// Declare all modules
pub mod blob;
pub mod buffer;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod demux;
pub mod encode;
pub mod error;
pub mod queries;
pub mod recall;
pub mod schema;
pub mod transport;
pub mod writer;

pub use config::CaptureConfig;
pub use coordinator::SessionCoordinator;
pub use error::{CaptureError, Result};
pub use recall::RecallIndex;
