mod handler;
mod routes;

pub mod app;
pub mod backend;
pub mod caption;
pub mod config;
pub mod frame;
pub mod prompt;
pub mod server;
pub mod telemetry;

pub use app::{initialize, start_app};
pub use backend::{InferenceBackend, InferenceError};
pub use caption::{BackendRoutes, CaptionService};
pub use frame::Frame;
pub use handler::{analyze_frame, ConnectionHandler, ConnectionState, FrameAnalysis};
pub use server::{ConnectionTracker, RelayServer};
