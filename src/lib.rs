//! ember-watcher - real-time metrics sidecar library.
//!
//! Polls the fixed-layout shared memory region written by the database and
//! republishes each decoded snapshot to WebSocket subscribers:
//! - `region`: scoped read-only acquisition of the shared region
//! - `snapshot`: snapshot model and the binary decoder
//! - `poller`: fixed-interval acquire/decode/publish loop
//! - `hub`: subscriber registry and fan-out
//! - `server`: `/ws` subscription endpoint and status API
//! - `app`: wiring of the above from a `Config`

pub mod app;
pub mod config;
pub mod hub;
pub mod poller;
pub mod region;
pub mod server;
pub mod shutdown;
pub mod snapshot;

pub use config::Config;
pub use shutdown::{Shutdown, ShutdownSignal};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
