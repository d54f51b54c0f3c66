#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
//! # aesd-socket: Concurrent Line-Oriented Logging Service
//!
//! A TCP service that appends every newline-terminated message it receives
//! to one shared log file and answers each client with the whole log as it
//! stands after that client's message.
//!
//! ## Key Features
//!
//! - **Unbounded Concurrency**: one task per connection, no client waits on another's I/O
//! - **Atomic Appends**: a single critical section covers append and snapshot, so records never interleave
//! - **Periodic Timestamps**: RFC 2822 timestamp records injected on a fixed period
//! - **Graceful Shutdown**: SIGINT/SIGTERM stop accepting, drain every handler, then delete the log
//! - **Daemon Mode**: bind first, then detach, so port conflicts surface to the caller
//! - **Configuration**: defaults, TOML file and `AESD_` environment variables
//! - **Structured Logging**: tracing with optional JSON output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use aesd_socket::{Config, Service};
//!
//! fn main() -> aesd_socket::Result<()> {
//!     let config = Config::load()?;
//!
//!     // Bind before any runtime exists; a busy port fails here.
//!     let service = Service::builder(config).bind()?;
//!
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let stats = runtime.block_on(service.run())?;
//!     println!("served {} connections", stats.accepted);
//!     Ok(())
//! }
//! ```

// Private modules
mod config;
mod error;

// Public modules
pub mod connection;
pub mod logging;
pub mod process;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod signal;
pub mod store;
pub mod timestamp;

// Public exports
pub use config::{
    Config, ConfigBuilder, ConnectionConfig, ListenConfig, LogConfig, LogLevel, ShutdownConfig,
    StorageConfig, TimestampConfig,
};
pub use error::{Error, ErrorCode, Result};
pub use service::{Service, ServiceBuilder, ServiceMonitor, ServiceStats};
pub use shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownReason};
pub use store::LogStore;

/// Version of the aesd-socket library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port
pub const DEFAULT_PORT: u16 = 9000;

/// Default location of the shared log
pub const DEFAULT_DATA_FILE: &str = "/var/tmp/aesdsocketdata";

/// Default initial receive buffer capacity in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "aesdsocket.toml";
