//! Application module
//!
//! Process-level concerns of the binary:
//! - Verbosity and working directory handling
//! - Logging setup
//! - Mapping fatal errors to exit codes

pub mod config;
pub mod error_handling;
pub mod logging;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
