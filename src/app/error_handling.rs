//! Error handling utilities

use tracing::error;

use crate::error::CoordinatorError;

/// Handle fatal errors and exit with appropriate status code
///
/// # Verbose Mode Behavior
/// - `verbose = 0`: the error message with its context
/// - `verbose >= 1`: the full source chain
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error:#}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code_for(&error))
}

/// Exit code for an error, using the coordinator's classification when available
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<CoordinatorError>()
        .map(CoordinatorError::exit_code)
        .unwrap_or(1)
}
