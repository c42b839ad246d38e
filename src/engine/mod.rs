//! Background jobs.

pub mod token_cleanup;

pub use token_cleanup::{spawn_cleanup_task, TokenCleanup};
