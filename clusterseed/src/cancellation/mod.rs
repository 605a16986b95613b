//! Cooperative cancellation for a bootstrap run.

mod token;

pub use token::CancellationToken;
