//! Common utilities and types shared across router agent components.

pub mod error;
pub mod exec;
pub mod logging;
pub mod retry;

pub use error::{Error, Result};
pub use retry::{RetryPolicy, retry};
