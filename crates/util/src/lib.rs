//! Shared lifecycle and retry helpers.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod retry;
pub mod stop;

pub use retry::{
    DEFAULT_SUCCEEDS_SOON_DURATION, Retry, RetryOptions, SucceedsSoonError, succeeds_soon,
};
pub use stop::{Stopper, StopperError};
