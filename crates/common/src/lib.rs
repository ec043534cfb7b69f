//! Shared types for the balance proxy workspace

mod error;
mod mask;
mod secret;

pub use error::{Error, Result};
pub use mask::mask_key;
pub use secret::Secret;
