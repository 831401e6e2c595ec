//! Types shared by the Mercado Livre OAuth crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
