//! Mercado Livre OAuth authentication library
//!
//! Provides the authorization-code + PKCE flow for Mercado Livre seller
//! accounts, with the code verifier carried inside the signed `state`
//! parameter so it survives the cross-site redirect. This crate has no
//! dependency on the gateway binary and is tested on its own.
//!
//! Flow:
//! 1. `initiator::Initiator::begin()` creates verifier, challenge and the
//!    signed state capsule, mirrors the attempt server-side and builds the
//!    authorization URL
//! 2. The seller authorizes on Mercado Livre and is redirected back
//! 3. `callback::Exchanger::complete()` recovers the verifier (state first,
//!    then cookies or the server cache), enforces single use and expiry,
//!    and calls `token::TokenClient::exchange_code()`
//! 4. The credential is upserted via `credentials::CredentialStore::upsert()`
//! 5. Refreshes go through `token::TokenClient::refresh()`

pub mod attempts;
pub mod callback;
pub mod clock;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod initiator;
pub mod pkce;
pub mod state;
pub mod token;

pub use attempts::{AttemptStore, BoxFuture, MemoryAttemptStore};
pub use callback::{
    CallbackError, CallbackParams, ExchangeOutcome, Exchanger, RecoveryChannel, SecondaryChannel,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use constants::*;
pub use credentials::{
    Credential, CredentialStore, CredentialUpsert, FileCredentialStore, MemoryCredentialStore,
};
pub use error::{Error, Result};
pub use initiator::{AuthorizationRequest, Initiator, InitiatorConfig};
pub use pkce::{compute_challenge, generate_verifier};
pub use state::{AuthorizationAttempt, StateCodec};
pub use token::{TokenClient, TokenClientConfig, TokenResponse};
