//! Data models shared by the login flow, the token exchange and the token store.

pub mod access_token;
pub mod authorization_code;
pub mod credentials;

pub use access_token::{AccessToken, StoredTokenRecord, UpsertOutcome, TOKEN_LIFETIME_HOURS};
pub use authorization_code::AuthorizationCode;
pub use credentials::Credentials;
