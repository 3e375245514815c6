pub mod security;
pub mod time;
pub mod totp;

pub use security::*;
pub use time::*;
