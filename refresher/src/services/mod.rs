pub mod credentials;
pub mod login;
pub mod session_driver;
pub mod token_exchange;
