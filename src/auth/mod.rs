//! Credentials and login

mod broker;
mod credential;

pub use broker::CredentialBroker;
pub use credential::{AdminSecret, SessionToken};
