//! gog: the account and credential layer of a Google Workspace command-line client.
//!
//! - [`secrets`] stores OAuth refresh tokens in the OS keychain or in (encrypted) files
//! - [`accounts`] decides which account a command acts as
//! - [`service_account`] keeps service-account keys for domain-wide delegation
//! - [`api`] runs OAuth authorizations, verifies identities and serves the account manager
//! - [`commands`] implements `gog auth ...` on top of all of that

pub mod accounts;
pub mod api;
pub mod args;
pub mod commands;
mod config;
mod error;
pub mod secrets;
pub mod service_account;
mod utils;


pub use config::Config;
pub use error::{auth_error, AuthError, Error, Result};
