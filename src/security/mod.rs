//! Access control seam: user resolution at login and per-command privilege
//! checks.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::sqlstate;

pub mod auth;
pub mod roles;

pub use auth::{AuthError, AuthExchange, AuthStatus};
pub use roles::{RoleAccessControl, RoleEntry, RoleRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    #[default]
    Trust,
    Password,
    Md5,
    ScramSha256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub method: AuthMethod,
    pub password: Option<String>,
}

impl Credentials {
    pub fn trusted(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            method: AuthMethod::Trust,
            password: None,
        }
    }
}

/// What a statement is about to do, for privilege checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandClass {
    Connect,
    Read,
    Write,
    Schema,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("role \"{0}\" does not exist")]
    UnknownRole(String),
    #[error("role \"{0}\" is not permitted to log in")]
    LoginNotAllowed(String),
    #[error("no access rule allows host {host} for role \"{user}\"")]
    HostNotAllowed { host: IpAddr, user: String },
    #[error("cannot read users file {path}: {source}")]
    UsersFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid users file: {0}")]
    InvalidUsers(#[from] serde_json::Error),
}

impl AccessError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Self::UnknownRole(_) | Self::LoginNotAllowed(_) | Self::HostNotAllowed { .. } => {
                sqlstate::INVALID_AUTHORIZATION
            }
            Self::UsersFile { .. } | Self::InvalidUsers(_) => sqlstate::INTERNAL_ERROR,
        }
    }
}

pub trait AccessControl: Send + Sync {
    /// Called once per connection at authentication time.
    fn resolve_user(
        &self,
        remote_host: IpAddr,
        user: &str,
        database: &str,
    ) -> Result<Credentials, AccessError>;

    fn has_privilege(&self, user: &str, database: &str, command: CommandClass) -> bool;
}

/// Admits every user without a password and grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustAll;

impl AccessControl for TrustAll {
    fn resolve_user(
        &self,
        _remote_host: IpAddr,
        user: &str,
        _database: &str,
    ) -> Result<Credentials, AccessError> {
        Ok(Credentials::trusted(user))
    }

    fn has_privilege(&self, _user: &str, _database: &str, _command: CommandClass) -> bool {
        true
    }
}
