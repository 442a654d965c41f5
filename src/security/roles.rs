use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::security::{AccessControl, AccessError, AuthMethod, CommandClass, Credentials};

const ANY: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleEntry {
    pub name: String,
    #[serde(default)]
    pub superuser: bool,
    #[serde(default = "default_login")]
    pub login: bool,
    #[serde(default)]
    pub password: Option<String>,
    /// Authentication method; defaults to SCRAM when a password is set.
    #[serde(default)]
    pub auth: Option<AuthMethod>,
    /// Allowed client addresses; empty or `*` admits any host.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Database name (or `*`) to granted command classes.
    #[serde(default)]
    pub databases: HashMap<String, Vec<CommandClass>>,
}

fn default_login() -> bool {
    true
}

impl RoleEntry {
    fn method(&self) -> AuthMethod {
        match (self.auth, &self.password) {
            (Some(method), _) => method,
            (None, Some(_)) => AuthMethod::ScramSha256,
            (None, None) => AuthMethod::Trust,
        }
    }

    fn allows_host(&self, host: IpAddr) -> bool {
        self.hosts.is_empty()
            || self.hosts.iter().any(|allowed| {
                allowed == ANY || allowed.parse::<IpAddr>().is_ok_and(|addr| addr == host)
            })
    }

    fn grants(&self, database: &str) -> impl Iterator<Item = &CommandClass> {
        [database, ANY]
            .into_iter()
            .filter_map(|key| self.databases.get(key))
            .flatten()
    }

    fn has_privilege(&self, database: &str, command: CommandClass) -> bool {
        if self.superuser {
            return true;
        }
        match command {
            // any grant on the database implies connect
            CommandClass::Connect => self.grants(database).next().is_some(),
            other => self.grants(database).any(|granted| *granted == other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    roles: Vec<RoleEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    roles: HashMap<String, RoleEntry>,
}

impl RoleRegistry {
    pub fn from_json(raw: &str) -> Result<Self, AccessError> {
        let file: UsersFile = serde_json::from_str(raw)?;
        Ok(Self {
            roles: file
                .roles
                .into_iter()
                .map(|role| (role.name.clone(), role))
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, AccessError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AccessError::UsersFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn role_exists(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn can_login(&self, role: &str) -> bool {
        self.roles.get(role).is_some_and(|r| r.login)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

/// Role registry backed by a JSON users file. Lookups share a read lock;
/// `reload` swaps the whole registry under the write lock.
#[derive(Debug)]
pub struct RoleAccessControl {
    path: Option<PathBuf>,
    registry: RwLock<RoleRegistry>,
}

impl RoleAccessControl {
    pub fn new(registry: RoleRegistry) -> Self {
        Self {
            path: None,
            registry: RwLock::new(registry),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, AccessError> {
        let path = path.into();
        let registry = RoleRegistry::load(&path)?;
        info!(path = %path.display(), roles = registry.len(), "loaded users file");
        Ok(Self {
            path: Some(path),
            registry: RwLock::new(registry),
        })
    }

    /// Re-reads the users file; the previous registry stays in place on error.
    pub fn reload(&self) -> Result<(), AccessError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let next = RoleRegistry::load(path)?;
        info!(path = %path.display(), roles = next.len(), "reloaded users file");
        *self.registry.write() = next;
        Ok(())
    }
}

impl AccessControl for RoleAccessControl {
    fn resolve_user(
        &self,
        remote_host: IpAddr,
        user: &str,
        _database: &str,
    ) -> Result<Credentials, AccessError> {
        let registry = self.registry.read();
        let role = registry
            .roles
            .get(user)
            .ok_or_else(|| AccessError::UnknownRole(user.to_string()))?;
        if !registry.can_login(user) {
            return Err(AccessError::LoginNotAllowed(user.to_string()));
        }
        if !role.allows_host(remote_host) {
            return Err(AccessError::HostNotAllowed {
                host: remote_host,
                user: user.to_string(),
            });
        }
        Ok(Credentials {
            user: role.name.clone(),
            method: role.method(),
            password: role.password.clone(),
        })
    }

    fn has_privilege(&self, user: &str, database: &str, command: CommandClass) -> bool {
        self.registry
            .read()
            .roles
            .get(user)
            .is_some_and(|role| role.has_privilege(database, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    const USERS: &str = r#"{
        "roles": [
            {"name": "admin", "superuser": true, "password": "root", "auth": "md5"},
            {"name": "alice", "password": "wonder",
             "hosts": ["127.0.0.1"],
             "databases": {"shop": ["read", "write"], "*": ["read"]}},
            {"name": "bob", "databases": {"shop": ["read"]}},
            {"name": "ghost", "login": false}
        ]
    }"#;

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn control() -> RoleAccessControl {
        RoleAccessControl::new(RoleRegistry::from_json(USERS).expect("users parse"))
    }

    #[test]
    fn resolves_methods_from_entries() {
        let control = control();
        let admin = control.resolve_user(local(), "admin", "shop").expect("admin");
        assert_eq!(admin.method, AuthMethod::Md5);
        let alice = control.resolve_user(local(), "alice", "shop").expect("alice");
        assert_eq!(alice.method, AuthMethod::ScramSha256);
        assert_eq!(alice.password.as_deref(), Some("wonder"));
        let bob = control.resolve_user(local(), "bob", "shop").expect("bob");
        assert_eq!(bob.method, AuthMethod::Trust);
    }

    #[test]
    fn rejects_unknown_nologin_and_foreign_hosts() {
        let control = control();
        assert!(matches!(
            control.resolve_user(local(), "mallory", "shop"),
            Err(AccessError::UnknownRole(_))
        ));
        assert!(matches!(
            control.resolve_user(local(), "ghost", "shop"),
            Err(AccessError::LoginNotAllowed(_))
        ));
        let remote = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        assert!(matches!(
            control.resolve_user(remote, "alice", "shop"),
            Err(AccessError::HostNotAllowed { .. })
        ));
    }

    #[test]
    fn privileges_follow_database_grants() {
        let control = control();
        assert!(control.has_privilege("alice", "shop", CommandClass::Write));
        assert!(control.has_privilege("alice", "other", CommandClass::Read));
        assert!(!control.has_privilege("alice", "other", CommandClass::Write));
        assert!(control.has_privilege("bob", "shop", CommandClass::Connect));
        assert!(!control.has_privilege("bob", "other", CommandClass::Connect));
        assert!(!control.has_privilege("bob", "shop", CommandClass::Schema));
        assert!(control.has_privilege("admin", "anything", CommandClass::Schema));
        assert!(!control.has_privilege("mallory", "shop", CommandClass::Read));
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"roles": [{{"name": "carol"}}]}}"#).expect("write users");
        let control = RoleAccessControl::from_file(file.path()).expect("load users");
        assert!(control.resolve_user(local(), "dave", "db").is_err());

        std::fs::write(file.path(), r#"{"roles": [{"name": "dave"}]}"#).expect("rewrite users");
        control.reload().expect("reload");
        assert!(control.resolve_user(local(), "dave", "db").is_ok());
        assert!(control.resolve_user(local(), "carol", "db").is_err());
    }
}
