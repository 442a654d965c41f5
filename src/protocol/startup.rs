#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPacket {
    pub user: String,
    pub database: Option<String>,
    pub parameters: Vec<(String, String)>,
}

impl StartupPacket {
    pub fn new(user: impl Into<String>, database: Option<String>) -> Self {
        let user = user.into();
        let mut parameters = vec![("user".to_string(), user.clone())];
        if let Some(db) = &database {
            parameters.push(("database".to_string(), db.clone()));
        }
        Self {
            user,
            database,
            parameters,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// The logical database requested by the client; PostgreSQL clients
    /// default it to the user name.
    pub fn database_name(&self) -> &str {
        match self.database.as_deref() {
            Some(db) if !db.is_empty() => db,
            _ => &self.user,
        }
    }

    /// Parameters that are echoed back as ParameterStatus after login.
    pub fn reported_parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("application_name"))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn client_encoding_is_supported(&self) -> bool {
        match self.parameter("client_encoding") {
            None => true,
            Some(encoding) => {
                let normalized = encoding.trim().trim_matches('\'').replace('-', "");
                normalized.eq_ignore_ascii_case("utf8") || normalized.eq_ignore_ascii_case("unicode")
            }
        }
    }
}

/// Logical database names become file names, so only a conservative
/// character set is accepted.
pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_defaults_to_user() {
        let packet = StartupPacket::new("alice", None);
        assert_eq!(packet.database_name(), "alice");
        let packet = StartupPacket::new("alice", Some("inventory".to_string()));
        assert_eq!(packet.database_name(), "inventory");
    }

    #[test]
    fn client_encoding_accepts_utf8_spellings() {
        let packet = StartupPacket::new("alice", None).with_parameter("client_encoding", "UTF-8");
        assert!(packet.client_encoding_is_supported());
        let packet = StartupPacket::new("alice", None).with_parameter("client_encoding", "'utf8'");
        assert!(packet.client_encoding_is_supported());
        let packet = StartupPacket::new("alice", None).with_parameter("client_encoding", "LATIN1");
        assert!(!packet.client_encoding_is_supported());
    }

    #[test]
    fn database_names_are_restricted() {
        assert!(is_valid_database_name("orders_2024"));
        assert!(is_valid_database_name("app-db"));
        assert!(!is_valid_database_name("../etc/passwd"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("a b"));
    }
}
