use std::fmt::{Display, Formatter};

use tollgate_core::{AppResult, NonEmptyString};

/// Stable coordination-store key of one quota domain.
///
/// Formatted `namespace:server` for server-wide scopes and
/// `namespace:server:group` for endpoint-group scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Creates the key of a scope shared by every request to one upstream server.
    pub fn server(namespace: &str, server: &str) -> AppResult<Self> {
        let namespace = NonEmptyString::new(namespace)?;
        let server = NonEmptyString::new(server)?;
        Ok(Self(format!("{namespace}:{server}")))
    }

    /// Creates the key of a scope shared by one endpoint group on one server.
    pub fn group(namespace: &str, server: &str, group: &str) -> AppResult<Self> {
        let server_key = Self::server(namespace, server)?;
        let group = NonEmptyString::new(group)?;
        Ok(Self(format!("{}:{group}", server_key.0)))
    }

    /// Returns the key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Returns the ledger key of this scope's window with the given span.
    #[must_use]
    pub fn window_key(&self, span_seconds: u32) -> String {
        format!("{}:{span_seconds}", self.0)
    }
}

impl Display for ScopeKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}
