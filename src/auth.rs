/// SOCKS5 username/password credentials (RFC 1929)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    /// Create new credentials
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}
