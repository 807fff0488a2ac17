use std::path::PathBuf;
use std::time::Duration;

/// A remote account the pool can dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    pub sudo: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Key { private_key_path: PathBuf },
    Agent,
    /// Accepted in configuration but refused at dial time: primary password
    /// authentication would need interactive input.
    Password,
}

impl Target {
    /// Pool key, `user@host:port`.
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub dial_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(15)),
            inactivity_timeout: None,
        }
    }
}
