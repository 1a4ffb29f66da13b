//! Broker and client configuration
//!
//! Settings come from `~/.ptybrokerrc` and are then overridden by the environment:
//! - PTYBROKER_SOCKET (socket path)
//! - PTYBROKER_SERVER (broker executable launched by attach-or-launch)
//! - PTYBROKER_REQUEST_TIMEOUT (milliseconds)
//! - PTYBROKER_LAUNCH_TIMEOUT (milliseconds to wait for a freshly spawned broker)
//! - PTYBROKER_CACHE_INTERVAL (milliseconds between background process cache refreshes)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the broker binary
pub const BROKER_BINARY_NAME: &str = "ptybrokerd";

/// Default round-trip timeout for launch and wait requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a freshly spawned broker gets to start listening
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default background refresh tick of the process cache
pub const DEFAULT_CACHE_INTERVAL: Duration = Duration::from_millis(500);

/// Settings shared by the broker, its clients and the process cache
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerConfig {
    pub socket_path: Option<PathBuf>,
    pub server_executable: Option<PathBuf>,
    pub request_timeout: Option<Duration>,
    pub launch_timeout: Option<Duration>,
    pub cache_interval: Option<Duration>,
}

impl BrokerConfig {
    /// Load `~/.ptybrokerrc` and apply environment overrides
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Get the path to .ptybrokerrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ptybrokerrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = BrokerConfig::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.set(&key, &unquote(&value));
            }
        }

        config
    }

    /// Apply overrides from a variable lookup (the process environment in practice)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in [
            "PTYBROKER_SOCKET",
            "PTYBROKER_SERVER",
            "PTYBROKER_REQUEST_TIMEOUT",
            "PTYBROKER_LAUNCH_TIMEOUT",
            "PTYBROKER_CACHE_INTERVAL",
        ] {
            if let Some(value) = lookup(key) {
                self.set(key, value.trim());
            }
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "PTYBROKER_SOCKET" if !value.is_empty() => {
                self.socket_path = Some(expand_home(value));
            }
            "PTYBROKER_SERVER" if !value.is_empty() => {
                self.server_executable = Some(expand_home(value));
            }
            "PTYBROKER_REQUEST_TIMEOUT" => {
                if let Some(d) = parse_millis(value) {
                    self.request_timeout = Some(d);
                }
            }
            "PTYBROKER_LAUNCH_TIMEOUT" => {
                if let Some(d) = parse_millis(value) {
                    self.launch_timeout = Some(d);
                }
            }
            "PTYBROKER_CACHE_INTERVAL" => {
                if let Some(d) = parse_millis(value) {
                    self.cache_interval = Some(d);
                }
            }
            _ => {}
        }
    }

    /// Client settings, falling back to defaults for anything unset
    pub fn client_config(&self) -> io::Result<ClientConfig> {
        let socket_path = match &self.socket_path {
            Some(path) => path.clone(),
            None => default_socket_path()?,
        };
        let server_executable = match &self.server_executable {
            Some(path) => path.clone(),
            None => default_server_executable()?,
        };
        Ok(ClientConfig {
            socket_path,
            server_executable,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            launch_timeout: self.launch_timeout.unwrap_or(DEFAULT_LAUNCH_TIMEOUT),
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            refresh_interval: self.cache_interval.unwrap_or(DEFAULT_CACHE_INTERVAL),
        }
    }
}

/// Settings for one [`MultiClient`](crate::broker::MultiClient)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Broker socket
    pub socket_path: PathBuf,
    /// Executable spawned by `attach_or_launch_server`
    pub server_executable: PathBuf,
    pub request_timeout: Duration,
    pub launch_timeout: Duration,
}

impl ClientConfig {
    /// Config for a socket path with default timeouts
    ///
    /// The server executable defaults to `ptybrokerd` next to the current executable,
    /// or to a bare `ptybrokerd` resolved through `PATH` when that cannot be determined.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            server_executable: default_server_executable()
                .unwrap_or_else(|_| PathBuf::from(BROKER_BINARY_NAME)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }

    pub fn with_server_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_executable = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }
}

/// Settings for the [`ProcessCache`](crate::process::ProcessCache)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How often the background refresher checks the needs-update flag
    pub refresh_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_CACHE_INTERVAL,
        }
    }
}

/// Create the broker directory with secure permissions
pub fn broker_dir() -> io::Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Could not determine home directory")
    })?;

    let dir = home.join(".ptybroker");

    if !dir.exists() {
        fs::create_dir(&dir)?;

        // Owner only
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&dir)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&dir, perms)?;
    }

    Ok(dir)
}

/// `~/.ptybroker/broker.sock`
pub fn default_socket_path() -> io::Result<PathBuf> {
    Ok(broker_dir()?.join("broker.sock"))
}

/// `ptybrokerd` next to the running executable
pub fn default_server_executable() -> io::Result<PathBuf> {
    let exe_path = std::env::current_exe()?;
    let exe_dir = exe_path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Cannot determine executable directory")
    })?;
    Ok(exe_dir.join(BROKER_BINARY_NAME))
}

/// Pid file written by the broker next to its socket
pub fn pid_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_file_name("broker.pid")
}

/// Log file a spawned broker's stderr is appended to
pub fn log_file_path(socket_path: &Path) -> PathBuf {
    socket_path.with_file_name("broker.log")
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_empty() {
        let config = BrokerConfig::parse("");
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.cache_config().refresh_interval, DEFAULT_CACHE_INTERVAL);
    }

    #[test]
    fn test_parse_rc_file() {
        let content = r#"
# broker settings
PTYBROKER_SOCKET="/tmp/broker-test.sock"
export PTYBROKER_SERVER='/opt/bin/ptybrokerd'
PTYBROKER_REQUEST_TIMEOUT=2500
PTYBROKER_CACHE_INTERVAL=100
"#;
        let config = BrokerConfig::parse(content);

        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/broker-test.sock")));
        assert_eq!(config.server_executable, Some(PathBuf::from("/opt/bin/ptybrokerd")));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.launch_timeout, None);
        assert_eq!(config.cache_interval, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let config = BrokerConfig::parse("PTYBROKER_REQUEST_TIMEOUT=soon\nNOT VALID=1\n");
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = BrokerConfig::parse("PTYBROKER_SOCKET=/tmp/a.sock\nPTYBROKER_LAUNCH_TIMEOUT=100");
        let env: HashMap<&str, &str> = [("PTYBROKER_SOCKET", "/tmp/b.sock")].into_iter().collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/b.sock")));
        assert_eq!(config.launch_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_client_config_uses_overrides() {
        let config = BrokerConfig {
            socket_path: Some(PathBuf::from("/tmp/x.sock")),
            server_executable: Some(PathBuf::from("/tmp/ptybrokerd")),
            request_timeout: Some(Duration::from_secs(1)),
            launch_timeout: None,
            cache_interval: None,
        };
        let client = config.client_config().unwrap();
        assert_eq!(client.socket_path, PathBuf::from("/tmp/x.sock"));
        assert_eq!(client.server_executable, PathBuf::from("/tmp/ptybrokerd"));
        assert_eq!(client.request_timeout, Duration::from_secs(1));
        assert_eq!(client.launch_timeout, DEFAULT_LAUNCH_TIMEOUT);
    }

    #[test]
    fn test_sibling_paths() {
        let socket = Path::new("/run/user/1000/ptybroker/broker.sock");
        assert_eq!(pid_file_path(socket), PathBuf::from("/run/user/1000/ptybroker/broker.pid"));
        assert_eq!(log_file_path(socket), PathBuf::from("/run/user/1000/ptybroker/broker.log"));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
