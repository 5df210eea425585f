//! Configuration for greylag.
//!
//! The configuration file is TOML, deserialized into `*Spec` structs and
//! then parsed into the runtime [`Config`].  The [`Config`] is immutable
//! once built; everything that changes at runtime lives in
//! [`Center`](crate::center::Center).

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::store::{StoreUrl, StoreUrlError};

//----------- Config -----------------------------------------------------------

/// The complete runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Process-level settings.
    pub daemon: DaemonConfig,

    /// Where and how to listen.
    pub listen: ListenConfig,

    /// The greylisting policy.
    pub greylist: GreyConfig,

    /// The auto-whitelist, if enabled.
    pub auto_whitelist: Option<AwlConfig>,

    /// The whitelist sources.
    pub whitelist: WhitelistConfig,
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Read(path.to_owned(), err.to_string()))?;
        let spec: Spec =
            toml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        spec.parse()
    }
}

/// Process-level settings.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Where to write the PID file, if anywhere.
    pub pid_file: Option<Utf8PathBuf>,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Seconds between maintenance sweeps.
    pub maintenance_interval: u64,
}

/// Logging settings.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// The minimum level to log.
    pub level: LogLevel,

    /// Where log output goes.
    pub target: LogTarget,
}

/// A minimum log level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// A log output target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output.
    Stdout,

    /// Standard error.
    Stderr,

    /// An append-only file.
    File(Utf8PathBuf),
}

/// Where and how to listen.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    /// The listening endpoint.
    pub endpoint: Endpoint,

    /// The most connections served at once.
    pub max_connections: usize,

    /// How long to wait for a client to finish its request.
    pub read_timeout: Duration,

    /// How long to wait for in-flight requests on shutdown.
    pub shutdown_grace: Duration,
}

/// A listening endpoint.
#[derive(Clone, Debug)]
pub enum Endpoint {
    /// A filesystem stream socket.
    Unix {
        /// The socket path; must not exist at bind time.
        path: Utf8PathBuf,

        /// The permission bits for the socket.
        mode: u32,
    },

    /// A TCP listener.
    Tcp {
        /// The resolved listen address.
        addr: SocketAddr,

        /// The listen backlog.
        backlog: u32,

        /// Whether to set SO_REUSEADDR.
        reuse_addr: bool,
    },
}

/// The greylisting policy.
#[derive(Clone, Debug)]
pub struct GreyConfig {
    /// The greylist store.
    pub store: StoreUrl,

    /// Seconds a new tuple must wait before it may pass.
    pub delay: i64,

    /// Seconds within which a retry proves the sender.
    pub retry_window: i64,

    /// Seconds after which an untouched entry expires.
    pub max_age: i64,

    /// Whether keys are stored as hex SHA-1.
    pub hash_keys: bool,

    /// The verb for deferrals.
    pub action: String,

    /// The deferral text; `{wait}` is the remaining wait in seconds.
    pub text: String,

    /// The PREPEND header template; `{delay}`, `{hostname}` and `{date}`
    /// are substituted.
    pub header: String,

    /// The name this host goes by in prepended headers.
    pub hostname: String,

    /// Whether this instance sweeps the greylist store.
    pub maintenance: bool,

    /// The prefix length for IPv4 remote normalization.
    pub mask_v4: u8,

    /// The prefix length for IPv6 remote normalization.
    pub mask_v6: u8,
}

/// The auto-whitelist.
#[derive(Clone, Debug)]
pub struct AwlConfig {
    /// The auto-whitelist store.
    pub store: StoreUrl,

    /// Passes after which a network is trusted outright.
    pub client_count: u64,

    /// Seconds after which an untouched entry expires.
    pub max_age: i64,

    /// Whether this instance sweeps the auto-whitelist store.
    pub maintenance: bool,
}

/// The whitelist sources.
#[derive(Clone, Debug)]
pub struct WhitelistConfig {
    /// Sources, loaded in order.
    pub sources: Vec<StoreUrl>,

    /// Whether raw regex entries are honored.
    pub allow_regex: bool,
}

//----------- Spec -------------------------------------------------------------

/// The configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
    /// Process-level settings.
    pub daemon: DaemonSpec,

    /// Where and how to listen.
    pub listen: ListenSpec,

    /// The greylisting policy.
    pub greylist: GreySpec,

    /// The auto-whitelist, if enabled.
    pub auto_whitelist: Option<AwlSpec>,

    /// The whitelist sources.
    pub whitelist: WhitelistSpec,
}

impl Spec {
    /// Parse and validate this specification.
    pub fn parse(self) -> Result<Config, ConfigError> {
        let auto_whitelist = match self.auto_whitelist {
            Some(awl) => Some(awl.parse(&self.greylist.store)?),
            None => None,
        };
        Ok(Config {
            daemon: self.daemon.parse()?,
            listen: self.listen.parse()?,
            greylist: self.greylist.parse()?,
            auto_whitelist,
            whitelist: self.whitelist.parse()?,
        })
    }
}

//----------- DaemonSpec -------------------------------------------------------

/// Process-level settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DaemonSpec {
    /// Where to write the PID file.
    pid_file: Option<Utf8PathBuf>,

    /// Logging settings.
    logging: LoggingSpec,

    /// Seconds between maintenance sweeps.
    maintenance_interval: u64,
}

impl DaemonSpec {
    fn parse(self) -> Result<DaemonConfig, ConfigError> {
        Ok(DaemonConfig {
            pid_file: self.pid_file,
            logging: self.logging.parse()?,
            maintenance_interval: self.maintenance_interval,
        })
    }
}

impl Default for DaemonSpec {
    fn default() -> Self {
        Self {
            pid_file: None,
            logging: Default::default(),
            maintenance_interval: 1800,
        }
    }
}

//----------- LoggingSpec ------------------------------------------------------

/// Logging settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LoggingSpec {
    /// The minimum level to log.
    level: LogLevel,

    /// Where log output goes: `"stdout"`, `"stderr"`, or `{ file = PATH }`.
    target: LogTargetSpec,
}

impl LoggingSpec {
    fn parse(self) -> Result<LoggingConfig, ConfigError> {
        let target = match self.target {
            LogTargetSpec::Stream(StreamName::Stdout) => LogTarget::Stdout,
            LogTargetSpec::Stream(StreamName::Stderr) => LogTarget::Stderr,
            LogTargetSpec::File { file } => LogTarget::File(file),
        };
        Ok(LoggingConfig {
            level: self.level,
            target,
        })
    }
}

/// A log target as written in the file.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
enum LogTargetSpec {
    /// A standard stream, by name.
    Stream(StreamName),

    /// An append-only file.
    File {
        /// The file path.
        file: Utf8PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
enum StreamName {
    Stdout,
    Stderr,
}

impl Default for LogTargetSpec {
    fn default() -> Self {
        Self::Stream(StreamName::Stderr)
    }
}

//----------- ListenSpec -------------------------------------------------------

/// Where and how to listen.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ListenSpec {
    /// The endpoint type: `"unix"` or `"tcp"`.
    #[serde(rename = "type")]
    kind: String,

    /// The socket path (unix only).
    path: Option<Utf8PathBuf>,

    /// The socket permission bits (unix only).
    mode: Option<u32>,

    /// The listen address (tcp only).
    addr: Option<String>,

    /// The listen backlog (tcp only).
    backlog: Option<u32>,

    /// Whether to set SO_REUSEADDR (tcp only).
    reuse_addr: Option<bool>,

    /// The most connections served at once.
    max_connections: usize,

    /// Seconds to wait for a client to finish its request.
    read_timeout: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    shutdown_grace: u64,
}

impl ListenSpec {
    fn parse(self) -> Result<ListenConfig, ConfigError> {
        let endpoint = match self.kind.as_str() {
            "unix" => {
                if self.addr.is_some() || self.backlog.is_some() || self.reuse_addr.is_some() {
                    return Err(ConfigError::ListenConflict(
                        "'addr', 'backlog' and 'reuse-addr' apply to TCP listeners only",
                    ));
                }
                let mode = self.mode.unwrap_or(0o660);
                if mode > 0o777 {
                    return Err(ConfigError::InvalidMode(mode));
                }
                Endpoint::Unix {
                    path: self
                        .path
                        .unwrap_or_else(|| "/run/greylag/policy.sock".into()),
                    mode,
                }
            }

            "tcp" => {
                if self.path.is_some() || self.mode.is_some() {
                    return Err(ConfigError::ListenConflict(
                        "'path' and 'mode' apply to unix listeners only",
                    ));
                }
                let addr = self.addr.as_deref().unwrap_or("127.0.0.1:10023");
                let addr = addr
                    .to_socket_addrs()
                    .map_err(|err| ConfigError::InvalidListenAddr(addr.into(), err.to_string()))?
                    .next()
                    .ok_or_else(|| {
                        ConfigError::InvalidListenAddr(addr.into(), "no addresses".into())
                    })?;
                Endpoint::Tcp {
                    addr,
                    backlog: self.backlog.unwrap_or(128),
                    reuse_addr: self.reuse_addr.unwrap_or(true),
                }
            }

            other => return Err(ConfigError::UnknownListenType(other.into())),
        };

        Ok(ListenConfig {
            endpoint,
            max_connections: self.max_connections,
            read_timeout: Duration::from_secs(self.read_timeout),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        })
    }
}

impl Default for ListenSpec {
    fn default() -> Self {
        Self {
            kind: "unix".into(),
            path: None,
            mode: None,
            addr: None,
            backlog: None,
            reuse_addr: None,
            max_connections: 64,
            read_timeout: 10,
            shutdown_grace: 10,
        }
    }
}

//----------- GreySpec ---------------------------------------------------------

/// The greylisting policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GreySpec {
    /// The greylist store URL.
    store: String,

    /// Seconds a new tuple must wait before it may pass.
    delay: u64,

    /// Seconds within which a retry proves the sender.
    retry_window: u64,

    /// Seconds after which an untouched entry expires.
    max_age: u64,

    /// Whether keys are stored as hex SHA-1.
    hash_keys: bool,

    /// The verb for deferrals.
    action: String,

    /// The deferral text.
    text: String,

    /// The PREPEND header template.
    header: String,

    /// The name this host goes by in prepended headers; defaults to the
    /// machine hostname.
    hostname: Option<String>,

    /// Whether this instance sweeps the greylist store.
    maintenance: bool,

    /// The prefix length for IPv4 remote normalization.
    mask_v4: u8,

    /// The prefix length for IPv6 remote normalization.
    mask_v6: u8,
}

impl GreySpec {
    fn parse(self) -> Result<GreyConfig, ConfigError> {
        let store = parse_store_url(&self.store)?;
        if self.mask_v4 > 32 {
            return Err(ConfigError::InvalidMask("mask-v4", self.mask_v4, 32));
        }
        if self.mask_v6 > 128 {
            return Err(ConfigError::InvalidMask("mask-v6", self.mask_v6, 128));
        }

        let hostname = match self.hostname {
            Some(hostname) => hostname,
            None => hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".into()),
        };

        Ok(GreyConfig {
            store,
            delay: self.delay as i64,
            retry_window: self.retry_window as i64,
            max_age: self.max_age as i64,
            hash_keys: self.hash_keys,
            action: self.action,
            text: self.text,
            header: self.header,
            hostname,
            maintenance: self.maintenance,
            mask_v4: self.mask_v4,
            mask_v6: self.mask_v6,
        })
    }
}

impl Default for GreySpec {
    fn default() -> Self {
        const TWO_DAYS: u64 = 2 * 24 * 3600;
        const FIVE_WEEKS: u64 = 35 * 24 * 3600;
        Self {
            store: "sled:///var/lib/greylag/greylist".into(),
            delay: 300,
            retry_window: TWO_DAYS,
            max_age: FIVE_WEEKS,
            hash_keys: true,
            action: "DEFER_IF_PERMIT".into(),
            text: "Greylisted, please retry in {wait} seconds".into(),
            header: "X-Greylist: delayed {delay} seconds at {hostname}; {date}".into(),
            hostname: None,
            maintenance: true,
            mask_v4: 20,
            mask_v6: 64,
        }
    }
}

//----------- AwlSpec ----------------------------------------------------------

/// The auto-whitelist.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct AwlSpec {
    /// The auto-whitelist store URL.
    store: String,

    /// Passes after which a network is trusted outright.
    client_count: u64,

    /// Seconds after which an untouched entry expires.
    max_age: u64,

    /// Whether this instance sweeps the auto-whitelist store.
    maintenance: bool,
}

impl AwlSpec {
    fn parse(self, grey_store: &str) -> Result<AwlConfig, ConfigError> {
        let store = parse_store_url(&self.store)?;
        // Sharing one database between the greylist and the auto-whitelist
        // would mix the two key spaces.
        if self.store == grey_store {
            return Err(ConfigError::SharedStore(store.to_string()));
        }
        Ok(AwlConfig {
            store,
            client_count: self.client_count,
            max_age: self.max_age as i64,
            maintenance: self.maintenance,
        })
    }
}

impl Default for AwlSpec {
    fn default() -> Self {
        Self {
            store: "sled:///var/lib/greylag/auto-whitelist".into(),
            client_count: 10,
            max_age: 35 * 24 * 3600,
            maintenance: true,
        }
    }
}

//----------- WhitelistSpec ----------------------------------------------------

/// The whitelist sources.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct WhitelistSpec {
    /// Sources, loaded in order.
    sources: Vec<String>,

    /// Whether raw regex entries are honored.
    allow_regex: bool,
}

impl WhitelistSpec {
    fn parse(self) -> Result<WhitelistConfig, ConfigError> {
        let sources = self
            .sources
            .iter()
            .map(|source| StoreUrl::parse(source).map_err(ConfigError::Store))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WhitelistConfig {
            sources,
            allow_regex: self.allow_regex,
        })
    }
}

/// Parse a store URL that must be writable.
fn parse_store_url(input: &str) -> Result<StoreUrl, ConfigError> {
    let url = StoreUrl::parse(input).map_err(ConfigError::Store)?;
    if url.is_read_only() {
        return Err(ConfigError::ReadOnlyStore(url.to_string()));
    }
    Ok(url)
}

//----------- ConfigError ------------------------------------------------------

/// An error in the configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be read.
    Read(Utf8PathBuf, String),

    /// The file is not valid TOML (or has unknown keys).
    Parse(String),

    /// The listen type is not `unix` or `tcp`.
    UnknownListenType(String),

    /// Options for the other listener type were given.
    ListenConflict(&'static str),

    /// The TCP listen address did not resolve.
    InvalidListenAddr(String, String),

    /// The socket mode has bits beyond 0o777.
    InvalidMode(u32),

    /// A network mask is out of range.
    InvalidMask(&'static str, u8, u8),

    /// A store URL could not be parsed.
    Store(StoreUrlError),

    /// A read-only URL was given for a writable store.
    ReadOnlyStore(String),

    /// The greylist and the auto-whitelist share one database.
    SharedStore(String),
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(path, err) => write!(f, "cannot read '{path}': {err}"),
            Self::Parse(err) => write!(f, "{err}"),
            Self::UnknownListenType(kind) => {
                write!(f, "unknown listen type '{kind}' (expected 'unix' or 'tcp')")
            }
            Self::ListenConflict(msg) => f.write_str(msg),
            Self::InvalidListenAddr(addr, err) => {
                write!(f, "cannot resolve listen address '{addr}': {err}")
            }
            Self::InvalidMode(mode) => write!(f, "invalid socket mode {mode:o}"),
            Self::InvalidMask(name, got, max) => {
                write!(f, "{name} is {got}, but at most {max} is possible")
            }
            Self::Store(err) => err.fmt(f),
            Self::ReadOnlyStore(url) => {
                write!(f, "'{url}' is read-only and cannot back a store")
            }
            Self::SharedStore(url) => write!(
                f,
                "the greylist and the auto-whitelist cannot share the database '{url}'"
            ),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ConfigError, Endpoint, LogTarget, Spec};

    fn parse(toml: &str) -> Result<super::Config, ConfigError> {
        toml::from_str::<Spec>(toml).unwrap().parse()
    }

    #[test]
    fn defaults_stand_alone() {
        let config = Spec::default().parse().unwrap();
        assert!(matches!(
            config.listen.endpoint,
            Endpoint::Unix { mode: 0o660, .. }
        ));
        assert_eq!(config.greylist.delay, 300);
        assert_eq!(config.greylist.retry_window, 172800);
        assert_eq!(config.greylist.max_age, 3024000);
        assert!(config.greylist.hash_keys);
        assert!(config.auto_whitelist.is_none());
        assert_eq!(config.daemon.maintenance_interval, 1800);
        assert_eq!(config.daemon.logging.target, LogTarget::Stderr);
    }

    #[test]
    fn a_full_file_parses() {
        let config = parse(
            r#"
            [daemon]
            pid-file = "/run/greylagd.pid"
            maintenance-interval = 600

            [daemon.logging]
            level = "debug"
            target = { file = "/var/log/greylagd.log" }

            [listen]
            type = "tcp"
            addr = "127.0.0.1:10023"
            backlog = 64
            max-connections = 16
            read-timeout = 5

            [greylist]
            store = "sled:///tmp/grey"
            delay = 60
            hostname = "mx.test"
            mask-v4 = 24

            [auto-whitelist]
            store = "redis-tcp://127.0.0.1:6379/?db=3"
            client-count = 5
            maintenance = false

            [whitelist]
            sources = ["file:///etc/greylag/wl.json"]
            allow-regex = true
            "#,
        )
        .unwrap();

        match config.listen.endpoint {
            Endpoint::Tcp { addr, backlog, reuse_addr } => {
                assert_eq!(addr.port(), 10023);
                assert_eq!(backlog, 64);
                assert!(reuse_addr);
            }
            other => panic!("unexpected endpoint: {other:?}"),
        }
        assert_eq!(config.listen.max_connections, 16);
        assert_eq!(config.listen.read_timeout, Duration::from_secs(5));
        assert_eq!(config.greylist.hostname, "mx.test");
        let awl = config.auto_whitelist.unwrap();
        assert_eq!(awl.client_count, 5);
        assert!(!awl.maintenance);
        assert_eq!(config.whitelist.sources.len(), 1);
        assert!(config.whitelist.allow_regex);
    }

    #[test]
    fn octal_socket_modes_parse() {
        let config = parse(
            r#"
            [listen]
            type = "unix"
            path = "/tmp/policy.sock"
            mode = 0o600
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.listen.endpoint,
            Endpoint::Unix { mode: 0o600, .. }
        ));
    }

    #[test]
    fn conflicting_listen_options_are_fatal() {
        assert!(matches!(
            parse("[listen]\ntype = \"unix\"\naddr = \"1.2.3.4:5\""),
            Err(ConfigError::ListenConflict(_))
        ));
        assert!(matches!(
            parse("[listen]\ntype = \"tcp\"\npath = \"/tmp/sock\""),
            Err(ConfigError::ListenConflict(_))
        ));
        assert!(matches!(
            parse("[listen]\ntype = \"sctp\""),
            Err(ConfigError::UnknownListenType(_))
        ));
    }

    #[test]
    fn read_only_and_shared_stores_are_fatal() {
        assert!(matches!(
            parse("[greylist]\nstore = \"file:///tmp/grey\""),
            Err(ConfigError::ReadOnlyStore(_))
        ));

        let shared = r#"
            [greylist]
            store = "redis-tcp://127.0.0.1:6379"

            [auto-whitelist]
            store = "redis-tcp://127.0.0.1:6379"
        "#;
        assert!(matches!(parse(shared), Err(ConfigError::SharedStore(_))));
    }

    #[test]
    fn masks_are_bounded() {
        assert!(matches!(
            parse("[greylist]\nstore = \"sled:///tmp/g\"\nmask-v4 = 33"),
            Err(ConfigError::InvalidMask("mask-v4", 33, 32))
        ));
    }
}
