//! The key-value stores behind the greylist and the auto-whitelist.
//!
//! Every backend offers the same narrow capability: `get`, `update`,
//! `delete`, `save` and `scan`.  Which backend a store uses is decided by
//! the scheme of its configured URL; see [`StoreUrl`].

use std::collections::HashMap;
use std::fmt;

use camino::Utf8PathBuf;
use url::Url;

pub use self::disk::DiskStore;
pub use self::redis::RedisStore;

mod disk;
mod redis;

//----------- Store ------------------------------------------------------------

/// A handle to an open key-value store.
///
/// Handles are cheap to clone and safe to share between the connection
/// workers and the maintenance sweeper.
#[derive(Clone, Debug)]
pub enum Store {
    /// An embedded on-disk store.
    Disk(DiskStore),

    /// A networked Redis store.
    Redis(RedisStore),
}

impl Store {
    /// Open the store behind a URL.
    ///
    /// `file://` URLs are whitelist sources, not stores; they are rejected
    /// here as well as by configuration validation.
    pub async fn open(url: &StoreUrl) -> Result<Self, StoreError> {
        match url {
            StoreUrl::Sled { path } => Ok(Self::Disk(DiskStore::open(path)?)),
            StoreUrl::RedisTcp { .. } | StoreUrl::RedisUnix { .. } => {
                Ok(Self::Redis(RedisStore::connect(url).await?))
            }
            StoreUrl::File { .. } => Err(StoreError::ReadOnly),
        }
    }

    /// Look up a key.
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Disk(store) => store.get(key),
            Self::Redis(store) => store.get(key).await,
        }
    }

    /// Create or overwrite a key.
    pub async fn update(&self, key: &str, value: &str) -> Result<(), StoreError> {
        match self {
            Self::Disk(store) => store.update(key, value),
            Self::Redis(store) => store.update(key, value).await,
        }
    }

    /// Delete a key.  Deleting an absent key is a success.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Disk(store) => store.delete(key),
            Self::Redis(store) => store.delete(key).await,
        }
    }

    /// Durability barrier.
    ///
    /// A no-op for backends that persist on their own schedule.
    pub async fn save(&self) -> Result<(), StoreError> {
        match self {
            Self::Disk(store) => store.save().await,
            Self::Redis(_) => Ok(()),
        }
    }

    /// Visit every entry and collect the keys accepted by the predicate.
    pub async fn scan<F>(&self, pred: F) -> Result<Vec<String>, StoreError>
    where
        F: Fn(&str, &str) -> bool,
    {
        match self {
            Self::Disk(store) => store.scan(pred),
            Self::Redis(store) => store.scan(pred).await,
        }
    }

    /// Fetch the members of a Redis list, for whitelist sources.
    pub async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Redis(store) => store.list(key).await,
            Self::Disk(_) => Err(StoreError::ReadOnly),
        }
    }

    /// Fetch a Redis hash as a field map, for whitelist sources.
    pub async fn hash(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self {
            Self::Redis(store) => store.hash(key).await,
            Self::Disk(_) => Err(StoreError::ReadOnly),
        }
    }
}

//----------- Entry ------------------------------------------------------------

/// A stored greylist or auto-whitelist value.
///
/// The wire form is `"<count>,<last_seen>"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// How often the tuple has been seen passing (0 = recorded, not passed).
    pub count: u64,

    /// POSIX timestamp of the last update.
    pub last_seen: i64,
}

impl Entry {
    /// Parse a stored value.
    ///
    /// Returns `None` for anything malformed; callers treat that the same
    /// as an absent key.
    pub fn parse(value: &str) -> Option<Self> {
        let (count, last_seen) = value.split_once(',')?;
        Some(Self {
            count: count.trim().parse().ok()?,
            last_seen: last_seen.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.count, self.last_seen)
    }
}

//----------- StoreUrl ---------------------------------------------------------

/// A parsed store or whitelist source URL.
///
/// The scheme selects the backend: `sled:///PATH` for the embedded store,
/// `redis-tcp://HOST:PORT[/?db=N]` and `redis-unix://[user:pw@]/PATH[?db=N]`
/// for Redis, and `file:///PATH` for read-only whitelist source files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreUrl {
    /// An embedded on-disk store.
    Sled {
        /// The directory holding the store.
        path: Utf8PathBuf,
    },

    /// A Redis server over TCP.
    RedisTcp {
        /// The server host.
        host: String,

        /// The server port.
        port: u16,

        /// The database index.
        db: i64,

        /// An optional user name.
        username: Option<String>,

        /// An optional password.
        password: Option<String>,
    },

    /// A Redis server over a Unix stream socket.
    RedisUnix {
        /// The socket path.
        path: Utf8PathBuf,

        /// The database index.
        db: i64,

        /// An optional user name.
        username: Option<String>,

        /// An optional password.
        password: Option<String>,
    },

    /// A read-only local file (whitelist sources only).
    File {
        /// The file path.
        path: Utf8PathBuf,
    },
}

impl StoreUrl {
    /// Parse a store URL.
    pub fn parse(input: &str) -> Result<Self, StoreUrlError> {
        // WHATWG URLs reject credentials next to an empty host, so the
        // `redis-unix://user:pw@/path` form is parsed by hand.
        if let Some(rest) = input.strip_prefix("redis-unix://") {
            return Self::parse_redis_unix(input, rest);
        }

        let url =
            Url::parse(input).map_err(|err| StoreUrlError::Invalid(input.into(), err.to_string()))?;

        match url.scheme() {
            "sled" => Ok(Self::Sled {
                path: Self::require_path(&url, input)?,
            }),

            "redis-tcp" => {
                let host = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| StoreUrlError::MissingHost(input.into()))?
                    .to_string();
                Ok(Self::RedisTcp {
                    host,
                    port: url.port().unwrap_or(6379),
                    db: Self::db_index(&url, input)?,
                    username: Self::username(&url),
                    password: url.password().map(str::to_string),
                })
            }

            "file" => Ok(Self::File {
                path: Self::require_path(&url, input)?,
            }),

            scheme => Err(StoreUrlError::UnknownScheme(scheme.into())),
        }
    }

    fn parse_redis_unix(input: &str, rest: &str) -> Result<Self, StoreUrlError> {
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let (userinfo, path) = match rest.split_once('@') {
            Some((userinfo, path)) => (Some(userinfo), path),
            None => (None, rest),
        };
        if !path.starts_with('/') {
            return Err(StoreUrlError::MissingPath(input.into()));
        }

        let (username, password) = match userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, pw)) => (
                    (!user.is_empty()).then(|| user.to_string()),
                    Some(pw.to_string()),
                ),
                None => ((!info.is_empty()).then(|| info.to_string()), None),
            },
            None => (None, None),
        };

        let mut db = 0;
        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == "db" {
                db = value
                    .parse()
                    .map_err(|_| StoreUrlError::InvalidDb(input.into(), value.into()))?;
            }
        }

        Ok(Self::RedisUnix {
            path: Utf8PathBuf::from(path),
            db,
            username,
            password,
        })
    }

    /// Whether this URL refers to a read-only source.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    fn require_path(url: &Url, input: &str) -> Result<Utf8PathBuf, StoreUrlError> {
        let path = url.path();
        if path.is_empty() || path == "/" {
            return Err(StoreUrlError::MissingPath(input.into()));
        }
        Ok(Utf8PathBuf::from(path))
    }

    fn db_index(url: &Url, input: &str) -> Result<i64, StoreUrlError> {
        match url.query_pairs().find(|(key, _)| key == "db") {
            Some((_, value)) => value
                .parse()
                .map_err(|_| StoreUrlError::InvalidDb(input.into(), value.into_owned())),
            None => Ok(0),
        }
    }

    fn username(url: &Url) -> Option<String> {
        let name = url.username();
        (!name.is_empty()).then(|| name.to_string())
    }
}

//--- Display
//
// The rendered form is safe for logs: the password segment is replaced by
// the literal word `password`.

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sled { path } => write!(f, "sled://{path}"),
            Self::RedisTcp {
                host,
                port,
                db,
                username,
                password,
            } => {
                f.write_str("redis-tcp://")?;
                fmt_userinfo(f, username.as_deref(), password.is_some())?;
                write!(f, "{host}:{port}")?;
                if *db != 0 {
                    write!(f, "/?db={db}")?;
                }
                Ok(())
            }
            Self::RedisUnix {
                path,
                db,
                username,
                password,
            } => {
                f.write_str("redis-unix://")?;
                fmt_userinfo(f, username.as_deref(), password.is_some())?;
                write!(f, "{path}")?;
                if *db != 0 {
                    write!(f, "?db={db}")?;
                }
                Ok(())
            }
            Self::File { path } => write!(f, "file://{path}"),
        }
    }
}

fn fmt_userinfo(
    f: &mut fmt::Formatter<'_>,
    username: Option<&str>,
    has_password: bool,
) -> fmt::Result {
    match (username, has_password) {
        (Some(name), true) => write!(f, "{name}:password@"),
        (Some(name), false) => write!(f, "{name}@"),
        (None, true) => f.write_str(":password@"),
        (None, false) => Ok(()),
    }
}

//----------- StoreUrlError ----------------------------------------------------

/// An error parsing a store URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreUrlError {
    /// The URL could not be parsed at all.
    Invalid(String, String),

    /// The scheme does not name a known backend.
    UnknownScheme(String),

    /// A path-based URL is missing its path.
    MissingPath(String),

    /// A TCP URL is missing its host.
    MissingHost(String),

    /// The `db` query parameter is not an integer.
    InvalidDb(String, String),
}

impl std::error::Error for StoreUrlError {}

impl fmt::Display for StoreUrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(url, err) => write!(f, "invalid store URL '{url}': {err}"),
            Self::UnknownScheme(scheme) => write!(f, "unknown store URL scheme '{scheme}'"),
            Self::MissingPath(url) => write!(f, "store URL '{url}' is missing a path"),
            Self::MissingHost(url) => write!(f, "store URL '{url}' is missing a host"),
            Self::InvalidDb(url, db) => {
                write!(f, "store URL '{url}' has a non-integer database index '{db}'")
            }
        }
    }
}

//----------- StoreError -------------------------------------------------------

/// An error from a store operation.
#[derive(Debug)]
pub enum StoreError {
    /// The embedded backend failed.
    Disk(sled::Error),

    /// The networked backend failed.
    Redis(::redis::RedisError),

    /// The URL names a read-only source, which cannot back a store.
    ReadOnly,
}

impl std::error::Error for StoreError {}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk(err) => write!(f, "disk store: {err}"),
            Self::Redis(err) => write!(f, "redis store: {err}"),
            Self::ReadOnly => f.write_str("a read-only source cannot back a store"),
        }
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Disk(err)
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Redis(err)
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::{Entry, StoreUrl, StoreUrlError};

    #[test]
    fn entry_round_trip() {
        let entry = Entry::parse("3,1700000000").unwrap();
        assert_eq!(
            entry,
            Entry {
                count: 3,
                last_seen: 1700000000
            }
        );
        assert_eq!(entry.to_string(), "3,1700000000");
    }

    #[test]
    fn entry_malformed() {
        assert_eq!(Entry::parse(""), None);
        assert_eq!(Entry::parse("12"), None);
        assert_eq!(Entry::parse("a,b"), None);
        assert_eq!(Entry::parse("-1,100"), None);
    }

    #[test]
    fn parse_sled() {
        let url = StoreUrl::parse("sled:///var/lib/greylag/grey").unwrap();
        assert_eq!(
            url,
            StoreUrl::Sled {
                path: "/var/lib/greylag/grey".into()
            }
        );
        assert_eq!(url.to_string(), "sled:///var/lib/greylag/grey");
    }

    #[test]
    fn parse_redis_tcp() {
        let url = StoreUrl::parse("redis-tcp://cache.test:6380/?db=2").unwrap();
        assert_eq!(
            url,
            StoreUrl::RedisTcp {
                host: "cache.test".into(),
                port: 6380,
                db: 2,
                username: None,
                password: None,
            }
        );
    }

    #[test]
    fn parse_redis_unix_with_password() {
        let url = StoreUrl::parse("redis-unix://grey:hunter2@/run/redis.sock?db=1").unwrap();
        match &url {
            StoreUrl::RedisUnix {
                path,
                db,
                username,
                password,
            } => {
                assert_eq!(path, "/run/redis.sock");
                assert_eq!(*db, 1);
                assert_eq!(username.as_deref(), Some("grey"));
                assert_eq!(password.as_deref(), Some("hunter2"));
            }
            other => panic!("unexpected URL: {other:?}"),
        }
    }

    #[test]
    fn password_is_elided_from_display() {
        let url = StoreUrl::parse("redis-tcp://:hunter2@cache.test:6379").unwrap();
        let shown = url.to_string();
        assert!(!shown.contains("hunter2"), "{shown}");
        assert_eq!(shown, "redis-tcp://:password@cache.test:6379");
    }

    #[test]
    fn unknown_scheme() {
        assert_eq!(
            StoreUrl::parse("gdbm:///var/lib/grey.db"),
            Err(StoreUrlError::UnknownScheme("gdbm".into()))
        );
    }
}
