//! The whitelists.
//!
//! Four matchers are kept per set: IPv4 networks, IPv6 networks,
//! client-name patterns and recipient patterns.  A set is immutable; a
//! reload builds a complete new set from every configured source and
//! publishes it with a single [`ArcSwap`](arc_swap::ArcSwap) store, so
//! readers always observe either the old or the new set in full.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::{fmt, fs, io};

use camino::Utf8Path;
use ipnet::{Ipv4Net, Ipv6Net};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::center::Center;
use crate::config::Config;
use crate::request::Request;
use crate::store::{Store, StoreError, StoreUrl};

/// The root list naming the whitelist sub-lists in a networked source.
const ROOT_LIST: &str = "whitelists";

//----------- Whitelists -------------------------------------------------------

/// One immutable generation of the whitelist set.
#[derive(Debug, Default)]
pub struct Whitelists {
    /// Whitelisted IPv4 networks.
    v4_nets: Vec<Ipv4Net>,

    /// Whitelisted IPv6 networks.
    v6_nets: Vec<Ipv6Net>,

    /// Patterns over the client's reverse-DNS name.
    client_names: Vec<Regex>,

    /// Patterns over the envelope recipient.
    recipients: Vec<Regex>,
}

impl Whitelists {
    /// A set that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether any matcher accepts the request.
    ///
    /// Checked in order: IPv4 network, IPv6 network, client name,
    /// recipient; the first hit wins.
    pub fn matches(&self, request: &Request) -> bool {
        if let Ok(addr) = request.client_address().parse::<IpAddr>() {
            let hit = match addr {
                IpAddr::V4(addr) => self.v4_nets.iter().any(|net| net.contains(&addr)),
                IpAddr::V6(addr) => self.v6_nets.iter().any(|net| net.contains(&addr)),
            };
            if hit {
                return true;
            }
        }

        let name = request.client_name();
        if self.client_names.iter().any(|re| re.is_match(name)) {
            return true;
        }

        let recipient = request.recipient();
        self.recipients.iter().any(|re| re.is_match(recipient))
    }

    /// The number of entries across all four matchers.
    pub fn len(&self) -> usize {
        self.v4_nets.len() + self.v6_nets.len() + self.client_names.len() + self.recipients.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//----------- Loading ----------------------------------------------------------

/// Build a fresh set from every configured source.
///
/// A failing source is logged and skipped; the load completes with
/// whatever succeeded.
pub async fn load(config: &Config) -> Whitelists {
    let mut builder = Builder::default();
    for source in &config.whitelist.sources {
        match builder.load_source(source, config.whitelist.allow_regex).await {
            Ok(()) => debug!("Loaded whitelist source '{source}'"),
            Err(err) => warn!("Skipping whitelist source '{source}': {err}"),
        }
    }
    builder.set
}

/// Rebuild the whitelists and publish the new set.
///
/// In-flight requests keep matching against the old set; the swap itself
/// is a single atomic pointer store.
pub async fn reload(center: Arc<Center>) {
    let fresh = load(&center.config).await;
    info!("Reloaded whitelists ({} entries)", fresh.len());
    center.whitelists.store(Arc::new(fresh));
}

/// Accumulates matchers while sources load.
#[derive(Default)]
struct Builder {
    /// The set under construction.
    set: Whitelists,
}

impl Builder {
    async fn load_source(
        &mut self,
        source: &StoreUrl,
        allow_regex: bool,
    ) -> Result<(), SourceError> {
        match source {
            StoreUrl::File { path } => self.load_file(path, allow_regex),
            StoreUrl::RedisTcp { .. } | StoreUrl::RedisUnix { .. } => {
                self.load_redis(source, allow_regex).await
            }
            StoreUrl::Sled { .. } => Err(SourceError::Unsupported),
        }
    }

    /// Load a JSON file: a top-level mapping of list names to entry arrays.
    fn load_file(&mut self, path: &Utf8Path, allow_regex: bool) -> Result<(), SourceError> {
        let text = fs::read_to_string(path)?;
        let lists: HashMap<String, Vec<RawEntry>> = serde_json::from_str(&text)?;
        for (name, entries) in lists {
            for entry in entries {
                self.add(&name, entry, allow_regex);
            }
        }
        Ok(())
    }

    /// Load a networked source: the `whitelists` root list names sub-lists,
    /// each sub-list names entry hashes with the same fields as a file
    /// entry.
    async fn load_redis(&mut self, url: &StoreUrl, allow_regex: bool) -> Result<(), SourceError> {
        let store = Store::open(url).await?;
        for list in store.list(ROOT_LIST).await? {
            for entry_key in store.list(&list).await? {
                let fields = store.hash(&entry_key).await?;
                match RawEntry::from_fields(&fields) {
                    Some(entry) => self.add(&list, entry, allow_regex),
                    None => warn!("Whitelist entry '{entry_key}' has no type; ignoring it"),
                }
            }
        }
        Ok(())
    }

    /// Fold one entry into the set, skipping anything malformed.
    fn add(&mut self, origin: &str, entry: RawEntry, allow_regex: bool) {
        match entry.kind.as_str() {
            "ipv4_net" => match entry.v4_net() {
                Some(net) => self.set.v4_nets.push(net),
                None => warn!("Ignoring malformed ipv4_net entry in '{origin}': {entry:?}"),
            },

            "ipv6_net" => match entry.v6_net() {
                Some(net) => self.set.v6_nets.push(net),
                None => warn!("Ignoring malformed ipv6_net entry in '{origin}': {entry:?}"),
            },

            "recipient_literal" => {
                match entry.recipient.as_deref().map(compile_recipient_literal) {
                    Some(Ok(re)) => self.set.recipients.push(re),
                    Some(Err(err)) => {
                        warn!("Ignoring malformed recipient_literal in '{origin}': {err}");
                    }
                    None => warn!("Ignoring recipient_literal without recipient in '{origin}'"),
                }
            }

            "recipient_regex" | "remote_regex" if !allow_regex => {
                warn!(
                    "Ignoring {} entry in '{origin}': regex whitelisting is disabled",
                    entry.kind
                );
            }

            "recipient_regex" => match entry.regex.as_deref().map(compile_anchored) {
                Some(Ok(re)) => self.set.recipients.push(re),
                Some(Err(err)) => {
                    warn!("Ignoring malformed recipient_regex in '{origin}': {err}");
                }
                None => warn!("Ignoring recipient_regex without regex in '{origin}'"),
            },

            "remote_regex" => match entry.regex.as_deref().map(compile_anchored) {
                Some(Ok(re)) => self.set.client_names.push(re),
                Some(Err(err)) => warn!("Ignoring malformed remote_regex in '{origin}': {err}"),
                None => warn!("Ignoring remote_regex without regex in '{origin}'"),
            },

            other => warn!("Ignoring whitelist entry of unknown type '{other}' in '{origin}'"),
        }
    }
}

//----------- RawEntry ---------------------------------------------------------

/// A whitelist entry as it appears in a source, before validation.
#[derive(Clone, Debug, Deserialize)]
struct RawEntry {
    /// The entry type.
    #[serde(rename = "type")]
    kind: String,

    /// The network address (`ipv4_net`, `ipv6_net`).
    #[serde(default)]
    net: Option<String>,

    /// The prefix length (`ipv4_net`, `ipv6_net`).
    #[serde(default)]
    mask: Option<u8>,

    /// The address literal (`recipient_literal`).
    #[serde(default)]
    recipient: Option<String>,

    /// The pattern (`recipient_regex`, `remote_regex`).
    #[serde(default)]
    regex: Option<String>,
}

impl RawEntry {
    /// Build an entry from a networked source's hash fields.
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            kind: fields.get("type")?.clone(),
            net: fields.get("net").cloned(),
            mask: fields.get("mask").and_then(|mask| mask.parse().ok()),
            recipient: fields.get("recipient").cloned(),
            regex: fields.get("regex").cloned(),
        })
    }

    fn v4_net(&self) -> Option<Ipv4Net> {
        Ipv4Net::new(self.net.as_ref()?.parse().ok()?, self.mask?).ok()
    }

    fn v6_net(&self) -> Option<Ipv6Net> {
        Ipv6Net::new(self.net.as_ref()?.parse().ok()?, self.mask?).ok()
    }
}

/// Compile a `user@domain` literal.
///
/// A missing half matches anything; the local part tolerates a
/// `+extension`.  An entry without an `@` names a domain.
fn compile_recipient_literal(literal: &str) -> Result<Regex, LiteralError> {
    let (user, domain) = match literal.split('@').collect::<Vec<_>>()[..] {
        [domain] => ("", domain),
        [user, domain] => (user, domain),
        _ => return Err(LiteralError::ManyAts(literal.into())),
    };
    if user.is_empty() && domain.is_empty() {
        return Err(LiteralError::Empty);
    }

    let user = if user.is_empty() {
        ".+".to_string()
    } else {
        regex::escape(user)
    };
    let domain = if domain.is_empty() {
        ".+".to_string()
    } else {
        regex::escape(domain)
    };

    RegexBuilder::new(&format!("^{user}(?:\\+[^@]+)?@{domain}$"))
        .case_insensitive(true)
        .build()
        .map_err(|err| LiteralError::Regex(err.to_string()))
}

/// Compile a raw pattern with match-at-start semantics, case-insensitively.
fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!("^(?:{pattern})"))
        .case_insensitive(true)
        .build()
}

//----------- Errors -----------------------------------------------------------

/// An error loading one whitelist source.
#[derive(Debug)]
enum SourceError {
    /// The source file could not be read.
    Io(io::Error),

    /// The source file is not the expected JSON shape.
    Json(serde_json::Error),

    /// The networked source failed.
    Store(StoreError),

    /// The URL scheme cannot serve as a whitelist source.
    Unsupported,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Unsupported => f.write_str("not a file or redis URL"),
        }
    }
}

impl From<io::Error> for SourceError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<StoreError> for SourceError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// An error compiling a recipient literal.
#[derive(Debug)]
enum LiteralError {
    /// More than one `@`.
    ManyAts(String),

    /// Both halves empty.
    Empty,

    /// The escaped literal did not compile.
    Regex(String),
}

impl fmt::Display for LiteralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManyAts(literal) => write!(f, "'{literal}' has more than one '@'"),
            Self::Empty => f.write_str("the entry is empty"),
            Self::Regex(err) => write!(f, "{err}"),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{Builder, RawEntry, Whitelists, compile_recipient_literal};
    use crate::request::Request;

    fn request(addr: &str, name: &str, recipient: &str) -> Request {
        Request::from_attrs([
            ("request", "smtpd_access_policy"),
            ("client_address", addr),
            ("client_name", name),
            ("sender", "someone@example.com"),
            ("recipient", recipient),
        ])
    }

    fn entry(json: &str) -> RawEntry {
        serde_json::from_str(json).unwrap()
    }

    fn built(entries: &[&str], allow_regex: bool) -> Whitelists {
        let mut builder = Builder::default();
        for e in entries {
            builder.add("test", entry(e), allow_regex);
        }
        builder.set
    }

    #[test]
    fn networks_match_by_containment() {
        let set = built(
            &[
                r#"{"type": "ipv4_net", "net": "192.0.2.0", "mask": 24}"#,
                r#"{"type": "ipv6_net", "net": "2001:db8::", "mask": 32}"#,
            ],
            false,
        );

        assert!(set.matches(&request("192.0.2.17", "x", "a@b")));
        assert!(!set.matches(&request("192.0.3.17", "x", "a@b")));
        assert!(set.matches(&request("2001:db8:ffff::1", "x", "a@b")));
        assert!(!set.matches(&request("2001:db9::1", "x", "a@b")));
    }

    #[test]
    fn recipient_literals_allow_extensions_and_fold_case() {
        let set = built(&[r#"{"type": "recipient_literal", "recipient": "bob@ours.test"}"#], false);

        assert!(set.matches(&request("192.0.2.1", "x", "bob@ours.test")));
        assert!(set.matches(&request("192.0.2.1", "x", "Bob@Ours.Test")));
        assert!(set.matches(&request("192.0.2.1", "x", "bob+spam@ours.test")));
        assert!(!set.matches(&request("192.0.2.1", "x", "bobby@ours.test")));
        assert!(!set.matches(&request("192.0.2.1", "x", "bob@ours.testy")));
    }

    #[test]
    fn half_literals_match_the_other_half_freely() {
        let set = built(
            &[
                r#"{"type": "recipient_literal", "recipient": "@ours.test"}"#,
                r#"{"type": "recipient_literal", "recipient": "postmaster@"}"#,
            ],
            false,
        );

        assert!(set.matches(&request("192.0.2.1", "x", "anyone@ours.test")));
        assert!(set.matches(&request("192.0.2.1", "x", "postmaster@elsewhere.test")));
        assert!(!set.matches(&request("192.0.2.1", "x", "anyone@elsewhere.test")));
    }

    #[test]
    fn malformed_literals_are_rejected() {
        assert!(compile_recipient_literal("a@b@c").is_err());
        assert!(compile_recipient_literal("@").is_err());
        // A bare name is a domain.
        let re = compile_recipient_literal("ours.test").unwrap();
        assert!(re.is_match("anyone@ours.test"));
    }

    #[test]
    fn client_names_anchor_at_the_start() {
        let set = built(&[r#"{"type": "remote_regex", "regex": "mail[0-9]*\\.example\\.com"}"#], true);

        assert!(set.matches(&request("192.0.2.1", "mail3.example.com", "a@b")));
        assert!(set.matches(&request("192.0.2.1", "MAIL.EXAMPLE.COM", "a@b")));
        // Anchored at the start only.
        assert!(set.matches(&request("192.0.2.1", "mail.example.com.attacker.test", "a@b")));
        assert!(!set.matches(&request("192.0.2.1", "smtp.mail.example.com", "a@b")));
    }

    #[test]
    fn regex_entries_honor_the_feature_flag() {
        let gated = built(&[r#"{"type": "recipient_regex", "regex": ".*@ours.test"}"#], false);
        assert!(gated.is_empty());

        let open = built(&[r#"{"type": "recipient_regex", "regex": ".*@ours.test"}"#], true);
        assert!(open.matches(&request("192.0.2.1", "x", "anyone@ours.test")));
    }

    #[test]
    fn unknown_and_malformed_entries_are_skipped() {
        let set = built(
            &[
                r#"{"type": "carrier_pigeon", "net": "192.0.2.0"}"#,
                r#"{"type": "ipv4_net", "net": "not-an-ip", "mask": 24}"#,
                r#"{"type": "ipv4_net", "net": "192.0.2.0", "mask": 99}"#,
                r#"{"type": "remote_regex", "regex": "(unclosed"}"#,
            ],
            true,
        );
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn file_sources_load_and_bad_ones_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("wl.json");
        let mut f = std::fs::File::create(&good).unwrap();
        write!(
            f,
            r#"{{"ours": [{{"type": "recipient_literal", "recipient": "@ours.test"}},
                          {{"type": "ipv4_net", "net": "198.51.100.0", "mask": 24}}]}}"#
        )
        .unwrap();
        let bad = dir.path().join("broken.json");
        std::fs::write(&bad, "not json").unwrap();

        let toml = format!(
            r#"
            [greylist]
            store = "sled://{dir}/grey"

            [whitelist]
            sources = ["file://{good}", "file://{bad}", "file://{missing}"]
            "#,
            dir = dir.path().display(),
            good = good.display(),
            bad = bad.display(),
            missing = dir.path().join("missing.json").display(),
        );
        let config = toml::from_str::<crate::config::Spec>(&toml)
            .unwrap()
            .parse()
            .unwrap();

        let set = super::load(&config).await;
        assert_eq!(set.len(), 2);
        assert!(set.matches(&request("198.51.100.7", "x", "a@b")));
    }
}
