//! The greylisting decision engine.
//!
//! Each valid request is reduced to a `(network, sender, recipient)` tuple
//! and judged against the greylist store; proven-legitimate networks are
//! promoted through the auto-whitelist.  Anything that cannot be judged is
//! answered with the neutral `DUNNO` so that no failure on our side denies
//! legitimate mail.

use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::{Ipv4Net, Ipv6Net};
use regex::Regex;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::center::Center;
use crate::config::GreyConfig;
use crate::request::{Action, Request};
use crate::store::{Entry, Store};

/// Maximal decimal runs bounded by non-word characters; such runs are
/// usually per-message serials in bounce addresses.
static DIGIT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9]+\b").expect("the digit-run pattern is valid"));

//----------- Decision ---------------------------------------------------------

/// Judge one request.
///
/// `now` is the request's wall-clock time in POSIX seconds; it is threaded
/// through explicitly so the state machine is deterministic under test.
pub async fn decide(center: &Center, request: &Request, now: i64) -> Action {
    let grey = &center.config.greylist;

    if !request.is_valid() {
        warn!("Ignoring an incomplete or foreign policy request");
        return Action::Dunno;
    }

    let Ok(addr) = request.client_address().parse::<IpAddr>() else {
        warn!(
            "Ignoring a request with unparseable client address '{}'",
            request.client_address()
        );
        return Action::Dunno;
    };
    let remote = normalize_remote(addr, grey.mask_v4, grey.mask_v6);

    // Static whitelists first; a hit means no store is touched.
    if center.whitelists.load().matches(request) {
        debug!("Whitelisted: {} from {remote}", request.sender());
        return Action::Dunno;
    }

    // Then the auto-whitelist, which needs a store read.
    match awl_check(center, &remote, now).await {
        Ok(true) => {
            debug!("Auto-whitelisted: {remote}");
            return Action::Dunno;
        }
        Ok(false) => {}
        Err(()) => return Action::Dunno,
    }

    let sender = clean_sender(request.sender());
    let key = grey_key(&remote, &sender, request.recipient(), grey.hash_keys);

    let value = match center.greylist.get(&key).await {
        Ok(value) => value,
        Err(err) => {
            warn!("Greylist read failed, answering neutrally: {err}");
            return Action::Dunno;
        }
    };

    let entry = match value {
        Some(ref value) => {
            let entry = Entry::parse(value);
            if entry.is_none() {
                warn!("Discarding unparseable greylist value '{value}'");
            }
            entry
        }
        None => None,
    };

    match entry {
        // Never seen (or the stored value was garbage): record the tuple
        // and ask the client to come back.
        None => {
            if !record(&center.greylist, &key, Entry { count: 0, last_seen: now }).await {
                return Action::Dunno;
            }
            defer(grey, grey.delay)
        }

        Some(Entry { count: 0, last_seen }) => {
            // A clock step backward reads as a negative wait; treat it as
            // "no time has passed".
            let waited = (now - last_seen).max(0);

            if waited <= grey.delay {
                defer(grey, grey.delay - waited)
            } else if waited > grey.retry_window {
                // The retry came far too late to prove anything.  Restart
                // the delay clock from this attempt.
                if !record(&center.greylist, &key, Entry { count: 0, last_seen: now }).await {
                    return Action::Dunno;
                }
                defer(grey, grey.delay)
            } else {
                // First pass: the client waited out the delay and retried
                // within the window.
                if !record(&center.greylist, &key, Entry { count: 1, last_seen: now }).await {
                    return Action::Dunno;
                }
                awl_bump(center, &remote, now).await;
                Action::Prepend {
                    header: render_header(grey, waited, now),
                }
            }
        }

        // Already passed: advance the counter, refresh the timestamp, and
        // stay out of the MTA's way.
        Some(Entry { count, last_seen: _ }) => {
            let next = Entry {
                count: count.saturating_add(1),
                last_seen: now,
            };
            if !record(&center.greylist, &key, next).await {
                return Action::Dunno;
            }
            awl_bump(center, &remote, now).await;
            Action::Dunno
        }
    }
}

/// Write a greylist entry, reporting success.
async fn record(store: &Store, key: &str, entry: Entry) -> bool {
    match store.update(key, &entry.to_string()).await {
        Ok(()) => true,
        Err(err) => {
            warn!("Greylist write failed, answering neutrally: {err}");
            false
        }
    }
}

/// Build the deferral answer, with `{wait}` clamped to zero.
fn defer(grey: &GreyConfig, wait: i64) -> Action {
    Action::Defer {
        verb: grey.action.clone(),
        text: grey.text.replace("{wait}", &wait.max(0).to_string()),
    }
}

/// Render the PREPEND header for a passing request.
fn render_header(grey: &GreyConfig, waited: i64, now: i64) -> String {
    grey.header
        .replace("{delay}", &waited.to_string())
        .replace("{hostname}", &grey.hostname)
        .replace("{date}", &render_ctime(now))
}

/// The ctime-style rendering of a POSIX timestamp, in the local time zone.
fn render_ctime(now: i64) -> String {
    match jiff::Timestamp::from_second(now) {
        Ok(ts) => ts
            .to_zoned(jiff::tz::TimeZone::system())
            .strftime("%a %b %e %H:%M:%S %Y")
            .to_string(),
        Err(_) => String::new(),
    }
}

//----------- Auto-whitelist ---------------------------------------------------

/// Whether the remote network has passed greylisting often enough to be
/// trusted outright.
///
/// `Err(())` is a store failure; the caller answers neutrally.
async fn awl_check(center: &Center, remote: &str, now: i64) -> Result<bool, ()> {
    let Some(awl) = &center.awl else {
        return Ok(false);
    };
    let config = center
        .config
        .auto_whitelist
        .as_ref()
        .expect("an open auto-whitelist store implies its configuration");

    let key = awl_key(remote, center.config.greylist.hash_keys);
    let value = match awl.get(&key).await {
        Ok(value) => value,
        Err(err) => {
            warn!("Auto-whitelist read failed, answering neutrally: {err}");
            return Err(());
        }
    };

    if let Some(entry) = value.as_deref().and_then(Entry::parse) {
        if entry.count >= config.client_count {
            // Trusted; keep counting so the sweep sees the network as live.
            bump_entry(awl, &key, now).await;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Credit the remote network with one more greylist pass.
async fn awl_bump(center: &Center, remote: &str, now: i64) {
    if let Some(awl) = &center.awl {
        let key = awl_key(remote, center.config.greylist.hash_keys);
        bump_entry(awl, &key, now).await;
    }
}

/// Increment an auto-whitelist counter, creating it at 1.
///
/// The counter grows without a cap: the threshold test only needs `>=`, and
/// the running total is useful when eyeballing the store.  Failures are
/// logged and ignored; the auto-whitelist is an optimization, not a
/// dependency.
async fn bump_entry(store: &Store, key: &str, now: i64) {
    let count = match store.get(key).await {
        Ok(value) => value
            .as_deref()
            .and_then(Entry::parse)
            .map_or(1, |entry| entry.count.saturating_add(1)),
        Err(err) => {
            warn!("Auto-whitelist read failed, skipping the bump: {err}");
            return;
        }
    };
    let entry = Entry {
        count,
        last_seen: now,
    };
    if let Err(err) = store.update(key, &entry.to_string()).await {
        warn!("Auto-whitelist write failed: {err}");
    }
}

//----------- Normalization ----------------------------------------------------

/// The canonical `network/prefix` form of the client address.
///
/// Addresses in the same masked network collapse to the same string, which
/// is the sender-network identity everywhere else in the engine.
pub fn normalize_remote(addr: IpAddr, mask_v4: u8, mask_v6: u8) -> String {
    match addr {
        IpAddr::V4(addr) => Ipv4Net::new(addr, mask_v4)
            .expect("the v4 prefix length is validated at startup")
            .trunc()
            .to_string(),
        IpAddr::V6(addr) => Ipv6Net::new(addr, mask_v6)
            .expect("the v6 prefix length is validated at startup")
            .trunc()
            .to_string(),
    }
}

/// Normalize a sender address.
///
/// Strips a `prvs=TAG=` bounce-verification wrapper, drops a `+extension`
/// from the local part, and collapses isolated decimal runs in the local
/// part to `#` so per-message bounce serials share one greylist entry.  The
/// domain part is preserved verbatim.
pub fn clean_sender(sender: &str) -> String {
    let sender = strip_prvs(sender);

    let (local, domain) = match sender.rsplit_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (sender, None),
    };

    let local = match local.split_once('+') {
        Some((base, _extension)) => base,
        None => local,
    };
    let local = DIGIT_RUN.replace_all(local, "#");

    match domain {
        Some(domain) => format!("{local}@{domain}"),
        None => local.into_owned(),
    }
}

/// Strip a bounce-address-verification wrapper.
///
/// `prvs=TAG=address` with a ten-character alphanumeric TAG yields the bare
/// address; any other `prvs=` form loses only the leading `prvs` field.
fn strip_prvs(sender: &str) -> &str {
    let Some(rest) = sender.strip_prefix("prvs=") else {
        return sender;
    };
    if let Some((tag, addr)) = rest.split_once('=') {
        if tag.len() == 10 && tag.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return addr;
        }
    }
    rest
}

/// The greylist key for a request tuple.
pub fn grey_key(remote: &str, sender: &str, recipient: &str, hash: bool) -> String {
    let raw = format!("{remote}/{sender}/{recipient}").to_lowercase();
    if hash { sha1_hex(raw.as_bytes()) } else { raw }
}

/// The auto-whitelist key for a remote network.
pub fn awl_key(remote: &str, hash: bool) -> String {
    let raw = remote.to_lowercase();
    if hash { sha1_hex(raw.as_bytes()) } else { raw }
}

/// Hex SHA-1 of a byte string.
fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

//============ Tests =========================================================
