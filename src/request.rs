//! The SMTPD access-policy wire protocol.
//!
//! A request is a run of `name=value` lines terminated by an empty line; the
//! answer is a single `action=...` line followed by an empty line.  One
//! request per connection, no pipelining.

use std::fmt;
use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// The protocol type this server understands.
const POLICY_REQUEST: &str = "smtpd_access_policy";

//----------- Request ----------------------------------------------------------

/// One delegated policy request.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// The raw attributes, as received.
    attrs: foldhash::HashMap<String, String>,
}

impl Request {
    /// Read a request off the wire.
    ///
    /// Returns `Ok(None)` if the peer closed the connection before sending
    /// anything.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, RequestError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut attrs = foldhash::HashMap::default();
        let mut line = String::new();
        loop {
            line.clear();
            // Non-UTF-8 bytes surface as an I/O error here and abort the
            // request.
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                if attrs.is_empty() {
                    return Ok(None);
                }
                return Err(RequestError::UnexpectedEof);
            }

            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if line.is_empty() {
                return Ok(Some(Self { attrs }));
            }

            match line.split_once('=') {
                Some((name, value)) => {
                    attrs.insert(name.to_string(), value.to_string());
                }
                None => return Err(RequestError::Malformed(line.to_string())),
            }
        }
    }

    /// Look up an attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// An attribute's value, with absence flattened to the empty string.
    fn get_or_empty(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// The connecting client's IP address, as text.
    pub fn client_address(&self) -> &str {
        self.get_or_empty("client_address")
    }

    /// The connecting client's reverse-DNS name.
    pub fn client_name(&self) -> &str {
        self.get_or_empty("client_name")
    }

    /// The envelope sender.
    pub fn sender(&self) -> &str {
        self.get_or_empty("sender")
    }

    /// The envelope recipient.
    pub fn recipient(&self) -> &str {
        self.get_or_empty("recipient")
    }

    /// Whether the request can be judged at all.
    ///
    /// The `request` attribute must name the access-policy protocol and the
    /// four significant attributes must be present and non-empty.  Anything
    /// else the MTA sent is accepted and ignored.
    pub fn is_valid(&self) -> bool {
        self.get("request") == Some(POLICY_REQUEST)
            && !self.client_address().is_empty()
            && !self.client_name().is_empty()
            && !self.sender().is_empty()
            && !self.recipient().is_empty()
    }

    /// Build a request from attribute pairs (tests and tooling).
    pub fn from_attrs<'a, I>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            attrs: attrs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }
}

//----------- Action -----------------------------------------------------------

/// The answer to a policy request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// No opinion; the MTA decides.  Also the safe answer to anything that
    /// went wrong on our side.
    Dunno,

    /// Defer the message (the verb is configurable, default
    /// `DEFER_IF_PERMIT`).
    Defer {
        /// The verb to emit.
        verb: String,

        /// The explanatory text sent along with the deferral.
        text: String,
    },

    /// Let the message pass and ask the MTA to prepend a header.
    Prepend {
        /// The rendered header line.
        header: String,
    },
}

impl Action {
    /// The complete response, ready for the wire.
    pub fn to_wire(&self) -> String {
        format!("action={self}\n\n")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dunno => f.write_str("DUNNO"),
            Self::Defer { verb, text } => write!(f, "{verb} {text}"),
            Self::Prepend { header } => write!(f, "PREPEND {header}"),
        }
    }
}

//----------- RequestError -----------------------------------------------------

/// An error reading a request.
#[derive(Debug)]
pub enum RequestError {
    /// The connection failed, or the peer sent bytes that are not UTF-8.
    Io(io::Error),

    /// A line carried neither `name=value` nor end-of-request.
    Malformed(String),

    /// The peer closed the connection mid-request.
    UnexpectedEof,
}

impl std::error::Error for RequestError {}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "reading request: {err}"),
            Self::Malformed(line) => write!(f, "malformed request line '{line}'"),
            Self::UnexpectedEof => f.write_str("connection closed mid-request"),
        }
    }
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

//============ Tests =========================================================
