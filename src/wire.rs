//! Requester wire protocol.
//!
//! The requester sends nothing. It connects, reads exactly one reply, and
//! the daemon closes the connection. The reply is one of two literal byte
//! strings; the requester treats anything else as a deny.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Reply for an allowed request. The trailing NUL is part of the token.
pub const ALLOW_TOKEN: &[u8] = b"YaY!\0";

/// Reply for a denied request.
pub const DENY_TOKEN: &[u8] = b"Nah.";

/// Upper bound on bytes a requester reads before giving up on the reply.
const MAX_REPLY_BYTES: u64 = 64;

/// Final outcome of a root request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Deny,
}

impl Outcome {
    pub fn token(self) -> &'static [u8] {
        match self {
            Outcome::Allow => ALLOW_TOKEN,
            Outcome::Deny => DENY_TOKEN,
        }
    }

    pub fn is_allow(self) -> bool {
        self == Outcome::Allow
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
        }
    }
}

/// Map raw reply bytes to an outcome. Only an exact allow token allows.
pub fn parse_reply(bytes: &[u8]) -> Outcome {
    if bytes == ALLOW_TOKEN {
        Outcome::Allow
    } else {
        Outcome::Deny
    }
}

/// Write the reply token and flush.
pub fn write_reply<W: Write>(writer: &mut W, outcome: Outcome) -> io::Result<()> {
    writer.write_all(outcome.token())?;
    writer.flush()
}

/// Read the daemon's reply until EOF (bounded) and map it to an outcome.
///
/// Read errors, early close and oversized replies all map to `Deny`.
pub fn read_reply<R: Read>(reader: R) -> Outcome {
    let mut buf = Vec::with_capacity(ALLOW_TOKEN.len());
    match reader.take(MAX_REPLY_BYTES + 1).read_to_end(&mut buf) {
        Ok(_) if buf.len() as u64 <= MAX_REPLY_BYTES => parse_reply(&buf),
        Ok(_) => Outcome::Deny,
        Err(_) => Outcome::Deny,
    }
}
