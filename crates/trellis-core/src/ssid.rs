//! Channel parsing and Ssid encoding.
//!
//! A channel is a slash-delimited path such as `news/sports`. Before it reaches the
//! subscription trie it is encoded into an [`Ssid`]: one fixed-width token per
//! segment, prefixed by the contract (tenant realm) that owns the channel.
//!
//! The encoding is part of the cluster contract. Every node must produce the same
//! Ssid for the same `(contract, channel)` pair, so segment hashing is a plain
//! 32-bit FNV-1a with no per-process seed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum channel length in bytes.
pub const MAX_CHANNEL_LENGTH: usize = 256;

/// Maximum number of segments in a channel.
pub const MAX_SEGMENTS: usize = 32;

/// Maximum length of a single segment in bytes.
pub const MAX_SEGMENT_LENGTH: usize = 64;

/// Segment separator.
pub const SEPARATOR: char = '/';

/// A single Ssid token.
pub type Token = u32;

/// Token of a `+` segment, matching exactly one segment.
pub const SINGLE: Token = 1;

/// Token of a `#` segment, matching the remaining suffix (zero or more segments).
pub const MULTI: Token = 2;

/// Token opening the presence namespace of a channel.
pub const PRESENCE: Token = 3;

/// Tokens below this value are never produced by segment hashing.
pub const RESERVED_TOKENS: Token = 16;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Channel validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel is empty.
    #[error("Channel cannot be empty")]
    Empty,

    /// The channel exceeds [`MAX_CHANNEL_LENGTH`].
    #[error("Channel too long: {0} bytes")]
    TooLong(usize),

    /// The channel has more than [`MAX_SEGMENTS`] segments.
    #[error("Channel has too many segments: {0}")]
    TooManySegments(usize),

    /// A segment is empty (`a//b`).
    #[error("Empty segment at position {position}")]
    EmptySegment { position: usize },

    /// A segment exceeds [`MAX_SEGMENT_LENGTH`].
    #[error("Segment at position {position} too long")]
    SegmentTooLong { position: usize },

    /// A segment contains a character outside the allowed set.
    #[error("Invalid character {character:?} in segment {segment:?}")]
    InvalidCharacter { segment: String, character: char },

    /// A wildcard is embedded in a segment, or `#` is not the last segment.
    #[error("Misplaced wildcard at position {position}")]
    MisplacedWildcard { position: usize },

    /// Channels starting with `$` are reserved.
    #[error("Channels starting with '$' are reserved")]
    Reserved,
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@' | '~')
}

/// Hash a segment into a token.
///
/// Hashes landing in the reserved range are shifted out of it, so wildcard and
/// namespace tokens can never be forged by a segment name.
#[must_use]
pub fn hash_segment(segment: &str) -> Token {
    let hash = segment
        .bytes()
        .fold(FNV_OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(FNV_PRIME));
    if hash < RESERVED_TOKENS {
        hash + RESERVED_TOKENS
    } else {
        hash
    }
}

/// Check whether a token belongs to the reserved range.
#[inline]
#[must_use]
pub fn is_reserved(token: Token) -> bool {
    token < RESERVED_TOKENS
}

/// A validated, normalized channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    /// Parse and validate a channel.
    ///
    /// A single trailing `/` is accepted and stripped. `+` may stand for any whole
    /// segment, `#` only for the last one.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] describing the first violation found.
    pub fn parse(name: &str) -> Result<Self, ChannelError> {
        let name = name.strip_suffix(SEPARATOR).unwrap_or(name);
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        if name.len() > MAX_CHANNEL_LENGTH {
            return Err(ChannelError::TooLong(name.len()));
        }
        if name.starts_with('$') {
            return Err(ChannelError::Reserved);
        }

        let count = name.split(SEPARATOR).count();
        if count > MAX_SEGMENTS {
            return Err(ChannelError::TooManySegments(count));
        }

        for (position, segment) in name.split(SEPARATOR).enumerate() {
            match segment {
                "" => return Err(ChannelError::EmptySegment { position }),
                "+" => {}
                "#" if position + 1 == count => {}
                "#" => return Err(ChannelError::MisplacedWildcard { position }),
                _ => {
                    if segment.len() > MAX_SEGMENT_LENGTH {
                        return Err(ChannelError::SegmentTooLong { position });
                    }
                    if let Some(character) = segment.chars().find(|c| !is_segment_char(*c)) {
                        if character == '+' || character == '#' {
                            return Err(ChannelError::MisplacedWildcard { position });
                        }
                        return Err(ChannelError::InvalidCharacter {
                            segment: segment.to_string(),
                            character,
                        });
                    }
                }
            }
        }

        Ok(Self(name.to_string()))
    }

    /// Get the channel as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Check if any segment is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.segments().any(|s| s == "+" || s == "#")
    }

    /// Check whether `self`, read as a pattern, covers `other`.
    ///
    /// Segments of `other` are compared literally: a `+` in `other` is only
    /// covered by a `+` or `#` in the pattern.
    #[must_use]
    pub fn matches(&self, other: &Channel) -> bool {
        let mut pattern = self.segments();
        let mut target = other.segments();
        loop {
            match (pattern.next(), target.next()) {
                (Some("#"), _) => return true,
                (Some("+"), Some(_)) => {}
                (Some(p), Some(t)) if p == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> String {
        channel.0
    }
}

/// Encoded subscription identifier: `[contract, token_1, ..., token_n]`.
///
/// The presence feed of a channel lives at `[contract, PRESENCE, token_1, ..., token_n]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<Token>", into = "Vec<Token>")]
pub struct Ssid(Vec<Token>);

impl Ssid {
    /// Encode a parsed channel for a contract.
    #[must_use]
    pub fn new(contract: u32, channel: &Channel) -> Self {
        let mut tokens = Vec::with_capacity(channel.segments().count() + 1);
        tokens.push(contract);
        tokens.extend(channel.segments().map(|segment| match segment {
            "+" => SINGLE,
            "#" => MULTI,
            _ => hash_segment(segment),
        }));
        Self(tokens)
    }

    /// Parse and encode a raw channel string.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is invalid.
    pub fn encode(contract: u32, channel: &str) -> Result<Self, ChannelError> {
        Ok(Self::new(contract, &Channel::parse(channel)?))
    }

    /// Encode the presence pseudo-channel of a channel.
    #[must_use]
    pub fn presence(contract: u32, channel: &Channel) -> Self {
        Self::new(contract, channel).for_presence()
    }

    /// Derive the presence Ssid of this Ssid. Presence Ssids map to themselves.
    #[must_use]
    pub fn for_presence(&self) -> Self {
        if self.is_presence() {
            return self.clone();
        }
        let mut tokens = Vec::with_capacity(self.0.len() + 1);
        tokens.push(self.contract());
        tokens.push(PRESENCE);
        tokens.extend_from_slice(&self.0[1..]);
        Self(tokens)
    }

    /// Rebuild an Ssid from raw tokens, e.g. as received from a cluster peer.
    ///
    /// Returns `None` if there is no contract and at least one segment token.
    #[must_use]
    pub fn from_tokens(tokens: Vec<Token>) -> Option<Self> {
        (tokens.len() >= 2).then_some(Self(tokens))
    }

    /// The owning contract.
    #[must_use]
    pub fn contract(&self) -> u32 {
        self.0[0]
    }

    /// All tokens, contract first.
    #[must_use]
    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    /// Number of tokens, contract included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// An Ssid always carries a contract, so it is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check whether any segment token is a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0[1..].iter().any(|t| *t == SINGLE || *t == MULTI)
    }

    /// Check whether this Ssid addresses a presence feed.
    #[must_use]
    pub fn is_presence(&self) -> bool {
        self.0.get(1) == Some(&PRESENCE)
    }

    /// Check whether this subscription Ssid matches a publish Ssid.
    ///
    /// Same rules as a trie lookup: `+` takes one segment, `#` the remaining
    /// suffix, and wildcards never match a reserved token.
    #[must_use]
    pub fn matches(&self, publish: &Ssid) -> bool {
        if self.contract() != publish.contract() {
            return false;
        }
        let mut pattern = self.0[1..].iter();
        let mut target = publish.0[1..].iter();
        loop {
            match (pattern.next(), target.next()) {
                (Some(&MULTI), next) => return next.map_or(true, |t| !is_reserved(*t)),
                (Some(&SINGLE), Some(t)) if !is_reserved(*t) => {}
                (Some(p), Some(t)) if p == t => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl TryFrom<Vec<Token>> for Ssid {
    type Error = &'static str;

    fn try_from(tokens: Vec<Token>) -> Result<Self, Self::Error> {
        Self::from_tokens(tokens).ok_or("Ssid needs a contract and at least one segment")
    }
}

impl From<Ssid> for Vec<Token> {
    fn from(ssid: Ssid) -> Vec<Token> {
        ssid.0
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{token:x}")?;
        }
        Ok(())
    }
}
