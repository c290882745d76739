//! Format check applied to wallet identifiers before a session is created.

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Friendly (user-facing), raw workchain and raw masterchain address shapes.
const ADDRESS_PATTERNS: &[&str] = &[
    r"^(UQ|EQ)[A-Za-z0-9_-]{46}$",
    r"^0:[a-fA-F0-9]{64}$",
    r"^-1:[a-fA-F0-9]{64}$",
];

const MIN_ADDRESS_LEN: usize = 48;

static WALLET_ADDRESSES: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(ADDRESS_PATTERNS).expect("built-in address patterns must compile"));

#[derive(Debug, Clone)]
pub struct IdentifierPolicy {
    patterns: RegexSet,
    min_len: usize,
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self::wallet_addresses()
    }
}

impl IdentifierPolicy {
    pub fn wallet_addresses() -> Self {
        Self {
            patterns: WALLET_ADDRESSES.clone(),
            min_len: MIN_ADDRESS_LEN,
        }
    }

    pub fn custom<I, S>(patterns: I, min_len: usize) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
            min_len,
        })
    }

    pub fn accepts(&self, id: &str) -> bool {
        id.len() >= self.min_len && self.patterns.is_match(id)
    }
}

/// Shortened form for log lines.
pub fn short_id(id: &str) -> String {
    if id.len() <= 12 || !id.is_char_boundary(6) || !id.is_char_boundary(id.len() - 6) {
        return id.to_string();
    }
    format!("{}...{}", &id[..6], &id[id.len() - 6..])
}
