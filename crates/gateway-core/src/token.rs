//! Capability tokens.
//!
//! A token is an opaque handle compared by identity only. Tokens cannot be
//! cloned, serialized or rebuilt from their debug output, and only the
//! routing core can mint them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of a token, used in grant lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TokenId(u64);

/// An unforgeable capability handle.
pub struct Token {
    id: TokenId,
}

impl Token {
    /// Mint a token distinct from every other token in the process.
    pub(crate) fn mint() -> Self {
        Self {
            id: TokenId(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub(crate) fn id(&self) -> TokenId {
        self.id
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_distinct() {
        let a = Token::mint();
        let b = Token::mint();
        assert_ne!(a, b);
        assert_eq!(a, a);
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }
}
