//! Canonical gateway URIs.
//!
//! Every resource reachable through the gateway is named
//! `scheme://authority/path?query`, where the scheme is the protocol name of
//! the plugin that serves it and the query parameters are sorted by name.
//! The canonical string is the key for subscriptions and cached replies.

use crate::error::ProtocolError;
use std::fmt;
use url::{form_urlencoded, Url};

/// Maximum accepted length of a request path.
pub const MAX_PATH_LENGTH: usize = 2048;

/// A resolved, canonical gateway URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayUri {
    scheme: String,
    authority: String,
    path: String,
    query: Vec<(String, String)>,
}

impl GatewayUri {
    /// Resolve a request path.
    ///
    /// Accepts both `/{protocol}/{authority}/{path}?{query}` and
    /// `{protocol}://{authority}/{path}?{query}`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidUri`] if the path names no protocol or
    /// authority, or is not a valid URI.
    pub fn parse(path: &str) -> Result<Self, ProtocolError> {
        if path.len() > MAX_PATH_LENGTH {
            return Err(ProtocolError::InvalidUri("path too long".into()));
        }

        if path.contains("://") {
            return Self::from_url(path.trim_start_matches('/'));
        }

        let trimmed = path.trim_start_matches('/');
        let (scheme, rest) = trimmed
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidUri(format!("missing authority in {path:?}")))?;
        let (authority, remainder) = match rest.find(['/', '?']) {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        Self::from_url(&format!("{scheme}://{authority}/{}", remainder.trim_start_matches('/')))
    }

    /// Rebuild a URI from a protocol name and the route headers of a message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidUri`] if the parts do not form a URI.
    pub fn from_parts(scheme: &str, authority: &str, path: &str) -> Result<Self, ProtocolError> {
        if path.starts_with('/') || path.starts_with('?') || path.is_empty() {
            Self::from_url(&format!("{scheme}://{authority}{path}"))
        } else {
            Self::from_url(&format!("{scheme}://{authority}/{path}"))
        }
    }

    fn from_url(raw: &str) -> Result<Self, ProtocolError> {
        let url = Url::parse(raw).map_err(|e| ProtocolError::InvalidUri(format!("{raw}: {e}")))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProtocolError::InvalidUri(format!("missing authority in {raw:?}")))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        let mut query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        // Stable: repeated names keep their relative order.
        query.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            path,
            query,
        })
    }

    /// Protocol name.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters, sorted by name.
    #[must_use]
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Path plus sorted query, as written into a routed request.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        format!("{}?{}", self.path, query)
    }
}

impl fmt::Display for GatewayUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme,
            self.authority,
            self.path_and_query()
        )
    }
}

impl std::str::FromStr for GatewayUri {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
