//! Query strings and the `Location` carry-over rule
//!
//! Registries may embed session state (for example a rotating `_state` token) in the query
//! string of an upload `Location`. Those parameters have to be replayed on the next request
//! to that session, merged with any parameters the request adds itself.

use url::Url;

/// Base used to resolve relative `Location` values; only path and query are ever read back.
const RELATIVE_BASE: &str = "http://registry.invalid/";

/// Ordered list of query parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryString {
    pairs: Vec<(String, String)>,
}

impl QueryString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters embedded in a registry-supplied `Location`, absolute or origin-relative
    pub fn from_location(location: &str) -> Self {
        match resolve_location(location) {
            Some(url) => Self {
                pairs: url.query_pairs().into_owned().collect(),
            },
            None => Self::default(),
        }
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(key, value);
        self
    }

    pub fn merge(&mut self, other: QueryString) -> &mut Self {
        self.pairs.extend(other.pairs);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Replace the query of `url` with these parameters
    pub fn apply_to(&self, url: &mut Url) {
        if self.pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(self.pairs.iter());
        }
    }

    /// Encoded form, for logging
    pub fn encoded(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }
}

/// Path component of a registry-supplied `Location`, absolute or origin-relative
pub fn location_path(location: &str) -> Option<String> {
    let url = resolve_location(location)?;
    let path = url.path();
    if path.is_empty() || path == "/" {
        None
    } else {
        Some(path.to_string())
    }
}

fn resolve_location(location: &str) -> Option<Url> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    match Url::parse(location) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(RELATIVE_BASE).ok()?.join(location).ok()
        }
        Err(_) => None,
    }
}
