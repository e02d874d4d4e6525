use std::{collections::BTreeMap, str::FromStr, time::Duration};

use super::{Endpoint, NamingError};

/// `scheme://authority/path?key=value&...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingUrl {
    pub raw: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
}

impl NamingUrl {
    pub fn parse(raw: &str) -> Result<Self, NamingError> {
        let invalid = |reason: &str| NamingError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing `://`"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(invalid("bad scheme"));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match location.find('/') {
            Some(idx) => location.split_at(idx),
            None => (location, ""),
        };

        let mut params = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            path: path.to_string(),
            params,
        })
    }

    /// Comma-separated endpoints in the authority.
    pub fn hosts(&self) -> Result<Vec<Endpoint>, NamingError> {
        self.authority
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::parse::<Endpoint>)
            .collect()
    }

    pub fn param<T: FromStr>(&self, key: &str) -> Result<Option<T>, NamingError> {
        match self.params.get(key) {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| NamingError::InvalidUrl {
                    url: self.raw.clone(),
                    reason: format!("bad value `{value}` for `{key}`"),
                }),
            None => Ok(None),
        }
    }

    pub fn param_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, NamingError> {
        Ok(self.param(key)?.unwrap_or(default))
    }

    /// A millisecond parameter as a [`Duration`].
    pub fn duration_ms(&self, key: &str, default: Duration) -> Result<Duration, NamingError> {
        Ok(self
            .param::<u64>(key)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }
}
