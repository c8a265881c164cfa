// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decides which domains resources may be rewritten from

use crate::error::Error;

use log::trace;
use regex::Regex;
use url::Url;

/// A parsed domain pattern like `*.example.com` or `https://cdn.example.com`
#[derive(Debug, Clone)]
struct DomainPattern {
    scheme: Option<String>,
    host: Regex,
    port: Option<u16>,
}

impl DomainPattern {
    fn matches(&self, url: &Url) -> bool {
        if let Some(scheme) = &self.scheme {
            if url.scheme() != scheme {
                return false;
            }
        }
        if let Some(port) = self.port {
            if url.port_or_known_default() != Some(port) {
                return false;
            }
        }
        url.host_str().is_some_and(|host| self.host.is_match(host))
    }
}

impl TryFrom<&str> for DomainPattern {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = value.trim();
        let (scheme, rest) = match value.split_once("://") {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, value),
        };
        let rest = rest.split('/').next().unwrap_or("");

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|c| c.is_ascii_digit()) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidConfig(format!("invalid port in domain {value}")))?;
                (host, Some(port))
            }
            _ => (rest, None),
        };
        if host.is_empty() {
            return Err(Error::InvalidConfig(format!("invalid domain {value:?}")));
        }

        let mut regex = String::from("^");
        for c in host.to_ascii_lowercase().chars() {
            match c {
                '*' => regex.push_str(".*"),
                '?' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');

        Ok(Self {
            scheme,
            host: Regex::new(&regex).map_err(|err| Error::InvalidConfig(err.to_string()))?,
            port,
        })
    }
}

/// Authorization of resource domains
///
/// Resources on the document’s own origin are always authorized. Other domains have to be listed
/// explicitly, `*` and `?` wildcards are supported.
#[derive(Debug, Clone, Default)]
pub struct DomainLawyer {
    patterns: Vec<DomainPattern>,
}

impl DomainLawyer {
    /// Creates a domain lawyer from a list of domain patterns.
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Result<Self, Error> {
        let patterns = domains
            .iter()
            .map(|domain| DomainPattern::try_from(domain.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    /// Checks whether `url` may be rewritten when referenced from a document at `base`.
    pub fn is_authorized(&self, url: &Url, base: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        if url.origin() == base.origin() {
            return true;
        }
        let result = self.patterns.iter().any(|pattern| pattern.matches(url));
        if !result {
            trace!("Domain of {url} is not authorized");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn own_origin_authorized() {
        let lawyer = DomainLawyer::default();
        let base = url("http://example.com/index.html");
        assert!(lawyer.is_authorized(&url("http://example.com/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("https://example.com/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("http://cdn.example.com/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("data:text/css,a"), &base));
    }

    #[test]
    fn wildcards() {
        let lawyer =
            DomainLawyer::new(&["*.example.com", "https://static.example.net:8443"]).unwrap();
        let base = url("http://example.com/");
        assert!(lawyer.is_authorized(&url("http://cdn.example.com/a.css"), &base));
        assert!(lawyer.is_authorized(&url("https://a.b.example.com/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("http://example.org/a.css"), &base));
        assert!(lawyer.is_authorized(&url("https://static.example.net:8443/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("http://static.example.net:8443/a.css"), &base));
        assert!(!lawyer.is_authorized(&url("https://static.example.net/a.css"), &base));
    }

    #[test]
    fn invalid_patterns() {
        assert!(DomainLawyer::new(&[""]).is_err());
        assert!(DomainLawyer::new(&["http://"]).is_err());
    }
}
