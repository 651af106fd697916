//! Endpoint location parsing.
//!
//! A location spec takes one of three shapes: `path` (local),
//! `host:path` (remote, implicit user) or `user@host:path`. A leading `/`
//! always means a local path, so absolute paths containing colons are
//! never mistaken for remote specs.

use anyhow::anyhow;
use common::{CategorizedError, ExitCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub user: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

impl Location {
    pub fn local(path: &str) -> Self {
        Self {
            user: None,
            host: None,
            path: path.to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        if spec.is_empty() {
            return Err(invalid(spec, "empty location"));
        }
        if spec.starts_with('/') {
            return Ok(Self::local(spec));
        }
        if let (Some(at), Some(colon)) = (spec.find('@'), spec.find(':')) {
            if colon > at {
                let user = &spec[..at];
                let host = &spec[at + 1..colon];
                let path = &spec[colon + 1..];
                if user.is_empty() || host.is_empty() || path.is_empty() {
                    return Err(invalid(spec, "expected user@host:path"));
                }
                return Ok(Self {
                    user: Some(user.to_string()),
                    host: Some(host.to_string()),
                    path: path.to_string(),
                });
            }
        }
        if let Some(colon) = spec.find(':') {
            let host = &spec[..colon];
            let path = &spec[colon + 1..];
            if host.is_empty() || path.is_empty() {
                return Err(invalid(spec, "expected host:path"));
            }
            return Ok(Self {
                user: None,
                host: Some(host.to_string()),
                path: path.to_string(),
            });
        }
        Ok(Self::local(spec))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => write!(f, "{}@{}:{}", user, host, self.path),
            (None, Some(host)) => write!(f, "{}:{}", host, self.path),
            _ => write!(f, "{}", self.path),
        }
    }
}

fn invalid(spec: &str, detail: &str) -> anyhow::Error {
    CategorizedError::new(
        ExitCode::Config,
        anyhow!("invalid location {:?}: {}", spec, detail),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::errcode::exit_code_of;

    #[test]
    fn absolute_path_is_local() {
        let loc = Location::parse("/data/in:colon").unwrap();
        assert_eq!(loc.host, None);
        assert_eq!(loc.path, "/data/in:colon");
    }

    #[test]
    fn relative_path_is_local() {
        let loc = Location::parse("data/incoming").unwrap();
        assert!(!loc.is_remote());
        assert_eq!(loc.path, "data/incoming");
    }

    #[test]
    fn host_and_path() {
        let loc = Location::parse("storage01:/srv/data").unwrap();
        assert_eq!(loc.user, None);
        assert_eq!(loc.host.as_deref(), Some("storage01"));
        assert_eq!(loc.path, "/srv/data");
    }

    #[test]
    fn user_host_and_path() {
        let loc = Location::parse("deploy@storage01:archive").unwrap();
        assert_eq!(loc.user.as_deref(), Some("deploy"));
        assert_eq!(loc.host.as_deref(), Some("storage01"));
        assert_eq!(loc.path, "archive");
    }

    #[test]
    fn rejects_malformed_specs() {
        for spec in ["", ":path", "host:", "@host:path", "user@:path", "user@host:"] {
            let err = Location::parse(spec).unwrap_err();
            assert_eq!(exit_code_of(&err), ExitCode::Config, "spec: {:?}", spec);
        }
    }

    #[test]
    fn at_sign_without_colon_is_a_local_name() {
        let loc = Location::parse("notes@home").unwrap();
        assert!(!loc.is_remote());
    }

    #[test]
    fn display_round_trips() {
        for spec in ["/data", "storage01:/srv/data", "deploy@storage01:archive"] {
            assert_eq!(Location::parse(spec).unwrap().to_string(), spec);
        }
    }
}
