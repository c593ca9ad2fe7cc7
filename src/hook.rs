use crate::error::HookError;
use crate::requestor::retry::RetryToken;
use serde::{Deserialize, Serialize};
use url::Url;

/// A webhook target as it appears in application JSON: either a bare URL
/// string or an object carrying method and basic-auth credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookSpec {
    Url(String),
    Object {
        url: String,
        #[serde(default)]
        method: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl HookScheme {
    pub fn is_ws(&self) -> bool {
        matches!(self, HookScheme::Ws | HookScheme::Wss)
    }
}

/// Normalized webhook target.
#[derive(Debug, Clone)]
pub struct Hook {
    pub url: String,
    pub method: HookMethod,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Hook {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            method: HookMethod::Post,
            username: None,
            password: None,
        }
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Resolve against the session base URL: relative paths join the base,
    /// absolute URLs stand alone, and the `#` fragment is parsed for
    /// per-hook retry overrides then stripped.
    pub fn resolve(&self, base: &Url) -> Result<ResolvedHook, HookError> {
        let mut url = base
            .join(&self.url)
            .map_err(|e| HookError::InvalidHook(format!("{}: {}", self.url, e)))?;

        let scheme = match url.scheme() {
            "http" => HookScheme::Http,
            "https" => HookScheme::Https,
            "ws" => HookScheme::Ws,
            "wss" => HookScheme::Wss,
            other => {
                return Err(HookError::InvalidHook(format!(
                    "unsupported scheme {other}"
                )))
            }
        };

        let retry = url.fragment().map(RetryOverride::parse).unwrap_or_default();
        url.set_fragment(None);

        let basic_auth = match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };

        Ok(ResolvedHook {
            url,
            scheme,
            method: self.method,
            basic_auth,
            retry,
        })
    }
}

impl From<HookSpec> for Hook {
    fn from(spec: HookSpec) -> Self {
        match spec {
            HookSpec::Url(url) => Hook::new(url),
            HookSpec::Object {
                url,
                method,
                username,
                password,
            } => Hook {
                url,
                method: match method.as_deref() {
                    Some(m) if m.eq_ignore_ascii_case("get") => HookMethod::Get,
                    _ => HookMethod::Post,
                },
                username,
                password,
            },
        }
    }
}

/// Per-hook retry configuration from the URL fragment
/// (`#rp=<tokens>&rc=<count>`). Unknown options are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverride {
    pub policy: Option<Vec<RetryToken>>,
    pub count: Option<u8>,
}

impl RetryOverride {
    pub fn parse(fragment: &str) -> Self {
        let mut out = RetryOverride::default();
        for pair in fragment.split('&') {
            let mut kv = pair.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("rp"), Some(v)) => {
                    let tokens = RetryToken::parse_list(v);
                    if !tokens.is_empty() {
                        out.policy = Some(tokens);
                    }
                }
                (Some("rc"), Some(v)) => {
                    if let Ok(n) = v.parse::<i32>() {
                        out.count = Some(n.unsigned_abs().clamp(1, 5) as u8);
                    }
                }
                _ => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedHook {
    pub url: Url,
    pub scheme: HookScheme,
    pub method: HookMethod,
    pub basic_auth: Option<(String, String)>,
    pub retry: RetryOverride,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://app.example/hooks/main").unwrap()
    }

    #[test]
    fn test_bare_string_spec() {
        let spec: HookSpec = serde_json::from_str(r#""https://x.example/a""#).unwrap();
        let hook: Hook = spec.into();
        assert_eq!(hook.url, "https://x.example/a");
        assert_eq!(hook.method, HookMethod::Post);
    }

    #[test]
    fn test_object_spec_with_auth_and_method() {
        let spec: HookSpec = serde_json::from_str(
            r#"{"url": "/status", "method": "GET", "username": "u", "password": "p"}"#,
        )
        .unwrap();
        let hook: Hook = spec.into();
        assert_eq!(hook.method, HookMethod::Get);
        let resolved = hook.resolve(&base()).unwrap();
        assert_eq!(resolved.url.as_str(), "https://app.example/status");
        assert_eq!(
            resolved.basic_auth,
            Some(("u".to_string(), "p".to_string()))
        );
    }

    #[test]
    fn test_relative_resolution() {
        let hook = Hook::new("events");
        let resolved = hook.resolve(&base()).unwrap();
        assert_eq!(resolved.url.as_str(), "https://app.example/hooks/events");
    }

    #[test]
    fn test_ws_scheme_detected() {
        let hook = Hook::new("wss://app.example/socket");
        let resolved = hook.resolve(&base()).unwrap();
        assert!(resolved.scheme.is_ws());
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let hook = Hook::new("ftp://app.example/file");
        assert!(matches!(
            hook.resolve(&base()),
            Err(HookError::InvalidHook(_))
        ));
    }

    #[test]
    fn test_fragment_options_parsed_and_stripped() {
        let hook = Hook::new("https://app.example/a#rp=5xx,ct&rc=3");
        let resolved = hook.resolve(&base()).unwrap();
        assert_eq!(resolved.url.as_str(), "https://app.example/a");
        assert_eq!(
            resolved.retry.policy,
            Some(vec![RetryToken::Status5xx, RetryToken::ConnectFailure])
        );
        assert_eq!(resolved.retry.count, Some(3));
    }

    #[test]
    fn test_retry_count_clamped() {
        assert_eq!(RetryOverride::parse("rc=99").count, Some(5));
        assert_eq!(RetryOverride::parse("rc=-3").count, Some(3));
        assert_eq!(RetryOverride::parse("rc=0").count, Some(1));
    }

    #[test]
    fn test_unknown_fragment_options_ignored() {
        let o = RetryOverride::parse("foo=bar&rc=2&baz");
        assert_eq!(o.count, Some(2));
        assert!(o.policy.is_none());
    }
}
