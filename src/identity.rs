use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the fingerprint hash. Enough entropy
/// to keep legitimate users apart; this is not an authentication boundary.
const USER_KEY_LEN: usize = 16;

/// Pseudonymous per-user identity derived from connection metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserKey(String);

impl UserKey {
    /// Shortened form for responses and logs
    pub fn preview(&self) -> String {
        format!("{}...", &self.0[..8])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive a stable `UserKey` from request headers.
///
/// The address is the first entry of `x-forwarded-for` (the gateway is
/// expected to run behind a reverse proxy), falling back to `x-real-ip` and
/// then to `"unknown"`. Two requests with identical inputs always map to the
/// same key; collisions between distinct real users are a tolerated tradeoff.
pub fn resolve_user_key(headers: &HeaderMap) -> UserKey {
    let address = header_str(headers, "x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .unwrap_or("unknown");
    let fingerprint = header_str(headers, "x-user-fingerprint").unwrap_or("");
    let user_agent = header_str(headers, "user-agent").unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(format!("{address}_{fingerprint}_{user_agent}"));
    let digest = hex::encode(hasher.finalize());
    UserKey(digest[..USER_KEY_LEN].to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(entries: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in entries {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_key_is_deterministic() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-user-fingerprint", "fp-abc"),
            ("user-agent", "Mozilla/5.0"),
        ]);
        let first = resolve_user_key(&h);
        let second = resolve_user_key(&h);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), USER_KEY_LEN);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_forwarded_for_uses_first_entry_trimmed() {
        let direct = resolve_user_key(&headers(&[("x-forwarded-for", "203.0.113.7")]));
        let chained = resolve_user_key(&headers(&[(
            "x-forwarded-for",
            " 203.0.113.7 , 10.0.0.1, 10.0.0.2",
        )]));
        assert_eq!(direct, chained);
    }

    #[test]
    fn test_distinct_inputs_produce_distinct_keys() {
        let a = resolve_user_key(&headers(&[("x-forwarded-for", "203.0.113.7")]));
        let b = resolve_user_key(&headers(&[("x-forwarded-for", "203.0.113.8")]));
        let c = resolve_user_key(&headers(&[
            ("x-forwarded-for", "203.0.113.7"),
            ("x-user-fingerprint", "fp"),
        ]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_real_ip_fallback() {
        let real_ip = resolve_user_key(&headers(&[("x-real-ip", "198.51.100.4")]));
        let forwarded = resolve_user_key(&headers(&[("x-forwarded-for", "198.51.100.4")]));
        // Same address through either header hashes identically
        assert_eq!(real_ip, forwarded);
    }

    #[test]
    fn test_missing_metadata_still_produces_a_key() {
        let key = resolve_user_key(&HeaderMap::new());
        assert_eq!(key.as_str().len(), USER_KEY_LEN);
        assert_eq!(key, resolve_user_key(&HeaderMap::new()));
    }

    #[test]
    fn test_preview_is_shortened() {
        let key = resolve_user_key(&HeaderMap::new());
        let preview = key.preview();
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), 11);
    }
}
