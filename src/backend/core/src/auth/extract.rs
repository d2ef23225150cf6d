//! Credential extraction with a single precedence rule: header before cookie.

use axum::http::{header, HeaderMap};

use super::RequestType;

/// A raw credential and the source it was read from.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub request_type: RequestType,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("request_type", &self.request_type)
            .finish()
    }
}

/// Extract a credential from request headers.
///
/// The `Authorization` header is consulted first; its scheme is matched
/// case-insensitively against `Bearer`. If it is absent, uses another scheme
/// or carries an empty token, the cookie named `cookie_name` is tried. The
/// first non-empty source wins.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<Credential> {
    bearer_token(headers)
        .map(|token| Credential {
            token,
            request_type: RequestType::Bearer,
        })
        .or_else(|| {
            cookie_token(headers, cookie_name).map(|token| Credential {
                token,
                request_type: RequestType::Cookie,
            })
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::AUTHORIZATION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|value| {
            let value = value.trim();
            let (scheme, token) = value.split_once(char::is_whitespace)?;
            if !scheme.eq_ignore_ascii_case("bearer") {
                return None;
            }
            let token = token.trim();
            (!token.is_empty()).then(|| token.to_string())
        })
}

fn cookie_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.trim() != cookie_name {
                return None;
            }
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_bearer_header() {
        let h = headers(&[(header::AUTHORIZATION, "Bearer abc.def.ghi")]);
        let credential = extract_token(&h, "access_token").unwrap();
        assert_eq!(credential.token, "abc.def.ghi");
        assert_eq!(credential.request_type, RequestType::Bearer);
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let h = headers(&[(header::AUTHORIZATION, "bEaReR   tok")]);
        assert_eq!(extract_token(&h, "access_token").unwrap().token, "tok");
    }

    #[test]
    fn test_header_wins_over_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer from-header"),
            (header::COOKIE, "access_token=from-cookie"),
        ]);
        let credential = extract_token(&h, "access_token").unwrap();
        assert_eq!(credential.token, "from-header");
        assert_eq!(credential.request_type, RequestType::Bearer);
    }

    #[test]
    fn test_empty_header_falls_through_to_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Bearer "),
            (header::COOKIE, "theme=dark; access_token=from-cookie; lang=en"),
        ]);
        let credential = extract_token(&h, "access_token").unwrap();
        assert_eq!(credential.token, "from-cookie");
        assert_eq!(credential.request_type, RequestType::Cookie);
    }

    #[test]
    fn test_other_scheme_falls_through_to_cookie() {
        let h = headers(&[
            (header::AUTHORIZATION, "Basic dXNlcjpwYXNz"),
            (header::COOKIE, "access_token=\"quoted\""),
        ]);
        assert_eq!(extract_token(&h, "access_token").unwrap().token, "quoted");
    }

    #[test]
    fn test_no_credential() {
        let h = headers(&[(header::COOKIE, "access_token=; other=x")]);
        assert!(extract_token(&h, "access_token").is_none());
        assert!(extract_token(&HeaderMap::new(), "access_token").is_none());
    }

    #[test]
    fn test_debug_hides_token() {
        let credential = Credential {
            token: "secret-token".into(),
            request_type: RequestType::Cookie,
        };
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }
}
