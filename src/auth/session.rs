//! Cookie-backed credential session.
//!
//! A [`CredentialSession`] accumulates the cookies handed out by the identity
//! service during login. It is a plain value owned by one authenticated run:
//! the authenticator mutates it, the metrics client only reads it.

use std::collections::BTreeMap;

use crate::http::HttpResponse;

/// Cookie carrying the account info issued after a successful sign-in.
pub const ACCOUNT_COOKIE: &str = "myacinfo";

/// Cookie carrying the App Store Connect session context.
pub const SESSION_COOKIE: &str = "itctx";

/// `Accept` header the portal's web client sends.
pub const PORTAL_ACCEPT: &str = "application/json, text/javascript, */*";

/// `set-cookie` attributes that describe a cookie rather than name one.
const COOKIE_ATTRIBUTES: &[&str] = &[
    "path", "domain", "expires", "max-age", "secure", "httponly", "samesite", "priority",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSession {
    cookies: BTreeMap<String, String>,
}

impl CredentialSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn has_account_cookie(&self) -> bool {
        self.cookies.contains_key(ACCOUNT_COOKIE)
    }

    pub fn has_session_cookie(&self) -> bool {
        self.cookies.contains_key(SESSION_COOKIE)
    }

    /// A session can back API calls only once both login cookies are present.
    pub fn is_usable(&self) -> bool {
        self.has_account_cookie() && self.has_session_cookie()
    }

    /// Upsert every `key=value` pair of a single `set-cookie` header value.
    ///
    /// The value is split on `;`. Attributes such as `Path=/` and bare flags
    /// such as `Secure` are skipped. Within one header the last duplicate wins.
    pub fn absorb_set_cookie(&mut self, header_value: &str) {
        for (name, value) in parse_set_cookie(header_value) {
            self.cookies.insert(name, value);
        }
    }

    /// Absorb every `set-cookie` header carried by `response`.
    pub fn absorb_response(&mut self, response: &HttpResponse) {
        for value in response.header_values("set-cookie") {
            self.absorb_set_cookie(value);
        }
    }

    /// Value for the `Cookie` request header: `key=value` pairs joined by spaces.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Headers every portal request carries: JSON content negotiation plus cookies.
    pub fn request_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Content-Type", "application/json".to_string()),
            ("Accept", PORTAL_ACCEPT.to_string()),
            ("Cookie", self.cookie_header()),
        ]
    }
}

/// Split a `set-cookie` header value into its cookie pairs.
pub fn parse_set_cookie(header_value: &str) -> Vec<(String, String)> {
    header_value
        .split(';')
        .filter_map(|segment| {
            let (name, value) = segment.split_once('=')?;
            let name = name.trim();
            if name.is_empty() || is_cookie_attribute(name) {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn is_cookie_attribute(name: &str) -> bool {
    COOKIE_ATTRIBUTES
        .iter()
        .any(|attr| attr.eq_ignore_ascii_case(name))
}
