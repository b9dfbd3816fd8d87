use crate::config::BackendTarget;
use crate::credentials::Credentials;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use hyper::StatusCode;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No usable Basic credentials on the request
    MissingCredentials,
    /// Credentials present but not matching
    InvalidCredentials,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::MissingCredentials => "missing credentials",
            DenyReason::InvalidCredentials => "invalid credentials",
        }
    }
}

/// Per-request admission outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    Allow(BackendTarget),
    Deny { status: StatusCode, reason: DenyReason },
}

impl ProxyDecision {
    fn deny(reason: DenyReason) -> Self {
        ProxyDecision::Deny {
            status: StatusCode::UNAUTHORIZED,
            reason,
        }
    }

    /// Short label for access logs
    pub fn label(&self) -> &'static str {
        match self {
            ProxyDecision::Allow(_) => "allow",
            ProxyDecision::Deny { reason, .. } => reason.as_str(),
        }
    }
}

/// Validates HTTP Basic credentials against the configured pair
#[derive(Clone)]
pub struct Authenticator {
    credentials: Arc<Credentials>,
    target: BackendTarget,
    challenge: HeaderValue,
}

impl Authenticator {
    pub fn new(credentials: Arc<Credentials>, target: BackendTarget, realm: &str) -> Self {
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\", charset=\"UTF-8\"", realm))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        Self {
            credentials,
            target,
            challenge,
        }
    }

    /// Decide whether a request may be forwarded
    pub fn authenticate(&self, path: &str, headers: &HeaderMap) -> ProxyDecision {
        let decision = self.decide(headers);
        debug!(path, decision = decision.label(), "Authentication decision");
        decision
    }

    fn decide(&self, headers: &HeaderMap) -> ProxyDecision {
        let mut values = headers.get_all(AUTHORIZATION).iter();
        let (Some(value), None) = (values.next(), values.next()) else {
            // Absent, or ambiguous because repeated
            return ProxyDecision::deny(DenyReason::MissingCredentials);
        };

        let Some((username, password)) = value.to_str().ok().and_then(parse_basic) else {
            return ProxyDecision::deny(DenyReason::MissingCredentials);
        };

        if self.verify(&username, &password) {
            ProxyDecision::Allow(self.target.clone())
        } else {
            ProxyDecision::deny(DenyReason::InvalidCredentials)
        }
    }

    /// Compare both fields without short-circuiting
    fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(username.as_bytes(), self.credentials.username().as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), self.credentials.password().as_bytes());
        user_ok & pass_ok
    }

    /// Value for the `WWW-Authenticate` header on a 401
    pub fn challenge(&self) -> &HeaderValue {
        &self.challenge
    }
}

/// Decode an `Authorization: Basic ...` value into `(user, password)`
pub fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Build an `Authorization` header value for the given pair
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Constant-time equality that also hides the length of either input.
///
/// Both sides are reduced to fixed-size SHA-256 digests first, so the XOR fold
/// always runs over 32 bytes regardless of where or whether the inputs differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
