//! Token-based credentials for remote access.
//!
//! The provider is built once at startup from the configured token. For each
//! push it hands out an [`AuthenticatedUrl`] with the token embedded as URL
//! userinfo; that value lives only for the duration of the push and is used
//! through an in-memory remote, so the token never reaches `.git/config`.
//! Clone and fetch go against the plain URL and authenticate through
//! [`CredentialProvider::credential`] instead.

use std::fmt;

use git2::{Cred, CredentialType};

use crate::errors::CredentialError;

/// Username paired with the token for HTTP basic auth.
pub const TOKEN_USERNAME: &str = "x-access-token";

const REDACTED: &str = "***TOKEN***";

/// Holds the long-lived access token.
#[derive(Clone)]
pub struct CredentialProvider {
    token: String,
    /// Percent-encoded form used as URL userinfo.
    encoded: String,
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("token", &REDACTED)
            .finish()
    }
}

impl CredentialProvider {
    /// Create a provider. An empty token is a fatal configuration error.
    pub fn new(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::MissingToken);
        }
        if token.chars().any(char::is_control) {
            return Err(CredentialError::InvalidToken);
        }
        let encoded = urlencoding::encode(&token).into_owned();
        Ok(Self { token, encoded })
    }

    /// Build the authenticated form of `url` for a single network operation.
    ///
    /// HTTP(S) URLs get `x-access-token:<token>@` userinfo, with the token
    /// percent-encoded, replacing any userinfo already present. Other transports (local paths, `file://`,
    /// ssh) are returned unchanged.
    pub fn authenticate(&self, url: &str) -> Result<AuthenticatedUrl, CredentialError> {
        let Some((scheme, rest)) = url.split_once("://") else {
            return Ok(AuthenticatedUrl::passthrough(url));
        };
        let scheme_lc = scheme.to_ascii_lowercase();
        if scheme_lc != "http" && scheme_lc != "https" {
            return Ok(AuthenticatedUrl::passthrough(url));
        }

        let authority_end = rest.find('/').unwrap_or(rest.len());
        let (authority, path) = rest.split_at(authority_end);
        let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        if host.is_empty() {
            return Err(CredentialError::InvalidUrl(url.to_string()));
        }

        Ok(AuthenticatedUrl {
            url: format!(
                "{}://{}:{}@{}{}",
                scheme_lc, TOKEN_USERNAME, self.encoded, host, path
            ),
            display: format!("{}://{}{}", scheme_lc, host, path),
            authenticated: true,
        })
    }

    /// Answer a libgit2 credential request with the token.
    pub fn credential(&self, allowed: CredentialType) -> Result<Cred, git2::Error> {
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            Cred::userpass_plaintext(TOKEN_USERNAME, &self.token)
        } else {
            Cred::default()
        }
    }

    /// Scrub the token out of text headed for logs or results.
    pub fn redact(&self, text: &str) -> String {
        text.replace(&self.token, REDACTED)
            .replace(&self.encoded, REDACTED)
    }
}

/// A remote URL carrying credentials. Short-lived by construction; its
/// `Debug` and `Display` never show the token.
pub struct AuthenticatedUrl {
    url: String,
    display: String,
    authenticated: bool,
}

impl AuthenticatedUrl {
    fn passthrough(url: &str) -> Self {
        Self {
            url: url.to_string(),
            display: url.to_string(),
            authenticated: false,
        }
    }

    /// The URL to hand to the transport.
    pub fn expose(&self) -> &str {
        &self.url
    }

    /// Whether a token was embedded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

impl fmt::Display for AuthenticatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for AuthenticatedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedUrl")
            .field("url", &self.display)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
