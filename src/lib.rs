//! PAIC auth provides service account access tokens for ForgeRock / Ping Advanced Identity Cloud
//!
//! A service account is identified by its ID and a private RSA key, usually downloaded from
//! the tenant as a JSON Web Key. This library signs a short-lived assertion with that key and
//! exchanges it at the tenant's `/am/oauth2/access_token` endpoint using the JWT-Bearer grant
//! (RFC 7523). The resulting [`TokenResult`] carries a bearer token for the platform APIs.
//!
//! Every call performs exactly one token exchange. Tokens are not cached and failed requests
//! are not retried; callers that need either should build it on top.
//!
//! ## Simple usage
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), paic_auth::Error> {
//! use paic_auth::ServiceAccount;
//!
//! let service_account = ServiceAccount::from_file("token-config.json")?;
//! let token = service_account.token().await?;
//! println!("expires at {}", token.expires_at());
//! # Ok(())
//! # }
//! ```
//!
//! ## Building the request in code
//!
//! ```rust,no_run
//! # fn get_token(jwk: &str) -> Result<(), paic_auth::Error> {
//! use paic_auth::{KeyDescription, KeySource, RequestConfig, ServiceAccount};
//!
//! let config = RequestConfig::new(
//!     "2f3b1c9e-8a41-4c7e-9d2a-6b1f0e5c7a13",
//!     "https://openam-example.forgeblocks.com",
//!     KeySource::Jwk(jwk.parse::<KeyDescription>()?),
//! )
//! .with_scope("fr:am:* fr:idm:*");
//!
//! // Runs the whole exchange on the current thread.
//! let token = ServiceAccount::new(config)?.token_blocking()?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;
use tracing::{instrument, Level};

mod config;
pub use config::{KeySource, RequestConfig, TokenConfig};

mod jwk;
pub use jwk::{KeyDescription, RsaKeyDescription};

mod jwt;

mod service_account;
pub use service_account::ServiceAccount;

mod types;
pub use types::{Signer, TokenMetadata, TokenResult};

/// Select a token generator for the given configuration
///
/// Only service account tokens are supported; configurations asking for `user` or `custom`
/// tokens are rejected with [`Error::Config`].
#[instrument(level = Level::DEBUG, skip(config))]
pub fn generator(config: TokenConfig) -> Result<Arc<dyn TokenGenerator>, Error> {
    Ok(Arc::new(ServiceAccount::from_config(config)?))
}

/// A source of access tokens
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    /// Run one complete token exchange
    ///
    /// Each call signs a fresh assertion and performs a single request; nothing is cached.
    async fn generate(&self) -> Result<TokenResult, Error>;
}

/// Enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The request configuration is incomplete or invalid
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// The configuration could not be read or parsed
    #[error("{0}")]
    ConfigSource(&'static str, #[source] Box<dyn StdError + Send + Sync>),

    /// The key description is incomplete or does not describe a usable RSA key
    #[error("invalid key material in `{field}`: {reason}")]
    KeyMaterial {
        /// Name of the offending key field, e.g. `n` or `kty`
        field: &'static str,
        /// What was wrong with it; never contains key material
        reason: String,
    },

    /// The assertion could not be built or signed
    #[error("{0}")]
    Assertion(&'static str),

    /// The token endpoint could not be reached, or did not answer in time
    #[error("{0}")]
    Transport(String, #[source] Box<dyn StdError + Send + Sync>),

    /// The token endpoint answered 200 but the body is not a token response
    #[error("failed to parse token response")]
    ResponseParse(#[source] serde_json::Error),

    /// The token endpoint rejected the request
    ///
    /// The body is kept verbatim for diagnostics; it is not guaranteed to be JSON.
    #[error("token request failed with status {status}: {body}")]
    Exchange {
        /// HTTP status returned by the token endpoint
        status: StatusCode,
        /// Raw response body
        body: String,
    },
}

impl Error {
    /// The broad category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::ConfigSource(..) => ErrorKind::Config,
            Self::KeyMaterial { .. } => ErrorKind::KeyMaterial,
            Self::Assertion(_) => ErrorKind::Assertion,
            Self::Transport(..) => ErrorKind::Transport,
            Self::ResponseParse(_) => ErrorKind::ResponseParse,
            Self::Exchange { .. } => ErrorKind::Exchange,
        }
    }

    /// Whether calling again later, with a freshly signed assertion, may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(..) => true,
            Self::Exchange { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Broad categories of [`Error`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Fix the configuration
    Config,
    /// Regenerate or re-download the service account key
    KeyMaterial,
    /// Signing failed locally
    Assertion,
    /// Network failure; usually transient
    Transport,
    /// The platform returned something that is not a token response
    ResponseParse,
    /// The platform refused the exchange, e.g. a disabled service account
    Exchange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        let err = Error::Exchange {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Exchange);

        let err = Error::Exchange {
            status: StatusCode::UNAUTHORIZED,
            body: r#"{"error":"invalid_client"}"#.to_owned(),
        };
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            r#"token request failed with status 401 Unauthorized: {"error":"invalid_client"}"#
        );

        let err = Error::KeyMaterial {
            field: "d",
            reason: "missing".to_owned(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::KeyMaterial);
        assert_eq!(err.to_string(), "invalid key material in `d`: missing");
    }

    #[test]
    fn unsupported_token_type() {
        let config = r#"{"type":"user","baseUrl":"https://example.com"}"#
            .parse::<TokenConfig>()
            .unwrap();
        match generator(config) {
            Err(err) => assert_eq!(err.kind(), ErrorKind::Config),
            Ok(_) => panic!("user tokens are not supported"),
        }
    }
}
