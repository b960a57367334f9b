use std::fmt;
use std::time::Duration;

use bytes::Buf;
use chrono::{DateTime, Utc};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

use crate::Error;

#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    inner: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
    timeout: Duration,
}

impl HttpClient {
    pub(crate) fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let https = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                Error::Transport(
                    "failed to load native TLS root certificates for HTTPS".to_owned(),
                    Box::new(err),
                )
            })?;

        // Connections are not reused: every exchange stands alone.
        Ok(Self {
            inner: Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(0)
                .build(https.https_or_http().enable_http1().enable_http2().build()),
            timeout: REQUEST_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a token request once and parse the successful response
    pub(crate) async fn token(&self, req: Request<Full<Bytes>>) -> Result<TokenResponse, Error> {
        let body = self.request(req).await?;
        serde_json::from_slice(&body).map_err(Error::ResponseParse)
    }

    /// Send a request once, bounded by the client timeout, and return the body of a 200 response
    pub(crate) async fn request(&self, req: Request<Full<Bytes>>) -> Result<Bytes, Error> {
        let url = req.uri().to_string();
        debug!(%url, "requesting token");

        let response = async {
            let (parts, body) = self
                .inner
                .request(req)
                .await
                .map_err(|err| Error::Transport(format!("request to {url} failed"), Box::new(err)))?
                .into_parts();

            let mut body = body
                .collect()
                .await
                .map_err(|err| {
                    Error::Transport(
                        format!("failed to read response body from {url}"),
                        Box::new(err),
                    )
                })?
                .aggregate();

            Ok::<_, Error>((parts.status, body.copy_to_bytes(body.remaining())))
        };

        let (status, body) = tokio::time::timeout(self.timeout, response)
            .await
            .map_err(|err| {
                Error::Transport(
                    format!("request to {url} timed out after {:?}", self.timeout),
                    Box::new(err),
                )
            })??;

        debug!(%status, "token endpoint responded");
        if status != StatusCode::OK {
            let body = String::from_utf8_lossy(&body).into_owned();
            warn!(%body, %status, "token request failed");
            return Err(Error::Exchange { status, body });
        }

        Ok(body)
    }
}

/// Token response body from the `/am/oauth2/access_token` endpoint
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) token_type: String,
    #[serde(default)]
    pub(crate) expires_in: Option<u64>,
    #[serde(default)]
    pub(crate) scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"****")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// An access token obtained from a successful exchange
///
/// The token does not implement [`Display`] to avoid accidentally printing the token in log
/// files, likewise [`Debug`] does not expose the token value itself which is only available
/// using the [`TokenResult::as_str`] method. The [`Serialize`] implementation does include
/// it, for callers that render the result.
///
/// [`Display`]: fmt::Display
#[derive(Clone, Serialize)]
pub struct TokenResult {
    access_token: String,
    token_type: String,
    expires_in: u64,
    expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    metadata: TokenMetadata,
}

impl TokenResult {
    pub(crate) fn new(response: TokenResponse, metadata: TokenMetadata) -> Self {
        let expires_in = response.expires_in.unwrap_or_default();
        let expires_at = chrono::Duration::from_std(Duration::from_secs(expires_in))
            .ok()
            .and_then(|lifetime| metadata.generated_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_in,
            expires_at,
            scope: response.scope,
            metadata,
        }
    }

    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// Token type as reported by the server, usually `Bearer`
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Lifetime reported by the server; zero if the server did not report one
    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }

    /// When the token expires, computed when the response was received
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Scopes granted, if the server reported them
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Where the token came from
    pub fn metadata(&self) -> &TokenMetadata {
        &self.metadata
    }

    /// Whether the token has expired, or is about to
    ///
    /// This takes an additional 20s margin to ensure the token can still be reasonably used
    /// instead of expiring right after having checked.
    pub fn has_expired(&self) -> bool {
        self.expires_at - Duration::from_secs(20) <= Utc::now()
    }
}

impl fmt::Debug for TokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResult")
            .field("access_token", &"****")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Details about the request that produced a [`TokenResult`]
#[derive(Clone, Debug, Serialize)]
pub struct TokenMetadata {
    pub(crate) service_account_id: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub(crate) generated_at: DateTime<Utc>,
    pub(crate) platform: String,
}

impl TokenMetadata {
    /// The service account the token was issued to
    pub fn service_account_id(&self) -> &str {
        &self.service_account_id
    }

    /// When the token response was received
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// The tenant base URL the token was requested from
    pub fn platform(&self) -> &str {
        &self.platform
    }
}

fn serialize_timestamp<S: Serializer>(
    time: &DateTime<Utc>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(time.timestamp())
}

/// An RSA PKCS1 SHA256 signer
///
/// Built from a service account key and used for exactly one assertion. It only exposes
/// signing; the key itself cannot be read back.
pub struct Signer {
    key: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    pub(crate) fn from_key_pair(key: RsaKeyPair) -> Self {
        Signer {
            key,
            rng: SystemRandom::new(),
        }
    }

    /// Load an RSA private key from PEM, PKCS#8 or PKCS#1
    pub(crate) fn from_pem(pem: &str) -> Result<Self, Error> {
        let key = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|_| {
            Error::KeyMaterial {
                field: "privateKey",
                reason: "no PEM encoded private key found".to_owned(),
            }
        })?;

        let key = match &key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => {
                return Err(Error::KeyMaterial {
                    field: "privateKey",
                    reason: "not an RSA private key".to_owned(),
                })
            }
        }
        .map_err(|err| Error::KeyMaterial {
            field: "privateKey",
            reason: format!("invalid RSA private key: {err}"),
        })?;

        Ok(Self::from_key_pair(key))
    }

    /// Sign the input message and return the signature
    pub fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(&RSA_PKCS1_SHA256, &self.rng, input, &mut signature)
            .map_err(|_| Error::Assertion("failed to sign assertion"))?;
        Ok(signature)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}

/// Upper bound on one token request, from connecting to reading the whole body.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwk::tests::verify;

    const PEM: &str = include_str!("../testdata/rsa_pkcs8.pem");

    fn metadata() -> TokenMetadata {
        TokenMetadata {
            service_account_id: "sa".to_owned(),
            generated_at: Utc::now(),
            platform: "https://example.com".to_owned(),
        }
    }

    #[test]
    fn test_deserialize_with_time() {
        let s = r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600}"#;
        let token = TokenResult::new(serde_json::from_str(s).unwrap(), metadata());
        let expires = Utc::now() + Duration::from_secs(3600);

        assert_eq!(token.as_str(), "abc");
        assert_eq!(token.token_type(), "Bearer");
        assert_eq!(token.expires_in(), Duration::from_secs(3600));
        assert_eq!(token.scope(), None);
        assert!(!token.has_expired());

        // Testing time is always racy, give it 1s leeway.
        let expires_at = token.expires_at();
        assert!(expires_at < expires + Duration::from_secs(1));
        assert!(expires_at > expires - Duration::from_secs(1));
    }

    #[test]
    fn missing_expiry_defaults_to_zero() {
        let s = r#"{"access_token":"abc","token_type":"Bearer","scope":"fr:am:*"}"#;
        let metadata = metadata();
        let generated_at = metadata.generated_at;
        let token = TokenResult::new(serde_json::from_str(s).unwrap(), metadata);

        assert_eq!(token.expires_in(), Duration::ZERO);
        assert_eq!(token.expires_at(), generated_at);
        assert_eq!(token.scope(), Some("fr:am:*"));
        assert!(token.has_expired());
    }

    #[test]
    fn required_response_fields() {
        assert!(serde_json::from_str::<TokenResponse>(r#"{"token_type":"Bearer"}"#).is_err());
        assert!(serde_json::from_str::<TokenResponse>(r#"{"access_token":"abc"}"#).is_err());
    }

    #[test]
    fn serialized_and_debug_forms() {
        let s = r#"{"access_token":"secret-token","token_type":"Bearer","expires_in":60}"#;
        let token = TokenResult::new(serde_json::from_str(s).unwrap(), metadata());

        let debug = format!("{token:?}");
        assert!(!debug.contains("secret-token"));

        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["access_token"], "secret-token");
        assert_eq!(value["expires_in"], 60);
        assert!(value.get("scope").is_none());
        assert_eq!(value["metadata"]["service_account_id"], "sa");
        assert_eq!(value["metadata"]["platform"], "https://example.com");
        assert!(value["metadata"]["generated_at"].is_i64());
        assert!(value["expires_at"].is_string());
    }

    #[test]
    fn default_request_timeout() {
        let client = HttpClient::new().unwrap();
        assert_eq!(client.timeout, Duration::from_secs(30));

        let client = client.with_timeout(Duration::from_secs(1));
        assert_eq!(client.timeout, Duration::from_secs(1));
    }

    #[test]
    fn pem_keys() {
        let signer = Signer::from_pem(PEM).unwrap();
        let signature = signer.sign(b"payload").unwrap();
        assert!(verify(b"payload", &signature));

        match Signer::from_pem("not a key") {
            Err(Error::KeyMaterial { field, .. }) => assert_eq!(field, "privateKey"),
            other => panic!("expected key material error, got {other:?}"),
        }
    }
}
