use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::Request;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::config::{KeySource, RequestConfig, TokenConfig};
use crate::jwt::{self, SignedAssertion};
use crate::types::{HttpClient, Signer, TokenMetadata, TokenResponse, TokenResult};
use crate::{Error, TokenGenerator};

/// A service account that exchanges signed assertions for access tokens
///
/// Every call to [`ServiceAccount::token`] decodes the key, signs a new assertion and
/// performs one request to the token endpoint. Nothing is cached between calls, so a
/// `ServiceAccount` can be shared freely between tasks.
#[derive(Debug)]
pub struct ServiceAccount {
    client: HttpClient,
    config: RequestConfig,
}

impl ServiceAccount {
    /// Create a service account from a normalized request
    pub fn new(config: RequestConfig) -> Result<Self, Error> {
        config.validate()?;
        debug!(
            service_account_id = config.service_account_id(),
            base_url = config.base_url(),
            "found service account configuration"
        );
        Ok(Self {
            client: HttpClient::new()?,
            config,
        })
    }

    /// Normalize a user configuration and create a service account from it
    pub fn from_config(config: TokenConfig) -> Result<Self, Error> {
        Self::new(RequestConfig::try_from(config)?)
    }

    /// Read the configuration file named by the `PAIC_TOKEN_CONFIG` environment variable
    pub fn from_env() -> Result<Option<Self>, Error> {
        debug!("check for PAIC_TOKEN_CONFIG env var");
        match TokenConfig::from_env()? {
            Some(config) => Self::from_config(config).map(Some),
            None => Ok(None),
        }
    }

    /// Read the configuration from the given JSON file
    pub fn from_file<T: AsRef<Path>>(path: T) -> Result<Self, Error> {
        Self::from_config(TokenConfig::from_file(path)?)
    }

    /// Read the configuration from the given JSON string
    pub fn from_json(s: &str) -> Result<Self, Error> {
        Self::from_config(s.parse()?)
    }

    /// Exchange a freshly signed assertion for an access token
    #[instrument(
        level = Level::DEBUG,
        skip(self),
        fields(service_account_id = %self.config.service_account_id())
    )]
    pub async fn token(&self) -> Result<TokenResult, Error> {
        let token_url = self.config.token_url();
        let assertion = {
            let signer = self.signer()?;
            debug!("key decoded");
            jwt::build(
                self.config.service_account_id(),
                &token_url,
                self.config.lifetime().as_secs(),
                &signer,
            )?
        };
        debug!(audience = %token_url, lifetime = ?self.config.lifetime(), "assertion signed");

        let response = self
            .exchange(&token_url, assertion, self.config.scope())
            .await?;

        let token = TokenResult::new(
            response,
            TokenMetadata {
                service_account_id: self.config.service_account_id().to_owned(),
                generated_at: Utc::now(),
                platform: self.config.base_url().to_owned(),
            },
        );
        debug!(
            token_len = token.as_str().len(),
            token_type = token.token_type(),
            expires_at = %token.expires_at(),
            "access token received"
        );
        Ok(token)
    }

    /// Like [`ServiceAccount::token`], but runs to completion on the current thread
    ///
    /// This starts a single-threaded runtime for the duration of the call, so it must not be
    /// called from within an async context.
    pub fn token_blocking(&self) -> Result<TokenResult, Error> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::Transport("failed to start runtime".to_owned(), Box::new(err)))?
            .block_on(self.token())
    }

    /// The service account ID, used as issuer and subject of the assertion
    pub fn service_account_id(&self) -> &str {
        self.config.service_account_id()
    }

    /// The token endpoint tokens are requested from
    pub fn token_url(&self) -> String {
        self.config.token_url()
    }

    fn signer(&self) -> Result<Signer, Error> {
        match self.config.key_source() {
            KeySource::Jwk(jwk) => jwk.decode(),
            KeySource::Pem(pem) => Signer::from_pem(pem),
        }
    }

    async fn exchange(
        &self,
        token_url: &str,
        assertion: SignedAssertion,
        scope: &str,
    ) -> Result<TokenResponse, Error> {
        let body = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            form.extend_pairs(&[
                ("client_id", CLIENT_ID),
                ("grant_type", GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ]);
            if !scope.is_empty() {
                form.append_pair("scope", scope);
            }
            Bytes::from(form.finish().into_bytes())
        };

        let request = Request::post(token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(Full::from(body))
            .map_err(|_| Error::Config("token endpoint is not a valid URI"))?;

        debug!(%token_url, grant_type = GRANT_TYPE, scope, "exchanging assertion");
        self.client.token(request).await
    }
}

#[async_trait]
impl TokenGenerator for ServiceAccount {
    async fn generate(&self) -> Result<TokenResult, Error> {
        self.token().await
    }
}

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CLIENT_ID: &str = "service-account";
const USER_AGENT_VALUE: &str = concat!("paic_auth/", env!("CARGO_PKG_VERSION"));
