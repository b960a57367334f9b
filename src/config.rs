use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

use serde::{de, Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::jwk::KeyDescription;
use crate::Error;

/// Token configuration as written by users
///
/// Field names follow the `pctl` token configuration format, including its alternative
/// spellings (`platform` for `baseUrl`, `exp_seconds` for `expiresIn`, `scope` for `scopes`).
/// Normalize it into a [`RequestConfig`] with `RequestConfig::try_from`.
#[derive(Clone, Default, Deserialize)]
pub struct TokenConfig {
    #[serde(rename = "type", default)]
    token_type: Option<String>,
    #[serde(rename = "baseUrl", default)]
    base_url: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default, alias = "serviceAccountId")]
    service_account_id: Option<String>,
    #[serde(default)]
    jwk_json: Option<serde_json::Value>,
    #[serde(rename = "privateKey", default)]
    private_key: Option<String>,
    #[serde(rename = "expiresIn", default, deserialize_with = "deserialize_duration")]
    expires_in: Option<Duration>,
    #[serde(default)]
    exp_seconds: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
}

impl TokenConfig {
    /// Read the configuration file named by the `PAIC_TOKEN_CONFIG` environment variable
    pub fn from_env() -> Result<Option<Self>, Error> {
        env::var_os(CONFIG_ENV)
            .map(|path| {
                debug!(?path, "reading token config from {CONFIG_ENV} env var");
                Self::from_file(path)
            })
            .transpose()
    }

    /// Read the configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path.as_ref()).map_err(|err| {
            Error::ConfigSource("failed to open token config file", Box::new(err))
        })?;
        serde_json::from_reader(file).map_err(|err| {
            Error::ConfigSource("failed to deserialize token config", Box::new(err))
        })
    }
}

impl FromStr for TokenConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|err| {
            Error::ConfigSource("failed to deserialize token config", Box::new(err))
        })
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("type", &self.token_type)
            .field("base_url", &self.base_url)
            .field("platform", &self.platform)
            .field("service_account_id", &self.service_account_id)
            .field("expires_in", &self.expires_in)
            .field("exp_seconds", &self.exp_seconds)
            .field("scope", &self.scope)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Where the service account's private key comes from
#[derive(Clone)]
pub enum KeySource {
    /// A JSON Web Key, as downloaded when creating the service account
    Jwk(KeyDescription),
    /// A PEM encoded RSA private key, PKCS#8 or PKCS#1
    Pem(String),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jwk(jwk) => f.debug_tuple("Jwk").field(jwk).finish(),
            Self::Pem(_) => f.debug_tuple("Pem").field(&"****").finish(),
        }
    }
}

/// A normalized service account token request
#[derive(Clone, Debug)]
pub struct RequestConfig {
    service_account_id: String,
    base_url: String,
    scope: String,
    key_source: KeySource,
    lifetime: u64,
}

impl RequestConfig {
    /// Create a request for the given service account against the tenant at `base_url`
    ///
    /// Trailing slashes on `base_url` are ignored. The scope defaults to empty and the
    /// assertion lifetime to 899 seconds.
    pub fn new(
        service_account_id: impl Into<String>,
        base_url: impl AsRef<str>,
        key_source: KeySource,
    ) -> Self {
        Self {
            service_account_id: service_account_id.into(),
            base_url: resolve_base_url(Some(base_url.as_ref()), None).unwrap_or_default(),
            scope: String::new(),
            key_source,
            lifetime: DEFAULT_LIFETIME_SECS,
        }
    }

    /// Set the space separated scopes to request
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Set the assertion lifetime; anything below one second falls back to the default
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = resolve_lifetime(None, Some(lifetime));
        self
    }

    /// The service account ID, used as issuer and subject of the assertion
    pub fn service_account_id(&self) -> &str {
        &self.service_account_id
    }

    /// The tenant base URL, without trailing slashes
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The OAuth2 token endpoint, which is also the assertion audience
    pub fn token_url(&self) -> String {
        format!("{}{}", self.base_url, TOKEN_PATH)
    }

    /// The requested scopes
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Lifetime of the signed assertion
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime)
    }

    pub(crate) fn key_source(&self) -> &KeySource {
        &self.key_source
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.service_account_id.trim().is_empty() {
            return Err(Error::Config("service_account_id is required"));
        }

        if self.base_url.is_empty() {
            return Err(Error::Config("baseUrl or platform is required"));
        }

        match Url::parse(&self.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
            _ => Err(Error::Config("baseUrl must be an absolute http(s) URL")),
        }
    }
}

impl TryFrom<TokenConfig> for RequestConfig {
    type Error = Error;

    fn try_from(config: TokenConfig) -> Result<Self, Self::Error> {
        match config.token_type.as_deref().map(str::trim) {
            None | Some("") | Some(SERVICE_ACCOUNT_TYPE) => {}
            Some("user" | "custom") => {
                return Err(Error::Config(
                    "only service-account tokens are supported",
                ))
            }
            Some(_) => return Err(Error::Config("invalid token type")),
        }

        let service_account_id = config
            .service_account_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(Error::Config("service_account_id is required"))?;

        let base_url = resolve_base_url(config.base_url.as_deref(), config.platform.as_deref())
            .ok_or(Error::Config("baseUrl or platform is required"))?;

        let jwk = config.jwk_json.filter(|value| match value {
            serde_json::Value::String(s) => !s.trim().is_empty(),
            value => !value.is_null(),
        });
        let pem = config.private_key.filter(|pem| !pem.trim().is_empty());
        let key_source = match (jwk, pem) {
            (Some(jwk), None) => KeySource::Jwk(parse_jwk(jwk)?),
            (None, Some(pem)) => KeySource::Pem(pem),
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "only one of jwk_json and privateKey may be set",
                ))
            }
            (None, None) => return Err(Error::Config("jwk_json or privateKey is required")),
        };

        let scope = match config.scope {
            Some(scope) if !scope.trim().is_empty() => scope.trim().to_owned(),
            _ => config.scopes.join(" "),
        };

        let request = Self {
            service_account_id,
            base_url,
            scope,
            key_source,
            lifetime: resolve_lifetime(config.exp_seconds, config.expires_in),
        };
        request.validate()?;
        Ok(request)
    }
}

fn parse_jwk(value: serde_json::Value) -> Result<KeyDescription, Error> {
    match value {
        serde_json::Value::String(s) => s.parse(),
        value @ serde_json::Value::Object(_) => KeyDescription::from_value(value),
        _ => Err(Error::Config(
            "jwk_json must be a JSON object or a string containing one",
        )),
    }
}

/// Pick the tenant base URL: `baseUrl` if set, otherwise `platform`
///
/// Surrounding whitespace and trailing slashes are removed, so `https://example.com/` and
/// `https://example.com` resolve to the same base.
pub(crate) fn resolve_base_url(base_url: Option<&str>, platform: Option<&str>) -> Option<String> {
    [base_url, platform]
        .into_iter()
        .flatten()
        .map(|url| url.trim().trim_end_matches('/'))
        .find(|url| !url.is_empty())
        .map(str::to_owned)
}

/// Pick the assertion lifetime in seconds: `exp_seconds`, then `expiresIn`, then 899
pub(crate) fn resolve_lifetime(exp_seconds: Option<u64>, expires_in: Option<Duration>) -> u64 {
    exp_seconds
        .filter(|&secs| secs > 0)
        .or_else(|| expires_in.map(|d| d.as_secs()).filter(|&secs| secs > 0))
        .unwrap_or(DEFAULT_LIFETIME_SECS)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Nanos(u64),
        Text(String),
    }

    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos))),
        Some(RawDuration::Text(s)) => parse_duration(&s)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid duration `{s}`"))),
    }
}

/// Parse durations such as `900s`, `15m`, `1h30m` or `1.5h`
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }

    humantime::parse_duration(s).ok().or_else(|| parse_fractional(s))
}

/// A single decimal value with a unit, as written by Go's `time.Duration`
fn parse_fractional(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (value, unit) = s.split_at(split);
    if !value.contains('.') {
        return None;
    }

    let value = value.parse::<f64>().ok()?;
    let unit = humantime::parse_duration(&format!("1{unit}")).ok()?;
    Duration::try_from_secs_f64(unit.as_secs_f64() * value).ok()
}

pub(crate) const TOKEN_PATH: &str = "/am/oauth2/access_token";
pub(crate) const DEFAULT_LIFETIME_SECS: u64 = 899;
const SERVICE_ACCOUNT_TYPE: &str = "service-account";
const CONFIG_ENV: &str = "PAIC_TOKEN_CONFIG";
