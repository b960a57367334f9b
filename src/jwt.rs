use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;

use crate::types::Signer;
use crate::Error;

/// Sign a fresh assertion for `service_account_id`, addressed to the token endpoint
pub(crate) fn build(
    service_account_id: &str,
    token_url: &str,
    lifetime: u64,
    signer: &Signer,
) -> Result<SignedAssertion, Error> {
    Claims::new(service_account_id, token_url, lifetime)?.to_jwt(signer)
}

/// Claims of the self-issued assertion presented with the JWT-Bearer grant
///
/// See RFC 7523 section 3. The issuer and subject are both the service account.
#[derive(Serialize)]
pub(crate) struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    exp: i64,
    jti: String,
}

impl<'a> Claims<'a> {
    pub(crate) fn new(
        service_account_id: &'a str,
        audience: &'a str,
        lifetime: u64,
    ) -> Result<Self, Error> {
        let mut id = [0; JTI_LEN];
        SystemRandom::new()
            .fill(&mut id)
            .map_err(|_| Error::Assertion("failed to generate assertion ID"))?;

        let exp = i64::try_from(lifetime)
            .ok()
            .and_then(|lifetime| Utc::now().timestamp().checked_add(lifetime))
            .ok_or(Error::Assertion("assertion lifetime out of range"))?;

        Ok(Claims {
            iss: service_account_id,
            sub: service_account_id,
            aud: audience,
            exp,
            jti: URL_SAFE_NO_PAD.encode(id),
        })
    }

    pub(crate) fn to_jwt(&self, signer: &Signer) -> Result<SignedAssertion, Error> {
        let claims = serde_json::to_vec(self)
            .map_err(|_| Error::Assertion("failed to encode assertion claims"))?;

        let mut jwt = String::new();
        URL_SAFE_NO_PAD.encode_string(RS256_HEAD, &mut jwt);
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(claims, &mut jwt);

        let signature = signer.sign(jwt.as_bytes())?;
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(signature, &mut jwt);
        Ok(SignedAssertion(jwt))
    }
}

/// A signed compact JWT, good for one exchange
///
/// Not `Clone`; the exchange consumes it.
pub(crate) struct SignedAssertion(String);

impl SignedAssertion {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SignedAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedAssertion")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// Bytes of randomness in the `jti` claim
const JTI_LEN: usize = 16;
const RS256_HEAD: &str = r#"{"alg":"RS256","typ":"JWT"}"#;
