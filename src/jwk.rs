use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::rsa::{KeyPairComponents, PublicKeyComponents};
use ring::signature::RsaKeyPair;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::Signer;
use crate::Error;

/// A private key in JSON Web Key form (RFC 7517, RFC 7518)
///
/// The key type is taken from the `kty` member. Only RSA keys are supported; anything else is
/// rejected when the description is parsed.
#[derive(Clone)]
#[non_exhaustive]
pub enum KeyDescription {
    /// `"kty": "RSA"`
    Rsa(RsaKeyDescription),
}

impl KeyDescription {
    pub(crate) fn from_value(value: serde_json::Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(key_error("jwk", "must be a JSON object"));
        }

        let is_rsa = match value.get("kty") {
            Some(serde_json::Value::String(kty)) => kty == "RSA",
            Some(_) => return Err(key_error("kty", "must be a string")),
            None => return Err(key_error("kty", "missing")),
        };
        if !is_rsa {
            return Err(key_error("kty", "unsupported key type, expected `RSA`"));
        }

        serde_json::from_value(value)
            .map(Self::Rsa)
            .map_err(|_| key_error("jwk", "RSA key members must be strings"))
    }

    /// Reconstruct the private key and prepare it for RS256 signing
    ///
    /// Fails with [`Error::KeyMaterial`] naming the offending member if the description is
    /// incomplete, badly encoded, or does not describe a consistent key.
    pub fn decode(&self) -> Result<Signer, Error> {
        match self {
            Self::Rsa(rsa) => rsa.decode(),
        }
    }

    /// The key ID, if the description has one
    pub fn kid(&self) -> Option<&str> {
        match self {
            Self::Rsa(rsa) => rsa.kid.as_deref(),
        }
    }
}

impl FromStr for KeyDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = serde_json::from_str(s).map_err(|_| key_error("jwk", "not valid JSON"))?;
        Self::from_value(value)
    }
}

impl fmt::Debug for KeyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa(rsa) => f.debug_tuple("Rsa").field(rsa).finish(),
        }
    }
}

/// The members of an RSA private JWK
///
/// `dp`, `dq` and `qi` are not read: the CRT values are always derived from `d`, `p` and `q`.
#[derive(Clone, Deserialize)]
pub struct RsaKeyDescription {
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    d: Option<String>,
    p: Option<String>,
    q: Option<String>,
}

impl RsaKeyDescription {
    fn decode(&self) -> Result<Signer, Error> {
        if self.e.as_deref().is_some_and(|e| e != PUBLIC_EXPONENT_B64) {
            warn!(kid = ?self.kid, "key declares a public exponent other than 65537, ignoring it");
        }

        let n = component("n", self.n.as_deref())?;
        let d = component("d", self.d.as_deref())?;
        let mut p = component("p", self.p.as_deref())?;
        let mut q = component("q", self.q.as_deref())?;
        if p < q {
            std::mem::swap(&mut p, &mut q);
        }

        let e = BigUint::from_bytes_be(&PUBLIC_EXPONENT);
        let mut key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
            .and_then(|key| key.validate().map(|()| key))
            .map_err(|_| key_error("key", "members do not form a consistent RSA key"))?;
        key.precompute()
            .map_err(|_| key_error("key", "failed to precompute CRT values"))?;

        let (dp, dq, qinv) = match (key.dp(), key.dq(), key.crt_coefficient()) {
            (Some(dp), Some(dq), Some(qinv)) => (dp.to_bytes_be(), dq.to_bytes_be(), qinv),
            _ => return Err(key_error("key", "failed to precompute CRT values")),
        };
        let primes = key.primes();
        let components = KeyPairComponents {
            public_key: PublicKeyComponents {
                n: key.n().to_bytes_be(),
                e: PUBLIC_EXPONENT.to_vec(),
            },
            d: key.d().to_bytes_be(),
            p: primes[0].to_bytes_be(),
            q: primes[1].to_bytes_be(),
            dP: dp,
            dQ: dq,
            qInv: qinv.to_bytes_be(),
        };

        let key_pair = RsaKeyPair::from_components(&components)
            .map_err(|err| key_error("key", format!("rejected for RS256 signing: {err}")))?;
        debug!(kid = ?self.kid, bits = key_pair.public().modulus_len() * 8, "decoded RSA key");
        Ok(Signer::from_key_pair(key_pair))
    }
}

impl fmt::Debug for RsaKeyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyDescription")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Decode one base64url member into an unsigned big-endian integer
fn component(field: &'static str, value: Option<&str>) -> Result<BigUint, Error> {
    let value = match value {
        Some(value) if !value.is_empty() => value,
        _ => return Err(key_error(field, "missing")),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| key_error(field, "not valid unpadded base64url"))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

fn key_error(field: &'static str, reason: impl Into<String>) -> Error {
    Error::KeyMaterial {
        field,
        reason: reason.into(),
    }
}

/// 65537, big-endian without leading zeros
const PUBLIC_EXPONENT: [u8; 3] = [1, 0, 1];
const PUBLIC_EXPONENT_B64: &str = "AQAB";

#[cfg(test)]
pub(crate) mod tests {
    use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256};
    use serde_json::Value;

    use super::*;
    use crate::ErrorKind;

    pub(crate) const JWK: &str = include_str!("../testdata/rsa_jwk.json");

    pub(crate) fn test_key() -> KeyDescription {
        JWK.parse().unwrap()
    }

    /// Check an RS256 signature against the public half of the test key
    pub(crate) fn verify(message: &[u8], signature: &[u8]) -> bool {
        let jwk: Value = serde_json::from_str(JWK).unwrap();
        let n = URL_SAFE_NO_PAD
            .decode(jwk["n"].as_str().unwrap())
            .unwrap();
        RsaPublicKeyComponents { n, e: vec![1, 0, 1] }
            .verify(&RSA_PKCS1_2048_8192_SHA256, message, signature)
            .is_ok()
    }

    fn jwk_with(edit: impl FnOnce(&mut serde_json::Map<String, Value>)) -> Result<Signer, Error> {
        let mut jwk: Value = serde_json::from_str(JWK).unwrap();
        edit(jwk.as_object_mut().unwrap());
        KeyDescription::from_value(jwk)?.decode()
    }

    fn failing_field(result: Result<Signer, Error>) -> &'static str {
        match result {
            Err(Error::KeyMaterial { field, .. }) => field,
            Err(err) => panic!("expected key material error, got {err:?}"),
            Ok(_) => panic!("expected key material error, got a key"),
        }
    }

    #[test]
    fn decoded_key_signs_verifiably() {
        let signer = test_key().decode().unwrap();
        let signature = signer.sign(b"header.claims").unwrap();
        assert_eq!(signature.len(), 256);
        assert!(verify(b"header.claims", &signature));
        assert!(!verify(b"header.other", &signature));
    }

    #[test]
    fn missing_members() {
        for field in ["n", "d", "p", "q"] {
            assert_eq!(failing_field(jwk_with(|jwk| drop(jwk.remove(field)))), field);
            assert_eq!(
                failing_field(jwk_with(|jwk| drop(jwk.insert(field.into(), "".into())))),
                field
            );
        }
    }

    #[test]
    fn malformed_base64() {
        for field in ["n", "d", "p", "q"] {
            let result = jwk_with(|jwk| {
                let value = format!("{}==", jwk[field].as_str().unwrap());
                jwk.insert(field.into(), value.into());
            });
            assert_eq!(failing_field(result), field);
        }

        let result = jwk_with(|jwk| drop(jwk.insert("d".into(), "not+base64/url".into())));
        assert_eq!(failing_field(result), "d");
    }

    #[test]
    fn key_type() {
        let result = jwk_with(|jwk| drop(jwk.insert("kty".into(), "EC".into())));
        assert_eq!(failing_field(result), "kty");

        let result = jwk_with(|jwk| drop(jwk.remove("kty")));
        assert_eq!(failing_field(result), "kty");

        let err = "[1, 2, 3]".parse::<KeyDescription>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyMaterial);

        let err = "{ not json".parse::<KeyDescription>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyMaterial);

        let result = jwk_with(|jwk| drop(jwk.insert("n".into(), 12.into())));
        assert_eq!(failing_field(result), "jwk");
    }

    #[test]
    fn public_exponent_is_fixed() {
        let signer = jwk_with(|jwk| drop(jwk.insert("e".into(), "Aw".into()))).unwrap();
        assert!(verify(b"payload", &signer.sign(b"payload").unwrap()));

        let signer = jwk_with(|jwk| drop(jwk.remove("e"))).unwrap();
        assert!(verify(b"payload", &signer.sign(b"payload").unwrap()));
    }

    #[test]
    fn prime_order_and_crt_members_are_irrelevant() {
        let signer = jwk_with(|jwk| {
            let p = jwk["p"].clone();
            let q = jwk["q"].clone();
            jwk.insert("p".into(), q);
            jwk.insert("q".into(), p);
            jwk.insert("dp".into(), "AQ".into());
            jwk.remove("qi");
        })
        .unwrap();
        assert!(verify(b"payload", &signer.sign(b"payload").unwrap()));
    }

    #[test]
    fn inconsistent_members() {
        let result = jwk_with(|jwk| {
            let p = jwk["p"].clone();
            jwk.insert("q".into(), p);
        });
        assert_eq!(failing_field(result), "key");

        let result = jwk_with(|jwk| {
            let p = jwk["p"].clone();
            jwk.insert("d".into(), p);
        });
        assert_eq!(failing_field(result), "key");
    }

    #[test]
    fn debug_hides_key_material() {
        let key = test_key();
        assert_eq!(key.kid(), Some("test-key"));

        let debug = format!("{key:?}");
        let jwk: Value = serde_json::from_str(JWK).unwrap();
        for field in ["n", "d", "p", "q"] {
            assert!(!debug.contains(jwk[field].as_str().unwrap()));
        }
        assert!(debug.contains("test-key"));
    }
}
