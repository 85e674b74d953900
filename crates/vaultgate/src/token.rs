use crate::clock::now_secs;
use crate::error::TokenError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Turns an opaque bearer credential into the subject it was issued for.
pub trait SubjectDecoder: Send + Sync {
    fn subject(&self, token: &str) -> Result<String, TokenError>;
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    /// Expiry, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// Verifies compact HS256 JWTs signed with a shared secret.
#[derive(Clone)]
pub struct Hs256Decoder {
    mac: HmacSha256,
}

impl Hs256Decoder {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())
                .expect("HMAC accepts keys of any length"),
        }
    }

    /// Issue a token for `subject`, optionally expiring at `expires_at` (Unix seconds).
    pub fn sign(&self, subject: &str, expires_at: Option<u64>) -> String {
        let header = Header {
            alg: "HS256".to_string(),
            typ: Some("JWT".to_string()),
        };
        let claims = Claims {
            sub: Some(subject.to_string()),
            exp: expires_at,
        };
        let signing_input = format!("{}.{}", encode_segment(&header), encode_segment(&claims));
        let mut mac = self.mac.clone();
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{signing_input}.{signature}")
    }
}

impl SubjectDecoder for Hs256Decoder {
    fn subject(&self, token: &str) -> Result<String, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed("expected three segments"));
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != "HS256" {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed("signature is not base64url"))?;
        let mut mac = self.mac.clone();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        if let Some(exp) = claims.exp
            && exp <= now_secs()
        {
            return Err(TokenError::Expired(exp));
        }

        claims
            .sub
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(TokenError::MissingSubject)
    }
}

fn encode_segment<T: Serialize>(value: &T) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap_or_default())
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed("segment is not base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed("segment is not JSON"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Hs256Decoder {
        Hs256Decoder::new("test-secret")
    }

    #[test]
    fn valid_token_yields_subject() {
        let d = decoder();
        let token = d.sign("alice", Some(now_secs() + 3_600));
        assert_eq!(d.subject(&token).unwrap(), "alice");
    }

    #[test]
    fn token_without_expiry_is_accepted() {
        let d = decoder();
        let token = d.sign("bob", None);
        assert_eq!(d.subject(&token).unwrap(), "bob");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = Hs256Decoder::new("other-secret").sign("alice", None);
        assert_eq!(decoder().subject(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let d = decoder();
        let token = d.sign("alice", None);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = encode_segment(&Claims {
            sub: Some("mallory".to_string()),
            exp: None,
        });
        parts[1] = forged.as_str();
        assert_eq!(d.subject(&parts.join(".")), Err(TokenError::BadSignature));
    }

    #[test]
    fn expired_token_is_rejected() {
        let d = decoder();
        let token = d.sign("alice", Some(1_000));
        assert_eq!(d.subject(&token), Err(TokenError::Expired(1_000)));
    }

    #[test]
    fn alg_none_is_rejected() {
        let header = encode_segment(&Header {
            alg: "none".to_string(),
            typ: None,
        });
        let claims = encode_segment(&Claims {
            sub: Some("alice".to_string()),
            exp: None,
        });
        let token = format!("{header}.{claims}.");
        assert_eq!(
            decoder().subject(&token),
            Err(TokenError::UnsupportedAlgorithm("none".to_string()))
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let d = decoder();
        assert!(matches!(d.subject("not-a-jwt"), Err(TokenError::Malformed(_))));
        assert!(matches!(d.subject("a.b.c.d"), Err(TokenError::Malformed(_))));
        assert!(matches!(d.subject("!!!.e30.sig"), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn blank_subject_is_missing() {
        let d = decoder();
        let token = d.sign("   ", None);
        assert_eq!(d.subject(&token), Err(TokenError::MissingSubject));
    }
}
