//! ES256 signing and verification for the trust layer.
//!
//! All operations fail closed: malformed keys, signatures, or tokens
//! resolve to `None`/`false` rather than errors. The permission gate treats
//! a missing or invalid signature as an ordinary deny, never a fault.

use crate::{
    config::TrustConfig,
    whitelist::profile_url_from_header,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding},
    EncodedPoint, FieldBytes,
};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Public key description restricted to EC P-256 / ES256.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

/// Agent discovery profile, reduced to the part the trust layer reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub signing_keys: Vec<Jwk>,
}

struct CachedProfile {
    profile: AgentProfile,
    fetched_at: Instant,
}

pub struct CryptoService {
    key_id: String,
    signing_key: Option<SigningKey>,
    require_signature: bool,
    client: reqwest::Client,
    fetch_timeout: Duration,
    cache_ttl: Duration,
    profile_cache: Mutex<HashMap<String, CachedProfile>>,
}

impl CryptoService {
    /// Builds the service from config. A configured PEM that fails to parse
    /// is a configuration error; an absent key generates an ephemeral pair
    /// (signatures will not survive a restart).
    pub fn from_config(trust: &TrustConfig, require_signature: bool) -> crate::Result<Self> {
        let signing_key = match &trust.private_key_pem {
            Some(pem) => Some(SigningKey::from_pkcs8_pem(pem).map_err(|e| {
                crate::UcpError::Config(format!("Invalid signing key PEM: {}", e))
            })?),
            None => {
                tracing::warn!("no signing key configured, generating an ephemeral key pair");
                Some(SigningKey::random(&mut OsRng))
            }
        };

        Ok(Self::build(
            trust.key_id.clone(),
            signing_key,
            require_signature,
            Duration::from_secs(trust.profile_cache_ttl_seconds),
            Duration::from_secs(trust.profile_fetch_timeout_seconds),
        ))
    }

    /// Service with no signing key; `sign` and `create_jws` return `None`.
    pub fn without_key(key_id: &str) -> Self {
        Self::build(
            key_id.to_string(),
            None,
            false,
            Duration::from_secs(3600),
            Duration::from_secs(10),
        )
    }

    fn build(
        key_id: String,
        signing_key: Option<SigningKey>,
        require_signature: bool,
        cache_ttl: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            key_id,
            signing_key,
            require_signature,
            client: reqwest::Client::new(),
            fetch_timeout,
            cache_ttl,
            profile_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Signs data with ES256 (ECDSA P-256 + SHA-256) over the active
    /// private key. Returns the base64url-encoded DER signature, or `None`
    /// when no key is configured.
    pub fn sign(&self, data: &[u8]) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        let signature: Signature = key.sign(data);
        Some(base64url_encode(signature.to_der().as_bytes()))
    }

    /// Verifies an ES256 signature against a PEM-encoded public key.
    pub fn verify(data: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
            return false;
        };
        let Some(der) = base64url_decode(signature_b64) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(&der) else {
            return false;
        };
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Creates a compact-serialized JWS with header
    /// `{alg: ES256, typ: JWT, kid}`.
    pub fn create_jws(&self, payload: &Value) -> Option<String> {
        let header = serde_json::json!({
            "alg": "ES256",
            "typ": "JWT",
            "kid": self.key_id,
        });

        let header_b64 = base64url_encode(&serde_json::to_vec(&header).ok()?);
        let payload_b64 = base64url_encode(&serde_json::to_vec(payload).ok()?);

        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = self.sign(signing_input.as_bytes())?;

        Some(format!("{signing_input}.{signature}"))
    }

    /// Verifies a compact JWS and decodes its payload. Fails (`None`) on
    /// anything other than exactly three segments, an invalid signature,
    /// or a payload that is not valid JSON.
    pub fn verify_jws(jws: &str, public_key_pem: &str) -> Option<Value> {
        let parts: Vec<&str> = jws.split('.').collect();
        if parts.len() != 3 {
            return None;
        }

        let signing_input = format!("{}.{}", parts[0], parts[1]);
        if !Self::verify(signing_input.as_bytes(), parts[2], public_key_pem) {
            return None;
        }

        let payload_bytes = base64url_decode(parts[1])?;
        serde_json::from_slice(&payload_bytes).ok()
    }

    /// Converts an EC P-256 JWK to a SubjectPublicKeyInfo PEM by rebuilding
    /// the uncompressed point `0x04 || x || y`. Any other key type or curve
    /// is rejected.
    pub fn jwk_to_pem(jwk: &Jwk) -> Option<String> {
        if jwk.kty != "EC" || jwk.crv != "P-256" {
            return None;
        }

        let x = base64url_decode(&jwk.x)?;
        let y = base64url_decode(&jwk.y)?;
        if x.len() != 32 || y.len() != 32 {
            return None;
        }

        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&x),
            FieldBytes::from_slice(&y),
            false,
        );
        let verifying_key = VerifyingKey::from_encoded_point(&point).ok()?;
        verifying_key.to_public_key_pem(LineEnding::LF).ok()
    }

    /// The active public key as a JWK, for the discovery-profile boundary.
    pub fn public_key_jwk(&self) -> Option<Jwk> {
        let verifying_key = self.signing_key.as_ref()?.verifying_key();
        let point = verifying_key.to_encoded_point(false);

        Some(Jwk {
            kid: Some(self.key_id.clone()),
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: base64url_encode(point.x()?.as_slice()),
            y: base64url_encode(point.y()?.as_slice()),
            key_use: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
        })
    }

    /// The active public key in PEM form.
    pub fn public_key_pem(&self) -> Option<String> {
        let verifying_key = self.signing_key.as_ref()?.verifying_key();
        verifying_key.to_public_key_pem(LineEnding::LF).ok()
    }

    /// Validates the `Request-Signature` header of an inbound request
    /// against the signing key published in the agent's discovery profile.
    /// Short-circuits true when enforcement is disabled; any missing piece
    /// resolves to false.
    pub async fn validate_agent_signature(
        &self,
        agent_header: Option<&str>,
        signature_header: Option<&str>,
        body: &[u8],
    ) -> bool {
        if !self.require_signature {
            return true;
        }

        let Some(signature) = signature_header.filter(|s| !s.is_empty()) else {
            return false;
        };
        let Some(agent) = agent_header.filter(|h| !h.is_empty()) else {
            return false;
        };
        let Some(profile_url) = profile_url_from_header(agent) else {
            return false;
        };

        let Some(profile) = self.fetch_agent_profile(profile_url).await else {
            return false;
        };
        let Some(jwk) = profile.signing_keys.first() else {
            return false;
        };
        let Some(pem) = Self::jwk_to_pem(jwk) else {
            return false;
        };

        Self::verify(body, signature, &pem)
    }

    /// Fetches an agent discovery profile, serving from a TTL cache keyed
    /// by URL. Transport errors resolve to `None`; verification then fails
    /// closed at the caller.
    pub async fn fetch_agent_profile(&self, url: &str) -> Option<AgentProfile> {
        {
            let cache = self.profile_cache.lock();
            if let Some(cached) = cache.get(url) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Some(cached.profile.clone());
                }
            }
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.fetch_timeout)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let profile: AgentProfile = response.json().await.ok()?;

        self.profile_cache.lock().insert(
            url.to_string(),
            CachedProfile { profile: profile.clone(), fetched_at: Instant::now() },
        );

        Some(profile)
    }
}

/// Standard base64 with `+/` replaced by `-_` and padding stripped.
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(data).ok()
}

/// Random 16-byte nonce, hex encoded.
pub fn generate_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::build(
            "test_key".to_string(),
            Some(SigningKey::random(&mut OsRng)),
            false,
            Duration::from_secs(3600),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let crypto = service();
        let pem = crypto.public_key_pem().unwrap();

        let data = b"checkout session payload";
        let signature = crypto.sign(data).unwrap();

        assert!(CryptoService::verify(data, &signature, &pem));
        assert!(!CryptoService::verify(b"tampered payload", &signature, &pem));
    }

    #[test]
    fn test_verify_rejects_unrelated_key() {
        let crypto = service();
        let other = service();

        let data = b"signed by the first key";
        let signature = crypto.sign(data).unwrap();

        assert!(!CryptoService::verify(data, &signature, &other.public_key_pem().unwrap()));
    }

    #[test]
    fn test_sign_without_key_returns_none() {
        let crypto = CryptoService::without_key("no_key");
        assert!(crypto.sign(b"data").is_none());
        assert!(crypto.create_jws(&serde_json::json!({"a": 1})).is_none());
        assert!(crypto.public_key_jwk().is_none());
    }

    #[test]
    fn test_jws_round_trip() {
        let crypto = service();
        let pem = crypto.public_key_pem().unwrap();

        let payload = serde_json::json!({
            "event": "order.confirmed",
            "order_id": "order_42",
        });
        let jws = crypto.create_jws(&payload).unwrap();

        let decoded = CryptoService::verify_jws(&jws, &pem).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_jws_header_fields() {
        let crypto = service();
        let jws = crypto.create_jws(&serde_json::json!({"x": 1})).unwrap();

        let header_b64 = jws.split('.').next().unwrap();
        let header: Value =
            serde_json::from_slice(&base64url_decode(header_b64).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["typ"], "JWT");
        assert_eq!(header["kid"], "test_key");
    }

    #[test]
    fn test_verify_jws_rejects_malformed_tokens() {
        let crypto = service();
        let pem = crypto.public_key_pem().unwrap();
        let jws = crypto.create_jws(&serde_json::json!({"x": 1})).unwrap();

        assert!(CryptoService::verify_jws("only.two", &pem).is_none());
        assert!(CryptoService::verify_jws("a.b.c.d", &pem).is_none());
        assert!(CryptoService::verify_jws(&format!("{jws}x"), &pem).is_none());

        let other = service();
        assert!(CryptoService::verify_jws(&jws, &other.public_key_pem().unwrap()).is_none());
    }

    #[test]
    fn test_jwk_pem_round_trip() {
        let crypto = service();
        let jwk = crypto.public_key_jwk().unwrap();

        let pem = CryptoService::jwk_to_pem(&jwk).unwrap();
        assert_eq!(pem, crypto.public_key_pem().unwrap());

        let signature = crypto.sign(b"data").unwrap();
        assert!(CryptoService::verify(b"data", &signature, &pem));
    }

    #[test]
    fn test_jwk_to_pem_rejects_other_key_types() {
        let crypto = service();
        let good = crypto.public_key_jwk().unwrap();

        let mut rsa = good.clone();
        rsa.kty = "RSA".to_string();
        assert!(CryptoService::jwk_to_pem(&rsa).is_none());

        let mut wrong_curve = good.clone();
        wrong_curve.crv = "P-384".to_string();
        assert!(CryptoService::jwk_to_pem(&wrong_curve).is_none());

        let mut short_coord = good;
        short_coord.x = base64url_encode(&[1, 2, 3]);
        assert!(CryptoService::jwk_to_pem(&short_coord).is_none());
    }

    #[test]
    fn test_base64url_round_trip() {
        let data = vec![0u8, 255, 7, 62, 63, 250];
        let encoded = base64url_encode(&data);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('='));
        assert_eq!(base64url_decode(&encoded).unwrap(), data);
        assert!(base64url_decode("not base64url!!").is_none());
    }

    #[test]
    fn test_generate_nonce() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, generate_nonce());
    }

    #[tokio::test]
    async fn test_signature_validation_disabled_short_circuits() {
        let crypto = service();
        assert!(crypto.validate_agent_signature(None, None, b"body").await);
    }

    #[tokio::test]
    async fn test_signature_validation_requires_headers() {
        let crypto = CryptoService::build(
            "test_key".to_string(),
            Some(SigningKey::random(&mut OsRng)),
            true,
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        assert!(!crypto.validate_agent_signature(None, Some("sig"), b"body").await);
        assert!(
            !crypto
                .validate_agent_signature(Some("Agent profile=\"https://a.example/p\""), None, b"body")
                .await
        );
        assert!(!crypto.validate_agent_signature(Some("Agent v=1"), Some("sig"), b"body").await);
    }
}
