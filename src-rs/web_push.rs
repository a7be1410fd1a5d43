//! Web Push delivery: VAPID authorization (RFC 8292) and `aes128gcm`
//! payload encryption (RFC 8291).

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use hkdf::Hkdf;
use ring::{
    aead, agreement,
    rand::{SecureRandom, SystemRandom},
    signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING},
};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

const RECORD_SIZE: u32 = 4096;
const TAG_LEN: usize = 16;
/// Salt, record size, key id length and the uncompressed P-256 key id.
const HEADER_LEN: usize = 16 + 4 + 1 + 65;
/// Largest plaintext whose encrypted body still fits in one 4096-byte push
/// message, header included.
pub const MAX_PAYLOAD_LEN: usize = RECORD_SIZE as usize - HEADER_LEN - 1 - TAG_LEN;
const PUSH_TTL_SECS: u32 = 86_400;
const VAPID_EXPIRY_SECS: i64 = 12 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("VAPID_PUBLIC_KEY and VAPID_PRIVATE_KEY must be configured.")]
    NotConfigured,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("push service responded with status {status}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Clone)]
struct VapidKeys {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
    public_key_b64: String,
}

#[derive(Clone)]
pub struct WebPushSender {
    http: reqwest::Client,
    vapid: Option<VapidKeys>,
    subject: String,
    rng: SystemRandom,
}

impl WebPushSender {
    pub fn new(
        public_key: Option<&str>,
        private_key: Option<&str>,
        subject: String,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create push HTTP client")?;

        let vapid = match (public_key, private_key) {
            (Some(public_key), Some(private_key)) => {
                let public_key_bytes = decode_b64(public_key).context("invalid VAPID_PUBLIC_KEY")?;
                let private_key_bytes =
                    decode_b64(private_key).context("invalid VAPID_PRIVATE_KEY")?;
                Some(VapidKeys {
                    private_key: private_key_bytes,
                    public_key: public_key_bytes,
                    public_key_b64: public_key.trim().trim_end_matches('=').to_string(),
                })
            }
            _ => None,
        };

        Ok(Self {
            http,
            vapid,
            subject,
            rng: SystemRandom::new(),
        })
    }

    /// Encrypts and posts `payload` to the subscription's push service.
    /// Returns the push service's status on success.
    pub async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &[u8],
    ) -> Result<u16, PushError> {
        let vapid = self.vapid.as_ref().ok_or(PushError::NotConfigured)?;

        let ua_public = decode_b64(&subscription.keys.p256dh)
            .map_err(|_| PushError::InvalidRequest("subscription.keys.p256dh is invalid".into()))?;
        let auth_secret = decode_b64(&subscription.keys.auth)
            .map_err(|_| PushError::InvalidRequest("subscription.keys.auth is invalid".into()))?;
        check_payload_len(payload.len())?;

        let authorization = self
            .vapid_authorization(vapid, &subscription.endpoint, Utc::now().timestamp())
            .map_err(|error| PushError::InvalidRequest(error.to_string()))?;
        let body = encrypt_payload(&ua_public, &auth_secret, payload, &self.rng)?;

        let response = self
            .http
            .post(&subscription.endpoint)
            .header("Authorization", authorization)
            .header("TTL", PUSH_TTL_SECS.to_string())
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await
            .context("push service request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(status.as_u16())
    }

    fn vapid_authorization(
        &self,
        vapid: &VapidKeys,
        endpoint: &str,
        now: i64,
    ) -> anyhow::Result<String> {
        let audience = endpoint_origin(endpoint)?;
        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"ES256"}"#);
        let claims = URL_SAFE_NO_PAD.encode(
            json!({
                "aud": audience,
                "exp": now + VAPID_EXPIRY_SECS,
                "sub": self.subject,
            })
            .to_string(),
        );
        let signing_input = format!("{}.{}", header, claims);

        let key_pair = EcdsaKeyPair::from_private_key_and_public_key(
            &ECDSA_P256_SHA256_FIXED_SIGNING,
            &vapid.private_key,
            &vapid.public_key,
            &self.rng,
        )
        .map_err(|error| anyhow!("VAPID key pair rejected: {}", error))?;
        let signature = key_pair
            .sign(&self.rng, signing_input.as_bytes())
            .map_err(|_| anyhow!("failed to sign VAPID token"))?;

        Ok(format!(
            "vapid t={}.{}, k={}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.as_ref()),
            vapid.public_key_b64
        ))
    }
}

fn check_payload_len(len: usize) -> Result<(), PushError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(PushError::InvalidRequest(format!(
            "payload is too large ({len} bytes, max {MAX_PAYLOAD_LEN})"
        )));
    }
    Ok(())
}

fn decode_b64(value: &str) -> anyhow::Result<Vec<u8>> {
    let trimmed = value.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed.replace('+', "-").replace('/', "_"))
        .context("invalid base64url value")
}

fn endpoint_origin(endpoint: &str) -> anyhow::Result<String> {
    let url = reqwest::Url::parse(endpoint).context("subscription endpoint is not a URL")?;
    if !matches!(url.scheme(), "https" | "http") {
        return Err(anyhow!("subscription endpoint must be http(s)"));
    }
    Ok(url.origin().ascii_serialization())
}

/// Encrypts one `aes128gcm` record for the user agent identified by
/// `ua_public` (uncompressed P-256 point) and `auth_secret`.
pub fn encrypt_payload(
    ua_public: &[u8],
    auth_secret: &[u8],
    plaintext: &[u8],
    rng: &dyn SecureRandom,
) -> anyhow::Result<Bytes> {
    let ephemeral = agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, rng)
        .map_err(|_| anyhow!("failed to generate ephemeral key"))?;
    let as_public = ephemeral
        .compute_public_key()
        .map_err(|_| anyhow!("failed to compute ephemeral public key"))?;
    let as_public = as_public.as_ref().to_vec();

    let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, ua_public);
    let ecdh_secret = agreement::agree_ephemeral(ephemeral, &peer, |secret| secret.to_vec())
        .map_err(|_| anyhow!("subscription public key is not a valid P-256 point"))?;

    let mut salt = [0u8; 16];
    rng.fill(&mut salt)
        .map_err(|_| anyhow!("failed to generate salt"))?;

    let (cek, nonce) =
        derive_content_keys(&ecdh_secret, auth_secret, ua_public, &as_public, &salt)?;

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &cek)
            .map_err(|_| anyhow!("invalid content encryption key"))?,
    );
    let mut record = Vec::with_capacity(plaintext.len() + 1 + TAG_LEN);
    record.extend_from_slice(plaintext);
    record.push(0x02);
    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        aead::Aad::empty(),
        &mut record,
    )
    .map_err(|_| anyhow!("failed to encrypt push payload"))?;

    let mut body = BytesMut::with_capacity(16 + 4 + 1 + as_public.len() + record.len());
    body.put_slice(&salt);
    body.put_u32(RECORD_SIZE);
    body.put_u8(as_public.len() as u8);
    body.put_slice(&as_public);
    body.put_slice(&record);
    Ok(body.freeze())
}

fn derive_content_keys(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
    salt: &[u8],
) -> anyhow::Result<([u8; 16], [u8; 12])> {
    let mut key_info = Vec::with_capacity(14 + ua_public.len() + as_public.len());
    key_info.extend_from_slice(b"WebPush: info\0");
    key_info.extend_from_slice(ua_public);
    key_info.extend_from_slice(as_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret)
        .expand(&key_info, &mut ikm)
        .map_err(|_| anyhow!("HKDF expand failed for IKM"))?;

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; 16];
    hk.expand(b"Content-Encoding: aes128gcm\0", &mut cek)
        .map_err(|_| anyhow!("HKDF expand failed for CEK"))?;
    let mut nonce = [0u8; 12];
    hk.expand(b"Content-Encoding: nonce\0", &mut nonce)
        .map_err(|_| anyhow!("HKDF expand failed for nonce"))?;

    Ok((cek, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED};

    const TEST_PRIVATE: &str = "Hy49TFtqeYgBI0VniavN7_7cuph2VDIQABEiM0RVZqs";
    const TEST_PUBLIC: &str =
        "BF5R6DsNHG9Aeo7Jj6JKmBcalMoJQJacnbY67HvJd5mgKXQZqwBxfyl0j4bM481-sbJVtQQ-umRLUkkzTDZaBrE";

    fn sender() -> WebPushSender {
        WebPushSender::new(
            Some(TEST_PUBLIC),
            Some(TEST_PRIVATE),
            "mailto:ops@leadforge.app".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn encrypted_record_decrypts_on_the_user_agent_side() {
        let rng = SystemRandom::new();
        let ua_private =
            agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng).unwrap();
        let ua_public = ua_private.compute_public_key().unwrap().as_ref().to_vec();
        let auth_secret = [7u8; 16];

        let body = encrypt_payload(&ua_public, &auth_secret, b"{\"title\":\"hi\"}", &rng).unwrap();

        let salt = &body[..16];
        assert_eq!(u32::from_be_bytes(body[16..20].try_into().unwrap()), RECORD_SIZE);
        let id_len = body[20] as usize;
        assert_eq!(id_len, 65);
        let as_public = &body[21..21 + id_len];
        let mut ciphertext = body[21 + id_len..].to_vec();

        let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, as_public);
        let ecdh = agreement::agree_ephemeral(ua_private, &peer, |secret| secret.to_vec()).unwrap();
        let (cek, nonce) =
            derive_content_keys(&ecdh, &auth_secret, &ua_public, as_public, salt).unwrap();

        let key = aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &cek).unwrap());
        let plain = key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::empty(),
                &mut ciphertext,
            )
            .unwrap();
        assert_eq!(&plain[..], &b"{\"title\":\"hi\"}\x02"[..]);
    }

    #[test]
    fn invalid_user_agent_key_is_rejected() {
        let rng = SystemRandom::new();
        assert!(encrypt_payload(&[4u8; 65], &[0u8; 16], b"x", &rng).is_err());
    }

    #[test]
    fn vapid_header_is_signed_for_the_endpoint_origin() {
        let sender = sender();
        let vapid = sender.vapid.clone().unwrap();
        let header = sender
            .vapid_authorization(&vapid, "https://fcm.googleapis.com/fcm/send/abc", 1_700_000_000)
            .unwrap();

        let rest = header.strip_prefix("vapid t=").unwrap();
        let (token, key) = rest.split_once(", k=").unwrap();
        assert_eq!(key, TEST_PUBLIC);

        let (signing_input, signature) = token.rsplit_once('.').unwrap();
        let (_, claims) = signing_input.split_once('.').unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://fcm.googleapis.com");
        assert_eq!(claims["exp"], 1_700_000_000 + VAPID_EXPIRY_SECS);
        assert_eq!(claims["sub"], "mailto:ops@leadforge.app");

        let public = URL_SAFE_NO_PAD.decode(TEST_PUBLIC).unwrap();
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, public)
            .verify(
                signing_input.as_bytes(),
                &URL_SAFE_NO_PAD.decode(signature).unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn sending_without_keys_is_a_configuration_error() {
        let sender = WebPushSender::new(None, None, "mailto:x@y".to_string()).unwrap();
        let subscription = PushSubscription {
            endpoint: "https://push.example.com/1".to_string(),
            keys: PushKeys {
                p256dh: TEST_PUBLIC.to_string(),
                auth: "AAAAAAAAAAAAAAAAAAAAAA".to_string(),
            },
        };
        assert!(matches!(
            sender.send(&subscription, b"hi").await,
            Err(PushError::NotConfigured)
        ));
    }

    #[test]
    fn largest_payload_fills_exactly_one_push_message() {
        let rng = SystemRandom::new();
        let ua_private =
            agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng).unwrap();
        let ua_public = ua_private.compute_public_key().unwrap().as_ref().to_vec();
        let payload = vec![b'a'; MAX_PAYLOAD_LEN];

        let body = encrypt_payload(&ua_public, &[7u8; 16], &payload, &rng).unwrap();
        assert_eq!(body.len(), RECORD_SIZE as usize);
        assert_eq!(MAX_PAYLOAD_LEN, 3993);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_sending() {
        let subscription = PushSubscription {
            endpoint: "https://push.example.com/1".to_string(),
            keys: PushKeys {
                p256dh: TEST_PUBLIC.to_string(),
                auth: "AAAAAAAAAAAAAAAAAAAAAA".to_string(),
            },
        };
        let payload = vec![b'a'; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            sender().send(&subscription, &payload).await,
            Err(PushError::InvalidRequest(_))
        ));
        assert!(check_payload_len(MAX_PAYLOAD_LEN).is_ok());
    }

    #[test]
    fn non_http_endpoints_are_rejected() {
        assert!(endpoint_origin("ftp://push.example.com").is_err());
        assert_eq!(
            endpoint_origin("https://push.example.com:8443/a/b").unwrap(),
            "https://push.example.com:8443"
        );
    }
}
