use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use courier_api::{normalize_hex_key, SignedEvent, KIND_CLIENT_AUTH};
use courier_core::error::CoreError;
use courier_core::signer::Signer;
use courier_core::time::{ms_to_secs, now_ms};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::schnorr::Signature;
use secp256k1::{ecdh, Keypair, Message, Parity, SecretKey, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};

const SEAL_CONTEXT: &[u8] = b"courier:dm-seal:v1";
const NONCE_LEN: usize = 24;

pub struct SoftwareSigner {
    secret: SecretKey,
    keypair: Keypair,
    public_hex: String,
}

impl SoftwareSigner {
    pub fn from_hex(secret_hex: &str) -> Result<Self, CoreError> {
        let normalized = normalize_hex_key(secret_hex)
            .ok_or_else(|| CoreError::Validation("secret key must be 64 hex chars".to_string()))?;
        let bytes = hex::decode(normalized)
            .map_err(|_| CoreError::Validation("secret key hex".to_string()))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| CoreError::Validation("secret key out of range".to_string()))?;
        Ok(Self::from_secret(secret))
    }

    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut OsRng))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, &secret);
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            secret,
            keypair,
            public_hex: hex::encode(xonly.serialize()),
        }
    }

    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    fn sign(&self, kind: u32, tags: Vec<Vec<String>>, content: String) -> Result<SignedEvent, CoreError> {
        let created_at = ms_to_secs(now_ms());
        let id = event_id(&self.public_hex, created_at, kind, &tags, &content)?;
        let digest: [u8; 32] = hex::decode(&id)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| CoreError::Codec("event id".to_string()))?;
        let message = Message::from_digest(digest);
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&message, &self.keypair);
        Ok(SignedEvent {
            id,
            pubkey: self.public_hex.clone(),
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(sig.serialize()),
        })
    }

    fn conversation_key(&self, counterparty: &str) -> Result<[u8; 32], CoreError> {
        let normalized = normalize_hex_key(counterparty)
            .ok_or_else(|| CoreError::Encryption("invalid counterparty key".to_string()))?;
        let bytes = hex::decode(normalized)
            .map_err(|_| CoreError::Encryption("invalid counterparty key".to_string()))?;
        let xonly = XOnlyPublicKey::from_slice(&bytes)
            .map_err(|_| CoreError::Encryption("invalid counterparty key".to_string()))?;
        // ECDH x-coordinate does not depend on the lifted point's parity.
        let point = ecdh::shared_secret_point(&xonly.public_key(Parity::Even), &self.secret);
        let hkdf = Hkdf::<Sha256>::new(None, &point[..32]);
        let mut key = [0u8; 32];
        hkdf.expand(SEAL_CONTEXT, &mut key)
            .map_err(|_| CoreError::Encryption("derive".to_string()))?;
        Ok(key)
    }

    pub fn seal(&self, counterparty: &str, plaintext: &str) -> Result<String, CoreError> {
        let key = self.conversation_key(counterparty)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| CoreError::Encryption("cipher".to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CoreError::Encryption("aead".to_string()))?;
        Ok(format!(
            "{}?iv={}",
            STANDARD.encode(ciphertext),
            STANDARD.encode(nonce)
        ))
    }

    pub fn open(&self, counterparty: &str, sealed: &str) -> Result<String, CoreError> {
        let (body, nonce_b64) = sealed
            .split_once("?iv=")
            .ok_or_else(|| CoreError::Encryption("malformed ciphertext".to_string()))?;
        let ciphertext = STANDARD
            .decode(body.trim())
            .map_err(|_| CoreError::Encryption("malformed ciphertext".to_string()))?;
        let nonce = STANDARD
            .decode(nonce_b64.trim())
            .map_err(|_| CoreError::Encryption("malformed nonce".to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(CoreError::Encryption("malformed nonce".to_string()));
        }
        let key = self.conversation_key(counterparty)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| CoreError::Encryption("cipher".to_string()))?;
        let plain = cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CoreError::Encryption("decrypt failed".to_string()))?;
        String::from_utf8(plain).map_err(|_| CoreError::Encryption("plaintext utf8".to_string()))
    }
}

#[async_trait::async_trait]
impl Signer for SoftwareSigner {
    fn public_key(&self) -> Option<String> {
        Some(self.public_hex.clone())
    }

    async fn build_event(
        &self,
        recipient: &str,
        plaintext: &str,
        kind: u32,
    ) -> Result<SignedEvent, CoreError> {
        let recipient = normalize_hex_key(recipient)
            .ok_or_else(|| CoreError::Encryption("invalid recipient key".to_string()))?;
        let content = self.seal(&recipient, plaintext)?;
        self.sign(kind, vec![vec!["p".to_string(), recipient]], content)
    }

    async fn build_auth_event(
        &self,
        challenge: &str,
        relay_url: &str,
    ) -> Result<SignedEvent, CoreError> {
        let tags = vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ];
        self.sign(KIND_CLIENT_AUTH, tags, String::new())
    }

    async fn decrypt(&self, counterparty: &str, ciphertext: &str) -> Result<String, CoreError> {
        self.open(counterparty, ciphertext)
    }
}

/// NIP-01 event id: lowercase hex sha256 of the canonical serialization.
pub fn event_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, CoreError> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Checks the id against the content and the Schnorr signature against the id.
pub fn verify_event(event: &SignedEvent) -> bool {
    if !event.is_well_formed() {
        return false;
    }
    let expected = match event_id(&event.pubkey, event.created_at, event.kind, &event.tags, &event.content) {
        Ok(id) => id,
        Err(_) => return false,
    };
    if expected != event.id {
        return false;
    }
    let parsed = hex::decode(&event.id)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .zip(hex::decode(&event.sig).ok().and_then(|bytes| Signature::from_slice(&bytes).ok()))
        .zip(hex::decode(&event.pubkey).ok().and_then(|bytes| XOnlyPublicKey::from_slice(&bytes).ok()));
    match parsed {
        Some(((digest, sig), pubkey)) => SECP256K1
            .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
            .is_ok(),
        None => false,
    }
}
