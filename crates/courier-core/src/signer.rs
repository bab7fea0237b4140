use crate::error::CoreError;
use courier_api::SignedEvent;

/// Identity capability: seals plaintext for a recipient and signs protocol events.
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the active identity, `None` when no identity is loaded.
    fn public_key(&self) -> Option<String>;

    async fn build_event(
        &self,
        recipient: &str,
        plaintext: &str,
        kind: u32,
    ) -> Result<SignedEvent, CoreError>;

    async fn build_auth_event(
        &self,
        challenge: &str,
        relay_url: &str,
    ) -> Result<SignedEvent, CoreError>;

    async fn decrypt(&self, counterparty: &str, ciphertext: &str) -> Result<String, CoreError>;
}

#[derive(Clone, Default)]
pub struct NoSigner;

#[async_trait::async_trait]
impl Signer for NoSigner {
    fn public_key(&self) -> Option<String> {
        None
    }

    async fn build_event(
        &self,
        _recipient: &str,
        _plaintext: &str,
        _kind: u32,
    ) -> Result<SignedEvent, CoreError> {
        Err(CoreError::SignerUnavailable)
    }

    async fn build_auth_event(
        &self,
        _challenge: &str,
        _relay_url: &str,
    ) -> Result<SignedEvent, CoreError> {
        Err(CoreError::SignerUnavailable)
    }

    async fn decrypt(&self, _counterparty: &str, _ciphertext: &str) -> Result<String, CoreError> {
        Err(CoreError::SignerUnavailable)
    }
}
