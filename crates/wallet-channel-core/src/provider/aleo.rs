use std::ops::Deref;

use serde_json::Value;

use super::{string_result, Provider};
use crate::ports::{BridgeError, Transport};

/// Privacy-chain calls; encryption happens in the wallet, never here.
#[derive(Debug)]
pub struct AleoProvider<T: Transport> {
    base: Provider<T>,
}

impl<T: Transport> Clone for AleoProvider<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<T: Transport> Deref for AleoProvider<T> {
    type Target = Provider<T>;

    fn deref(&self) -> &Provider<T> {
        &self.base
    }
}

impl<T: Transport> AleoProvider<T> {
    pub(crate) fn new(base: Provider<T>) -> Self {
        Self { base }
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String, BridgeError> {
        let result = self
            .base
            .request("aleo_encrypt", serde_json::json!({ "plaintext": plaintext }))
            .await?;
        string_result(&result, "ciphertext")
    }

    pub async fn decrypt(&self, ciphertext: &str) -> Result<String, BridgeError> {
        let result = self
            .base
            .request("aleo_decrypt", serde_json::json!({ "ciphertext": ciphertext }))
            .await?;
        string_result(&result, "plaintext")
    }

    pub async fn request_transaction(&self, transaction: &Value) -> Result<String, BridgeError> {
        let result = self
            .base
            .request("aleo_requestTransaction", transaction.clone())
            .await?;
        string_result(&result, "transactionId")
    }
}
