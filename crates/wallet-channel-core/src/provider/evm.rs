use std::ops::Deref;

use alloy::primitives::{Address, Bytes, B256};
use serde_json::Value;

use super::Provider;
use crate::domain::parse_evm_chain_id;
use crate::ports::{BridgeError, Transport};

/// EIP-1193 style calls over the channel.
#[derive(Debug)]
pub struct EvmProvider<T: Transport> {
    base: Provider<T>,
}

impl<T: Transport> Clone for EvmProvider<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<T: Transport> Deref for EvmProvider<T> {
    type Target = Provider<T>;

    fn deref(&self) -> &Provider<T> {
        &self.base
    }
}

impl<T: Transport> EvmProvider<T> {
    pub(crate) fn new(base: Provider<T>) -> Self {
        Self { base }
    }

    pub async fn request_accounts(&self) -> Result<Vec<Address>, BridgeError> {
        let raw = self.base.get_accounts().await?;
        raw.iter()
            .map(|a| {
                a.parse::<Address>()
                    .map_err(|e| BridgeError::MessageFailed(format!("invalid account {a}: {e}")))
            })
            .collect()
    }

    pub async fn chain_id_u64(&self) -> Result<u64, BridgeError> {
        let result = self.base.request("eth_chainId", serde_json::json!([])).await?;
        json_chain_id_to_u64(&result)
    }

    pub async fn personal_sign(
        &self,
        message: &[u8],
        signer: Address,
    ) -> Result<Bytes, BridgeError> {
        let payload_hex = format!("0x{}", alloy::hex::encode(message));
        let result = self
            .base
            .request(
                "personal_sign",
                serde_json::json!([payload_hex, signer.to_string()]),
            )
            .await?;
        parse_signature(&result)
    }

    pub async fn sign_typed_data_v4(
        &self,
        signer: Address,
        typed_data: &Value,
    ) -> Result<Bytes, BridgeError> {
        let payload_text = serde_json::to_string(typed_data)
            .map_err(|e| BridgeError::MessageFailed(format!("typed data encode failed: {e}")))?;
        let result = self
            .base
            .request(
                "eth_signTypedData_v4",
                serde_json::json!([signer.to_string(), payload_text]),
            )
            .await?;
        parse_signature(&result)
    }

    pub async fn send_transaction(&self, tx_payload: &Value) -> Result<B256, BridgeError> {
        let result = self
            .base
            .request("eth_sendTransaction", serde_json::json!([tx_payload]))
            .await?;
        let hash = result.as_str().ok_or_else(|| {
            BridgeError::MessageFailed("eth_sendTransaction must return tx hash".to_owned())
        })?;
        hash.parse()
            .map_err(|e| BridgeError::MessageFailed(format!("invalid tx hash: {e}")))
    }

    pub async fn switch_chain(&self, chain_id: u64) -> Result<(), BridgeError> {
        self.base
            .request(
                "wallet_switchEthereumChain",
                serde_json::json!([{ "chainId": format!("{chain_id:#x}") }]),
            )
            .await?;
        Ok(())
    }
}

fn parse_signature(result: &Value) -> Result<Bytes, BridgeError> {
    let sig_raw = result.as_str().ok_or_else(|| {
        BridgeError::MessageFailed("signature response must be hex string".to_owned())
    })?;
    sig_raw
        .parse()
        .map_err(|e| BridgeError::MessageFailed(format!("invalid signature hex: {e}")))
}

pub(super) fn json_chain_id_to_u64(value: &Value) -> Result<u64, BridgeError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let s = value
        .as_str()
        .ok_or_else(|| BridgeError::MessageFailed("chain id must be string or number".to_owned()))?;
    parse_evm_chain_id(s)
        .map_err(|e| BridgeError::MessageFailed(format!("invalid chain id {s}: {e}")))
}
