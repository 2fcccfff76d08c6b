use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{string_result, Provider};
use crate::ports::{BridgeError, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedContract {
    pub transaction_hash: String,
    pub contract_address: String,
}

#[derive(Debug)]
pub struct StarknetProvider<T: Transport> {
    base: Provider<T>,
}

impl<T: Transport> Clone for StarknetProvider<T> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<T: Transport> Deref for StarknetProvider<T> {
    type Target = Provider<T>;

    fn deref(&self) -> &Provider<T> {
        &self.base
    }
}

impl<T: Transport> StarknetProvider<T> {
    pub(crate) fn new(base: Provider<T>) -> Self {
        Self { base }
    }

    pub async fn add_invoke_transaction(&self, calls: Value) -> Result<String, BridgeError> {
        let result = self
            .base
            .request(
                "wallet_addInvokeTransaction",
                serde_json::json!({ "calls": calls }),
            )
            .await?;
        string_result(&result, "transaction_hash")
    }

    pub async fn deploy_contract(
        &self,
        class_hash: &str,
        salt: Option<&str>,
        constructor_calldata: &[String],
    ) -> Result<DeployedContract, BridgeError> {
        let result = self
            .base
            .request(
                "wallet_deployContract",
                serde_json::json!({
                    "class_hash": class_hash,
                    "salt": salt,
                    "constructor_calldata": constructor_calldata,
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| BridgeError::MessageFailed(format!("invalid deploy result: {e}")))
    }

    pub async fn sign_typed_data(&self, typed_data: &Value) -> Result<Vec<String>, BridgeError> {
        let result = self
            .base
            .request("wallet_signTypedData", typed_data.clone())
            .await?;
        serde_json::from_value(result)
            .map_err(|e| BridgeError::MessageFailed(format!("invalid starknet signature: {e}")))
    }
}

/// Chain ids come back as felts holding a short ASCII string (`0x534e5f4d41494e` is `SN_MAIN`).
pub(super) fn decode_short_string(raw: &str) -> String {
    let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) else {
        return raw.to_owned();
    };
    let padded = if hex.len() % 2 == 1 {
        format!("0{hex}")
    } else {
        hex.to_owned()
    };
    match alloy::hex::decode(&padded) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => text,
            _ => raw.to_owned(),
        },
        Err(_) => raw.to_owned(),
    }
}
