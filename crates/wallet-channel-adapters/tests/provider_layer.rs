mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::Address;
use serde_json::json;

use wallet_channel_core::{
    BridgeError, ChainFamily, ChainId, ChainProvider, ConnectionFailure, Provider,
    ProviderEventKind, Transport,
};

use common::{connected_mock, settle, ACCOUNT, ACCOUNT_B, REQUEST_TIMEOUT};

#[tokio::test(start_paused = true)]
async fn evm_provider_probes_accounts_and_chain() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let provider = ChainProvider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let accounts = provider.get_accounts().await.expect("accounts");
    assert_eq!(accounts, vec![ACCOUNT.to_owned(), ACCOUNT_B.to_owned()]);
    let chain = provider.get_chain_id().await.expect("chain id");
    assert_eq!(chain, ChainId::evm(8453));
    assert_eq!(chain.to_string(), "eip155:8453");

    let evm = provider.as_evm().expect("evm provider");
    let typed: Vec<Address> = evm.request_accounts().await.expect("typed accounts");
    let expected: Address = ACCOUNT.parse().expect("account");
    assert_eq!(typed[0], expected);
    assert_eq!(evm.chain_id_u64().await.expect("chain"), 8453);

    assert_eq!(
        transport.sent_methods(),
        vec![
            "eth_requestAccounts",
            "eth_chainId",
            "eth_requestAccounts",
            "eth_chainId"
        ]
    );

    let events = provider.drain_events().expect("drain events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ProviderEventKind::AccountsChanged);
    assert_eq!(events[1].kind, ProviderEventKind::ChainChanged);
    assert_eq!(events[0].sequence + 1, events[1].sequence);
    assert!(provider.drain_events().expect("drain again").is_empty());
}

#[tokio::test(start_paused = true)]
async fn rpc_errors_are_returned_to_the_caller() {
    let transport = connected_mock();
    transport.respond_error("personal_sign", 4001, "User rejected the request.");
    transport.connect().await.expect("connect");
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let err = provider
        .request("personal_sign", json!(["0x68656c6c6f", ACCOUNT]))
        .await
        .expect_err("rejected");
    assert_eq!(
        err,
        BridgeError::Rpc {
            code: 4001,
            message: "User rejected the request.".to_owned()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, Duration::from_secs(5));

    let err = provider
        .request("eth_sendTransaction", json!([{}]))
        .await
        .expect_err("no answer");
    assert!(matches!(err, BridgeError::MessageFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn send_on_a_closed_transport_fails_fast() {
    let transport = connected_mock();
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let err = provider.get_accounts().await.expect_err("not connected");
    assert_eq!(err.failure(), Some(ConnectionFailure::Closed));
}

#[tokio::test(start_paused = true)]
async fn pending_requests_fail_closed_on_disconnect() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let (result, ()) = tokio::join!(provider.request("eth_sign", json!([])), async {
        settle().await;
        transport.simulate_peer_closed();
    });
    assert_eq!(result.expect_err("closed").failure(), Some(ConnectionFailure::Closed));

    settle().await;
    let events = provider.drain_events().expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ProviderEventKind::Disconnected);
    assert_eq!(events[0].value, "Popup window closed");
}

#[tokio::test(start_paused = true)]
async fn native_event_dialects_are_normalized() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    provider.on(ProviderEventKind::AccountsChanged, move |event| {
        sink.lock().expect("sink").push(event.value.clone());
    });

    transport.push_event("accounts_changed", json!([ACCOUNT_B]));
    transport.push_event("networkChanged", json!(10));
    transport.push_event("somethingElse", json!(null));
    settle().await;

    assert_eq!(provider.accounts(), vec![ACCOUNT_B.to_owned()]);
    assert_eq!(provider.chain_id(), Some(ChainId::evm(10)));
    assert_eq!(
        *seen.lock().expect("seen"),
        vec![format!("[\"{ACCOUNT_B}\"]")]
    );

    let kinds: Vec<_> = provider
        .drain_events()
        .expect("events")
        .into_iter()
        .map(|e| e.kind.canonical_name())
        .collect();
    assert_eq!(kinds, vec!["accountsChanged", "chainChanged"]);
}

#[tokio::test(start_paused = true)]
async fn off_stops_delivery() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let provider = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);

    let count = Arc::new(Mutex::new(0usize));
    let sink = count.clone();
    let id = provider.on(ProviderEventKind::ChainChanged, move |_| {
        *sink.lock().expect("count") += 1;
    });

    transport.push_event("chainChanged", json!("0x1"));
    settle().await;
    assert!(provider.off(id));
    assert!(!provider.off(id));
    transport.push_event("chainChanged", json!("0x89"));
    settle().await;

    assert_eq!(*count.lock().expect("count"), 1);
    assert_eq!(provider.chain_id(), Some(ChainId::evm(137)));
}

#[tokio::test(start_paused = true)]
async fn family_scoped_events_reach_only_their_provider() {
    let transport = connected_mock();
    transport.connect().await.expect("connect");
    let evm = Provider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);
    let starknet = Provider::new(transport.clone(), ChainFamily::Starknet, REQUEST_TIMEOUT);

    transport.push_family_event("starknet", "accountsChanged", json!(["0x0abc"]));
    settle().await;

    assert!(evm.accounts().is_empty());
    assert_eq!(starknet.accounts(), vec!["0x0abc".to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn responses_route_to_the_right_request_across_providers() {
    let transport = connected_mock();
    transport.respond_to("wallet_requestChainId", json!("0x534e5f4d41494e"));
    transport.connect().await.expect("connect");
    let evm = ChainProvider::new(transport.clone(), ChainFamily::Evm, REQUEST_TIMEOUT);
    let starknet = ChainProvider::new(transport.clone(), ChainFamily::Starknet, REQUEST_TIMEOUT);

    let (evm_chain, starknet_chain) = tokio::join!(evm.get_chain_id(), starknet.get_chain_id());
    assert_eq!(evm_chain.expect("evm chain"), ChainId::evm(8453));
    assert_eq!(
        starknet_chain.expect("starknet chain").to_string(),
        "starknet:SN_MAIN"
    );
}

#[tokio::test(start_paused = true)]
async fn aleo_and_starknet_typed_calls_share_the_request_path() {
    let transport = connected_mock();
    transport.respond_to("aleo_encrypt", json!("ciphertext1q"));
    transport.respond_to("aleo_decrypt", json!({ "plaintext": "hello" }));
    transport.respond_to(
        "wallet_deployContract",
        json!({ "transaction_hash": "0x1", "contract_address": "0x2" }),
    );
    transport.connect().await.expect("connect");

    let aleo = ChainProvider::new(transport.clone(), ChainFamily::Aleo, REQUEST_TIMEOUT);
    let aleo = aleo.as_aleo().expect("aleo provider");
    assert_eq!(aleo.encrypt("hello").await.expect("encrypt"), "ciphertext1q");
    assert_eq!(aleo.decrypt("ciphertext1q").await.expect("decrypt"), "hello");

    let starknet = ChainProvider::new(transport.clone(), ChainFamily::Starknet, REQUEST_TIMEOUT);
    let deployed = starknet
        .as_starknet()
        .expect("starknet provider")
        .deploy_contract("0xc1a55", Some("0x5a17"), &["0x1".to_owned()])
        .await
        .expect("deploy");
    assert_eq!(deployed.contract_address, "0x2");
    assert_eq!(deployed.transaction_hash, "0x1");
}
