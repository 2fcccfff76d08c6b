mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::error::TryRecvError;

use wallet_channel_adapters::{
    BridgeConfig, MockHost, PopupTransport, PopupTransportFactory, RuntimeProfile,
    DISCONNECT_REASON, PEER_CLOSED_REASON,
};
use wallet_channel_core::{
    BridgeError, ConnectionFailure, DescriptorDefaults, Envelope, PeerDescriptor, Role,
    ScreenGeometry, Transport, TransportEvent, TransportFactory, WindowFeatures, WindowId,
};

use common::{popup, ready, settle, EVIL_ORIGIN, WALLET_ORIGIN, WALLET_URL};

async fn handshake(host: &MockHost, transport: &PopupTransport) {
    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        host.deliver(WALLET_ORIGIN, ready());
    });
    result.expect("handshake completes");
}

#[tokio::test(start_paused = true)]
async fn popup_connect_message_and_close_end_to_end() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    handshake(&host, &transport).await;
    assert!(transport.is_connected());
    assert_eq!(
        events.try_recv().expect("connected event"),
        TransportEvent::Connected {
            url: WALLET_URL.to_owned()
        }
    );

    let opened = host.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].url, WALLET_URL);
    assert_eq!(
        opened[0].features,
        WindowFeatures::centered(ScreenGeometry::default(), 400, 600)
    );
    assert_eq!(
        opened[0].features.to_string(),
        "width=400,height=600,left=440,top=100,scrollbars=yes,resizable=yes"
    );

    host.deliver(WALLET_ORIGIN, json!({ "type": "data", "payload": "x" }));
    match events.try_recv().expect("message event") {
        TransportEvent::Message(envelope) => {
            assert_eq!(envelope.kind, "data");
            assert_eq!(envelope.payload(), Some(&json!("x")));
        }
        other => panic!("expected message event, got {other:?}"),
    }

    host.last_opened().expect("popup window").set_closed(true);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        events.try_recv().expect("disconnected event"),
        TransportEvent::Disconnected {
            reason: PEER_CLOSED_REASON.to_owned()
        }
    );
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert!(!transport.is_connected());
    assert_eq!(host.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_uses_configured_value() {
    let host = Arc::new(MockHost::new());
    let transport = PopupTransport::new(
        common::descriptor().with_handshake_timeout(Duration::from_millis(10_000)),
        host.clone(),
    );
    let mut events = transport.subscribe();

    let err = transport.connect().await.expect_err("no peer answers");
    assert_eq!(
        err,
        BridgeError::ConnectionFailed(ConnectionFailure::Timeout {
            after: Duration::from_millis(10_000)
        })
    );
    assert_eq!(host.listener_count(), 0);
    assert_eq!(host.last_opened().expect("popup window").close_calls(), 1);
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn mismatched_origin_is_dropped_and_ready_completes_once() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        host.deliver(EVIL_ORIGIN, ready());
        host.deliver(EVIL_ORIGIN, json!({ "type": "data", "payload": "spoof" }));
        host.deliver_from(Some(WindowId(999)), WALLET_ORIGIN, ready());
        settle().await;
        assert!(!transport.is_connected());
        host.deliver(WALLET_ORIGIN, ready());
        host.deliver(WALLET_ORIGIN, ready());
        host.deliver(WALLET_ORIGIN, json!({ "type": "ready" }));
    });
    result.expect("handshake completes");

    assert!(matches!(
        events.try_recv(),
        Ok(TransportEvent::Connected { .. })
    ));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(
        transport.last_validated_origin().as_deref(),
        Some(WALLET_ORIGIN)
    );
}

#[tokio::test(start_paused = true)]
async fn messages_before_ready_are_delivered_without_completing_handshake() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        host.deliver(WALLET_ORIGIN, json!("{\"type\":\"hello\"}"));
        host.deliver(WALLET_ORIGIN, json!("not json"));
        settle().await;
        assert!(!transport.is_connected());
        host.deliver(WALLET_ORIGIN, ready());
    });
    result.expect("handshake completes");

    match events.try_recv().expect("early message") {
        TransportEvent::Message(envelope) => assert_eq!(envelope.kind, "hello"),
        other => panic!("expected message, got {other:?}"),
    }
    assert!(matches!(
        events.try_recv(),
        Ok(TransportEvent::Connected { .. })
    ));
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn post_handshake_bad_messages_surface_as_error_events() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();
    handshake(&host, &transport).await;
    let _ = events.try_recv();

    host.deliver(WALLET_ORIGIN, json!(17));
    assert!(matches!(
        events.try_recv(),
        Ok(TransportEvent::Error(BridgeError::MessageFailed(_)))
    ));

    host.deliver(
        WALLET_ORIGIN,
        json!({ "type": "data", "originContext": { "origin": EVIL_ORIGIN } }),
    );
    assert_eq!(
        events.try_recv().expect("origin error"),
        TransportEvent::Error(BridgeError::OriginValidationFailed {
            claimed: EVIL_ORIGIN.to_owned(),
            actual: WALLET_ORIGIN.to_owned(),
        })
    );
    assert!(transport.is_connected());
}

#[tokio::test(start_paused = true)]
async fn legacy_wrapped_envelope_is_unwrapped() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();
    handshake(&host, &transport).await;
    let _ = events.try_recv();

    host.deliver(
        WALLET_ORIGIN,
        json!({
            "type": "wallet-channel:envelope",
            "data": "{\"type\":\"response\",\"data\":{\"id\":1,\"result\":true}}"
        }),
    );
    match events.try_recv().expect("unwrapped message") {
        TransportEvent::Message(envelope) => {
            assert_eq!(envelope.kind, "response");
            assert_eq!(envelope.data, Some(json!({ "id": 1, "result": true })));
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn double_disconnect_emits_one_event_and_send_fails_closed() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();
    handshake(&host, &transport).await;
    let _ = events.try_recv();

    transport.disconnect();
    transport.destroy();

    assert_eq!(
        events.try_recv().expect("disconnected event"),
        TransportEvent::Disconnected {
            reason: DISCONNECT_REASON.to_owned()
        }
    );
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    let popup_window = host.last_opened().expect("popup window");
    assert_eq!(popup_window.close_calls(), 1);
    assert_eq!(host.listener_count(), 0);

    let err = transport
        .send(&Envelope::new("data"))
        .expect_err("send after disconnect");
    assert_eq!(err, BridgeError::closed());
}

#[tokio::test(start_paused = true)]
async fn send_targets_the_expected_origin() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    handshake(&host, &transport).await;

    transport
        .send(&Envelope::new("data").with_data(json!({ "n": 1 })))
        .expect("send");
    let posted = host.last_opened().expect("popup window").posted();
    assert_eq!(
        posted,
        vec![(json!({ "type": "data", "data": { "n": 1 } }), WALLET_ORIGIN.to_owned())]
    );
}

#[tokio::test(start_paused = true)]
async fn send_fails_when_peer_window_reports_closed() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    handshake(&host, &transport).await;

    host.last_opened().expect("popup window").set_closed(true);
    let err = transport
        .send(&Envelope::new("data"))
        .expect_err("peer closed");
    assert_eq!(err.failure(), Some(ConnectionFailure::Closed));
}

#[tokio::test(start_paused = true)]
async fn popup_closed_before_handshake_cancels_without_disconnect_event() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        host.last_opened().expect("popup window").set_closed(true);
    });

    assert_eq!(
        result.expect_err("closed mid-handshake").failure(),
        Some(ConnectionFailure::Cancelled)
    );
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(host.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_handshake_rejects_connect() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        transport.disconnect();
    });

    assert_eq!(
        result.expect_err("cancelled").failure(),
        Some(ConnectionFailure::Cancelled)
    );
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(host.listener_count(), 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_releases_the_popup_and_allows_retry() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);
    let mut events = transport.subscribe();

    let abandoned = tokio::time::timeout(Duration::from_millis(100), transport.connect()).await;
    assert!(abandoned.is_err(), "connect should still be pending");
    assert_eq!(host.listener_count(), 0);
    let first = host.last_opened().expect("first popup");
    assert_eq!(first.close_calls(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

    handshake(&host, &transport).await;
    assert!(transport.is_connected());
    assert_eq!(host.opened().len(), 2);
    assert_eq!(host.listener_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn blocked_popup_is_reported_distinctly() {
    let host = Arc::new(MockHost::new());
    host.block_popups(true);
    let transport = popup(&host);

    let err = transport.connect().await.expect_err("blocked");
    assert_eq!(err.failure(), Some(ConnectionFailure::Blocked));
    assert_eq!(host.listener_count(), 0);
    assert!(host.opened().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_disconnect_registers_one_listener() {
    let host = Arc::new(MockHost::new());
    let transport = popup(&host);

    handshake(&host, &transport).await;
    assert_eq!(host.listener_count(), 1);
    transport.connect().await.expect("already connected");
    assert_eq!(host.opened().len(), 1);

    transport.disconnect();
    assert_eq!(host.listener_count(), 0);

    handshake(&host, &transport).await;
    assert_eq!(host.listener_count(), 1);
    assert_eq!(host.opened().len(), 2);

    transport.disconnect();
    assert_eq!(host.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn peer_role_announces_ready_to_opener() {
    let host = Arc::new(MockHost::with_opener());
    let transport =
        PopupTransport::for_host(WALLET_URL, host.clone(), &DescriptorDefaults::default());
    assert_eq!(transport.descriptor().role(), Role::Peer);
    let mut events = transport.subscribe();

    transport.connect().await.expect("peer connects immediately");
    assert!(transport.is_connected());
    assert!(host.opened().is_empty());
    assert!(matches!(
        events.try_recv(),
        Ok(TransportEvent::Connected { .. })
    ));

    let opener = host.opener_window().expect("opener");
    assert_eq!(
        opener.posted(),
        vec![(json!({ "type": "ready" }), WALLET_ORIGIN.to_owned())]
    );

    host.deliver(
        WALLET_ORIGIN,
        json!({ "type": "request", "data": { "id": 1, "method": "eth_chainId" } }),
    );
    assert!(matches!(events.try_recv(), Ok(TransportEvent::Message(_))));

    transport.disconnect();
    assert_eq!(opener.close_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unparseable_url_accepts_any_origin_and_replies_to_observed_one() {
    let host = Arc::new(MockHost::new());
    let descriptor = PeerDescriptor::new("wallet popup", Role::Opener);
    assert!(descriptor.origin().is_wildcard());
    assert_eq!(descriptor.warnings().len(), 1);
    let transport = PopupTransport::new(descriptor, host.clone());

    let (result, ()) = tokio::join!(transport.connect(), async {
        settle().await;
        host.deliver("https://anywhere.example", ready());
    });
    result.expect("handshake completes");

    transport.send(&Envelope::new("data")).expect("send");
    let posted = host.last_opened().expect("popup window").posted();
    assert_eq!(posted[0].1, "https://anywhere.example");
    assert_eq!(transport.descriptor().warnings().len(), 1);
}

#[test]
fn production_factory_refuses_wildcard_origins() {
    let host = Arc::new(MockHost::new());
    let strict = PopupTransportFactory::new(
        host.clone(),
        BridgeConfig {
            runtime_profile: RuntimeProfile::Production,
            ..BridgeConfig::default()
        },
    );
    let err = strict
        .create(PeerDescriptor::new("wallet popup", Role::Opener))
        .expect_err("wildcard refused");
    assert!(matches!(err, BridgeError::Configuration(_)));
    strict
        .create(PeerDescriptor::new(WALLET_URL, Role::Opener))
        .expect("exact origin allowed");

    let relaxed = PopupTransportFactory::new(host, BridgeConfig::default());
    relaxed
        .create(PeerDescriptor::new("wallet popup", Role::Opener))
        .expect("development allows wildcard");
}
