use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};
use transport_broadcast::{
    BroadcastClientTransport, DiscoveryCoordinator, DiscoveryEnvelope, DiscoveryListener,
    SessionChannelTransport, SessionInfo, SessionRegistry,
};
use transport_bus::{Bus, BusChannel, BusEvent, LocalBus};
use transport_core::{
    JsonRpcKind, JsonRpcMessage, TimeoutPhase, Transport, TransportError, TransportEvent,
    TransportEvents,
};

const DISCOVERY: &str = "mcp-discovery";

fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn next_event(events: &mut TransportEvents) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event stream ended")
}

async fn next_message(events: &mut TransportEvents) -> JsonRpcMessage {
    loop {
        match next_event(events).await {
            TransportEvent::Message(message) => return message,
            TransportEvent::Error(err) => tracing::debug!(error = %err, "skipping error event"),
            TransportEvent::Closed => panic!("transport closed before a message arrived"),
        }
    }
}

async fn next_bus_text(channel: &mut BusChannel) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), channel.recv())
            .await
            .expect("bus timeout")
            .expect("bus closed");
        if let BusEvent::Message(text) = event {
            return text;
        }
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn discovery_then_list_tools_round_trip() {
    init_tracing();
    let bus = LocalBus::shared();
    let registry = Arc::new(SessionRegistry::new());
    let listener = DiscoveryListener::bind(bus.clone(), DISCOVERY, registry.clone())
        .expect("bind listener");

    let server = tokio::spawn(async move {
        let granted = listener.accept().await.expect("granted session");
        let mut events = granted.transport.take_events().expect("server events");
        let request = next_message(&mut events).await;
        assert_eq!(request.kind(), JsonRpcKind::Request);
        assert_eq!(request.method(), Some("listTools"));

        let reply = JsonRpcMessage::response(
            request.id().cloned().expect("id"),
            json!({ "tools": [{ "name": "echo" }] }),
        )
        .expect("reply");
        granted.transport.send(&reply).await.expect("server send");
        (listener, granted)
    });

    let client = BroadcastClientTransport::new(bus.clone(), DISCOVERY);
    let mut client_events = client.take_events().expect("client events");
    client.start().await.expect("client start");
    let session_id = client.session_id().expect("session id");

    let request = JsonRpcMessage::request(1, "listTools", Some(json!({}))).expect("request");
    client.send(&request).await.expect("client send");

    let reply = next_message(&mut client_events).await;
    assert_eq!(
        reply.as_value(),
        &json!({ "jsonrpc": "2.0", "id": 1, "result": { "tools": [{ "name": "echo" }] } })
    );

    let (_listener, granted) = server.await.expect("server task");
    assert_eq!(granted.session.session_id, session_id);
    assert_eq!(
        granted.session.session_channel_name,
        format!("mcp-session-{session_id}")
    );
    assert!(registry.contains(&session_id));
    assert_eq!(registry.len(), 1);

    client.close().await.expect("close");
    client.close().await.expect("second close");
    assert_eq!(next_event(&mut client_events).await, TransportEvent::Closed);
}

#[test_timeout::tokio_timeout_test(5)]
async fn unanswered_request_times_out_and_releases_the_channel() {
    init_tracing();
    let hub = Arc::new(LocalBus::new());
    let bus: Arc<dyn Bus> = hub.clone();
    let coordinator =
        DiscoveryCoordinator::new(bus, DISCOVERY).with_timeout(Duration::from_millis(50));

    let started = tokio::time::Instant::now();
    let err = coordinator.establish_session().await.expect_err("no listener");
    assert_eq!(
        err,
        TransportError::timeout(TimeoutPhase::SessionRequest, Duration::from_millis(50))
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(hub.listener_count(DISCOVERY), 0);
    assert!(!coordinator.is_pending());
}

#[test_timeout::tokio_timeout_test(5)]
async fn failed_client_start_closes_the_client() {
    init_tracing();
    let client = BroadcastClientTransport::new(LocalBus::shared(), DISCOVERY)
        .with_session_timeout(Duration::from_millis(30));
    let mut events = client.take_events().expect("events");

    let err = client.start().await.expect_err("nobody grants");
    assert!(err.is_timeout());
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
    assert_eq!(client.start().await, Err(TransportError::AlreadyStarted));
    assert!(client.session_id().is_none());
}

#[test_timeout::tokio_timeout_test(5)]
async fn close_cancels_a_pending_start() {
    init_tracing();
    let hub = Arc::new(LocalBus::new());
    let bus: Arc<dyn Bus> = hub.clone();
    let client = Arc::new(
        BroadcastClientTransport::new(bus, DISCOVERY).with_session_timeout(Duration::from_secs(5)),
    );
    let mut events = client.take_events().expect("events");

    let start = tokio::spawn({
        let client = client.clone();
        async move { client.start().await }
    });
    while hub.listener_count(DISCOVERY) == 0 {
        tokio::task::yield_now().await;
    }

    let closed_at = tokio::time::Instant::now();
    client.close().await.expect("close");
    let outcome = start.await.expect("join");
    assert_eq!(outcome, Err(TransportError::ClosedPendingOpen));
    assert!(closed_at.elapsed() < Duration::from_secs(1));
    assert_eq!(hub.listener_count(DISCOVERY), 0);
    assert!(client.session_id().is_none());

    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .is_err()
    );
    assert_eq!(client.start().await, Err(TransportError::AlreadyStarted));
}

#[test_timeout::tokio_timeout_test(10)]
async fn every_client_gets_its_own_channel() {
    init_tracing();
    let bus = LocalBus::shared();
    let registry = Arc::new(SessionRegistry::new());
    let listener =
        DiscoveryListener::bind(bus.clone(), DISCOVERY, registry.clone()).expect("bind");

    let first = BroadcastClientTransport::new(bus.clone(), DISCOVERY);
    let second = BroadcastClientTransport::new(bus.clone(), DISCOVERY);
    first.start().await.expect("first");
    second.start().await.expect("second");

    let a = listener.accept().await.expect("grant a");
    let b = listener.accept().await.expect("grant b");
    assert_ne!(a.session.session_channel_name, b.session.session_channel_name);
    assert_ne!(a.client_id_hint, b.client_id_hint);
    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(registry.len(), 2);
}

#[test_timeout::tokio_timeout_test(10)]
async fn repeated_hint_is_granted_once_per_live_session() {
    init_tracing();
    let bus = LocalBus::shared();
    let registry = Arc::new(SessionRegistry::new());
    let listener =
        DiscoveryListener::bind(bus.clone(), DISCOVERY, registry.clone()).expect("bind");

    let mut probe = BusChannel::open(bus.clone(), DISCOVERY).expect("probe");
    let request = DiscoveryEnvelope::request("same-hint").to_wire().expect("wire");
    probe.post(&request).expect("first request");
    probe.post(&request).expect("second request");

    let grant = DiscoveryEnvelope::parse(&next_bus_text(&mut probe).await).expect("grant");
    assert!(grant.grant_for("same-hint").is_some());

    let second = tokio::time::timeout(Duration::from_millis(200), probe.recv()).await;
    assert!(second.is_err(), "a second grant went out: {second:?}");
    let granted = listener.accept().await.expect("granted");
    assert_eq!(registry.len(), 1);

    registry
        .remove(&granted.session.session_id)
        .expect("registered session");
    granted.transport.close().await.expect("close session");
    assert!(!registry.is_hint_claimed("same-hint"));

    probe.post(&request).expect("request after the session ended");
    let regrant = DiscoveryEnvelope::parse(&next_bus_text(&mut probe).await).expect("grant");
    let session = regrant.grant_for("same-hint").expect("fresh grant");
    assert_ne!(session, granted.session);
    assert!(listener.accept().await.is_some());
}

#[test_timeout::tokio_timeout_test(10)]
async fn noise_on_the_discovery_bus_does_not_fail_the_request() {
    init_tracing();
    let bus = LocalBus::shared();
    let events = Arc::new(transport_core::EventSink::new("discovery-test"));
    let mut errors = events.take().expect("events");
    let coordinator = DiscoveryCoordinator::new(bus.clone(), DISCOVERY)
        .with_timeout(Duration::from_secs(2))
        .with_events(events.clone());

    let mut peer = BusChannel::open(bus.clone(), DISCOVERY).expect("peer");
    let granter = tokio::spawn(async move {
        let request = DiscoveryEnvelope::parse(&next_bus_text(&mut peer).await).expect("request");
        let hint = request.client_id_hint().to_string();

        peer.post_bytes(Bytes::from_static(&[0xff, 0xfe, 0x00])).expect("corrupt");
        peer.post("definitely not json").expect("garbage");
        let stranger = SessionInfo {
            session_id: "other".into(),
            session_channel_name: "mcp-session-other".into(),
        };
        peer.post(&DiscoveryEnvelope::grant("someone-else", &stranger).to_wire().expect("wire"))
            .expect("foreign grant");

        let ours = SessionInfo {
            session_id: "ours".into(),
            session_channel_name: "mcp-session-ours".into(),
        };
        peer.post(&DiscoveryEnvelope::grant(&hint, &ours).to_wire().expect("wire"))
            .expect("grant");
        ours
    });

    let session = coordinator.establish_session().await.expect("session");
    assert_eq!(session, granter.await.expect("granter"));

    match next_event(&mut errors).await {
        TransportEvent::Error(TransportError::Parse(_)) => {}
        other => panic!("expected a parse error event, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(5)]
async fn session_pump_reports_bad_frames_and_keeps_going() {
    init_tracing();
    let bus = LocalBus::shared();
    let transport =
        SessionChannelTransport::new(bus.clone(), "mcp-session-pump").expect("transport");
    let mut events = transport.take_events().expect("events");
    transport.start().await.expect("start");

    let peer = BusChannel::open(bus.clone(), "mcp-session-pump").expect("peer");
    peer.post("{ nope").expect("garbage");
    peer.post(r#"{"jsonrpc":"2.0","result":{}}"#).expect("shapeless");
    peer.post(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .expect("notification");

    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(TransportError::Parse(_))
    ));
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(TransportError::Parse(_))
    ));
    let message = next_message(&mut events).await;
    assert_eq!(message.kind(), JsonRpcKind::Notification);

    transport.close().await.expect("close");
    transport.close().await.expect("close again");
    assert_eq!(next_event(&mut events).await, TransportEvent::Closed);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .map_or(true, |event| event.is_none())
    );
}
