//! Multi-peer session scenarios over the in-memory relay and loopback network
//!
//! ```bash
//! cargo test -p cloudcounter-session --test session_flows -- --nocapture
//! ```

mod harness;

use cloudcounter_session::{CounterEvent, CounterStore, PeerState, Role, SessionEvent};
use harness::{
    test_config, wait_for_event, wait_for_state, wait_for_total, wait_until, SessionHarness,
    SESSION,
};
use serde_json::json;
use std::time::Duration;

const CONNECT: Duration = Duration::from_secs(10);

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_peers_connect() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");

    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    assert_eq!(a.status_of("b").await.unwrap().role, Some(Role::Initiator));
    assert_eq!(b.status_of("a").await.unwrap().role, Some(Role::Responder));
    assert_eq!(harness.network.endpoints_between("a", "b"), 1);
    assert_eq!(harness.network.endpoints_between("b", "a"), 1);
    assert_eq!(harness.relay.published_between("a", "b", "offer"), 1);
    assert_eq!(harness.relay.published_between("b", "a", "offer"), 0);
    assert_eq!(
        b.states_of("a"),
        vec![PeerState::Idle, PeerState::Negotiating, PeerState::Connected]
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_glare_converges_on_smaller_id() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    // b gives up waiting for an offer early and initiates too
    let mut eager = test_config();
    eager.negotiation_timeout_ms = 2_000;
    let b = harness.add_peer_with("b", eager);

    harness.relay.hold();
    a.join().await.unwrap();
    b.join().await.unwrap();

    let relay = &harness.relay;
    wait_until("both offers published", CONNECT, || async move {
        relay.published_between("a", "b", "offer") == 1
            && relay.published_between("b", "a", "offer") == 1
    })
    .await
    .unwrap();

    relay.release();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    assert_eq!(a.status_of("b").await.unwrap().role, Some(Role::Initiator));
    assert_eq!(b.status_of("a").await.unwrap().role, Some(Role::Responder));
    assert_eq!(relay.published_between("a", "b", "answer"), 0);
    assert_eq!(relay.published_between("b", "a", "answer"), 1);
    assert_eq!(harness.network.endpoints_between("a", "b"), 1);
    assert_eq!(harness.network.endpoints_between("b", "a"), 1);
    assert_eq!(harness.network.links_established(), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_and_duplicated_signaling() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");

    a.join().await.unwrap();
    harness.relay.hold();
    harness.relay.set_duplicate_delivery(true);
    b.join().await.unwrap();

    // offer and candidate from a, delivered candidate first
    let relay = &harness.relay;
    wait_until("offer and candidate held", CONNECT, || async move {
        relay.held_count() >= 2
    })
    .await
    .unwrap();
    relay.release_reversed();

    harness.wait_for_mesh(CONNECT).await.unwrap();

    assert_eq!(harness.network.links_established(), 1);
    assert_eq!(harness.network.endpoints_between("b", "a"), 1);
    assert_eq!(
        b.states_of("a"),
        vec![PeerState::Idle, PeerState::Negotiating, PeerState::Connected]
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_signaling_is_discarded() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();
    let generation = b.status_of("a").await.unwrap().generation;

    let relay = &harness.relay;
    relay.inject_raw(
        SESSION,
        "b",
        json!({"type": "bogus", "session": SESSION, "from": "a", "to": "b", "payload": "", "seq": 1}),
    );
    relay.inject_raw(SESSION, "b", json!("not an envelope"));
    // well-formed, but b never sent an offer
    relay.inject_raw(
        SESSION,
        "b",
        json!({"type": "answer", "session": SESSION, "from": "a", "to": "b", "payload": "{}", "seq": u64::MAX}),
    );
    // addressed to someone else
    relay.inject_raw(
        SESSION,
        "b",
        json!({"type": "bye", "session": SESSION, "from": "a", "to": "c", "seq": u64::MAX}),
    );

    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = b.status_of("a").await.unwrap();
    assert_eq!(status.state, PeerState::Connected);
    assert_eq!(status.generation, generation);
    assert_eq!(
        b.count_events(|e| matches!(e, SessionEvent::SignalingError { .. })),
        0
    );

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restarted_peer_is_renegotiated_at_once() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();
    let before = a.status_of("b").await.unwrap().generation;

    // b's process dies and comes back with the same id; the new instance
    // does not wait long for an offer and initiates itself
    harness.crash("b");
    drop(b);
    let mut eager = test_config();
    eager.negotiation_timeout_ms = 2_000;
    let b = harness.add_peer_with("b", eager);
    b.join().await.unwrap();

    // a's old incarnation is still CONNECTED when the fresh offer arrives
    let peer = &a;
    wait_until("a renegotiates with the new b", CONNECT, || async move {
        peer.status_of("b")
            .await
            .is_some_and(|s| s.state == PeerState::Connected && s.generation > before)
    })
    .await
    .unwrap();
    wait_for_state(&b, "a", PeerState::Connected, CONNECT)
        .await
        .unwrap();

    assert!(a.states_of("b").contains(&PeerState::Failed));
    assert_eq!(a.status_of("b").await.unwrap().role, Some(Role::Responder));
    assert_eq!(harness.relay.published_between("a", "b", "answer"), 1);
    assert_eq!(
        a.count_events(|e| matches!(e, SessionEvent::Reconnecting { .. })),
        0
    );

    a.coordinator.record_local_count(SESSION, 2).await.unwrap();
    wait_for_total(&b, 2, CONNECT).await.unwrap();

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_limit_ignores_extra_members() {
    let mut harness = SessionHarness::new();
    let mut single = test_config();
    single.max_peers = 1;
    let b = harness.add_peer("b");
    let c = harness.add_peer("c");
    b.join().await.unwrap();
    c.join().await.unwrap();
    wait_for_state(&b, "c", PeerState::Connected, CONNECT)
        .await
        .unwrap();

    // members are admitted in id order: b fits, c does not
    let a = harness.add_peer_with("a", single);
    a.join().await.unwrap();
    wait_for_state(&a, "b", PeerState::Connected, CONNECT)
        .await
        .unwrap();

    // c eventually offers on its own; a keeps ignoring it
    tokio::time::sleep(Duration::from_secs(30)).await;

    let states = a.coordinator.peer_states(SESSION).await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].peer_id, "b");
    assert!(a.status_of("c").await.is_none());
    assert!(harness.relay.published_between("c", "a", "offer") >= 1);
    assert_eq!(harness.relay.published_between("a", "c", "offer"), 0);
    assert_eq!(harness.relay.published_between("a", "c", "answer"), 0);
    assert_eq!(a.states_of("c"), Vec::<PeerState>::new());

    harness.shutdown().await;
}

// ============================================================================
// Counter events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_counter_event_applied_once_per_peer() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    let c = harness.add_peer("c");
    for peer in [&a, &b, &c] {
        peer.join().await.unwrap();
    }
    harness.wait_for_mesh(CONNECT).await.unwrap();

    let e1 = CounterEvent::new(SESSION, "a", 1).with_event_id("e1");
    a.coordinator.broadcast_counter_event(e1.clone()).await.unwrap();

    wait_for_total(&b, 1, CONNECT).await.unwrap();
    wait_for_total(&c, 1, CONNECT).await.unwrap();

    // replays are ignored wherever they show up
    b.coordinator.broadcast_counter_event(e1.clone()).await.unwrap();
    a.coordinator.broadcast_counter_event(e1.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    for peer in [&a, &b, &c] {
        assert_eq!(peer.total().await, 1);
        assert_eq!(peer.store.applied_count(SESSION, "e1"), 1);
        assert_eq!(
            peer.count_events(|e| matches!(e, SessionEvent::CounterApplied { .. })),
            1
        );
    }

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outbox_flushed_after_reconnect() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");

    harness.network.partition("a", "b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_state(&a, "b", PeerState::Negotiating, CONNECT)
        .await
        .unwrap();

    a.coordinator.record_local_count(SESSION, 5).await.unwrap();
    assert_eq!(a.status_of("b").await.unwrap().pending_events, 1);
    assert_eq!(a.total().await, 5);

    // negotiation times out, the retry connects
    harness.network.heal("a", "b");
    wait_for_total(&b, 5, Duration::from_secs(60)).await.unwrap();
    assert_eq!(a.status_of("b").await.unwrap().pending_events, 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_departed_peer_reports_undeliverable_events() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");

    harness.network.partition("a", "b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_state(&a, "b", PeerState::Negotiating, CONNECT)
        .await
        .unwrap();

    let event = a.coordinator.record_local_count(SESSION, 1).await.unwrap();
    b.leave().await.unwrap();

    wait_for_event(&a, CONNECT, |e| {
        matches!(
            e,
            SessionEvent::Undeliverable { peer_id, event: lost, .. }
                if peer_id == "b" && lost.event_id == event.event_id
        )
    })
    .await
    .unwrap();
    wait_for_state(&a, "b", PeerState::Closed, CONNECT).await.unwrap();
    assert_eq!(a.total().await, 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outbox_overflow_drops_oldest() {
    let mut harness = SessionHarness::new();
    let mut small = test_config();
    small.max_pending_events = 2;
    let a = harness.add_peer_with("a", small);
    let b = harness.add_peer("b");

    harness.network.partition("a", "b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_state(&a, "b", PeerState::Negotiating, CONNECT)
        .await
        .unwrap();

    let first = a.coordinator.record_local_count(SESSION, 1).await.unwrap();
    a.coordinator.record_local_count(SESSION, 2).await.unwrap();
    a.coordinator.record_local_count(SESSION, 4).await.unwrap();

    assert_eq!(a.status_of("b").await.unwrap().pending_events, 2);
    assert_eq!(a.total().await, 7);

    let dropped = |e: &SessionEvent| {
        matches!(
            e,
            SessionEvent::Undeliverable { peer_id, event, reason, .. }
                if peer_id == "b" && event.event_id == first.event_id && reason == "outbox full"
        )
    };
    wait_for_event(&a, CONNECT, dropped).await.unwrap();
    assert_eq!(
        a.count_events(|e| matches!(e, SessionEvent::Undeliverable { .. })),
        1
    );

    // only the events still queued reach b
    harness.network.heal("a", "b");
    wait_for_total(&b, 6, Duration::from_secs(60)).await.unwrap();
    assert_eq!(b.store.applied_count(SESSION, &first.event_id), 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_overflowing_remote_event_is_reported_not_applied() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    // b already holds a total that a does not know about
    b.store
        .append_event(&CounterEvent::new(SESSION, "b", 10).with_event_id("offline"))
        .await
        .unwrap();

    let huge = CounterEvent::new(SESSION, "a", i64::MAX - 5).with_event_id("huge");
    a.coordinator.broadcast_counter_event(huge).await.unwrap();

    wait_for_event(&b, CONNECT, |e| {
        matches!(
            e,
            SessionEvent::Undeliverable { peer_id, event, reason, .. }
                if peer_id == "b" && event.event_id == "huge" && reason.starts_with("store")
        )
    })
    .await
    .unwrap();
    assert_eq!(b.total().await, 10);
    assert_eq!(b.store.applied_count(SESSION, "huge"), 0);

    // the session keeps working
    a.coordinator.record_local_count(SESSION, -20).await.unwrap();
    wait_for_total(&b, -10, CONNECT).await.unwrap();

    harness.shutdown().await;
}

// ============================================================================
// Liveness, reconnection and leave
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_liveness_failure_reconnects() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();
    let before = a.status_of("b").await.unwrap().generation;

    harness.network.partition("a", "b");
    wait_for_event(&a, Duration::from_secs(30), |e| {
        matches!(e, SessionEvent::Reconnecting { peer_id, attempt: 1, .. } if peer_id == "b")
    })
    .await
    .unwrap();
    assert!(a.states_of("b").contains(&PeerState::Failed));
    harness.network.heal("a", "b");

    let peer = &a;
    wait_until("a reconnects to b", Duration::from_secs(30), || async move {
        peer.status_of("b")
            .await
            .is_some_and(|s| s.state == PeerState::Connected && s.generation > before)
    })
    .await
    .unwrap();
    wait_for_state(&b, "a", PeerState::Connected, CONNECT)
        .await
        .unwrap();

    let status = a.status_of("b").await.unwrap();
    assert_eq!(status.attempts, 0);
    assert!(!status.retry_pending);
    assert_eq!(harness.network.links_established(), 2);
    assert_eq!(
        a.count_events(|e| matches!(e, SessionEvent::Reconnecting { .. })),
        1
    );

    a.coordinator.record_local_count(SESSION, 3).await.unwrap();
    wait_for_total(&b, 3, CONNECT).await.unwrap();

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_backoff_ends_closed() {
    let mut harness = SessionHarness::new();
    let mut config = test_config();
    config.reconnect.backoff_initial_ms = 5_000;
    let a = harness.add_peer_with("a", config.clone());
    let b = harness.add_peer_with("b", config);
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    harness.network.partition("a", "b");
    wait_for_event(&a, Duration::from_secs(30), |e| {
        matches!(e, SessionEvent::Reconnecting { peer_id, .. } if peer_id == "b")
    })
    .await
    .unwrap();
    assert!(a.status_of("b").await.unwrap().retry_pending);

    a.leave().await.unwrap();
    let offers = harness.relay.published_between("a", "b", "offer");

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(harness.relay.published_between("a", "b", "offer"), offers);
    assert_eq!(a.states_of("b").last(), Some(&PeerState::Closed));
    assert_eq!(harness.network.endpoints_between("a", "b"), 0);
    assert!(matches!(
        a.events().last(),
        Some(SessionEvent::SessionClosed { .. })
    ));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_sends_bye_and_remote_closes() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    a.leave().await.unwrap();

    assert_eq!(harness.relay.published_between("a", "b", "bye"), 1);
    assert_eq!(harness.relay.members(SESSION), vec!["b".to_string()]);

    let peer = &a;
    wait_until("a records the close", CONNECT, || async move {
        peer.states_of("b").last() == Some(&PeerState::Closed)
    })
    .await
    .unwrap();

    wait_for_state(&b, "a", PeerState::Closed, CONNECT)
        .await
        .unwrap();
    let network = &harness.network;
    wait_until("b released its transport", CONNECT, || async move {
        network.endpoints_between("b", "a") == 0
    })
    .await
    .unwrap();

    // a peer that left is not retried
    tokio::time::sleep(Duration::from_secs(60)).await;
    let status = b.status_of("a").await.unwrap();
    assert_eq!(status.state, PeerState::Closed);
    assert!(!status.retry_pending);
    assert!(!status.member);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_abandons_peer() {
    let mut harness = SessionHarness::new();
    let mut limited = test_config();
    limited.reconnect.max_retries = Some(2);
    let a = harness.add_peer_with("a", limited);
    let b = harness.add_peer("b");

    harness.network.partition("a", "b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_state(&a, "b", PeerState::Negotiating, CONNECT)
        .await
        .unwrap();
    let event = a.coordinator.record_local_count(SESSION, 1).await.unwrap();

    // three negotiation timeouts: two retries, then the budget is spent
    wait_for_event(&a, Duration::from_secs(120), |e| {
        matches!(
            e,
            SessionEvent::Undeliverable { peer_id, event: lost, reason, .. }
                if peer_id == "b" && lost.event_id == event.event_id && reason == "peer abandoned"
        )
    })
    .await
    .unwrap();
    assert_eq!(
        a.count_events(|e| matches!(e, SessionEvent::PeerAbandoned { peer_id, .. } if peer_id == "b")),
        1
    );

    for attempt in [1, 2] {
        assert_eq!(
            a.count_events(|e| matches!(
                e,
                SessionEvent::Reconnecting { peer_id, attempt: n, .. } if peer_id == "b" && *n == attempt
            )),
            1
        );
    }
    let status = a.status_of("b").await.unwrap();
    assert_eq!(status.state, PeerState::Failed);
    assert!(!status.retry_pending);
    assert_eq!(status.pending_events, 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_peer_expires_from_presence() {
    let mut harness = SessionHarness::new();
    let a = harness.add_peer("a");
    let b = harness.add_peer("b");
    a.join().await.unwrap();
    b.join().await.unwrap();
    harness.wait_for_mesh(CONNECT).await.unwrap();

    // no leave: no BYE, no withdraw
    harness.crash("b");
    drop(b);

    wait_for_event(&a, Duration::from_secs(30), |e| {
        matches!(e, SessionEvent::Reconnecting { peer_id, .. } if peer_id == "b")
    })
    .await
    .unwrap();
    let event = a.coordinator.record_local_count(SESSION, 1).await.unwrap();

    let peer = &a;
    wait_until("a gives up on the silent member", Duration::from_secs(60), || async move {
        peer.status_of("b")
            .await
            .is_some_and(|s| s.state == PeerState::Closed && !s.member)
    })
    .await
    .unwrap();

    wait_for_event(&a, CONNECT, |e| {
        matches!(
            e,
            SessionEvent::Undeliverable { peer_id, event: lost, reason, .. }
                if peer_id == "b" && lost.event_id == event.event_id && reason == "peer left"
        )
    })
    .await
    .unwrap();
    // the member record itself is left behind by the crash
    assert_eq!(
        harness.relay.members(SESSION),
        vec!["a".to_string(), "b".to_string()]
    );

    // no more reconnection attempts towards a dead peer
    let reconnects = a.count_events(|e| matches!(e, SessionEvent::Reconnecting { .. }));
    let offers = harness.relay.published_between("a", "b", "offer");
    tokio::time::sleep(Duration::from_secs(600)).await;

    let status = a.status_of("b").await.unwrap();
    assert_eq!(status.state, PeerState::Closed);
    assert!(!status.retry_pending);
    assert_eq!(
        a.count_events(|e| matches!(e, SessionEvent::Reconnecting { .. })),
        reconnects
    );
    assert_eq!(harness.relay.published_between("a", "b", "offer"), offers);

    harness.shutdown().await;
}
