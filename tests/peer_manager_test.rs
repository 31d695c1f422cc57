mod common;

use common::{host_candidate, FakeNetwork};
use labpulse_lib::errors::{DropReason, Outcome};
use labpulse_lib::peer::{
    CloseReason, LinkState, LinkUpdate, MediaTransport, PeerManager, Role, SessionDescription, TransportState,
};
use std::time::Duration;

fn offer() -> SessionDescription {
    SessionDescription::offer("v=0 fake s1 -> fac stream=screen-1")
}

#[tokio::test]
async fn second_offer_on_negotiating_link_is_ignored() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();

    let first = peers.create_answer("s1", offer()).await.unwrap();
    assert!(first.is_applied());
    assert_eq!(peers.get("s1").unwrap().state(), LinkState::Negotiating);

    let second = peers.create_answer("s1", offer()).await.unwrap();
    assert_eq!(second.dropped(), Some(DropReason::NegotiationConflict));
    assert_eq!(peers.len(), 1);
}

#[tokio::test]
async fn offer_outside_stable_signaling_is_ignored() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();

    // транспорт уже сам начал согласование
    let transport = network.transport("fac", "s1").unwrap();
    transport.create_offer().await.unwrap();

    let outcome = peers.create_answer("s1", offer()).await.unwrap();
    assert_eq!(outcome.dropped(), Some(DropReason::NegotiationConflict));
    assert_eq!(peers.get("s1").unwrap().state(), LinkState::New);
}

#[tokio::test]
async fn answer_without_link_is_orphan() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("s1"), None);

    let outcome = peers
        .apply_answer("fac", SessionDescription::answer("v=0"))
        .await
        .unwrap();
    assert_eq!(outcome.dropped(), Some(DropReason::OrphanSignal));
    assert_eq!(
        peers.add_ice_candidate("fac", host_candidate("fac")).await,
        Outcome::Dropped(DropReason::OrphanSignal)
    );
}

#[tokio::test]
async fn replacing_a_link_ignores_events_of_the_old_one() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);

    let old_generation = peers.create("s1", Role::Receiver).await.unwrap();
    let old = network.transport("fac", "s1").unwrap();
    let new_generation = peers.create("s1", Role::Receiver).await.unwrap();

    assert!(new_generation > old_generation);
    assert!(old.is_closed());
    assert_eq!(peers.len(), 1);

    old.report(TransportState::Connected);
    while let Some(event) = peers.try_next_event() {
        assert!(peers.handle_event(event).await.is_none());
    }
    let link = peers.get("s1").unwrap();
    assert_eq!(link.generation(), new_generation);
    assert_eq!(link.state(), LinkState::New);
}

#[tokio::test]
async fn early_candidates_wait_for_remote_description() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();
    let transport = network.transport("fac", "s1").unwrap();

    let outcome = peers.add_ice_candidate("s1", host_candidate("s1")).await;
    assert!(outcome.is_applied());
    assert_eq!(peers.get("s1").unwrap().pending_candidates(), 1);
    assert_eq!(transport.received_candidates(), 0);

    peers.create_answer("s1", offer()).await.unwrap();
    assert_eq!(peers.get("s1").unwrap().pending_candidates(), 0);
    assert_eq!(transport.received_candidates(), 1);

    // после remote description кандидат идёт сразу
    peers.add_ice_candidate("s1", host_candidate("s1")).await;
    assert_eq!(transport.received_candidates(), 2);
}

#[tokio::test]
async fn local_candidates_are_handed_out_and_recorded() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();
    peers.create_answer("s1", offer()).await.unwrap();

    let mut candidates = 0;
    while let Some(event) = peers.try_next_event() {
        if let Some(LinkUpdate::LocalCandidate { peer_id, candidate }) = peers.handle_event(event).await {
            assert_eq!(peer_id, "s1");
            assert!(candidate.candidate.contains("typ host"));
            candidates += 1;
        }
    }
    assert_eq!(candidates, 1);
    assert_eq!(peers.get("s1").unwrap().local_candidates().len(), 1);
}

#[tokio::test]
async fn transport_failure_closes_the_link() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();
    network.transport("fac", "s1").unwrap().report(TransportState::Failed);

    let mut closed = None;
    while let Some(event) = peers.try_next_event() {
        if let Some(LinkUpdate::Closed(c)) = peers.handle_event(event).await {
            closed = Some(c);
        }
    }
    let closed = closed.expect("link closed");
    assert_eq!(closed.reason, CloseReason::TransportFailed);
    assert!(peers.is_empty());
}

#[tokio::test]
async fn disconnect_is_only_a_problem() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), None);
    peers.create("s1", Role::Receiver).await.unwrap();
    network
        .transport("fac", "s1")
        .unwrap()
        .report(TransportState::Disconnected);

    let event = peers.try_next_event().unwrap();
    assert!(matches!(
        peers.handle_event(event).await,
        Some(LinkUpdate::Problem { .. })
    ));
    assert!(peers.contains("s1"));
}

#[tokio::test(start_paused = true)]
async fn unconnected_link_times_out() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), Some(Duration::from_secs(5)));
    let mut events = peers.take_events().unwrap();
    peers.create("s1", Role::Receiver).await.unwrap();

    let closed = loop {
        let event = events.recv().await.unwrap();
        if let Some(LinkUpdate::Closed(closed)) = peers.handle_event(event).await {
            break closed;
        }
    };
    assert_eq!(closed.peer_id, "s1");
    assert_eq!(closed.reason, CloseReason::TimedOut);
    assert!(peers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn connected_link_disarms_the_deadline() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("fac"), Some(Duration::from_secs(5)));
    let mut events = peers.take_events().unwrap();
    peers.create("s1", Role::Receiver).await.unwrap();
    network.transport("fac", "s1").unwrap().report(TransportState::Connected);

    let event = events.recv().await.unwrap();
    assert!(matches!(
        peers.handle_event(event).await,
        Some(LinkUpdate::Connected { .. })
    ));

    let late = tokio::time::timeout(Duration::from_secs(30), events.recv()).await;
    assert!(late.is_err(), "deadline fired after connect");
    assert_eq!(peers.get("s1").unwrap().state(), LinkState::Connected);
}

#[tokio::test]
async fn summaries_are_sorted_by_peer() {
    let network = FakeNetwork::new();
    let mut peers = PeerManager::new(network.factory("s1"), None);
    for viewer in ["fac-b", "fac-a", "fac-c"] {
        peers.create(viewer, Role::Sender).await.unwrap();
    }

    let ids: Vec<String> = peers.summaries().into_iter().map(|s| s.peer_id).collect();
    assert_eq!(ids, vec!["fac-a", "fac-b", "fac-c"]);

    let closed = peers.close_all().await;
    assert_eq!(closed.len(), 3);
    assert!(closed.iter().all(|c| c.reason == CloseReason::Requested));
    assert!(peers.is_empty());
}
