mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use beach_call::protocol::{EndpointId, Envelope, SessionDescription, SignalingMessage};
use beach_call::session::CallOutcome;
use beach_call::signaling::SignalingChannel;
use beach_call::transport::websocket::WebSocketMailbox;
use beach_call::transport::{ConnectionState, MailboxTransport, ReconnectPolicy};
use beach_call::{CallNotice, CallPhase, CallSettings};
use beach_mailbox::MailboxState;

use support::{id, init_tracing, party_over};

async fn start_relay() -> (SocketAddr, MailboxState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = MailboxState::new(64);
    let serving = state.clone();
    tokio::spawn(async move {
        beach_mailbox::serve(listener, serving).await.unwrap();
    });
    (addr, state)
}

async fn mailbox(addr: SocketAddr, endpoint: &EndpointId) -> Arc<WebSocketMailbox> {
    WebSocketMailbox::connect(
        &format!("ws://{addr}"),
        endpoint.clone(),
        ReconnectPolicy {
            delay: Duration::from_millis(50),
        },
    )
    .await
    .expect("relay reachable")
}

#[test_timeout::tokio_timeout_test]
async fn signals_cross_the_relay() {
    init_tracing();
    let (addr, _state) = start_relay().await;
    let alice = SignalingChannel::new(mailbox(addr, &id("alice")).await, ReconnectPolicy::default());
    let bob = SignalingChannel::new(mailbox(addr, &id("bob")).await, ReconnectPolicy::default());
    assert_eq!(
        *alice.transport().state().borrow(),
        ConnectionState::Connected
    );

    let mut offers = bob.subscribe_offers();
    alice
        .send_offer(&id("bob"), SessionDescription::offer("v=0 relay"))
        .await
        .unwrap();

    let signal = offers.recv().await.unwrap();
    assert_eq!(signal.from, id("alice"));
    assert_eq!(signal.payload.sdp, "v=0 relay");
}

#[test_timeout::tokio_timeout_test]
async fn offer_waits_at_the_relay_for_an_offline_callee() {
    init_tracing();
    let (addr, state) = start_relay().await;
    let mut alice = party_over(mailbox(addr, &id("alice")).await, CallSettings::default(), true);

    alice.controller.call(id("bob")).await.unwrap();
    while state.held_for("bob") == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut bob = party_over(mailbox(addr, &id("bob")).await, CallSettings::default(), true);
    let incoming = bob.next_notice().await;
    assert_eq!(incoming, CallNotice::Incoming { peer: id("alice") });

    bob.controller.accept_call().await.unwrap();
    for side in [&alice, &bob] {
        side.observer
            .wait_for(|snapshot| snapshot.phase == CallPhase::InCall && snapshot.media_connected)
            .await
            .unwrap();
    }

    bob.controller.end_call().await.unwrap();
    let ended = alice
        .notice_matching(|notice| matches!(notice, CallNotice::Ended { .. }))
        .await;
    assert_eq!(
        ended,
        CallNotice::Ended {
            peer: id("bob"),
            outcome: CallOutcome::RemoteEnded
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn closed_socket_mailbox_refuses_traffic() {
    init_tracing();
    let (addr, _state) = start_relay().await;
    let alice = mailbox(addr, &id("alice")).await;
    alice.close().await;

    assert_eq!(*alice.state().borrow(), ConnectionState::Closed);
    assert!(alice.recv().await.is_err());
    let channel = SignalingChannel::new(alice, ReconnectPolicy::default());
    assert!(channel.send_end_call(&id("bob")).await.is_err());
}

#[test_timeout::tokio_timeout_test]
async fn lost_socket_reconnects_and_keeps_receiving() {
    init_tracing();
    let (addr, _state) = start_relay().await;
    let alice = mailbox(addr, &id("alice")).await;
    let bob = mailbox(addr, &id("bob")).await;
    let mut state = alice.state();

    // A second socket for the same endpoint makes the relay drop the first.
    let (mut intruder, _) = connect_async(format!("ws://{addr}/mailbox/alice"))
        .await
        .unwrap();
    state
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();
    state
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();
    // The reconnected mailbox in turn replaces the intruder.
    loop {
        match intruder.next().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    let wire = Envelope::new(id("bob"), &id("alice"), SignalingMessage::EndCall)
        .into_wire()
        .unwrap();
    bob.send(wire).await.unwrap();
    let received = alice.recv().await.unwrap();
    assert_eq!(received.kind, "end-call");
    assert_eq!(received.from, "bob");
}
