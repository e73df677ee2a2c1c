//! End-to-end relay behavior over real WebSockets.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use switchboard_sdk::Identity;
use switchboard_sdk::sps::{ClientIntro, SpsPacket};
use switchboard_server::config::ServerConfig;
use switchboard_server::server::Server;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(cfg: ServerConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(cfg);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Ws {
    tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap()
        .0
}

fn intro(identity: &Identity) -> ClientIntro {
    ClientIntro {
        id: identity.full_id().to_string(),
        pub_key: identity.public_key_bytes().to_vec(),
        signature: identity.self_witness().to_bytes().to_vec(),
        hosting: false,
        swarm_channel: None,
        host_target: None,
        pass_code: None,
    }
}

async fn send_json<T: serde::Serialize>(ws: &mut Ws, value: &T) {
    ws.send(Message::Text(serde_json::to_string(value).unwrap().into()))
        .await
        .unwrap();
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return text.to_string();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn swarm_members_learn_of_joiners_and_relay_messages() {
    let addr = start_server(ServerConfig::default()).await;
    let alice = Identity::generate();
    let bob = Identity::generate();

    let mut ws_a = connect(addr).await;
    let mut a_intro = intro(&alice);
    a_intro.swarm_channel = Some("room".into());
    send_json(&mut ws_a, &a_intro).await;

    // Give the server a beat to register Alice before Bob joins.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ws_b = connect(addr).await;
    let mut b_intro = intro(&bob);
    b_intro.swarm_channel = Some("room".into());
    send_json(&mut ws_b, &b_intro).await;

    // Alice, the existing member, hears about Bob.
    let joined: SpsPacket = serde_json::from_str(&next_text(&mut ws_a).await).unwrap();
    let SpsPacket::Join { data } = joined else {
        panic!("expected JOIN");
    };
    assert_eq!(data.id, bob.full_id());

    // Bob relays a message to Alice by her ShortID, lying about `from`.
    send_json(
        &mut ws_b,
        &SpsPacket::Msg {
            from: "f".repeat(40),
            target_client: Some(alice.short_id().to_string()),
            data: serde_json::json!({"hello": "alice"}),
        },
    )
    .await;

    let relayed: SpsPacket = serde_json::from_str(&next_text(&mut ws_a).await).unwrap();
    let SpsPacket::Msg { from, data, .. } = relayed else {
        panic!("expected MSG");
    };
    // The relay stamps the authenticated sender, not the claimed one.
    assert_eq!(from, bob.full_id());
    assert_eq!(data["hello"], "alice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_targets_are_dropped_silently() {
    let addr = start_server(ServerConfig::default()).await;
    let alice = Identity::generate();

    let mut ws = connect(addr).await;
    send_json(&mut ws, &intro(&alice)).await;

    send_json(
        &mut ws,
        &SpsPacket::Msg {
            from: alice.full_id().to_string(),
            target_client: Some("0".repeat(40)),
            data: serde_json::json!({"into": "the void"}),
        },
    )
    .await;

    // The connection survives; keepalive still round-trips.
    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_credentials_get_dc() {
    let addr = start_server(ServerConfig {
        pass: Some("sesame".into()),
        ..ServerConfig::default()
    })
    .await;
    let alice = Identity::generate();

    // Missing passcode.
    let mut ws = connect(addr).await;
    send_json(&mut ws, &intro(&alice)).await;
    assert_eq!(next_text(&mut ws).await, "dc");

    // Forged witness.
    let mallory = Identity::generate();
    let mut ws = connect(addr).await;
    let mut forged = intro(&alice);
    forged.pass_code = Some("sesame".into());
    forged.signature = mallory.self_witness().to_bytes().to_vec();
    send_json(&mut ws, &forged).await;
    assert_eq!(next_text(&mut ws).await, "dc");

    // Id that is not the SHA-1 of the key.
    let mut ws = connect(addr).await;
    let mut wrong_id = intro(&alice);
    wrong_id.pass_code = Some("sesame".into());
    wrong_id.id = mallory.full_id().to_string();
    send_json(&mut ws, &wrong_id).await;
    assert_eq!(next_text(&mut ws).await, "dc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joiner_finds_present_host() {
    let addr = start_server(ServerConfig::default()).await;
    let host = Identity::generate();
    let joiner = Identity::generate();

    let mut ws_host = connect(addr).await;
    let mut host_intro = intro(&host);
    host_intro.hosting = true;
    send_json(&mut ws_host, &host_intro).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    // The joiner only knows the host's ShortID.
    let mut ws_join = connect(addr).await;
    let mut join_intro = intro(&joiner);
    join_intro.host_target = Some(host.short_id().to_string());
    send_json(&mut ws_join, &join_intro).await;

    let packet: SpsPacket = serde_json::from_str(&next_text(&mut ws_join).await).unwrap();
    let SpsPacket::Join { data } = packet else {
        panic!("expected JOIN");
    };
    assert_eq!(data.id, host.full_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_joiner_is_woken_when_host_arrives() {
    let addr = start_server(ServerConfig::default()).await;
    let host = Identity::generate();
    let joiner = Identity::generate();

    // Joiner first: nothing to be told yet.
    let mut ws_join = connect(addr).await;
    let mut join_intro = intro(&joiner);
    join_intro.host_target = Some(host.full_id().to_string());
    send_json(&mut ws_join, &join_intro).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ws_host = connect(addr).await;
    let mut host_intro = intro(&host);
    host_intro.hosting = true;
    send_json(&mut ws_host, &host_intro).await;

    let packet: SpsPacket = serde_json::from_str(&next_text(&mut ws_join).await).unwrap();
    let SpsPacket::Join { data } = packet else {
        panic!("expected JOIN");
    };
    assert_eq!(data.id, host.full_id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_clients_are_terminated_after_two_pings() {
    let addr = start_server(ServerConfig {
        ping_freq: 1,
        ..ServerConfig::default()
    })
    .await;
    let alice = Identity::generate();

    let mut ws = connect(addr).await;
    send_json(&mut ws, &intro(&alice)).await;

    // Answer nothing; after two missed rounds the server hangs up.
    let died = tokio::time::timeout(Duration::from_secs(6), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) if text == "ping" => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(died.is_ok(), "server never dropped the silent client");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responsive_clients_are_kept() {
    let addr = start_server(ServerConfig {
        ping_freq: 1,
        ..ServerConfig::default()
    })
    .await;
    let alice = Identity::generate();

    let mut ws = connect(addr).await;
    send_json(&mut ws, &intro(&alice)).await;

    // Answer pings for a few rounds, then confirm we are still admitted.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) if text == "ping" => {
                ws.send(Message::Text("pong".into())).await.unwrap();
            }
            Ok(Some(Ok(_))) => {}
            Ok(_) => panic!("server dropped a responsive client"),
            Err(_) => {}
        }
    }

    ws.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "pong");
}
