use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::time::{timeout, Instant};
use tracing::Level;

use dcsession::codec::envelope::MessageId;
use dcsession::codec::service_messages::{PongData, ResendRequest, RpcErrorData, RpcResultBody, RpcResultData, ServiceMessage};
use dcsession::config::EngineConfig;
use dcsession::datacenter::address::{DatacenterAddress, DatacenterAddressSet, DatacenterId};
use dcsession::datacenter::discovery::StaticAddressDiscovery;
use dcsession::engine::Engine;
use dcsession::error::RpcFailure;
use dcsession::session::driver::{spawn_session, SessionEvent};
use dcsession::session::message_id::WallClock;
use dcsession::test_util::environment::TestEnvironment;
use dcsession::test_util::transport::{ReceivedMessage, ServerConnection};

const DC: DatacenterId = DatacenterId(2);

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn addresses(hosts: &[&str]) -> DatacenterAddressSet {
    DatacenterAddressSet::new(hosts.iter().map(|h| DatacenterAddress::new(*h, 443)).collect())
}

fn single_dc(hosts: &[&str]) -> FxHashMap<DatacenterId, DatacenterAddressSet> {
    let mut result = FxHashMap::default();
    result.insert(DC, addresses(hosts));
    result
}

async fn engine_for(config: EngineConfig) -> (TestEnvironment, Arc<Engine>) {
    let env = TestEnvironment::new(config, &[DC]).await.unwrap();
    let engine = Engine::new(env.context.clone(), DC).unwrap();
    (env, Arc::new(engine))
}

fn spawn_call(engine: &Arc<Engine>, body: &'static [u8]) -> tokio::task::JoinHandle<Result<Bytes, RpcFailure>> {
    let engine = engine.clone();
    tokio::spawn(async move { engine.invoke(Bytes::from_static(body)).await })
}

async fn recv_payload(server: &mut ServerConnection, body: &[u8]) -> ReceivedMessage {
    timeout(Duration::from_secs(120), server.recv_matching(|m| matches!(m, ServiceMessage::Payload(data) if data.as_ref() == body)))
        .await
        .unwrap()
        .unwrap()
}

fn data_result(request_message_id: MessageId, data: &'static [u8]) -> ServiceMessage {
    ServiceMessage::RpcResult(RpcResultData { request_message_id, result: RpcResultBody::Data(Bytes::from_static(data)) })
}

fn answer_pings(mut server: ServerConnection) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ping) = server.recv_matching(|m| matches!(m, ServiceMessage::Ping { .. })).await {
            if let ServiceMessage::Ping { ping_id } = ping.message {
                let pong = ServiceMessage::Pong(PongData { message_id: ping.envelope.message_id, ping_id });
                if server.send(ping.session_id, pong).await.is_err() {
                    break;
                }
            }
        }
    })
}

#[tokio::test(start_paused = true)]
async fn resend_request_retransmits_only_the_requested_message() {
    let (mut env, engine) = engine_for(EngineConfig::new()).await;
    let first = spawn_call(&engine, b"get1");
    let mut server = env.accept().await.unwrap();
    let original = recv_payload(&mut server, b"get1").await;

    let second = spawn_call(&engine, b"get2");
    let other = recv_payload(&mut server, b"get2").await;
    assert!(other.envelope.message_id > original.envelope.message_id);

    server.send(original.session_id, ServiceMessage::MsgResendReq(ResendRequest { message_ids: vec![original.envelope.message_id] })).await.unwrap();
    let resent = server.recv_matching(|m| matches!(m, ServiceMessage::Payload(_))).await.unwrap();
    assert_eq!(resent.envelope, original.envelope);

    server.send(original.session_id, data_result(original.envelope.message_id, b"res1")).await.unwrap();
    server.send(original.session_id, data_result(other.envelope.message_id, b"res2")).await.unwrap();
    assert_eq!(first.await.unwrap(), Ok(Bytes::from_static(b"res1")));
    assert_eq!(second.await.unwrap(), Ok(Bytes::from_static(b"res2")));

    let further = timeout(Duration::from_secs(10), server.recv_matching(|m| matches!(m, ServiceMessage::Payload(_)))).await;
    assert!(further.is_err(), "nothing but the requested message may be retransmitted");
}

#[tokio::test(start_paused = true)]
async fn flood_wait_is_retried_and_late_reply_is_discarded() {
    let mut config = EngineConfig::new();
    config.ping_interval = Duration::from_secs(600);
    let (mut env, engine) = engine_for(config).await;
    let call = spawn_call(&engine, b"get1");
    let mut server = env.accept().await.unwrap();
    let request = recv_payload(&mut server, b"get1").await;
    let session_id = request.session_id;
    let first_id = request.envelope.message_id;

    let error_at = Instant::now();
    server.send(session_id, ServiceMessage::RpcResult(RpcResultData {
        request_message_id: first_id,
        result: RpcResultBody::Error(RpcErrorData { error_code: 420, description: "FLOOD_WAIT_30".to_string() }),
    })).await.unwrap();

    // a late reply to the original request while the retry is still waiting
    server.send(session_id, data_result(first_id, b"old!")).await.unwrap();

    let retry = recv_payload(&mut server, b"get1").await;
    assert!(Instant::now() - error_at >= Duration::from_secs(30));
    assert!(retry.envelope.message_id > first_id);
    assert!(!call.is_finished());

    server.send(session_id, data_result(retry.envelope.message_id, b"res1")).await.unwrap();
    assert_eq!(call.await.unwrap(), Ok(Bytes::from_static(b"res1")));
}

#[tokio::test(start_paused = true)]
async fn failed_addresses_are_replaced_by_discovered_ones() {
    let discovery = StaticAddressDiscovery::new({
        let mut discovered = FxHashMap::default();
        discovered.insert(DC, addresses(&["10.0.1.1", "10.0.1.2", "10.0.0.3"]));
        discovered
    });
    let mut env = TestEnvironment::with_addresses(
        EngineConfig::new(),
        single_dc(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
        Arc::new(discovery),
    ).await.unwrap();
    for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        env.connector.set_reachable(host, false);
    }

    let session = spawn_session(env.context.clone(), DC);
    let call = {
        let session = session.clone();
        tokio::spawn(async move { session.invoke(Bytes::from_static(b"get1")).await })
    };

    // both discovered addresses are reachable, the earlier one wins
    let mut servers = vec![env.accept().await.unwrap(), env.accept().await.unwrap()];
    servers.sort_by_key(|s| s.candidate.index);
    let mut winner = servers.remove(0);
    assert_eq!(winner.candidate.address.host, "10.0.1.1");

    let mut attempts = env.connector.attempted_hosts();
    assert_eq!(attempts.len(), 5);
    let mut discovered_attempts = attempts.split_off(3);
    attempts.sort();
    discovered_attempts.sort();
    assert_eq!(attempts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    assert_eq!(discovered_attempts, vec!["10.0.1.1", "10.0.1.2"]);

    let request = recv_payload(&mut winner, b"get1").await;
    winner.send(request.session_id, data_result(request.envelope.message_id, b"res1")).await.unwrap();
    assert!(call.await.unwrap().is_ok());

    let persisted = env.context.resolver.address_set(DC).await;
    assert_eq!(persisted.first().map(|a| a.host.as_str()), Some("10.0.1.1"));
    assert_eq!(persisted.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn race_tie_break_prefers_address_order() {
    let mut env = TestEnvironment::with_addresses(
        EngineConfig::new(),
        single_dc(&["10.0.0.1", "10.0.0.2"]),
        Arc::new(StaticAddressDiscovery::new(Default::default())),
    ).await.unwrap();
    let engine = Arc::new(Engine::new(env.context.clone(), DC).unwrap());
    let call = spawn_call(&engine, b"get1");

    // both candidates connect instantly; the loser's connection is dropped by the client
    let mut servers = vec![env.accept().await.unwrap(), env.accept().await.unwrap()];
    servers.sort_by_key(|s| s.candidate.index);
    let mut loser = servers.pop().unwrap();
    let mut winner = servers.pop().unwrap();
    assert_eq!(winner.candidate.address.host, "10.0.0.1");

    let request = recv_payload(&mut winner, b"get1").await;
    winner.send(request.session_id, data_result(request.envelope.message_id, b"res1")).await.unwrap();
    assert!(call.await.unwrap().is_ok());
    assert!(loser.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn unanswered_ping_reconnects_exactly_once() {
    let (mut env, engine) = engine_for(EngineConfig::new()).await;
    let mut events = engine.subscribe(DC).await.unwrap();
    let mut first = env.accept().await.unwrap();
    let connected_at = Instant::now();

    let ping = first.recv_matching(|m| matches!(m, ServiceMessage::Ping { .. })).await.unwrap();
    assert!(Instant::now() - connected_at >= Duration::from_secs(15));
    drop(ping);

    let second = timeout(Duration::from_secs(60), env.accept()).await.unwrap().unwrap();
    assert!(Instant::now() - connected_at >= Duration::from_secs(25));
    assert!(first.recv_matching(|_| false).await.is_none(), "the timed out connection is closed");
    let responder = answer_pings(second);

    assert!(timeout(Duration::from_secs(300), env.accept()).await.is_err(), "answered pings must not cause reconnects");

    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Disconnected {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn clock_skew_resets_session_and_fails_pending_calls() {
    let (mut env, engine) = engine_for(EngineConfig::new()).await;
    let mut events = engine.subscribe(DC).await.unwrap();
    let pending = spawn_call(&engine, b"get1");
    let mut server = env.accept().await.unwrap();
    let request = recv_payload(&mut server, b"get1").await;

    server.send(request.session_id, ServiceMessage::Payload(Bytes::from_static(b"upd1"))).await.unwrap();
    let future_seconds = env.clock.unix_time().as_secs() as i64 + 120;
    server.send_with_id(request.session_id, MessageId((future_seconds << 32) | 1), ServiceMessage::Payload(Bytes::from_static(b"upd2"))).await.unwrap();

    assert_eq!(pending.await.unwrap(), Err(RpcFailure::SessionReset));
    loop {
        let event = timeout(Duration::from_secs(60), events.recv()).await.unwrap().unwrap();
        assert_ne!(event, SessionEvent::Update(Bytes::from_static(b"upd2")));
        if event == SessionEvent::Reset {
            break;
        }
    }

    let resubmitted = spawn_call(&engine, b"get1");
    let mut server = env.accept().await.unwrap();
    let request_again = recv_payload(&mut server, b"get1").await;
    assert_ne!(request_again.session_id, request.session_id);
    server.send(request_again.session_id, data_result(request_again.envelope.message_id, b"res1")).await.unwrap();
    assert_eq!(resubmitted.await.unwrap(), Ok(Bytes::from_static(b"res1")));
}
