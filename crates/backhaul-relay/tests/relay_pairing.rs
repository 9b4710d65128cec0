//! Relay pairing semantics, driven with raw sockets
//!
//! These tests play both roles themselves: sockets dialed at the relay
//! listener stand in for agents, sockets dialed at the public listener stand
//! in for clients. Whatever one side writes must come out of its paired
//! counterpart unchanged.

use backhaul_relay::{ListenerConfig, Relay, RelayConfig, ShutdownHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct TestRelay {
    public_addr: SocketAddr,
    relay_addr: SocketAddr,
    shutdown: ShutdownHandle,
    handle: JoinHandle<()>,
}

async fn start_relay(secret: Option<&str>) -> TestRelay {
    let mut config = RelayConfig::new(
        ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
        ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
    );
    if let Some(secret) = secret {
        config = config.with_secret(secret);
    }

    let relay = Relay::bind(config).await.unwrap();
    let public_addr = relay.public_addr().unwrap();
    let relay_addr = relay.relay_addr().unwrap();
    let shutdown = relay.shutdown_handle();
    let handle = tokio::spawn(async move {
        relay.run().await.unwrap();
    });

    TestRelay {
        public_addr,
        relay_addr,
        shutdown,
        handle,
    }
}

impl TestRelay {
    async fn stop(self) {
        self.shutdown.shutdown();
        let _ = timeout(WAIT, self.handle).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_then_client_pairs_and_pumps_both_ways() {
    let relay = start_relay(None).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    // The agent echoes back through the same tunnel.
    agent.write_all(b"hello").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"hello");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn client_bytes_are_buffered_until_an_agent_arrives() {
    let relay = start_relay(None).await;

    // No agent yet: the client's bytes wait in the pending buffer.
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    let mut buf = [0u8; 3];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"abc");

    // Bytes written after pairing arrive after the buffered prefix.
    client.write_all(b"def").await.unwrap();
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"def");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn correct_secret_admits_agent_and_is_stripped() {
    let relay = start_relay(Some("s3cret")).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    agent.write_all(b"s3cret").await.unwrap();

    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut buf = [0u8; 5];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    // The secret never reaches the tunnel payload.
    assert_eq!(&buf, b"hello");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn secret_overshoot_is_delivered_as_payload() {
    let relay = start_relay(Some("s3cret")).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    agent.write_all(b"s3cretpong").await.unwrap();

    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_secret_closes_the_connection_before_pairing() {
    let relay = start_relay(Some("s3cret")).await;

    let mut impostor = TcpStream::connect(relay.relay_addr).await.unwrap();
    impostor.write_all(b"WRONG!").await.unwrap();

    let mut buf = [0u8; 1];
    let n = timeout(WAIT, impostor.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "impostor should be disconnected");

    // The pool is untouched: a real agent still pairs first-come.
    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    agent.write_all(b"s3cret").await.unwrap();
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ok");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pairing_is_fifo_in_arrival_order() {
    let relay = start_relay(None).await;

    let mut agent_one = TcpStream::connect(relay.relay_addr).await.unwrap();
    // Make sure the first agent is parked before the second arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut agent_two = TcpStream::connect(relay.relay_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client_one = TcpStream::connect(relay.public_addr).await.unwrap();
    client_one.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(WAIT, agent_one.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"one");

    let mut client_two = TcpStream::connect(relay.public_addr).await.unwrap();
    client_two.write_all(b"two").await.unwrap();
    timeout(WAIT, agent_two.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"two");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_close_tears_down_the_paired_counterpart() {
    let relay = start_relay(None).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();

    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();

    drop(agent);
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "client should observe the tunnel collapse");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_that_closes_while_parked_is_skipped() {
    let relay = start_relay(None).await;

    let dead_agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(dead_agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut live_agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(WAIT, live_agent.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");

    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_timeout_destroys_pending_public_pipes() {
    let config = RelayConfig::new(
        ListenerConfig::plain("127.0.0.1:0".parse().unwrap())
            .with_idle_timeout(Some(Duration::from_millis(100))),
        ListenerConfig::plain("127.0.0.1:0".parse().unwrap()),
    );

    let relay = Relay::bind(config).await.unwrap();
    let public_addr = relay.public_addr().unwrap();
    let shutdown = relay.shutdown_handle();
    let handle = tokio::spawn(async move {
        relay.run().await.unwrap();
    });

    let mut client = TcpStream::connect(public_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "idle pending pipe should be destroyed");

    shutdown.shutdown();
    let _ = timeout(WAIT, handle).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_unbinds_listeners_and_destroys_pipes() {
    let relay = start_relay(None).await;

    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(WAIT, agent.read_exact(&mut buf)).await.unwrap().unwrap();

    let public_addr = relay.public_addr;
    relay.stop().await;

    // Active tunnels are gone.
    let n = timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    let n = timeout(WAIT, agent.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    // And the port is released.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(public_addr).await.is_err());
}
