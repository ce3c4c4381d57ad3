//! Client agent tests against a minimal in-test server

use burrow_client::{ClientConfig, ClientError, TunnelClient};
use burrow_proto::{HandshakeError, RequestHeader, ResponseHeader, ServerHandshake, ServerInfo};
use burrow_transport::{Multiplexer, Session};
use burrow_transport_h2::{H2Multiplexer, H2Session};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept one client, handshake, and hand back the server side of the session
async fn fake_server(token: &str) -> (SocketAddr, JoinHandle<Option<H2Session>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handshake = ServerHandshake::new(token)
        .with_callback(Arc::new(ServerInfo::new("test")))
        .with_callback(Arc::new(
            |req: &RequestHeader, resp: &mut ResponseHeader| -> anyhow::Result<()> {
                resp.values
                    .insert("echo_name".to_string(), serde_json::json!(req.name.clone()));
                Ok(())
            },
        ));

    let task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.ok()?;
        handshake
            .accept(&mut socket, |requested: String| async move {
                Ok(((), format!("fake-bound{}", requested)))
            })
            .await
            .ok()?;
        H2Multiplexer::default().accept_session(socket).await.ok()
    });

    (addr, task)
}

/// Target that answers PING with PONG on every connection
async fn pong_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() && &buf == b"PING" {
                    let _ = conn.write_all(b"PONG").await;
                }
            });
        }
    });
    addr
}

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_connect_reports_handshake_results() {
    let (server_addr, server) = fake_server("T1").await;

    let config =
        ClientConfig::new(server_addr.to_string(), "T1", free_addr()).with_shadow_addr(":0");
    let client = TunnelClient::connect(config).await.unwrap();

    assert!(client.name().starts_with("burrow-"));
    assert_eq!(client.shadow_addr(), "fake-bound:0");
    assert_eq!(client.values()["server_version"], serde_json::json!("test"));
    assert_eq!(client.values()["echo_name"], serde_json::json!(client.name()));

    let session = server.await.unwrap().expect("server session");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_run_forwards_streams_to_target() {
    let (server_addr, server) = fake_server("T1").await;
    let target = pong_target().await;

    let config = ClientConfig::new(server_addr.to_string(), "T1", target.to_string())
        .with_name("pinger");
    let client = Arc::new(TunnelClient::connect(config).await.unwrap());
    assert_eq!(client.name(), "pinger");

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let session = server.await.unwrap().expect("server session");
    for _ in 0..3 {
        let mut stream = session.open_stream().await.unwrap();
        stream.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(TEST_TIMEOUT, stream.read_exact(&mut buf))
            .await
            .expect("no reply through tunnel")
            .unwrap();
        assert_eq!(&buf, b"PONG");
    }

    client.close().await.unwrap();
    let result = timeout(TEST_TIMEOUT, runner).await.expect("run did not return");
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn test_unreachable_target_drops_only_that_stream() {
    let (server_addr, server) = fake_server("T1").await;

    let config = ClientConfig::new(server_addr.to_string(), "T1", free_addr());
    let client = Arc::new(TunnelClient::connect(config).await.unwrap());
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let session = server.await.unwrap().expect("server session");
    for _ in 0..2 {
        let mut stream = session.open_stream().await.unwrap();
        let mut buf = Vec::new();
        // The client resets the stream once the dial fails
        let _ = timeout(TEST_TIMEOUT, stream.read_to_end(&mut buf))
            .await
            .expect("stream was never torn down");
        assert!(buf.is_empty());
    }

    assert!(!runner.is_finished());
    assert!(!client.is_closed());

    client.close().await.unwrap();
    assert!(timeout(TEST_TIMEOUT, runner).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_run_returns_ok_when_server_goes_away() {
    let (server_addr, server) = fake_server("T1").await;
    let config = ClientConfig::new(server_addr.to_string(), "T1", free_addr());
    let client = TunnelClient::connect(config).await.unwrap();

    let session = server.await.unwrap().expect("server session");
    drop(session);

    let result = timeout(TEST_TIMEOUT, client.run()).await.expect("run hung");
    assert!(result.is_ok());
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (server_addr, _server) = fake_server("T1").await;
    let config = ClientConfig::new(server_addr.to_string(), "T1", free_addr());
    let client = TunnelClient::connect(config).await.unwrap();

    assert!(client.close().await.is_ok());
    assert!(client.close().await.is_ok());
    timeout(TEST_TIMEOUT, client.closed()).await.unwrap();
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (server_addr, server) = fake_server("right").await;
    let config = ClientConfig::new(server_addr.to_string(), "wrong", free_addr());

    let err = TunnelClient::connect(config).await.unwrap_err();
    match &err {
        ClientError::Handshake(HandshakeError::Rejected(msg)) => {
            assert!(!msg.is_empty());
            assert!(!msg.contains("right"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(err.is_fatal());
    assert!(server.await.unwrap().is_none());
}

#[tokio::test]
async fn test_connection_refused() {
    let config = ClientConfig::new(free_addr(), "T1", free_addr());
    let err = TunnelClient::connect(config).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionFailed { .. }));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let config = ClientConfig::new(addr.to_string(), "T1", free_addr())
        .with_handshake_timeout(Duration::from_millis(200));
    let err = TunnelClient::connect(config).await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(HandshakeError::Timeout)));
}

#[tokio::test]
async fn test_server_hanging_up_mid_handshake_is_benign() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        let _ = socket.read_exact(&mut buf).await;
        drop(socket);
    });

    let config = ClientConfig::new(addr.to_string(), "T1", free_addr());
    let err = TunnelClient::connect(config).await.unwrap_err();
    assert!(err.is_closed(), "unexpected error: {:?}", err);
    assert!(!err.is_fatal());
}
