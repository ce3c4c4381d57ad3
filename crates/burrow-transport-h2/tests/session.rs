//! Session tests over real loopback TCP connections

use burrow_transport::{Multiplexer, Session, TransportError};
use burrow_transport_h2::{H2Config, H2Multiplexer, H2Session};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns (server-agent side, client-agent side)
async fn session_pair(config: H2Config) -> (H2Session, H2Session) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let dialed = dialed.unwrap();
    let (accepted, _) = accepted.unwrap();

    let mux = H2Multiplexer::new(config);
    let (server, client) = tokio::join!(mux.accept_session(accepted), mux.open_session(dialed));
    (server.unwrap(), client.unwrap())
}

#[tokio::test]
async fn test_open_and_accept_stream() {
    let (server, client) = session_pair(H2Config::default()).await;

    let (opened, accepted) = tokio::join!(server.open_stream(), client.accept_stream());
    let mut opened = opened.unwrap();
    let mut accepted = accepted.unwrap().expect("stream should arrive");

    opened.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    accepted.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    accepted.write_all(b"PONG").await.unwrap();
    opened.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");

    // END_STREAM reads as EOF on the other side
    opened.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, accepted.read_to_end(&mut rest))
        .await
        .expect("EOF not delivered")
        .unwrap();
    assert!(rest.is_empty());

    assert_eq!(server.active_streams(), 1);
    assert_eq!(client.active_streams(), 1);
    drop(opened);
    drop(accepted);
    assert_eq!(server.active_streams(), 0);
    assert_eq!(client.active_streams(), 0);
}

#[tokio::test]
async fn test_concurrent_streams_are_independent() {
    let (server, client) = session_pair(H2Config::default()).await;

    let echo = tokio::spawn(async move {
        while let Ok(Some(mut stream)) = client.accept_stream().await {
            tokio::spawn(async move {
                let mut data = Vec::new();
                stream.read_to_end(&mut data).await.unwrap();
                stream.write_all(&data).await.unwrap();
                stream.shutdown().await.unwrap();
            });
        }
    });

    let server = std::sync::Arc::new(server);
    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let server = server.clone();
        tasks.push(tokio::spawn(async move {
            let mut stream = server.open_stream().await.unwrap();
            let payload = vec![i; 64 * 1024];
            stream.write_all(&payload).await.unwrap();
            stream.shutdown().await.unwrap();

            let mut echoed = Vec::new();
            stream.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }));
    }

    for task in tasks {
        timeout(TEST_TIMEOUT, task)
            .await
            .expect("stream timed out")
            .unwrap();
    }

    server.close().await;
    timeout(TEST_TIMEOUT, echo)
        .await
        .expect("acceptor did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_close_is_observed_by_peer() {
    let (server, client) = session_pair(H2Config::default()).await;

    client.close().await;
    client.close().await;
    assert!(client.is_closed());

    timeout(TEST_TIMEOUT, server.closed())
        .await
        .expect("peer never noticed the closed session");
    assert!(server.is_closed());

    let err = server.open_stream().await.unwrap_err();
    assert!(matches!(err, TransportError::SessionClosed));

    let next = client.accept_stream().await.unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_dropping_session_closes_connection() {
    let (server, client) = session_pair(H2Config::default()).await;

    drop(server);

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("dropped session left the connection open");
    assert!(client.accept_stream().await.unwrap().is_none());
}

#[tokio::test]
async fn test_streams_flow_one_way() {
    let (server, client) = session_pair(H2Config::default()).await;

    let err = client.open_stream().await.unwrap_err();
    assert!(matches!(err, TransportError::ProtocolError(_)));

    // The opener never receives streams; accept waits for the session to end
    let pending = timeout(Duration::from_millis(100), server.accept_stream()).await;
    assert!(pending.is_err());

    server.close().await;
    assert!(server.accept_stream().await.unwrap().is_none());
}

#[tokio::test]
async fn test_keep_alive_keeps_healthy_session() {
    let config = H2Config::default()
        .with_keep_alive(Duration::from_millis(50))
        .with_keep_alive_timeout(Duration::from_secs(2));
    let (server, client) = session_pair(config).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!server.is_closed());
    assert!(!client.is_closed());

    let (opened, accepted) = tokio::join!(server.open_stream(), client.accept_stream());
    assert!(opened.is_ok());
    assert!(accepted.unwrap().is_some());
}

#[tokio::test]
async fn test_unresponsive_peer_fails_setup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _silent = accepted.unwrap().0;

    // The stream-accepting side waits for a preface that never comes
    let mux = H2Multiplexer::new(
        H2Config::default().with_handshake_timeout(Duration::from_millis(100)),
    );
    let err = mux.open_session(dialed.unwrap()).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, _accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

    let mux = H2Multiplexer::new(H2Config::default().with_max_frame_size(1));
    let err = mux.accept_session(dialed.unwrap()).await.unwrap_err();
    assert!(matches!(err, TransportError::ConfigurationError(_)));
}

#[tokio::test]
async fn test_close_with_unaccepted_backlog() {
    let (server, client) = session_pair(H2Config::default()).await;
    let server = std::sync::Arc::new(server);

    let (opened, accepted) = tokio::join!(server.open_stream(), client.accept_stream());
    let mut opened = opened.unwrap();
    let mut accepted = accepted.unwrap().expect("stream should arrive");

    // More pending streams than the accept queue holds, none accepted
    let mut pending = Vec::new();
    for _ in 0..80 {
        let server = server.clone();
        pending.push(tokio::spawn(async move { server.open_stream().await }));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Streams that were already accepted keep flowing
    opened.write_all(b"PING").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, accepted.read_exact(&mut buf))
        .await
        .expect("connection stalled behind the backlog")
        .unwrap();
    assert_eq!(&buf, b"PING");

    client.close().await;
    timeout(TEST_TIMEOUT, server.closed())
        .await
        .expect("close did not reach the peer with a full backlog");

    for task in pending {
        let res = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
        assert!(res.is_err());
    }
}
