//! Integration tests for the transport connection.
//!
//! These tests run both ends of a connection over a localhost TCP pair
//! (or a subprocess tunnel), so the full byte path — queueing, buffering,
//! and the DEFLATE layer — is exercised exactly as the protocol layer
//! would drive it.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mailmirror_transport::{Connection, Error, ServerConfig, WriteBuf};

/// Connects a transport `Connection` to a raw peer socket.
async fn conn_and_peer(config: &Arc<ServerConfig>) -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    (
        Connection::from_tcp(client.unwrap(), config.clone()),
        accepted,
    )
}

/// Connects two transport `Connection`s back to back.
async fn conn_pair(config: &Arc<ServerConfig>) -> (Connection, Connection) {
    let (conn, peer) = conn_and_peer(config).await;
    (conn, Connection::from_tcp(peer, config.clone()))
}

fn default_config() -> Arc<ServerConfig> {
    Arc::new(ServerConfig::new("127.0.0.1", 0))
}

#[tokio::test]
async fn test_outbound_stream_equals_enqueue_order() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    let mut expected = Vec::new();
    for i in 0..40u8 {
        let payload = vec![b'a' + (i % 26); 11 + usize::from(i) * 97 % 4096];
        expected.extend_from_slice(&payload);
        if i % 2 == 0 {
            conn.write([WriteBuf::Own(payload)]).unwrap();
        } else {
            conn.write([WriteBuf::Copy(&payload)]).unwrap();
        }
    }

    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = peer.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&chunk[..n]);
        }
        got
    });

    conn.flushed().await.unwrap();
    conn.close().await;
    let got = reader.await.unwrap();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_copy_buffers_isolate_the_caller() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    let mut caller = b"a2 SELECT INBOX\r\n".to_vec();
    conn.write([WriteBuf::Copy(&caller)]).unwrap();
    // Clobbering the caller's buffer after write must not change what
    // goes on the wire.
    caller.iter_mut().for_each(|b| *b = b'!');
    conn.flushed().await.unwrap();

    let mut got = vec![0u8; 17];
    peer.read_exact(&mut got).await.unwrap();
    assert_eq!(got, b"a2 SELECT INBOX\r\n");
}

#[tokio::test]
async fn test_scatter_write_single_wire_image() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    conn.write([
        WriteBuf::Copy(b"a3 APPEND "),
        WriteBuf::Own(b"\"INBOX\"".to_vec()),
        WriteBuf::Copy(b" {5}\r\n"),
    ])
    .unwrap();
    conn.flushed().await.unwrap();

    let mut got = vec![0u8; 23];
    peer.read_exact(&mut got).await.unwrap();
    assert_eq!(got, b"a3 APPEND \"INBOX\" {5}\r\n");
}

#[tokio::test]
async fn test_line_reassembly_across_fragments() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    let line = b"* 172 FETCH (FLAGS (\\Seen) UID 4827)";
    let writer = tokio::spawn(async move {
        for piece in line.chunks(7) {
            peer.write_all(piece).await.unwrap();
            peer.flush().await.unwrap();
            tokio::task::yield_now().await;
        }
        peer.write_all(b"\r\n* 5 EXISTS\r\n").await.unwrap();
        peer
    });

    assert_eq!(conn.read_line().await.unwrap(), line);
    assert_eq!(conn.read_line().await.unwrap(), b"* 5 EXISTS");
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn test_expect_bytes_bulk_read() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    let literal: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
    let expected = literal.clone();
    let writer = tokio::spawn(async move {
        peer.write_all(&literal).await.unwrap();
        peer
    });

    conn.expect_bytes(20_000).unwrap();
    let mut got = Vec::new();
    while got.len() < expected.len() {
        let chunk = conn
            .read_bytes(1, expected.len() - got.len())
            .await
            .unwrap();
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, expected);
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn test_deflate_round_trip_both_directions() {
    let config = default_config();
    let (mut client, mut server) = conn_pair(&config).await;

    client.start_compression().unwrap();
    server.start_compression().unwrap();

    let payload: Vec<u8> = (0..32_768u32).map(|i| (i * 31 % 253) as u8).collect();
    let expected = payload.clone();

    client.write([WriteBuf::Own(payload)]).unwrap();
    client.flushed().await.unwrap();

    let mut got = Vec::new();
    while got.len() < expected.len() {
        let chunk = server
            .read_bytes(1, expected.len() - got.len())
            .await
            .unwrap();
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, expected);

    // And back the other way, line-framed.
    server.write([WriteBuf::Copy(b"a4 OK COMPRESS active\r\n")]).unwrap();
    server.flushed().await.unwrap();
    assert_eq!(client.read_line().await.unwrap(), b"a4 OK COMPRESS active");
}

#[tokio::test]
async fn test_deflate_small_writes_many_flushes() {
    let config = default_config();
    let (mut client, mut server) = conn_pair(&config).await;

    client.start_compression().unwrap();
    server.start_compression().unwrap();

    for i in 0..20u32 {
        let line = format!("a{i} NOOP\r\n");
        client.write([WriteBuf::Copy(line.as_bytes())]).unwrap();
        client.flushed().await.unwrap();
        let got = server.read_line().await.unwrap();
        assert_eq!(got, format!("a{i} NOOP").as_bytes());
    }
}

#[tokio::test]
async fn test_tunnel_transport_echo() {
    // `cat` echoes its stdin: the subprocess stdio pair acts as the
    // remote end.
    let config = Arc::new(ServerConfig::tunnel("cat").build());
    let mut conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.name(), "tunnel: cat");

    conn.write([WriteBuf::Copy(b"a5 CAPABILITY\r\n")]).unwrap();
    conn.flushed().await.unwrap();
    assert_eq!(conn.read_line().await.unwrap(), b"a5 CAPABILITY");
    conn.close().await;
}

#[tokio::test]
async fn test_resolution_failure_is_terminal() {
    let config = Arc::new(
        ServerConfig::builder("no-such-host.invalid", 143)
            .timeout(Duration::from_secs(5))
            .build(),
    );
    let err = Connection::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::Resolve(_) | Error::Timeout(_)));
}

#[tokio::test]
async fn test_connect_timeout_or_failure() {
    // Non-routable test address: either the attempt hangs until the
    // timeout fires or the stack refuses it outright. Both are terminal
    // connect failures at the same callback boundary.
    let config = Arc::new(
        ServerConfig::builder("10.255.255.1", 143)
            .timeout(Duration::from_millis(300))
            .build(),
    );
    let err = Connection::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_) | Error::Connect(_)));
}

#[tokio::test]
async fn test_close_silences_the_connection() {
    let config = default_config();
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    conn.write([WriteBuf::Copy(b"a6 LOGOUT\r\n")]).unwrap();
    conn.close().await;

    assert!(matches!(conn.read_line().await, Err(Error::Closed)));
    assert!(matches!(
        conn.write([WriteBuf::Copy(b"late")]),
        Err(Error::Closed)
    ));

    // The peer sees EOF, not stray late data.
    let mut rest = Vec::new();
    peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.len() <= 11);
}

#[tokio::test]
async fn test_queue_overflow_closes_connection() {
    let config = Arc::new(
        ServerConfig::builder("127.0.0.1", 0)
            .max_queued(1024)
            .build(),
    );
    let (mut conn, _peer) = conn_and_peer(&config).await;

    let err = conn.write([WriteBuf::Own(vec![0u8; 4096])]).unwrap_err();
    assert!(matches!(err, Error::WriteQueueOverflow { limit: 1024 }));
    assert!(matches!(conn.flushed().await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_framing_overflow_closes_connection() {
    let config = Arc::new(
        ServerConfig::builder("127.0.0.1", 0)
            .read_buffer(2048)
            .build(),
    );
    let (mut conn, mut peer) = conn_and_peer(&config).await;

    let writer = tokio::spawn(async move {
        // A "line" that can never fit the read buffer.
        let blob = vec![b'x'; 8192];
        let _ = peer.write_all(&blob).await;
        peer
    });

    let err = conn.read_line().await.unwrap_err();
    assert!(matches!(err, Error::LineTooLong { capacity: 2048 }));
    drop(writer.await.unwrap());
}
