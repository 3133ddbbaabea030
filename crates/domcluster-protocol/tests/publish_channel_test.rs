// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end exercise of the publish channel over loopback QUIC.

use domcluster_protocol::frame::{read_frame, write_frame, Frame};
use domcluster_protocol::{
    ClusterClient, ClusterClientConfig, ClusterServer, ConnectionHandler, PublishRequest,
    PublishResponse,
};

fn client_for(addr: std::net::SocketAddr) -> ClusterClient {
    ClusterClient::new(ClusterClientConfig {
        server_addr: addr,
        connect_timeout_ms: 2_000,
        ..Default::default()
    })
    .expect("client creation")
}

#[tokio::test]
async fn test_publish_stream_round_trip() {
    let server = ClusterServer::self_signed("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    // Server side: accept one connection, echo a reply per request.
    let server_task = tokio::spawn(async move {
        let incoming = server.accept().await.expect("incoming connection");
        let connection = incoming.await.expect("handshake");
        let conn = ConnectionHandler::new(connection);
        let (mut send, mut recv) = conn.accept_bi().await.expect("publish stream");

        let frame = read_frame(&mut recv).await.expect("request frame");
        let request: PublishRequest = frame.decode().expect("decode request");
        assert_eq!(request.issuer, "node-1");
        assert_eq!(request.cmd, "register");

        let reply = PublishResponse {
            reporter: "server".to_string(),
            req_id: request.req_id,
            status: 0,
            data: br#"{"message":"registered"}"#.to_vec(),
        };
        write_frame(&mut send, &Frame::response(&reply).unwrap())
            .await
            .expect("write reply");
    });

    let client = client_for(addr);
    let (mut send, mut recv) = client.open_publish_stream().await.expect("open stream");

    let request = PublishRequest {
        issuer: "node-1".to_string(),
        req_id: "register-1".to_string(),
        cmd: "register".to_string(),
        data: br#"{"name":"n1","version":"1.0.0"}"#.to_vec(),
    };
    write_frame(&mut send, &Frame::request(&request).unwrap())
        .await
        .expect("write request");

    let frame = read_frame(&mut recv).await.expect("reply frame");
    let reply: PublishResponse = frame.decode().expect("decode reply");
    assert_eq!(reply.status, 0);
    assert_eq!(reply.req_id, "register-1");
    assert_eq!(reply.reporter, "server");

    server_task.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn test_frames_preserve_order_within_stream() {
    let server = ClusterServer::self_signed("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let incoming = server.accept().await.expect("incoming connection");
        let connection = incoming.await.expect("handshake");
        let conn = ConnectionHandler::new(connection);
        let (_send, mut recv) = conn.accept_bi().await.expect("publish stream");

        let mut seen = Vec::new();
        for _ in 0..10 {
            let frame = read_frame(&mut recv).await.expect("frame");
            let request: PublishRequest = frame.decode().expect("decode");
            seen.push(request.req_id);
        }
        seen
    });

    let client = client_for(addr);
    let (mut send, _recv) = client.open_publish_stream().await.expect("open stream");

    for i in 0..10 {
        let request = PublishRequest {
            issuer: "node-1".to_string(),
            req_id: format!("seq-{}", i),
            cmd: "heartbeat".to_string(),
            data: b"{}".to_vec(),
        };
        write_frame(&mut send, &Frame::request(&request).unwrap())
            .await
            .expect("write");
    }

    let seen = server_task.await.unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("seq-{}", i)).collect();
    assert_eq!(seen, expected, "stream must deliver frames in send order");

    client.close().await;
}
