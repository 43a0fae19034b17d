// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end RPC tests over a real QUIC endpoint.

use std::sync::Arc;
use std::time::Duration;

use tessera_protocol::frame::MessageType;
use tessera_protocol::proto::verb_proto;
use tessera_protocol::{
    Frame, TesseraClient, TesseraServer, VerbClient,
};

/// Start a verb-echo server on an ephemeral port; `Call` echoes the body,
/// `Ping` answers ready.
async fn start_echo_server() -> std::net::SocketAddr {
    let server = TesseraServer::dev("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        server
            .run(|mut stream| async move {
                let Ok(frame) = stream.read_frame().await else {
                    return;
                };
                if frame.message_type != MessageType::Request {
                    return;
                }
                let Ok(request) = frame.decode::<verb_proto::RpcRequest>() else {
                    return;
                };
                let response = match request.request {
                    Some(verb_proto::rpc_request::Request::Ping(_)) => {
                        verb_proto::rpc_response::Response::Ping(verb_proto::PingResponse {
                            not_ready: None,
                        })
                    }
                    Some(verb_proto::rpc_request::Request::Call(call)) => {
                        verb_proto::rpc_response::Response::Call(verb_proto::CallResponse {
                            response: Some(verb_proto::call_response::Response::Body(call.body)),
                        })
                    }
                    None => return,
                };
                let envelope = verb_proto::RpcResponse {
                    response: Some(response),
                };
                let _ = stream.write_frame(&Frame::response(&envelope).unwrap()).await;
            })
            .await
    });
    // Let the accept loop start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

#[tokio::test]
async fn ping_round_trip() {
    let addr = start_echo_server().await;
    let client = VerbClient::new(Arc::new(TesseraClient::dev(addr).unwrap()));
    let response = client.ping().await.unwrap();
    assert!(response.not_ready.is_none());
}

#[tokio::test]
async fn call_echoes_body() {
    let addr = start_echo_server().await;
    let client = VerbClient::new(Arc::new(TesseraClient::dev(addr).unwrap()));
    let body = client
        .call("echo.echo".to_string(), b"{\"name\": \"tessera\"}".to_vec())
        .await
        .unwrap();
    assert_eq!(body, b"{\"name\": \"tessera\"}");
}

#[tokio::test]
async fn sequential_requests_reuse_the_connection() {
    let addr = start_echo_server().await;
    let transport = Arc::new(TesseraClient::dev(addr).unwrap());
    let client = VerbClient::new(transport.clone());

    for i in 0..5u8 {
        let body = client.call("echo.echo".to_string(), vec![i]).await.unwrap();
        assert_eq!(body, vec![i]);
    }
    assert!(transport.is_connected().await);
}
