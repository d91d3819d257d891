//! Log transports against their own server halves on loopback.

use std::sync::Arc;
use std::time::Duration;

use relay_gateway::transport::rpc::{
    read_frame, serve_rpc, write_frame, RpcCall, RpcLogTransport, RpcPayload, RpcReply,
    LOG_INFO_METHOD,
};
use relay_gateway::transport::{select_log_transport, HttpClient, LogEndpoints};
use relay_gateway::{EventMessage, LogTransport, TransportError, TransportKind};
use tokio::net::{TcpListener, TcpStream};

use crate::support::MemorySink;

async fn start_rpc(sink: Arc<MemorySink>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_rpc(listener, sink));
    addr.to_string()
}

#[tokio::test]
async fn rpc_round_trip() {
    let sink = Arc::new(MemorySink::default());
    let addr = start_rpc(sink.clone()).await;

    let transport = RpcLogTransport::new(addr, Duration::from_secs(1));
    let reply = transport
        .send(&EventMessage::new("log", "from rpc"))
        .await
        .unwrap();

    assert_eq!(reply, "Processed payload via RPC: log");
    assert_eq!(sink.entries(), [EventMessage::new("log", "from rpc")]);
}

#[tokio::test]
async fn rpc_connection_carries_several_calls() {
    let sink = Arc::new(MemorySink::default());
    let addr = start_rpc(sink.clone()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    for i in 0..3 {
        let call = RpcCall {
            method: LOG_INFO_METHOD.to_string(),
            payload: RpcPayload {
                name: format!("n{i}"),
                data: "d".to_string(),
            },
        };
        write_frame(&mut stream, &call).await.unwrap();
        let reply: RpcReply = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply, RpcReply::Ok(format!("Processed payload via RPC: n{i}")));
    }

    assert_eq!(sink.entries().len(), 3);
}

#[tokio::test]
async fn rpc_unknown_method_gets_an_error_reply() {
    let sink = Arc::new(MemorySink::default());
    let addr = start_rpc(sink.clone()).await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let call = RpcCall {
        method: "LogService.Delete".to_string(),
        payload: RpcPayload {
            name: "n".to_string(),
            data: "d".to_string(),
        },
    };
    write_frame(&mut stream, &call).await.unwrap();
    let reply: RpcReply = read_frame(&mut stream).await.unwrap().unwrap();

    assert!(matches!(reply, RpcReply::Err(msg) if msg.contains("unknown method")));
    assert!(sink.entries().is_empty());
}

#[tokio::test]
async fn rpc_silent_server_times_out() {
    // Accepts and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let transport = RpcLogTransport::new(addr.to_string(), Duration::from_millis(100));
    let err = transport
        .send(&EventMessage::new("log", "x"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(_)));
}

#[cfg(feature = "grpc")]
#[tokio::test]
async fn grpc_round_trip() {
    use relay_gateway::transport::grpc::{serve_grpc_with_listener, GrpcLogTransport};

    let sink = Arc::new(MemorySink::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_grpc_with_listener(sink.clone(), listener));

    let transport = GrpcLogTransport::new(format!("http://{addr}"), Duration::from_secs(1));
    let reply = transport
        .send(&EventMessage::new("log", "from grpc"))
        .await
        .unwrap();

    assert_eq!(reply, "logged");
    assert_eq!(sink.entries(), [EventMessage::new("log", "from grpc")]);
}

#[cfg(feature = "grpc")]
#[tokio::test]
async fn grpc_silent_server_times_out() {
    use relay_gateway::transport::grpc::GrpcLogTransport;

    // Accepts and never speaks HTTP/2.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let deadline = Duration::from_millis(100);
    let transport = GrpcLogTransport::new(format!("http://{addr}"), deadline);
    let started = std::time::Instant::now();
    let err = transport
        .send(&EventMessage::new("log", "x"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Timeout(d) if d == deadline));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn selected_rpc_transport_reaches_the_server() {
    let sink = Arc::new(MemorySink::default());
    let addr = start_rpc(sink.clone()).await;
    let endpoints = LogEndpoints {
        http_url: "http://127.0.0.1:1/log".to_string(),
        rpc_addr: addr,
        grpc_url: "http://127.0.0.1:1".to_string(),
    };
    let http = HttpClient::new(Duration::from_secs(1)).unwrap();

    let transport =
        select_log_transport(TransportKind::Rpc, &endpoints, &http, Duration::from_secs(1), None)
            .unwrap();
    transport.send(&EventMessage::new("event", "x")).await.unwrap();

    assert_eq!(transport.kind(), TransportKind::Rpc);
    assert_eq!(sink.entries().len(), 1);
}
