// E2E Test 4: gRPC splicing through the demultiplexer.

mod e2e;

use bytes::{Bytes, BytesMut};
use e2e::helpers::start_proxy;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

/// A length-prefixed gRPC frame carrying "hello".
const GRPC_MESSAGE: &[u8] = b"\x00\x00\x00\x00\x05hello";

/// h2 backend that echoes request data and finishes with grpc-status 0.
async fn spawn_grpc_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut connection = h2::server::handshake(socket).await.expect("handshake");
                while let Some(Ok((request, mut respond))) = connection.accept().await {
                    tokio::spawn(async move {
                        let (parts, mut body) = request.into_parts();
                        assert_eq!(parts.uri.path(), "/test.Echo/Say");
                        let mut data = BytesMut::new();
                        while let Some(chunk) = body.data().await {
                            let chunk = chunk.expect("request data");
                            let len = chunk.len();
                            data.extend_from_slice(&chunk);
                            let _ = body.flow_control().release_capacity(len);
                        }
                        let response = http::Response::builder()
                            .status(200)
                            .header("content-type", "application/grpc")
                            .body(())
                            .expect("response head");
                        let mut send = respond.send_response(response, false).expect("send head");
                        send.send_data(data.freeze(), false).expect("send data");
                        let mut trailers = http::HeaderMap::new();
                        trailers.insert("grpc-status", "0".parse().expect("status"));
                        send.send_trailers(trailers).expect("send trailers");
                    });
                }
            });
        }
    });
    addr
}

async fn grpc_call(
    proxy_addr: SocketAddr,
    authority_host: &str,
) -> http::Response<h2::RecvStream> {
    let tcp = TcpStream::connect(proxy_addr).await.expect("connect proxy");
    let (mut channel, connection) = h2::client::handshake(tcp).await.expect("client handshake");
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method("POST")
        .uri(format!(
            "http://{}:{}/test.Echo/Say",
            authority_host,
            proxy_addr.port()
        ))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
        .expect("request");
    let (response, mut send) = channel.send_request(request, false).expect("send request");
    send.send_data(Bytes::from_static(GRPC_MESSAGE), true)
        .expect("send body");
    response.await.expect("response")
}

#[tokio::test]
async fn test_e2e_4_grpc_splice() {
    let backend = spawn_grpc_echo_backend().await;
    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"grpc && host == "127.0.0.1" => "127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    let response = grpc_call(proxy.http_addr, "127.0.0.1").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .expect("content-type"),
        "application/grpc"
    );

    let (_parts, mut body) = response.into_parts();
    let mut echoed = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("response data");
        let len = chunk.len();
        echoed.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(len);
    }
    assert_eq!(&echoed[..], GRPC_MESSAGE);

    let trailers = body.trailers().await.expect("trailers").expect("trailers");
    assert_eq!(trailers.get("grpc-status").expect("grpc-status"), "0");

    proxy.stop().await;
}

#[tokio::test]
async fn test_e2e_4_unknown_route_is_permission_denied() {
    let backend = spawn_grpc_echo_backend().await;
    let proxy = start_proxy(move |builder| {
        builder.route(format!(
            r#"grpc && host == "known.example" => "127.0.0.1:{}""#,
            backend.port()
        ))
    })
    .await;

    // authority 127.0.0.1 matches no rule
    let response = grpc_call(proxy.http_addr, "127.0.0.1").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("grpc-status").expect("grpc-status"),
        "7"
    );

    proxy.stop().await;
}
