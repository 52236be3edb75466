//! Wire-level tests against a scripted relay.
//!
//! A local listener plays the relay front: it decodes the metadata the
//! tunnel sends and answers with hand-built response frames. Nothing
//! here touches the real network.

mod helpers;

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use helpers::{
    engine_for, framed_response, get_request, inflate, read_request, relay_options,
    request_metadata, tunnel_for,
};
use tunnel_proxy::config::{RelayOptions, RelayScheme};
use tunnel_proxy::error_handling::{FrameSection, TunnelError};
use tunnel_proxy::tunnel::framing::QUIRK_PREAMBLE;

/// A plain-transport fetch carries the request as compressed metadata
/// and gets the tunneled response back out of the frame.
#[tokio::test]
async fn plain_transport_round_trips_a_tunneled_response() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let request = read_request(&mut peer).await;
        let metadata = request_metadata(&request);
        peer.write_all(&framed_response(
            200,
            "Content-Type: text/plain\r\nContent-Length: 5\r\n",
            b"hello",
        ))
        .await
        .unwrap();
        metadata
    });

    let tunnel = tunnel_for(relay_options(port, false));
    let mut headers = HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static("probe/1.0"));
    headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
    headers.insert("host", HeaderValue::from_static("origin.test"));
    let mut response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/greeting",
            &headers,
            Bytes::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.relay_status, StatusCode::OK);
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers["content-type"], "text/plain");

    let mut body = Vec::new();
    response.body.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"hello");

    let metadata = relay.await.unwrap();
    assert!(metadata.starts_with("G-Method:GET\nG-Url:http://origin.test/greeting\n"));
    assert!(metadata.contains("User-Agent:probe/1.0\n"));
    // hop-by-hop fields and Host never reach the relay
    assert!(!metadata.contains("Proxy-Connection"));
    assert!(!metadata.contains("Host:"));
}

/// With the framing quirk on, the real exchange is preceded by a decoy
/// request whose answer is read and thrown away.
#[tokio::test]
async fn quirk_preamble_earns_a_throwaway_response() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoy = vec![0u8; QUIRK_PREAMBLE.len()];
        peer.read_exact(&mut decoy).await.unwrap();
        assert_eq!(decoy, QUIRK_PREAMBLE);
        peer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        let _ = read_request(&mut peer).await;
        peer.write_all(&framed_response(200, "Content-Length: 4\r\n", b"real"))
            .await
            .unwrap();
    });

    let tunnel = tunnel_for(relay_options(port, true));
    let mut response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    let mut body = Vec::new();
    response.body.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"real");
    relay.await.unwrap();
}

/// A relay front that rejects the quirked exchange with 400 turns the
/// quirk off and moves the transport to TLS for later fetches.
#[tokio::test]
async fn rejected_quirk_downgrades_quirk_and_scheme() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut decoy = vec![0u8; QUIRK_PREAMBLE.len()];
        peer.read_exact(&mut decoy).await.unwrap();
        let _ = read_request(&mut peer).await;
        let reject = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        // one answer for the decoy, one for the real request
        peer.write_all(reject).await.unwrap();
        peer.write_all(reject).await.unwrap();
    });

    let tunnel = tunnel_for(relay_options(port, true));
    let response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();
    relay.await.unwrap();

    assert_eq!(response.relay_status, StatusCode::BAD_REQUEST);
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(!tunnel.state().quirk_enabled());
    assert_eq!(tunnel.state().scheme(), RelayScheme::Https);
}

/// 503 means the active identity ran out of quota; the next fetch must
/// use the next identity in line.
#[tokio::test]
async fn quota_exhaustion_rotates_the_identity() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut peer).await;
        peer.write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
    });

    let address = format!("127.0.0.1:{port}");
    let tunnel = tunnel_for(RelayOptions {
        identities: vec![address.clone(), address],
        framing_quirk: false,
        ..RelayOptions::default()
    });
    assert_eq!(tunnel.state().endpoint().index, 0);

    let response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();
    relay.await.unwrap();

    assert_eq!(response.relay_status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(tunnel.state().endpoint().index, 1);
}

/// An `X-Status` header inside the frame overrides the frame's own
/// status and never reaches the caller as a header.
#[tokio::test]
async fn tunneled_status_override_wins() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut peer).await;
        peer.write_all(&framed_response(
            200,
            "X-Status: 301\r\nLocation: http://moved.test/\r\nContent-Length: 0\r\n",
            b"",
        ))
        .await
        .unwrap();
    });

    let tunnel = tunnel_for(relay_options(port, false));
    let response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/old",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();
    relay.await.unwrap();

    assert_eq!(response.relay_status, StatusCode::OK);
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers["location"], "http://moved.test/");
    assert!(response.headers.get("x-status").is_none());
}

/// A relay that dies mid-frame reports which section broke and how far
/// it got.
#[tokio::test]
async fn truncated_frame_reports_where_it_broke() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut peer).await;
        peer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n")
            .await
            .unwrap();
        peer.write_all(&[0u8, 200]).await.unwrap();
    });

    let tunnel = tunnel_for(relay_options(port, false));
    let err = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap_err();
    relay.await.unwrap();

    match err {
        TunnelError::ShortFrame {
            section: FrameSection::Lead,
            expected: 4,
            received: 2,
        } => {}
        other => panic!("unexpected error: {other}"),
    }
}

/// Obfuscated transport: the metadata rides base64-encoded in a cookie
/// on a bodiless GET, and well-known headers collapse to tokens.
#[tokio::test]
async fn obfuscated_metadata_rides_in_a_cookie() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let request = read_request(&mut peer).await;
        let text = String::from_utf8_lossy(&request).to_string();
        assert!(text.starts_with("GET /fetch HTTP/1.1\r\n"));
        let cookie = text
            .lines()
            .find_map(|line| line.strip_prefix("Cookie: "))
            .expect("metadata cookie")
            .to_string();
        let packed = STANDARD.decode(cookie.trim()).expect("cookie is base64");
        let metadata = String::from_utf8(inflate(&packed)).unwrap();
        peer.write_all(&framed_response(200, "Content-Length: 0\r\n", b""))
            .await
            .unwrap();
        metadata
    });

    let tunnel = tunnel_for(RelayOptions {
        identities: vec![format!("127.0.0.1:{port}")],
        framing_quirk: false,
        obfuscate: true,
        ..RelayOptions::default()
    });
    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("text/html,*/*;q=0.8"));
    let response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/hidden",
            &headers,
            Bytes::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    let metadata = relay.await.unwrap();
    assert!(metadata.starts_with("G-Method:GET\nG-Url:http://origin.test/hidden\n"));
    assert!(!metadata.contains("Accept:"));
    assert!(metadata.ends_with("G-Abbv:A\n"));
}

/// With XOR obfuscation the request announces a key byte and the relay
/// masks the response body with it; the tunnel unmasks transparently.
#[tokio::test]
async fn masked_response_body_is_unmasked() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let request = read_request(&mut peer).await;
        let first_line = String::from_utf8_lossy(&request)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        // the target carries a cache-busting query in this mode
        assert!(first_line.starts_with("POST /fetch?"));

        let metadata = request_metadata(&request);
        let key = metadata
            .lines()
            .find_map(|line| line.strip_prefix("G-xorchar:"))
            .expect("xor key option")
            .bytes()
            .next()
            .unwrap();
        let masked: Vec<u8> = b"masked bytes!".iter().map(|b| b ^ key).collect();
        peer.write_all(&framed_response(200, "Content-Length: 13\r\n", &masked))
            .await
            .unwrap();
    });

    let tunnel = tunnel_for(RelayOptions {
        identities: vec![format!("127.0.0.1:{port}")],
        framing_quirk: false,
        xor_obfuscation: true,
        ..RelayOptions::default()
    });
    let mut response = tunnel
        .fetch(
            &Method::GET,
            "http://origin.test/masked",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await
        .unwrap();
    relay.await.unwrap();

    let mut body = Vec::new();
    response.body.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"masked bytes!");
}

/// The engine splits cookies the relay folded into one line back into
/// separate `Set-Cookie` headers while streaming.
#[tokio::test]
async fn engine_unfolds_joined_cookies_while_streaming() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut peer, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut peer).await;
        peer.write_all(&framed_response(
            200,
            "Content-Type: text/html\r\nContent-Length: 2\r\nSet-Cookie: a=1; path=/, b=2\r\n",
            b"ok",
        ))
        .await
        .unwrap();
    });

    let engine = engine_for(relay_options(port, false));
    let mut client = Cursor::new(Vec::new());
    engine
        .serve_relay(get_request("http://origin.test/cookies"), &mut client)
        .await
        .unwrap();
    relay.await.unwrap();

    let text = String::from_utf8_lossy(client.get_ref()).to_string();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Set-Cookie: a=1; path=/\r\n"));
    assert!(text.contains("Set-Cookie: b=2\r\n"));
    assert!(!text.contains("a=1; path=/, b=2"));
    assert!(text.ends_with("ok"));
}

/// A quota rotation mid-request is invisible to the client: the engine
/// retries on the next identity and streams its answer.
#[tokio::test]
async fn engine_retries_past_a_quota_rotation() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut first).await;
        first
            .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        let (mut second, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut second).await;
        second
            .write_all(&framed_response(200, "Content-Length: 4\r\n", b"done"))
            .await
            .unwrap();
    });

    let address = format!("127.0.0.1:{port}");
    let engine = engine_for(RelayOptions {
        identities: vec![address.clone(), address],
        framing_quirk: false,
        ..RelayOptions::default()
    });
    let mut client = Cursor::new(Vec::new());
    engine
        .serve_relay(get_request("http://origin.test/retry"), &mut client)
        .await
        .unwrap();
    relay.await.unwrap();

    let text = String::from_utf8_lossy(client.get_ref()).to_string();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("done"));
    assert_eq!(engine.state().endpoint().index, 1);
}
