/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use intercept_proxy::config::{ListenerConfig, TlsConfig, UpstreamConfig};
use intercept_proxy::events::{EventHub, EventSubscriber, ProxyEvent, SessionProtocol};
use intercept_proxy::http::DEFAULT_MAX_HEAD_BYTES;
use intercept_proxy::proxy::{
    ProxyContext, ProxyServer, Shutdown, UpstreamConnector, HALF_CLOSE_GRACE,
};
use intercept_proxy::tls::{
    store::pem_encode, CacheOptions, CertificateCache, CertificateProvider, FileCertificateStore,
    RcgenCertificateProvider,
};
use intercept_proxy::utils::init_tracing;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tempfile::{tempdir, TempDir};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Recorder(Mutex<Vec<ProxyEvent>>);

impl Recorder {
    fn events(&self) -> Vec<ProxyEvent> {
        self.0.lock().expect("recorder lock").clone()
    }

    fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ProxyEvent::name).collect()
    }

    async fn wait_for(&self, name: &str) {
        timeout(WAIT, async {
            while !self.names().contains(&name) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} event, saw {:?}", self.names()));
    }
}

impl EventSubscriber for Recorder {
    fn on_event(&self, event: &ProxyEvent) -> anyhow::Result<()> {
        self.0.lock().expect("recorder lock").push(event.clone());
        Ok(())
    }
}

struct Panicking;

impl EventSubscriber for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn on_event(&self, event: &ProxyEvent) -> anyhow::Result<()> {
        if matches!(event, ProxyEvent::ConnectionAdded(_)) {
            panic!("subscriber blew up");
        }
        Ok(())
    }
}

struct Setup {
    upstream: UpstreamConfig,
    /// Registered ahead of the recorder.
    extra: Vec<Arc<dyn EventSubscriber>>,
    decrypt_https: bool,
    upstream_roots: Vec<PathBuf>,
    half_close_grace: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            extra: Vec::new(),
            decrypt_https: false,
            upstream_roots: Vec::new(),
            half_close_grace: HALF_CLOSE_GRACE,
        }
    }
}

struct Harness {
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    recorder: Arc<Recorder>,
    shutdown: Shutdown,
    _dir: TempDir,
}

impl Harness {
    async fn start(upstream: UpstreamConfig) -> Self {
        Self::launch(Setup {
            upstream,
            ..Setup::default()
        })
        .await
    }

    async fn start_with(upstream: UpstreamConfig, extra: Vec<Arc<dyn EventSubscriber>>) -> Self {
        Self::launch(Setup {
            upstream,
            extra,
            ..Setup::default()
        })
        .await
    }

    async fn launch(setup: Setup) -> Self {
        init_tracing(false);
        let dir = tempdir().expect("tempdir");
        let tls = TlsConfig {
            decrypt_https: setup.decrypt_https,
            ..TlsConfig::default()
        };
        let store = Arc::new(FileCertificateStore::open(dir.path()).expect("store"));
        let certs = CertificateCache::new(
            Arc::new(RcgenCertificateProvider),
            store,
            CacheOptions::from(&tls),
            None,
            Vec::new(),
        )
        .expect("certificate cache");

        let events = Arc::new(EventHub::new());
        for subscriber in setup.extra {
            events.subscribe(subscriber);
        }
        let recorder = Arc::new(Recorder::default());
        events.subscribe(recorder.clone());

        let ctx = Arc::new(
            ProxyContext::new(
                Arc::new(certs),
                Arc::new(UpstreamConnector::new(&setup.upstream_roots).expect("connector")),
                events,
                tls,
                setup.upstream,
                64 * 1024,
                DEFAULT_MAX_HEAD_BYTES,
                64 * 1024,
            )
            .with_half_close_grace(setup.half_close_grace),
        );
        let listener_cfg = ListenerConfig {
            bind_port: 0,
            ..ListenerConfig::default()
        };
        let server = ProxyServer::new(listener_cfg, ctx.clone());
        let listener = server.bind().await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = server.shutdown_handle();
        tokio::spawn(server.serve(listener));

        Self {
            addr,
            ctx,
            recorder,
            shutdown,
            _dir: dir,
        }
    }

    async fn client(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect to proxy")
    }

    /// Opens a raw CONNECT tunnel to `127.0.0.1:port`.
    async fn tunnel(&self, port: u16) -> TcpStream {
        let mut client = self.client().await;
        client
            .write_all(
                format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .expect("send CONNECT");
        let head = timeout(WAIT, read_head(&mut client)).await.expect("CONNECT reply");
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        client
    }
}

/// Reads up to and including the blank line that ends an HTTP head.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read head");
        assert_eq!(n, 1, "peer closed mid-head: {:?}", String::from_utf8_lossy(&head));
        head.push(byte[0]);
    }
    String::from_utf8(head).expect("ascii head")
}

/// Accepts one connection, hands its request head to the test and answers `response`.
async fn one_shot_origin(response: &'static [u8]) -> (u16, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("origin bind");
    let port = listener.local_addr().expect("origin addr").port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("origin accept");
        let head = read_head(&mut socket).await;
        let _ = tx.send(head);
        socket.write_all(response).await.expect("origin write");
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });
    (port, rx)
}

#[tokio::test]
async fn plain_http_request_is_forwarded_and_observed() {
    let harness = Harness::start(UpstreamConfig::default()).await;
    let (port, origin_head) =
        one_shot_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello").await;

    let mut client = harness.client().await;
    let request = format!(
        "GET http://127.0.0.1:{port}/hello?x=1 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
Proxy-Connection: keep-alive\r\nConnection: close\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.expect("send request");

    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    let reply = String::from_utf8(reply).expect("ascii reply");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(reply.contains("X-Origin: yes"));
    assert!(reply.ends_with("\r\n\r\nhello"));

    let seen = origin_head.await.expect("origin saw a request");
    assert!(seen.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{seen}");
    assert!(!seen.to_ascii_lowercase().contains("proxy-connection"));

    harness.recorder.wait_for("connection_removed").await;
    assert_eq!(
        harness.recorder.names(),
        vec![
            "connection_added",
            "request_sent",
            "response_sent",
            "disposing",
            "connection_removed"
        ]
    );

    let events = harness.recorder.events();
    let ProxyEvent::ResponseSent(session) = &events[2] else {
        panic!("third event should be response_sent");
    };
    assert_eq!(session.target, format!("127.0.0.1:{port}"));
    assert!(!session.is_https);
    assert_eq!(session.protocol, SessionProtocol::Http1);
    assert_eq!(session.stream_id, None);
    let response = session.response.as_ref().expect("response recorded");
    assert_eq!(&response.body[..], b"hello");
    assert!(events.iter().all(|event| event.connection_id() == session.connection_id));
    assert!(harness.ctx.registry.is_empty());
}

#[tokio::test]
async fn plain_http_goes_through_the_upstream_proxy_with_credentials() {
    let (port, proxy_head) =
        one_shot_origin(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
    let upstream = UpstreamConfig {
        http_proxy: Some(format!("127.0.0.1:{port}")),
        username: Some("user".into()),
        password: Some("pw".into()),
        ..UpstreamConfig::default()
    };
    let harness = Harness::start(upstream).await;

    let mut client = harness.client().await;
    client
        .write_all(
            b"GET http://origin.invalid/path HTTP/1.1\r\nHost: origin.invalid\r\n\
Proxy-Authorization: Basic Y2xpZW50\r\n\r\n",
        )
        .await
        .expect("send request");

    let head = timeout(WAIT, read_head(&mut client)).await.expect("reply in time");
    assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"), "{head}");

    let seen = proxy_head.await.expect("upstream proxy saw a request");
    assert!(seen.starts_with("GET http://origin.invalid:80/path HTTP/1.1\r\n"), "{seen}");
    assert!(seen.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
    assert!(!seen.contains("Y2xpZW50"));
}

#[tokio::test]
async fn unreachable_origin_gets_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = closed.local_addr().expect("addr").port();
    drop(closed);

    let harness = Harness::start(UpstreamConfig {
        connect_retries: 0,
        ..UpstreamConfig::default()
    })
    .await;
    let mut client = harness.client().await;
    client
        .write_all(format!("GET http://127.0.0.1:{port}/ HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .expect("send request");

    let head = timeout(WAIT, read_head(&mut client)).await.expect("reply in time");
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{head}");
    harness.recorder.wait_for("connection_removed").await;
    assert!(!harness.recorder.names().contains(&"request_sent"));
}

#[tokio::test]
async fn connect_tunnel_relays_raw_bytes() {
    let echo = TcpListener::bind("127.0.0.1:0").await.expect("echo bind");
    let port = echo.local_addr().expect("echo addr").port();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.expect("echo accept");
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let harness = Harness::start(UpstreamConfig::default()).await;
    let mut client = harness.tunnel(port).await;

    client.write_all(b"opaque bytes").await.expect("tunnel write");
    let mut echoed = [0u8; 12];
    timeout(WAIT, client.read_exact(&mut echoed))
        .await
        .expect("echo in time")
        .expect("echo read");
    assert_eq!(&echoed, b"opaque bytes");

    drop(client);
    harness.recorder.wait_for("connection_removed").await;
    assert!(!harness.recorder.names().contains(&"request_sent"));
    assert!(harness.ctx.registry.is_empty());
}

#[tokio::test]
async fn abrupt_disconnect_still_tears_down_cleanly() {
    let harness = Harness::start(UpstreamConfig::default()).await;
    let mut client = harness.client().await;
    client
        .write_all(b"GET http://127.0.0.1:9/ HTTP/1.1\r\nHo")
        .await
        .expect("partial request");
    harness.recorder.wait_for("connection_added").await;
    assert_eq!(harness.ctx.registry.len(), 1);
    drop(client);

    harness.recorder.wait_for("connection_removed").await;
    assert_eq!(
        harness.recorder.names(),
        vec!["connection_added", "disposing", "connection_removed"]
    );
    assert!(harness.ctx.registry.is_empty());
}

#[tokio::test]
async fn panicking_subscriber_is_reported_and_isolated() {
    let extra: Vec<Arc<dyn EventSubscriber>> = vec![Arc::new(Panicking)];
    let harness = Harness::start_with(UpstreamConfig::default(), extra).await;
    let mut fatal = harness.ctx.events.fatal_errors();

    let client = harness.client().await;
    let error = timeout(WAIT, fatal.recv())
        .await
        .expect("fatal error in time")
        .expect("fatal channel open");
    assert_eq!(error.subscriber, "panicking");
    assert_eq!(error.event, "connection_added");
    assert!(error.message.contains("subscriber blew up"), "{}", error.message);

    drop(client);
    harness.recorder.wait_for("connection_removed").await;
    assert_eq!(
        harness.recorder.names(),
        vec!["connection_added", "disposing", "connection_removed"]
    );
}

#[tokio::test]
async fn shutdown_closes_idle_connections() {
    let harness = Harness::start(UpstreamConfig::default()).await;
    let mut client = harness.client().await;
    harness.recorder.wait_for("connection_added").await;

    harness.shutdown.trigger();
    harness.recorder.wait_for("connection_removed").await;

    let mut rest = Vec::new();
    let read = timeout(WAIT, client.read_to_end(&mut rest))
        .await
        .expect("closed in time");
    assert!(read.map(|n| n == 0).unwrap_or(true));
    assert!(harness.ctx.registry.is_empty());
}

/// Accepts one connection, reads the request head and a `body_len` byte body, then
/// answers `200 ok`. `interim` is written right after the head when set.
async fn body_origin(
    body_len: usize,
    interim: Option<&'static [u8]>,
) -> (u16, oneshot::Receiver<(String, Vec<u8>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("origin bind");
    let port = listener.local_addr().expect("origin addr").port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("origin accept");
        let head = read_head(&mut socket).await;
        if let Some(interim) = interim {
            socket.write_all(interim).await.expect("origin interim");
        }
        let mut body = vec![0u8; body_len];
        socket.read_exact(&mut body).await.expect("origin body");
        let _ = tx.send((head, body));
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .expect("origin write");
    });
    (port, rx)
}

fn expect_continue_request(port: u16) -> String {
    format!(
        "POST http://127.0.0.1:{port}/upload HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
Expect: 100-continue\r\nContent-Length: 5\r\nConnection: close\r\n\r\n"
    )
}

fn sent_request_body(recorder: &Recorder) -> Vec<u8> {
    recorder
        .events()
        .iter()
        .find_map(|event| match event {
            ProxyEvent::RequestSent(session) => Some(session.request.body.to_vec()),
            _ => None,
        })
        .expect("request_sent recorded")
}

#[tokio::test]
async fn expect_continue_body_flows_when_origin_skips_interim() {
    let harness = Harness::start(UpstreamConfig::default()).await;
    let (port, origin_saw) = body_origin(5, None).await;

    let mut client = harness.client().await;
    client
        .write_all(expect_continue_request(port).as_bytes())
        .await
        .expect("send head");
    // The client gives up waiting for 100 Continue and sends the body anyway.
    sleep(Duration::from_millis(300)).await;
    client.write_all(b"hello").await.expect("send body");

    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    let reply = String::from_utf8(reply).expect("ascii reply");
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(reply.ends_with("\r\n\r\nok"), "{reply}");

    let (head, body) = origin_saw.await.expect("origin saw the request");
    assert!(head.starts_with("POST /upload HTTP/1.1\r\n"), "{head}");
    assert_eq!(body, b"hello");

    harness.recorder.wait_for("response_sent").await;
    assert_eq!(sent_request_body(&harness.recorder), b"hello");
}

#[tokio::test]
async fn expect_continue_waits_for_origin_interim() {
    let harness = Harness::start(UpstreamConfig::default()).await;
    let (port, origin_saw) = body_origin(5, Some(&b"HTTP/1.1 100 Continue\r\n\r\n"[..])).await;

    let mut client = harness.client().await;
    client
        .write_all(expect_continue_request(port).as_bytes())
        .await
        .expect("send head");
    let interim = timeout(WAIT, read_head(&mut client)).await.expect("interim in time");
    assert_eq!(interim, "HTTP/1.1 100 Continue\r\n\r\n");

    client.write_all(b"hello").await.expect("send body");
    let head = timeout(WAIT, read_head(&mut client)).await.expect("final in time");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let mut body = [0u8; 2];
    client.read_exact(&mut body).await.expect("final body");
    assert_eq!(&body, b"ok");

    let (_, seen) = origin_saw.await.expect("origin saw the request");
    assert_eq!(seen, b"hello");
    harness.recorder.wait_for("response_sent").await;
    assert_eq!(sent_request_body(&harness.recorder), b"hello");
}

#[tokio::test]
async fn set_upstream_applies_only_to_new_connections() {
    let (origin_port, origin_head) =
        one_shot_origin(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
    let (proxy_port, proxy_head) =
        one_shot_origin(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
    let harness = Harness::start(UpstreamConfig::default()).await;

    let mut first = harness.client().await;
    harness.recorder.wait_for("connection_added").await;
    harness.ctx.set_upstream(UpstreamConfig {
        http_proxy: Some(format!("127.0.0.1:{proxy_port}")),
        ..UpstreamConfig::default()
    });

    first
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/first HTTP/1.1\r\n\
Host: 127.0.0.1:{origin_port}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("first request");
    let head = timeout(WAIT, read_head(&mut first)).await.expect("first reply");
    assert!(head.starts_with("HTTP/1.1 204"), "{head}");
    let seen = origin_head.await.expect("origin saw the first request");
    assert!(seen.starts_with("GET /first HTTP/1.1\r\n"), "{seen}");

    let mut second = harness.client().await;
    second
        .write_all(
            format!(
                "GET http://127.0.0.1:{origin_port}/second HTTP/1.1\r\n\
Host: 127.0.0.1:{origin_port}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("second request");
    let head = timeout(WAIT, read_head(&mut second)).await.expect("second reply");
    assert!(head.starts_with("HTTP/1.1 204"), "{head}");
    let seen = proxy_head.await.expect("upstream proxy saw the second request");
    assert!(
        seen.starts_with(&format!("GET http://127.0.0.1:{origin_port}/second HTTP/1.1\r\n")),
        "{seen}"
    );
}

#[tokio::test]
async fn connect_tunnel_keeps_reply_path_open_after_client_half_close() {
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("origin bind");
    let port = origin.local_addr().expect("origin addr").port();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.expect("origin accept");
        let mut request = Vec::new();
        socket.read_to_end(&mut request).await.expect("origin read");
        assert_eq!(request, b"last words");
        socket.write_all(b"late reply").await.expect("origin write");
    });

    let harness = Harness::start(UpstreamConfig::default()).await;
    let mut client = harness.tunnel(port).await;
    client.write_all(b"last words").await.expect("tunnel write");
    client.shutdown().await.expect("client half-close");

    let mut reply = Vec::new();
    timeout(WAIT, client.read_to_end(&mut reply))
        .await
        .expect("reply in time")
        .expect("read reply");
    assert_eq!(reply, b"late reply");
    harness.recorder.wait_for("connection_removed").await;
}

#[tokio::test]
async fn silent_half_closed_tunnel_is_closed_after_grace() {
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("origin bind");
    let port = origin.local_addr().expect("origin addr").port();
    tokio::spawn(async move {
        let (mut socket, _) = origin.accept().await.expect("origin accept");
        let mut request = Vec::new();
        let _ = socket.read_to_end(&mut request).await;
        // Never answers and never closes.
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let harness = Harness::launch(Setup {
        half_close_grace: Duration::from_millis(200),
        ..Setup::default()
    })
    .await;
    let mut client = harness.tunnel(port).await;
    client.write_all(b"bye").await.expect("tunnel write");
    let closed_at = Instant::now();
    client.shutdown().await.expect("client half-close");

    let mut rest = Vec::new();
    timeout(WAIT, client.read_to_end(&mut rest))
        .await
        .expect("tunnel closed within the grace period")
        .expect("read to end");
    assert!(rest.is_empty());
    assert!(closed_at.elapsed() >= Duration::from_millis(150));
    harness.recorder.wait_for("connection_removed").await;
    assert!(harness.ctx.registry.is_empty());
}

/// Serves one TLS connection with a certificate for 127.0.0.1 signed by a private CA.
/// Returns the origin port and a PEM file holding that CA.
async fn tls_origin(dir: &TempDir) -> (u16, PathBuf, oneshot::Receiver<String>) {
    let provider = RcgenCertificateProvider;
    let ca = provider.create_root_certificate("Test Origin CA").expect("origin CA");
    let leaf = provider
        .create_server_certificate("127.0.0.1", &ca)
        .expect("origin leaf");
    let ca_path = dir.path().join("origin-ca.pem");
    std::fs::write(&ca_path, pem_encode("CERTIFICATE", ca.der())).expect("write origin CA");

    let acceptor = TlsAcceptor::from(
        leaf.server_config(vec![b"http/1.1".to_vec()])
            .expect("origin server config"),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("origin bind");
    let port = listener.local_addr().expect("origin addr").port();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.expect("origin accept");
        let mut tls = acceptor.accept(socket).await.expect("origin handshake");
        let head = read_head(&mut tls).await;
        let _ = tx.send(head);
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret")
            .await
            .expect("origin write");
        let _ = tls.shutdown().await;
    });
    (port, ca_path, rx)
}

#[tokio::test]
async fn decrypted_https_exchange_is_observed() {
    let roots_dir = tempdir().expect("tempdir");
    let (port, ca_path, origin_head) = tls_origin(&roots_dir).await;
    let harness = Harness::launch(Setup {
        decrypt_https: true,
        upstream_roots: vec![ca_path],
        ..Setup::default()
    })
    .await;

    let tunnel = harness.tunnel(port).await;
    let mut trusted = RootCertStore::empty();
    trusted
        .add(harness.ctx.certs.root().der().clone())
        .expect("trust proxy root");
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("protocol versions")
    .with_root_certificates(trusted)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = timeout(
        WAIT,
        TlsConnector::from(Arc::new(config)).connect(server_name, tunnel),
    )
    .await
    .expect("handshake in time")
    .expect("client trusts the generated certificate");
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"http/1.1"[..]));

    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("send request");
    let head = timeout(WAIT, read_head(&mut tls)).await.expect("reply in time");
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let mut body = [0u8; 6];
    tls.read_exact(&mut body).await.expect("reply body");
    assert_eq!(&body, b"secret");

    let seen = origin_head.await.expect("origin saw the request");
    assert!(seen.starts_with("GET /secure HTTP/1.1\r\n"), "{seen}");

    harness.recorder.wait_for("response_sent").await;
    let events = harness.recorder.events();
    let request = events
        .iter()
        .find_map(|event| match event {
            ProxyEvent::RequestSent(session) => Some(session.clone()),
            _ => None,
        })
        .expect("request_sent recorded");
    assert!(request.is_https);
    assert_eq!(request.target, format!("127.0.0.1:{port}"));
    assert_eq!(request.protocol, SessionProtocol::Http1);

    let response = events
        .iter()
        .find_map(|event| match event {
            ProxyEvent::ResponseSent(session) => Some(session.clone()),
            _ => None,
        })
        .expect("response_sent recorded");
    assert_eq!(response.id, request.id);
    let message = response.response.as_ref().expect("response recorded");
    assert_eq!(&message.body[..], b"secret");
    assert_eq!(harness.ctx.certs.metrics().generated, 1);
}
