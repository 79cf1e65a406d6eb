//! Proxy server: construction, bind/serve loop, graceful shutdown.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use url::Url;

use crate::error::{Result, ShroudError};
use crate::proxy::handler::Forwarder;
use crate::proxy::target::{Target, TargetRegistry};
use crate::proxy::transport::{HttpTransport, Transport};

/// Certificate chain plus private key for HTTPS serving
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Recognized proxy options, validated eagerly at construction
pub struct ProxyOptions {
    /// Bind port; 0 requests an OS-assigned port
    pub port: u16,
    /// Override the dispatch capability (default: plain [`HttpTransport`])
    pub transport: Option<Arc<dyn Transport>>,
    /// Enables HTTPS mode
    pub tls: Option<TlsIdentity>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            port: 0,
            transport: None,
            tls: None,
        }
    }
}

/// The reverse proxy: registry, transport, serving loop.
pub struct Proxy {
    registry: TargetRegistry,
    forwarder: Forwarder,
    addr: Arc<RwLock<Url>>,
    tls: Option<TlsAcceptor>,
    listener: Mutex<Option<TcpListener>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
}

impl Proxy {
    /// Validate targets and options and build the proxy.
    ///
    /// Any unparsable target origin or unusable TLS identity fails here;
    /// no listener is ever bound for a half-valid configuration.
    pub fn new(targets: Vec<Target>, options: ProxyOptions) -> Result<Arc<Self>> {
        let registry = TargetRegistry::new(targets)?;

        let transport: Arc<dyn Transport> = options
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));

        let scheme = if options.tls.is_some() { "https" } else { "http" };
        let addr = Url::parse(&format!("{}://0.0.0.0:{}", scheme, options.port))
            .map_err(|e| ShroudError::InvalidConfig(format!("listen address: {}", e)))?;
        let addr = Arc::new(RwLock::new(addr));

        let tls = match options.tls {
            Some(identity) => {
                let mut config = rustls::ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(identity.cert_chain, identity.key)
                    .map_err(|e| ShroudError::Tls(format!("invalid certificate: {}", e)))?;
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            forwarder: Forwarder::new(transport, Arc::clone(&addr)),
            registry,
            addr,
            tls,
            listener: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            active: Arc::new(AtomicUsize::new(0)),
        }))
    }

    /// The proxy's public address. After [`bind`], reflects the resolved
    /// host and port from the live listener (port 0 becomes the OS-assigned
    /// one).
    ///
    /// [`bind`]: Proxy::bind
    pub fn addr(&self) -> Url {
        self.addr.read().clone()
    }

    /// Bind the TCP listener and read back the resolved address.
    pub async fn bind(&self) -> Result<()> {
        let bind_addr = {
            let addr = self.addr.read();
            format!(
                "{}:{}",
                addr.host_str().unwrap_or("0.0.0.0"),
                addr.port_or_known_default().unwrap_or(0)
            )
        };
        let listener = TcpListener::bind(&bind_addr).await?;
        let local = listener.local_addr()?;
        {
            let mut addr = self.addr.write();
            let _ = addr.set_host(Some(&local.ip().to_string()));
            let _ = addr.set_port(Some(local.port()));
        }
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    /// Serve until shutdown. Blocks; a graceful close is `Ok(())`, not an
    /// error.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        // Take the listener in its own scope; bind() relocks the slot.
        let taken = self.listener.lock().await.take();
        let listener = match taken {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener.lock().await.take().expect("listener bound")
            }
        };

        let mut shutdown = self.shutdown_rx.clone();
        let prefixes: Vec<_> = self.registry.prefixes().collect();
        info!("Proxy listening on {}, serving {:?}", self.addr(), prefixes);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let proxy = Arc::clone(&self);
                            let guard = ActiveGuard::new(Arc::clone(&self.active));
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = proxy.handle_connection(stream).await {
                                    debug!(client = %client_addr, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Graceful shutdown: stop accepting, then wait for in-flight handlers
    /// to drain, bounded by the caller's deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        let start = Instant::now();
        while self.active.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                debug!(
                    remaining = self.active.load(Ordering::SeqCst),
                    "Shutdown deadline reached with handlers in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        // the only branch point in startup: plain HTTP or TLS, same handler
        match self.tls.clone() {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ShroudError::Tls(format!("TLS accept failed: {}", e)))?;
                self.serve_stream(tls_stream).await
            }
            None => self.serve_stream(stream).await,
        }
    }

    async fn serve_stream<S>(self: Arc<Self>, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            async move {
                let path = req.uri().path().to_string();
                let res = match proxy.registry.lookup(&path) {
                    Some(target) => proxy.forwarder.handle(target, req).await,
                    None => Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::from("404 page not found")))
                        .unwrap(),
                };
                Ok::<_, Infallible>(res)
            }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await
            .map_err(|e| ShroudError::Http(e.to_string()))
    }
}

/// Counts a connection as in flight for the duration of its task.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::proxy::transport::Dialer;
    use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE};
    use std::sync::atomic::AtomicUsize;

    /// Upstream fixture serving a fixed response and counting hits.
    async fn spawn_upstream(
        response: impl Fn() -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
    ) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let response = response.clone();
                let hits = Arc::clone(&hits_counter);
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<Incoming>| {
                        let response = response.clone();
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, Infallible>(response())
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, hits)
    }

    fn html_response(body: &'static str) -> Response<Full<Bytes>> {
        Response::builder()
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn start_proxy(targets: Vec<Target>) -> Arc<Proxy> {
        let proxy = Proxy::new(targets, ProxyOptions::default()).unwrap();
        proxy.bind().await.unwrap();
        tokio::spawn(Arc::clone(&proxy).serve());
        proxy
    }

    /// Plain client for talking to the proxy under test.
    fn client() -> HttpTransport {
        HttpTransport::with_dialer(Dialer::Direct)
    }

    fn proxy_url(proxy: &Proxy, path: &str) -> String {
        let addr = proxy.addr();
        format!(
            "http://127.0.0.1:{}{}",
            addr.port_or_known_default().unwrap(),
            path
        )
    }

    fn get(url: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(url)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwarding_rewrites_html_links() {
        let (upstream, _) = spawn_upstream(|| {
            html_response(r#"<a href="/page">go</a><a href="https://other.com/x">out</a>"#)
        })
        .await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/index")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = String::from_utf8(res.body().to_vec()).unwrap();
        let base = proxy.addr().as_str().trim_end_matches('/').to_string();
        assert!(
            body.contains(&format!(r#"<a href="{}/up/page">go</a>"#, base)),
            "{}",
            body
        );
        assert!(body.contains(r#"<a href="https://other.com/x">out</a>"#));
        // unconditional CORS headers on forwarded responses
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_non_html_bodies_pass_through_unrewritten() {
        let (upstream, _) = spawn_upstream(|| {
            Response::builder()
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from_static(b"{\"href\":\"/page\"}")))
                .unwrap()
        })
        .await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/data")))
            .await
            .unwrap();
        assert_eq!(res.body().as_ref(), b"{\"href\":\"/page\"}");
    }

    #[tokio::test]
    async fn test_compressed_html_round_trips_through_rewrite() {
        let (upstream, _) = spawn_upstream(|| {
            let packed =
                codec::compress(br#"<a href="/page">go</a>"#, codec::ContentCoding::Gzip).unwrap();
            Response::builder()
                .header(CONTENT_TYPE, "text/html")
                .header(CONTENT_ENCODING, "gzip")
                .body(Full::new(Bytes::from(packed)))
                .unwrap()
        })
        .await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        // recompressed with the same coding the upstream used
        assert_eq!(res.headers()[CONTENT_ENCODING], "gzip");
        let plain = codec::decompress(res.body(), codec::ContentCoding::Gzip).unwrap();
        let body = String::from_utf8(plain).unwrap();
        assert!(body.contains("/up/page"), "{}", body);
    }

    #[tokio::test]
    async fn test_unknown_upstream_encoding_is_bad_gateway() {
        let (upstream, _) = spawn_upstream(|| {
            Response::builder()
                .header(CONTENT_ENCODING, "zstd")
                .body(Full::new(Bytes::from_static(b"x")))
                .unwrap()
        })
        .await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_options_preflight_short_circuits() {
        let (upstream, hits) = spawn_upstream(|| html_response("<p>hi</p>")).await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let req = Request::builder()
            .method(hyper::Method::OPTIONS)
            .uri(proxy_url(&proxy, "/up/anything"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = client().round_trip(req).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        assert_eq!(
            res.headers()["access-control-allow-methods"],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        // zero upstream dispatches for preflights
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_path_is_not_found() {
        let (upstream, _) = spawn_upstream(|| html_response("<p>hi</p>")).await;
        let proxy = start_proxy(vec![Target::new(format!("http://{}", upstream), "/up/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/elsewhere")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dead_upstream_is_bad_gateway() {
        // port 1: connection refused
        let proxy = start_proxy(vec![Target::new("http://127.0.0.1:1", "/dead/")]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/dead/x")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_invalid_origin_fails_before_bind() {
        let err = Proxy::new(
            vec![Target::new("definitely not a url", "/x/")],
            ProxyOptions::default(),
        )
        .err()
        .expect("construction must fail");
        assert!(matches!(err, ShroudError::InvalidOrigin { .. }));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_completes() {
        let (upstream, _) = spawn_upstream(|| html_response("<p>hi</p>")).await;
        let proxy = Proxy::new(
            vec![Target::new(format!("http://{}", upstream), "/up/")],
            ProxyOptions::default(),
        )
        .unwrap();
        proxy.bind().await.unwrap();
        let serve_task = tokio::spawn(Arc::clone(&proxy).serve());

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        proxy.shutdown(Duration::from_secs(2)).await;
        let result = serve_task.await.unwrap();
        assert!(result.is_ok(), "graceful close is not an error");
    }

    #[tokio::test]
    async fn test_serve_without_explicit_bind_accepts_requests() {
        let (upstream, _) = spawn_upstream(|| html_response("<p>hi</p>")).await;
        let proxy = Proxy::new(
            vec![Target::new(format!("http://{}", upstream), "/up/")],
            ProxyOptions::default(),
        )
        .unwrap();
        // serve() binds on its own; no prior bind() call
        let serve_task = tokio::spawn(Arc::clone(&proxy).serve());

        // wait for the internal bind to resolve the port
        let deadline = Instant::now() + Duration::from_secs(2);
        while proxy.addr().port_or_known_default() == Some(0) {
            assert!(Instant::now() < deadline, "serve never bound");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let res = tokio::time::timeout(
            Duration::from_secs(2),
            client().round_trip(get(&proxy_url(&proxy, "/up/"))),
        )
        .await
        .expect("accept loop must be reachable")
        .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        proxy.shutdown(Duration::from_secs(2)).await;
        let result = tokio::time::timeout(Duration::from_secs(2), serve_task)
            .await
            .expect("serve must stop on shutdown")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_target_hooks_fire_around_dispatch() {
        struct CountingHooks {
            before: AtomicUsize,
            after: AtomicUsize,
        }

        impl crate::proxy::Hooks for CountingHooks {
            fn before_dispatch(&self, req: Request<Full<Bytes>>) -> Request<Full<Bytes>> {
                self.before.fetch_add(1, Ordering::SeqCst);
                req
            }

            fn after_dispatch(&self, res: Option<Response<Bytes>>) -> Option<Response<Bytes>> {
                self.after.fetch_add(1, Ordering::SeqCst);
                res
            }
        }

        let (upstream, _) = spawn_upstream(|| html_response("<p>hi</p>")).await;
        let hooks = Arc::new(CountingHooks {
            before: AtomicUsize::new(0),
            after: AtomicUsize::new(0),
        });
        let target =
            Target::new(format!("http://{}", upstream), "/up/").with_hooks(hooks.clone());
        let proxy = start_proxy(vec![target]).await;

        let res = client()
            .round_trip(get(&proxy_url(&proxy, "/up/")))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(hooks.before.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_port_zero_is_resolved_after_bind() {
        let proxy = Proxy::new(
            vec![Target::new("https://example.com", "/ex/")],
            ProxyOptions::default(),
        )
        .unwrap();
        proxy.bind().await.unwrap();
        assert_ne!(proxy.addr().port_or_known_default(), Some(0));
    }
}
