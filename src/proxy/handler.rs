//! Per-request forwarding pipeline.
//!
//! Builds the upstream request, runs the target's hooks around the dispatch,
//! then copies the response back to the client, rewriting HTML bodies so
//! same-origin links keep resolving through the proxy.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::RwLock;
use tracing::warn;
use url::Url;

use crate::codec;
use crate::error::{Result, ShroudError};
use crate::proxy::rewrite;
use crate::proxy::target::RegisteredTarget;
use crate::proxy::transport::Transport;

/// Forwards requests for registered targets through the proxy's transport.
pub(crate) struct Forwarder {
    transport: Arc<dyn Transport>,
    /// Proxy's own public address, used as the rewrite base. Shared with the
    /// server, which fixes the host up after binding.
    addr: Arc<RwLock<Url>>,
}

impl Forwarder {
    pub fn new(transport: Arc<dyn Transport>, addr: Arc<RwLock<Url>>) -> Self {
        Self { transport, addr }
    }

    /// Handle one inbound request for a matched target.
    ///
    /// Never fails outward; pipeline errors become 502 responses.
    pub async fn handle(
        &self,
        target: Arc<RegisteredTarget>,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        // CORS preflights are answered locally: no upstream dispatch, no
        // hook invocations.
        if req.method() == Method::OPTIONS {
            let mut res = Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .unwrap();
            append_cors_headers(res.headers_mut());
            return res;
        }

        match self.forward(&target, req).await {
            Ok(res) => res,
            Err(e) => {
                warn!(prefix = %target.prefix, error = %e, "Error forwarding request");
                error_response(&e)
            }
        }
    }

    async fn forward(
        &self,
        target: &RegisteredTarget,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let upstream_req = build_upstream_request(req, target).await?;

        let upstream_req = match &target.hooks {
            Some(hooks) => hooks.before_dispatch(upstream_req),
            None => upstream_req,
        };

        let res = match self.transport.round_trip(upstream_req).await {
            Ok(res) => res,
            Err(e) => {
                // collaborators still get to record the failure
                if let Some(hooks) = &target.hooks {
                    hooks.after_dispatch(None);
                }
                return Err(e);
            }
        };

        // The hook's return value, not the original, continues downstream.
        let res = match &target.hooks {
            Some(hooks) => hooks.after_dispatch(Some(res)).ok_or_else(|| {
                ShroudError::Forwarding("post-dispatch hook dropped the response".to_string())
            })?,
            None => res,
        };

        self.copy_response(res, target)
    }

    /// Copy the upstream response for the client, decompressing, rewriting
    /// HTML and recompressing as needed.
    fn copy_response(
        &self,
        mut upstream: Response<Bytes>,
        target: &RegisteredTarget,
    ) -> Result<Response<Full<Bytes>>> {
        let status = upstream.status();
        let encoding_token = upstream
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // Body length changes below; hyper reframes from the final body.
        let mut headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if name != CONTENT_LENGTH && name != TRANSFER_ENCODING {
                headers.append(name, value.clone());
            }
        }
        // Appended unconditionally; may duplicate upstream-supplied values.
        append_cors_headers(&mut headers);

        codec::decompress_response(&mut upstream)?;

        let is_html = upstream
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/html"));

        let body = if is_html {
            let addr = self.addr.read().clone();
            rewrite::rewrite_html(upstream.body(), &addr, target)?
        } else {
            upstream.body().to_vec()
        };

        let body = match &encoding_token {
            Some(token) => {
                let packed = codec::compress_with_token(&body, token)?;
                headers.insert(
                    CONTENT_ENCODING,
                    token.parse().map_err(|e| {
                        ShroudError::Codec(format!("invalid encoding token: {}", e))
                    })?,
                );
                packed
            }
            None => body,
        };

        let mut res = Response::builder()
            .status(status)
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ShroudError::Http(e.to_string()))?;
        *res.headers_mut() = headers;
        Ok(res)
    }
}

/// Build the request actually sent upstream: the inbound URI with the
/// target's scheme and host, the matched prefix stripped from the path, and
/// the connection forced closed so one stealth identity's connection never
/// serves another request.
pub(crate) async fn build_upstream_request(
    req: Request<Incoming>,
    target: &RegisteredTarget,
) -> Result<Request<Full<Bytes>>> {
    let (parts, body) = req.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| ShroudError::BodyRead(e.to_string()))?
        .to_bytes();

    let path = parts.uri.path();
    let stripped = path.strip_prefix(target.prefix.as_str()).unwrap_or(path);
    let mut upstream_url = target.origin.clone();
    upstream_url.set_path(stripped);
    upstream_url.set_query(parts.uri.query());

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(upstream_url.as_str());
    for (name, value) in &parts.headers {
        // the transport sets Host from the upstream authority
        if name != HOST {
            builder = builder.header(name, value);
        }
    }

    let mut upstream_req = builder
        .body(Full::new(body_bytes))
        .map_err(|e| ShroudError::Http(format!("error constructing new request: {}", e)))?;
    upstream_req
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    Ok(upstream_req)
}

pub(crate) fn append_cors_headers(headers: &mut HeaderMap) {
    headers.append(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.append(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.append(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

pub(crate) fn error_response(err: &ShroudError) -> Response<Full<Bytes>> {
    Response::builder()
        .status(err.status_code())
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(err.to_string())))
        .unwrap()
}
