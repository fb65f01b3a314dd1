//! Tower middleware putting [`Deflect`] in front of an axum service.

use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use futures::future::{BoxFuture, FutureExt};
use tower::{Layer, Service};

use crate::deflect::Deflect;

/// Explicit client identifier. When an outer layer inserts this into the
/// request extensions it is used instead of the peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

/// Identifier the throttle counts a request under.
///
/// [`ClientId`] wins, then the peer IP from `ConnectInfo`. Requests with
/// neither all share the empty identifier.
pub fn client_id<B>(req: &Request<B>) -> String {
    if let Some(ClientId(id)) = req.extensions().get::<ClientId>() {
        return id.clone();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

/// The fixed 403 sent to a deflected client.
pub fn deflected() -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::FORBIDDEN;
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    res
}

#[derive(Debug, Clone)]
pub struct DeflectLayer {
    deflect: Deflect,
}

impl DeflectLayer {
    pub fn new(deflect: Deflect) -> Self {
        Self { deflect }
    }
}

impl<S> Layer<S> for DeflectLayer {
    type Service = DeflectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeflectService {
            inner,
            deflect: self.deflect.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeflectService<S> {
    inner: S,
    deflect: Deflect,
}

impl<S> Service<Request<Body>> for DeflectService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // decided synchronously, the inner call runs outside the store lock
        let id = client_id(&req);
        if self.deflect.check(&id).is_blocked() {
            return futures::future::ready(Ok(deflected())).boxed();
        }

        // the clone is not ready, keep the one poll_ready was called on
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { inner.call(req).await })
    }
}
