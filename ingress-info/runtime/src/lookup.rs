use crate::Body;
use futures::future;
use http::{header, HeaderMap, HeaderName, Method, Request, Response, StatusCode};
use ingress_info_core::{CachedDb, IngressDb, ListIngresses};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use serde::Serialize;
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, error};

/// Answers whether a host is declared by an Ingress.
///
/// `GET /` lists every known host. `GET /<host>` reports whether `<host>`
/// is known, falling back to the value of the configured request header.
pub struct Lookup<L> {
    db: Arc<CachedDb<L>>,
    config: Arc<LookupConfig>,
    metrics: LookupMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct LookupConfig {
    /// A request header whose value is checked when the path does not name
    /// a known host.
    pub host_header: Option<HeaderName>,
}

#[derive(Clone, Debug, Default)]
pub struct LookupMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    result: String,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Message {
    Info(String),
    Error(String),
}

// === impl Lookup ===

impl<L> Clone for Lookup<L> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<L, B> tower::Service<Request<B>> for Lookup<L>
where
    L: ListIngresses + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let (parts, _) = req.into_parts();
        let lookup = self.clone();
        Box::pin(async move {
            let rsp = lookup
                .respond(parts.method, parts.uri.path(), &parts.headers)
                .await;
            Ok(rsp)
        })
    }
}

impl<L: ListIngresses> Lookup<L> {
    pub fn new(db: Arc<CachedDb<L>>, config: Arc<LookupConfig>, metrics: LookupMetrics) -> Self {
        Self {
            db,
            config,
            metrics,
        }
    }

    async fn respond(&self, method: Method, path: &str, headers: &HeaderMap) -> Response<Body> {
        if method != Method::GET && method != Method::HEAD {
            self.metrics.inc("method_not_allowed");
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &Message::Error(format!("'{method}' 405 method not allowed")),
            );
        }

        let db = match self.db.get().await {
            Ok(db) => db,
            Err(error) => {
                error!(%error, "Failed to build host database");
                self.metrics.inc("error");
                return json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &Message::Error(format!("500 failure: {error}")),
                );
            }
        };

        if path == "/" {
            self.metrics.inc("list");
            return json_response(StatusCode::OK, &db.hosts().collect::<Vec<_>>());
        }

        let candidate = path.strip_prefix('/').unwrap_or(path);
        if db.contains(candidate) {
            debug!(host = %candidate, "Found");
            self.metrics.inc("found");
            return json_response(
                StatusCode::OK,
                &Message::Info(format!("'{candidate}' found")),
            );
        }

        if let Some(host) = self.header_match(headers, &db) {
            debug!(host = %host, header = ?self.config.host_header, "Found by header");
            self.metrics.inc("found");
            return json_response(StatusCode::OK, &Message::Info(format!("'{host}' found")));
        }

        debug!(host = %candidate, "Not found");
        self.metrics.inc("not_found");
        json_response(
            StatusCode::NOT_FOUND,
            &Message::Error(format!("'{candidate}' 404 not found")),
        )
    }

    fn header_match<'h>(&self, headers: &'h HeaderMap, db: &IngressDb) -> Option<&'h str> {
        let name = self.config.host_header.as_ref()?;
        let value = headers.get(name)?.to_str().ok()?;
        (!value.is_empty() && db.contains(value)).then_some(value)
    }
}

/// Encodes `body` as pretty-printed JSON.
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, bytes) = match serde_json::to_vec_pretty(body) {
        Ok(bytes) => (status, bytes),
        Err(error) => {
            error!(%error, "Failed to encode response");
            let msg = serde_json::Value::String(format!("500 failure: {error}"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{{\n  \"error\": {msg}\n}}").into_bytes(),
            )
        }
    };

    let mut rsp = Response::new(Body::from(bytes));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    rsp
}

// === impl LookupMetrics ===

impl LookupMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of lookup requests by result",
            requests.clone(),
        );
        Self { requests }
    }

    fn inc(&self, result: &str) {
        self.requests
            .get_or_create(&RequestLabels {
                result: result.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    fn get(&self, result: &str) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                result: result.to_string(),
            })
            .get()
    }
}
