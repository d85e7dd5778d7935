use crate::Body;
use hyper::{body::Incoming, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{convert::Infallible, future::Future, time::Duration};
use tokio::{net::TcpListener, sync::watch, time};
use tracing::{debug, info, info_span, warn, Instrument};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying `accept` after a failure (e.g. EMFILE), doubling
/// per consecutive failure.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

/// Serves HTTP/1 and HTTP/2 connections accepted on `listener` with `svc`
/// until `shutdown` completes, then waits for open connections to finish
/// their in-flight requests.
pub async fn serve<S, F>(listener: TcpListener, svc: S, shutdown: F)
where
    S: tower::Service<Request<Incoming>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    F: Future<Output = ()>,
{
    let builder = auto::Builder::new(TokioExecutor::new());
    let (close_tx, close_rx) = watch::channel(false);
    let mut backoff = AcceptBackoff::default();
    tokio::pin!(shutdown);

    loop {
        let res = tokio::select! {
            res = listener.accept() => res,
            () = &mut shutdown => break,
        };
        let (io, client_addr) = match res {
            Ok(conn) => {
                backoff.reset();
                conn
            }
            Err(error) => {
                let delay = backoff.failed();
                warn!(%error, ?delay, "Failed to accept connection");
                tokio::select! {
                    () = time::sleep(delay) => continue,
                    () = &mut shutdown => break,
                }
            }
        };

        let builder = builder.clone();
        let svc = TowerToHyperService::new(svc.clone());
        let mut close = close_rx.clone();
        tokio::spawn(
            async move {
                let conn = builder.serve_connection(TokioIo::new(io), svc);
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = conn.as_mut() => res,
                    _ = close.changed() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection closed");
                }
            }
            .instrument(info_span!("conn", client.addr = %client_addr)),
        );
    }

    info!("Shutting down listener");
    drop(listener);
    drop(close_rx);
    let _ = close_tx.send(true);
    close_tx.closed().await;
}

// === impl AcceptBackoff ===

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }
}

impl AcceptBackoff {
    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}
