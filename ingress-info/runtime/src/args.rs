use crate::{
    core::{Builder, CachedDb, DbConfig, DbMetrics, MemoryStore, NoopStore, Selector, Store},
    k8s::{self, KubeIngresses, LoadConfigMode},
    lookup::{Lookup, LookupConfig, LookupMetrics},
    server,
    store::DiskStore,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use http::HeaderName;
use prometheus_client::registry::Registry;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "ingress-info",
    version,
    about = "Answers whether a host is declared by an Ingress in the cluster"
)]
pub struct Args {
    #[clap(
        short = 'l',
        long,
        default_value = "ingress_info=info,warn",
        env = "INGRESS_INFO_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// How cluster credentials are loaded: `local` uses the current
    /// kubeconfig context, `cluster` uses the pod's service account, which
    /// needs read access to Ingresses.
    #[clap(
        short = 'r',
        long,
        default_value = "local",
        env = "INGRESS_INFO_LOAD_CONFIG_MODE"
    )]
    load_config_mode: LoadConfigMode,

    /// Kubeconfig context to use in `local` mode.
    #[clap(long)]
    context: Option<String>,

    /// Comma-delimited `label=value` pairs. Only Ingresses carrying ALL of
    /// them are listed.
    #[clap(short = 'i', long)]
    include_label_selectors: Option<Selector>,

    /// Comma-delimited `label=value` pairs. Ingresses carrying ANY of them
    /// are ignored, even if they match the include selectors.
    #[clap(short = 'x', long)]
    exclude_label_selectors: Option<Selector>,

    /// Comma-delimited namespaces to list Ingresses in. All namespaces when
    /// unset.
    #[clap(short = 'n', long = "namespace")]
    namespaces: Option<Namespaces>,

    #[clap(short = 'p', long, default_value = "8081")]
    listen_port: u16,

    /// Request header checked for a known host when the request path does
    /// not name one (e.g. `X-Forwarded-Host`).
    #[clap(short = 'e', long)]
    host_match_on_header: Option<HeaderName>,

    #[clap(long)]
    cache_enabled: bool,

    /// Keeps cache entries on disk in this directory instead of in memory.
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    #[clap(long, default_value = "120")]
    cache_ttl_seconds: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Namespaces(Vec<String>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            load_config_mode,
            context,
            include_label_selectors,
            exclude_label_selectors,
            namespaces,
            listen_port,
            host_match_on_header,
            cache_enabled,
            cache_dir,
            cache_ttl_seconds,
        } = self;

        log_format.try_init(log_level)?;

        let db_config = Arc::new(DbConfig {
            namespaces: namespaces.map(|Namespaces(ns)| ns),
            include_labels: include_label_selectors.filter(|s| !s.is_empty()),
            exclude_labels: exclude_label_selectors.filter(|s| !s.is_empty()),
        });
        debug!(?db_config, "Configured");

        let client = k8s::client(load_config_mode, context).await?;

        let mut prom = <Registry>::default();
        let db_metrics = DbMetrics::register(prom.sub_registry_with_prefix("ingress_db"));
        let lookup_metrics = LookupMetrics::register(prom.sub_registry_with_prefix("lookup"));

        let store = mk_store(cache_enabled, cache_dir)?;
        let builder = Builder::new(KubeIngresses::new(client), db_config, db_metrics.clone());
        let db = CachedDb::new(
            builder,
            store,
            Duration::from_secs(cache_ttl_seconds),
            db_metrics,
        );
        let lookup = Lookup::new(
            Arc::new(db),
            Arc::new(LookupConfig {
                host_header: host_match_on_header,
            }),
            lookup_metrics,
        );

        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

        // The admin server reports not-ready until the lookup listener is
        // bound.
        let admin = admin.into_builder().with_prometheus(prom).bind()?.spawn();

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind lookup server on {addr}"))?;
        info!(%addr, "Ingress host lookup server listening");
        tokio::spawn(
            serve_lookup(listener, lookup, drain)
                .instrument(info_span!("lookup", port = %listen_port)),
        );
        admin.readiness().set(true);

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for in-flight lookups to complete before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn serve_lookup(listener: TcpListener, lookup: Lookup<KubeIngresses>, drain: drain::Watch) {
    let (close_tx, close_rx) = oneshot::channel::<()>();
    tokio::pin! {
        let srv = server::serve(listener, lookup, close_rx.map(drop));
    }
    tokio::select! {
        () = &mut srv => {}
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await;
        }
    }
}

fn mk_store(enabled: bool, dir: Option<PathBuf>) -> Result<Arc<dyn Store>> {
    if !enabled {
        return Ok(Arc::new(NoopStore::default()));
    }
    match dir {
        Some(dir) => {
            let store = DiskStore::new(&dir)
                .with_context(|| format!("failed to open cache directory {}", dir.display()))?;
            info!(dir = %dir.display(), "Caching host database on disk");
            Ok(Arc::new(store))
        }
        None => {
            info!("Caching host database in memory");
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}

impl std::str::FromStr for Namespaces {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let namespaces = s
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if namespaces.is_empty() {
            bail!("at least one namespace must be specified");
        }
        Ok(Self(namespaces))
    }
}
