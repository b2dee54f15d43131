use crate::{
    caption::CaptionService, config::ServerConfig, routes::api_routes, telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, broadcast::Receiver, Notify},
    task::JoinHandle,
};

/// Counts live relay connections so shutdown can wait for them to drain.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

pub struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    pub fn register(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Waits until no connection is left, giving up after `grace`.
    /// Returns whether the tracker drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct SharedState {
    pub caption_service: Arc<CaptionService>,
    pub metrics: Arc<Metrics>,
    pub connections: ConnectionTracker,
    pub shutdown_tx: broadcast::Sender<()>,
}

pub struct RelayServer {
    router: Router,
    listener: TcpListener,
    connections: ConnectionTracker,
}

impl RelayServer {
    pub async fn new(
        caption_service: Arc<CaptionService>,
        config: &ServerConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();
        let connections = ConnectionTracker::default();

        let app_state = SharedState {
            caption_service,
            metrics,
            connections: connections.clone(),
            shutdown_tx,
        };

        let router = Router::new()
            .merge(api_routes())
            .with_state(app_state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            router,
            listener,
            connections,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> ConnectionTracker {
        self.connections.clone()
    }

    /// Spawns the accept loop. It stops accepting once `shutdown_rx` fires;
    /// open relay connections are told to close through the same channel.
    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting relay on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        let mut shutdown_rx = shutdown_rx;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, service)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            tracing::info!("Relay stopped accepting connections");
            Ok::<(), anyhow::Error>(())
        });

        Ok(server_handle)
    }
}
