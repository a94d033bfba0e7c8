use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use checker::{Checker, CheckerMetrics};
use strata_config::Config;
use vault_store::ObjectStoreFactory;

/// Run the checker daemon until interrupted.
pub async fn run(config: Config) -> Result<(), Error> {
    let txn_kv = meta_kv::connect(&config.kv_url).map_err(Error::KvConnect)?;

    let metrics = Arc::new(CheckerMetrics::new());
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
    let _exporter = prometheus_exporter::start(addr).map_err(Error::MetricsExporter)?;

    // The lessee identity written into job records; another process seeing
    // it can tell who holds a lease.
    let lessee = format!("{}:{}", local_ip(), config.listen_port);

    let daemon = Checker::new(
        txn_kv,
        Arc::new(config),
        Arc::new(ObjectStoreFactory),
        metrics,
        lessee.clone(),
    );
    daemon.start();
    tracing::info!(lessee = %lessee, "checker daemon started");

    tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
    tracing::info!("shutdown requested, stopping checker daemon");
    daemon.stop().await;

    Ok(())
}

/// The IP this host routes external traffic through, falling back to
/// loopback when no route is available.
fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Errors that can occur while running the checker daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to connect to the KV store.
    #[error("failed to connect to kv store: {0}")]
    KvConnect(#[source] meta_kv::ConnectError),

    /// Failed to start the Prometheus exporter.
    #[error("failed to start metrics exporter: {0}")]
    MetricsExporter(#[source] prometheus_exporter::Error),

    /// Failed to install the interrupt handler.
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
