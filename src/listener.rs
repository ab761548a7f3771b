//! Loopback listener helpers.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::TcpListener;

/// Bind an ephemeral TCP listener confined to the IPv4 loopback.
///
/// Endpoints must never bind a routable address: the pod's network namespace
/// is the isolation boundary that keeps them unreachable from the host.
pub async fn bind_loopback() -> Result<(TcpListener, u16)> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    let listener = TcpListener::bind(addr)
        .await
        .context("bind loopback listener")?;
    let port = listener
        .local_addr()
        .context("local listener address")?
        .port();
    Ok((listener, port))
}
