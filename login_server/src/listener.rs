//! Accept loops for the client and game server ports.
//!
//! Each loop only runs admission and hands the socket over; everything protocol related
//! happens in the spawned connection tasks, so a slow peer never stalls accepting new ones.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use smol::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::admission::{AdmissionGate, Admitted};
use crate::services::Services;

pub type Acceptor = fn(Arc<Services>, TcpStream, SocketAddr, Admitted) -> Result<()>;

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Runs an accept loop until the listener fails; errors are logged, not propagated.
pub async fn accept_connections(listener: TcpListener, gate: Arc<AdmissionGate>, services: Arc<Services>, acceptor: Acceptor) {
    if let Err(e) = accept_connections_impl(listener, gate, services, acceptor).await {
        error!("Error in accept loop: {e:?}");
    }
}

async fn accept_connections_impl(
    listener: TcpListener,
    gate: Arc<AdmissionGate>,
    services: Arc<Services>,
    acceptor: Acceptor,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let ticket = match gate.admit(addr.ip()) {
            Ok(ticket) => ticket,
            Err(reason) => {
                debug!("Refused connection from {addr}: {reason:?}");
                continue;
            }
        };
        if let Err(e) = acceptor(services.clone(), stream, addr, ticket) {
            error!("Could not set up connection from {addr}: {e:?}");
        }
    }
}
