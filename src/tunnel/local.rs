use crate::error::MuxResult;
use crate::transport::Connection;
use crate::tunnel::pipe::pipe;
use crate::tunnel::{Tunnel, accept_loop, bind_listener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Bind the listener and start accepting. Each accepted socket gets its own
/// forwarded channel to `remote_host:remote_port`.
pub(super) async fn start(tunnel: &Arc<Tunnel>, connection: Arc<dyn Connection>) -> MuxResult<JoinHandle<()>> {
    let listener = bind_listener(tunnel).await?;
    let owner = tunnel.clone();
    let peer_tunnel = tunnel.clone();
    Ok(tokio::spawn(accept_loop(listener, owner, move |socket, peer| {
        forward_peer(peer_tunnel.clone(), connection.clone(), socket, peer)
    })))
}

async fn forward_peer(tunnel: Arc<Tunnel>, connection: Arc<dyn Connection>, socket: TcpStream, peer: SocketAddr) {
    let spec = &tunnel.spec;
    let channel = match connection
        .forward_out(&peer.ip().to_string(), peer.port(), &spec.remote_host, spec.remote_port)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            tracing::debug!(tunnel_id = %spec.id, %peer, error = %err, "Forwarded channel refused");
            return;
        }
    };

    match pipe(socket, channel, &tunnel.bytes_out, &tunnel.bytes_in).await {
        Ok(closed_by) => {
            tracing::debug!(tunnel_id = %spec.id, %peer, ?closed_by, "Peer closed");
        }
        Err(err) => {
            tracing::debug!(tunnel_id = %spec.id, %peer, error = %err, "Peer pipe ended with error");
        }
    }
}
