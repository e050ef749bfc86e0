use crate::error::MuxResult;
use crate::transport::{Connection, InboundConnection};
use crate::tunnel::Tunnel;
use crate::tunnel::pipe::pipe;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Ask the server to listen on `remote_host:remote_port`. Resolves once the
/// server has accepted the request.
pub(super) async fn start(tunnel: &Arc<Tunnel>, connection: Arc<dyn Connection>) -> MuxResult<JoinHandle<()>> {
    let spec = &tunnel.spec;
    let mut inbound = connection.forward_in(&spec.remote_host, spec.remote_port).await?;
    tracing::debug!(
        tunnel_id = %spec.id,
        remote_host = %spec.remote_host,
        remote_port = spec.remote_port,
        "Remote listener requested"
    );

    let tunnel = tunnel.clone();
    Ok(tokio::spawn(async move {
        while let Some(incoming) = inbound.recv().await {
            tunnel.spawn_peer(serve_inbound(tunnel.clone(), incoming));
        }
        tracing::debug!(tunnel_id = %tunnel.spec.id, "Remote listener closed");
    }))
}

async fn serve_inbound(tunnel: Arc<Tunnel>, incoming: InboundConnection) {
    let spec = &tunnel.spec;
    let origin = format!("{}:{}", incoming.originator_address, incoming.originator_port);
    let socket = match TcpStream::connect((spec.local_host.as_str(), spec.local_port)).await {
        Ok(socket) => socket,
        Err(err) => {
            // Dropping the stream closes the forwarded channel.
            tracing::debug!(tunnel_id = %spec.id, %origin, error = %err, "Local destination unreachable");
            return;
        }
    };

    match pipe(socket, incoming.stream, &tunnel.bytes_out, &tunnel.bytes_in).await {
        Ok(closed_by) => {
            tracing::debug!(tunnel_id = %spec.id, %origin, ?closed_by, "Forwarded connection closed");
        }
        Err(err) => {
            tracing::debug!(tunnel_id = %spec.id, %origin, error = %err, "Forwarded connection ended with error");
        }
    }
}
