use crate::error::MuxResult;
use crate::transport::Connection;
use crate::tunnel::pipe::pipe;
use crate::tunnel::socks::{self, REPLY_GENERAL_FAILURE, SUCCESS_REPLY};
use crate::tunnel::{Tunnel, accept_loop, bind_listener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Bind a SOCKS5 endpoint; every CONNECT becomes a forwarded channel.
pub(super) async fn start(tunnel: &Arc<Tunnel>, connection: Arc<dyn Connection>) -> MuxResult<JoinHandle<()>> {
    let listener = bind_listener(tunnel).await?;
    let owner = tunnel.clone();
    let peer_tunnel = tunnel.clone();
    Ok(tokio::spawn(accept_loop(listener, owner, move |socket, peer| {
        serve_socks(peer_tunnel.clone(), connection.clone(), socket, peer)
    })))
}

async fn serve_socks(tunnel: Arc<Tunnel>, connection: Arc<dyn Connection>, mut socket: TcpStream, peer: SocketAddr) {
    let spec = &tunnel.spec;
    let target = match socks::accept_request(&mut socket).await {
        Ok(target) => target,
        Err(err) => {
            tracing::debug!(tunnel_id = %spec.id, %peer, code = %err.code(), error = %err, "SOCKS handshake rejected");
            return;
        }
    };

    let channel = match connection
        .forward_out(&peer.ip().to_string(), peer.port(), &target.host, target.port)
        .await
    {
        Ok(channel) => channel,
        Err(err) => {
            tracing::debug!(
                tunnel_id = %spec.id,
                host = %target.host,
                port = target.port,
                error = %err,
                "SOCKS target unreachable"
            );
            let _ = socks::send_reply(&mut socket, REPLY_GENERAL_FAILURE).await;
            return;
        }
    };

    if let Err(err) = socket.write_all(&SUCCESS_REPLY).await {
        tracing::debug!(tunnel_id = %spec.id, %peer, error = %err, "SOCKS client went away");
        return;
    }

    match pipe(socket, channel, &tunnel.bytes_out, &tunnel.bytes_in).await {
        Ok(closed_by) => {
            tracing::debug!(tunnel_id = %spec.id, host = %target.host, ?closed_by, "SOCKS connection closed");
        }
        Err(err) => {
            tracing::debug!(tunnel_id = %spec.id, host = %target.host, error = %err, "SOCKS pipe ended with error");
        }
    }
}
