//! Address resolution and connection establishment.
//!
//! A network endpoint resolves to an ordered candidate list (resolver
//! order is preserved, v4/v6 interleaving included) and candidates are
//! attempted one by one until a connect succeeds. A tunnel endpoint skips
//! resolution and spawns a subprocess whose stdio pair becomes the
//! transport. The caller bounds the whole attempt with the configured
//! timeout.

use std::net::SocketAddr;
use std::process::Stdio;

use tokio::net::{TcpStream, lookup_host};
use tokio::process::Command;

use super::config::{Endpoint, ServerConfig};
use super::stream::RawStream;
use crate::{Error, Result};

/// Establishes the raw transport for the configured endpoint.
///
/// Returns the stream plus the connection's diagnostic name, derived from
/// the configuration and (for network endpoints) the resolved address.
pub(crate) async fn establish(config: &ServerConfig) -> Result<(RawStream, String)> {
    match &config.endpoint {
        Endpoint::Net { host, port } => connect_net(host, *port).await,
        Endpoint::Tunnel { command } => spawn_tunnel(command),
    }
}

async fn connect_net(host: &str, port: u16) -> Result<(RawStream, String)> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::Resolve(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::Resolve(format!("{host}: no addresses")));
    }

    let mut last_err = None;
    for addr in addrs {
        tracing::trace!(%addr, "attempting connect");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let name = format!("{host} ({})", addr.ip());
                tracing::debug!(name = %name, "connected");
                return Ok((RawStream::Tcp(stream), name));
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed, trying next candidate");
                last_err = Some(e);
            }
        }
    }
    // last_err is always set here: the candidate list was non-empty.
    let detail = last_err.map_or_else(String::new, |e| e.to_string());
    Err(Error::Connect(format!("{host}:{port}: {detail}")))
}

fn spawn_tunnel(command: &str) -> Result<(RawStream, String)> {
    tracing::debug!(command, "spawning tunnel");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Connect(format!("tunnel '{command}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Connect(format!("tunnel '{command}': no stdin")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Connect(format!("tunnel '{command}': no stdout")))?;

    let name = format!("tunnel: {command}");
    Ok((
        RawStream::Tunnel {
            _child: child,
            stdin,
            stdout,
        },
        name,
    ))
}
