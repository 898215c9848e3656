//! Per-connection request handling.
//!
//! ```text
//! AwaitCommand --SHM_CREATE--> Creating  --ok--> Leased --EOF/data/teardown--> release
//!              --SHM_ATTACH--> Attaching --ok--> Leased
//!              --SHUTDOWN--> raise shutdown
//!              --EOF/unknown--> close
//! ```

use super::ShutdownHandle;
use super::actor::RegistryHandle;
use crate::error::ShmResult;
use crate::registry::LeaseId;
use shmb::protocol::{Command, complete_reply, read_command, read_string, read_u64};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Releases a lease when dropped, whichever way the handler exits.
struct LeaseGuard {
    registry: RegistryHandle,
    name: String,
    lease: LeaseId,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.lease);
    }
}

/// Shared state every connection handler needs
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub registry: RegistryHandle,
    pub shutdown: ShutdownHandle,
    pub teardown: watch::Receiver<bool>,
}

/// Drive one control connection to completion.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    lease: LeaseId,
    mut ctx: ConnectionContext,
) -> ShmResult<()> {
    let Some(command) = read_command(&mut stream).await? else {
        debug!(%peer, "connection closed before a command");
        return Ok(());
    };

    let name = match command {
        Command::Shutdown => {
            info!(%peer, "shutdown requested");
            ctx.shutdown.trigger();
            return Ok(());
        }
        Command::ShmCreate => {
            let num_buffers = read_u64(&mut stream).await?;
            let buf_size = read_u64(&mut stream).await?;
            match ctx.registry.create(num_buffers, buf_size, lease).await {
                Ok(name) => name,
                Err(e) => {
                    warn!(%peer, num_buffers, buf_size, error = %e, "segment creation failed");
                    return Ok(());
                }
            }
        }
        Command::ShmAttach => {
            let name = read_string(&mut stream).await?;
            if !ctx.registry.attach(&name, lease).await {
                debug!(%peer, %name, "attach to unknown segment");
                return Ok(());
            }
            name
        }
        Command::Complete => {
            debug!(%peer, "unexpected COMPLETE from client");
            return Ok(());
        }
    };

    // The lease is counted from here on; the reply only follows it.
    let _guard = LeaseGuard {
        registry: ctx.registry.clone(),
        name: name.clone(),
        lease,
    };

    stream.write_all(&complete_reply(&name)).await?;
    stream.flush().await?;
    debug!(%peer, %name, lease, "lease granted");

    let mut byte = [0u8; 1];
    tokio::select! {
        result = stream.read(&mut byte) => match result {
            Ok(0) => debug!(%peer, %name, "lease holder disconnected"),
            Ok(_) => debug!(%peer, %name, "unexpected data on leased connection"),
            Err(e) => debug!(%peer, %name, error = %e, "leased connection failed"),
        },
        _ = ctx.teardown.wait_for(|closing| *closing) => {
            debug!(%peer, %name, "closing lease on broker teardown");
        }
    }

    Ok(())
}
