//! The client socket server.
//!
//! One listener, one connection task per client; every request is
//! serialised through a single mutex around the dispatch context, so the
//! model sees one mutation at a time no matter how many clients are
//! connected. The only background activity is the reconciliation tick that
//! observes payload exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use corral_container::Cred;
use corral_protocol::{read_message, write_message, ContainerRequest};

use crate::rpc::{self, Context};

/// Accept loop over the daemon socket.
pub struct Server {
    socket_path: PathBuf,
    ctx: Arc<Mutex<Context>>,
}

impl Server {
    /// Builds a server around shared dispatch state.
    pub fn new(socket_path: impl Into<PathBuf>, ctx: Arc<Mutex<Context>>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ctx,
        }
    }

    /// Binds the socket (unlinking any stale one) and serves until the
    /// task is cancelled.
    pub async fn run(&self) -> Result<()> {
        remove_stale_socket(&self.socket_path)?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!("failed to bind socket {}", self.socket_path.display())
        })?;
        info!(socket = %self.socket_path.display(), "listening");

        loop {
            let (stream, _addr) = listener.accept().await.context("accept failed")?;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx).await {
                    debug!(error = %e, "connection closed");
                }
            });
        }
    }
}

/// Reads requests off one connection until EOF, dispatching each under the
/// context lock and writing back the response unless it was suppressed.
async fn handle_connection(mut stream: UnixStream, ctx: Arc<Mutex<Context>>) -> Result<()> {
    let peer = stream.peer_cred().context("can't read peer credentials")?;
    let cred = Cred::new(peer.uid(), peer.gid());

    loop {
        let Some(req) = read_message::<_, ContainerRequest>(&mut stream).await? else {
            return Ok(());
        };

        let rsp = {
            let mut ctx = ctx.lock().await;
            rpc::handle_request(&mut ctx, &req, cred).await
        };

        if let Some(rsp) = rsp {
            write_message(&mut stream, &rsp).await?;
        }
    }
}

/// Periodically observes payload exits (`Running -> Dead`) under the same
/// lock the dispatcher uses.
pub fn spawn_reconciler(ctx: Arc<Mutex<Context>>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(10)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            ctx.lock().await.cholder.reconcile_exits();
        }
    })
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(socket = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("can't remove {}", path.display())),
    }
}
