use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{
    command::CommandRouter,
    registry::SessionRegistry,
    session::{SendError, Session},
};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Accepts TCP connections and runs one reader task plus one outbox writer
/// task per connected client. All shared state lives in the registry; the
/// router is wired to it once at construction.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    router: Arc<CommandRouter>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(CommandRouter::new(Arc::clone(&registry)));
        Self {
            listener,
            registry,
            router,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` completes, then announces the
    /// shutdown and closes every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            router,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    registry.broadcast("*** server shutting down");
                    registry.close_all();
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => spawn_connection(stream, peer, &registry, &router),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<SessionRegistry>,
    router: &Arc<CommandRouter>,
) {
    let registry = Arc::clone(registry);
    let router = Arc::clone(router);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, registry, router).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    router: Arc<CommandRouter>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (session, outbox) = Session::new();

    registry.add(Arc::clone(&session));
    info!(%peer, session = session.id(), clients = registry.len(), "client connected");

    let writer = tokio::spawn(drain_outbox(
        outbox,
        write_half,
        session.subscribe_closed(),
    ));

    let result = read_commands(read_half, &session, &router).await;

    registry.remove(session.id());
    session.close();
    let _ = writer.await;
    info!(%peer, session = session.id(), clients = registry.len(), "client disconnected");

    result
}

/// Reads command lines and dispatches them until the client hangs up or the
/// session is closed (by `/exit` or shutdown). A `Closed` reply failure
/// means the invoking session itself is unreachable, so the connection is
/// done; a `Full` one only costs that reply (drop-newest policy) and the
/// session stays connected.
async fn read_commands<R>(
    read_half: R,
    session: &Arc<Session>,
    router: &CommandRouter,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(());
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        match router.dispatch(trimmed, session) {
            Ok(()) => {}
            Err(SendError::Full) => {
                debug!(session = session.id(), "outbox full, dropping reply");
            }
            Err(SendError::Closed) => return Err(SendError::Closed.into()),
        }
        if session.is_closed() {
            return Ok(());
        }
    }
}

/// Drains a session's outbox into the connection's write half. Ends when
/// the outbox closes, the session is closed, or a write fails; the write
/// half is shut down on the way out so the peer sees EOF.
async fn drain_outbox(
    mut outbox: mpsc::Receiver<String>,
    mut writer: OwnedWriteHalf,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        select! {
            maybe_line = outbox.recv() => match maybe_line {
                Some(line) => {
                    if let Err(error) = write_line(&mut writer, &line).await {
                        debug!(?error, "failed to deliver line to client");
                        break;
                    }
                }
                None => break,
            },
            // The async block drops the watch read guard before the branch
            // body awaits, keeping this future Send.
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                // Flush lines already buffered (e.g. the shutdown notice)
                // before hanging up.
                while let Ok(line) = outbox.try_recv() {
                    if write_line(&mut writer, &line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
