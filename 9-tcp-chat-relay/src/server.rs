use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    message::{DEFAULT_MAX_MESSAGE, Message},
    registry::{ConnectionId, ConnectionRegistry, ReadOutcome},
};

pub const DEFAULT_PORT: u16 = 7007;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a received message is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RelayMode {
    /// Write the message back to the connection that sent it.
    #[default]
    Echo,
    /// Write the message to every connection except the sender.
    Broadcast,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on each readiness wait, and on the idle wait when nobody is connected.
    pub wait_timeout: Duration,
    /// Capacity of the dispatch read buffer.
    pub max_message: usize,
    pub mode: RelayMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            max_message: DEFAULT_MAX_MESSAGE,
            mode: RelayMode::default(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(ConnectionRegistry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Runs the accept task and the dispatch loop until `shutdown` resolves or dispatch fails.
    ///
    /// Either way the listening socket is released and every client connection is closed.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        let acceptor = spawn_accept_loop(listener, &registry);
        let mut dispatcher = Dispatcher::new(Arc::clone(&registry), config);

        let result = select! {
            _ = &mut shutdown => {
                info!("server shutting down");
                Ok(())
            }
            result = dispatcher.run() => result,
        };

        acceptor.abort();
        let _ = acceptor.await;
        let closed = registry.close_all().await;
        info!(closed, "closed client connections");

        result
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

fn spawn_accept_loop(
    listener: TcpListener,
    registry: &Arc<ConnectionRegistry>,
) -> tokio::task::JoinHandle<()> {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = accept_loop(listener, registry).await {
            error!(error = ?err, "no longer accepting connections");
        }
    })
}

async fn accept_loop(listener: TcpListener, registry: Arc<ConnectionRegistry>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => register_connection(stream, peer, &registry).await,
            Err(err) if is_transient_accept_error(&err) => {
                warn!(error = ?err, "failed to accept connection, retrying");
            }
            Err(err) => return Err(err).context("accept failed"),
        }
    }
}

async fn register_connection(stream: TcpStream, peer: SocketAddr, registry: &ConnectionRegistry) {
    let id = registry.add(stream, peer).await;
    info!(id, %peer, "client connected");
}

/// Errors that only concern the one connection being accepted.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// What one dispatch iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nobody was connected; waited for an arrival instead of a readiness wait.
    Idle,
    /// The readiness wait elapsed without activity.
    TimedOut,
    /// Activity was reported but no registered connection had data.
    Spurious,
    Relayed(ConnectionId),
    Quit(ConnectionId),
    Disconnected(ConnectionId),
}

/// The server's steady-state loop: one readiness wait and at most one serviced connection per step.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
    buffer: Vec<u8>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, config: ServerConfig) -> Self {
        let buffer = vec![0; config.max_message.max(1)];
        Self {
            registry,
            config,
            buffer,
        }
    }

    /// Steps until a fatal error.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.step().await?;
        }
    }

    pub async fn step(&mut self) -> Result<Step> {
        let targets = self.registry.build_readiness_set().await;
        if targets.is_empty() {
            self.registry
                .wait_for_arrival(self.config.wait_timeout)
                .await;
            return Ok(Step::Idle);
        }

        let ready = targets
            .wait(self.config.wait_timeout)
            .await
            .context("readiness wait failed")?;
        if ready.is_empty() {
            return Ok(Step::TimedOut);
        }

        let Some((id, outcome)) = self
            .registry
            .read_next_ready_message(&ready, &mut self.buffer)
            .await
        else {
            return Ok(Step::Spurious);
        };

        match outcome {
            ReadOutcome::Data(len) => Ok(self.handle_message(id, len).await),
            ReadOutcome::EndOfStream => {
                self.disconnect(id, "peer closed the connection").await;
                Ok(Step::Disconnected(id))
            }
            ReadOutcome::Failed(err) => {
                warn!(id, error = ?err, "read failed");
                self.disconnect(id, "read failed").await;
                Ok(Step::Disconnected(id))
            }
        }
    }

    async fn handle_message(&self, id: ConnectionId, len: usize) -> Step {
        let bytes = &self.buffer[..len];
        let message = Message::parse(bytes);
        info!(id, text = message.text(), "recv");

        if let Some(label) = message.label().filter(|label| !label.is_empty()) {
            self.registry.learn_name(id, label).await;
        }

        if message.is_quit() {
            self.disconnect(id, "client quit").await;
            return Step::Quit(id);
        }

        match self.config.mode {
            RelayMode::Echo => self.echo(id, bytes).await,
            RelayMode::Broadcast => self.broadcast(id, bytes).await,
        }
    }

    async fn echo(&self, id: ConnectionId, bytes: &[u8]) -> Step {
        let Some(stream) = self.registry.stream(id).await else {
            return Step::Disconnected(id);
        };
        if let Err(err) = write_all(&stream, bytes).await {
            warn!(id, error = ?err, "echo failed");
            drop(stream);
            self.disconnect(id, "write failed").await;
            return Step::Disconnected(id);
        }
        debug!(id, "sent echo");
        Step::Relayed(id)
    }

    async fn broadcast(&self, sender: ConnectionId, bytes: &[u8]) -> Step {
        for (id, stream) in self.registry.peers_except(sender).await {
            if let Err(err) = write_all(&stream, bytes).await {
                warn!(id, error = ?err, "broadcast delivery failed");
                drop(stream);
                self.disconnect(id, "write failed").await;
            }
        }
        Step::Relayed(sender)
    }

    async fn disconnect(&self, id: ConnectionId, reason: &str) {
        if let Some(connection) = self.registry.remove(id).await {
            info!(
                id,
                peer = %connection.peer(),
                name = connection.name().unwrap_or("-"),
                reason,
                "client disconnected"
            );
        }
    }
}

/// Writes all of `bytes` to a shared stream, waiting for writability as needed.
async fn write_all(stream: &TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        stream.writable().await?;
        match stream.try_write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_accept_errors_are_retried() {
        let transient = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(is_transient_accept_error(&transient));

        let fatal = io::Error::other("too many open files");
        assert!(!is_transient_accept_error(&fatal));
    }

    #[test]
    fn default_config_matches_reference_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message, 256);
        assert_eq!(config.mode, RelayMode::Echo);
    }

    #[tokio::test]
    async fn idle_step_returns_after_wait_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let config = ServerConfig {
            wait_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let mut dispatcher = Dispatcher::new(registry, config);
        let step = dispatcher.step().await.expect("step");
        assert_eq!(step, Step::Idle);
    }
}
