use std::{
    io::{self, BufRead},
    net::SocketAddr,
    thread,
};

use anyhow::{Context, Result, anyhow};
use futures::FutureExt;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{self, DEFAULT_MAX_MESSAGE},
    server::DEFAULT_PORT,
};

/// Lines typed by the user. The channel closing means the keyboard reached end-of-file.
pub type Keyboard = mpsc::Receiver<io::Result<String>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Capacity of the receive buffer.
    pub max_message: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_message: DEFAULT_MAX_MESSAGE,
        }
    }
}

/// Why a session loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user typed an exit token, which was sent before stopping.
    UserQuit,
    KeyboardClosed,
    ServerClosed,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::from(&args);
    let mut keyboard = spawn_keyboard_reader();
    let mut terminal = tokio::io::stdout();

    write_terminal(
        &mut terminal,
        "### tcp chat relay client ###\n# Type 'quit' or 'exit' to leave.\n",
    )
    .await?;
    let username = match args.username {
        Some(username) => username,
        None => prompt_username(&mut keyboard, &mut terminal).await?,
    };
    message::validate_username(&username)
        .map_err(|reason| anyhow!("invalid username: {reason}"))?;

    let stream = TcpStream::connect(config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;
    info!("connected to {}", config.server);

    let mut session = ClientSession::new(stream, username, config.max_message);
    let end = session.run(&mut keyboard, &mut terminal).await;
    session.close().await;

    info!(?end, "session ended");
    end.map(|_| ())
}

/// Reads stdin on a dedicated thread.
///
/// A blocking stdin read cannot be cancelled, and one parked on the runtime's
/// blocking pool would hold up shutdown until the user pressed enter.
fn spawn_keyboard_reader() -> Keyboard {
    let (tx, rx) = mpsc::channel(16);
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.blocking_send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn prompt_username<W>(keyboard: &mut Keyboard, terminal: &mut W) -> Result<String>
where
    W: AsyncWrite + Unpin,
{
    write_terminal(terminal, "Enter your username: ").await?;
    let line = keyboard
        .recv()
        .await
        .transpose()?
        .context("keyboard closed before a username was entered")?;
    Ok(line.trim().to_string())
}

/// One connected client: multiplexes keyboard lines and server data over a single wait.
pub struct ClientSession {
    stream: TcpStream,
    username: String,
    buffer: Vec<u8>,
}

/// Sources found ready by one wait. Either or both may be set.
struct Readiness {
    keyboard: Option<io::Result<Option<String>>>,
    socket: bool,
}

impl ClientSession {
    pub fn new(stream: TcpStream, username: String, max_message: usize) -> Self {
        Self {
            stream,
            username,
            buffer: vec![0; max_message.max(1)],
        }
    }

    pub async fn run<W>(
        &mut self,
        keyboard: &mut Keyboard,
        terminal: &mut W,
    ) -> Result<SessionEnd>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            write_terminal(terminal, &format!("{}: ", self.username)).await?;

            let ready = self.wait_for_input(keyboard).await?;
            let mut end = None;

            if let Some(line) = ready.keyboard {
                end = self.handle_keyboard(line).await?;
            }
            if ready.socket {
                end = end.or(self.handle_socket(terminal).await?);
            }

            if let Some(end) = end {
                return Ok(end);
            }
        }
    }

    /// Shuts down the write half so the server sees end-of-stream.
    pub async fn close(&mut self) {
        if let Err(error) = self.stream.shutdown().await {
            warn!(?error, "failed to shutdown client socket cleanly");
        }
    }

    /// Waits until the keyboard or the socket is ready, then checks the other without blocking.
    async fn wait_for_input(&self, keyboard: &mut Keyboard) -> Result<Readiness> {
        let stream = &self.stream;
        select! {
            line = keyboard.recv() => {
                let socket = match stream.readable().now_or_never() {
                    Some(ready) => {
                        ready.context("socket readiness check failed")?;
                        true
                    }
                    None => false,
                };
                Ok(Readiness { keyboard: Some(line.transpose()), socket })
            }
            ready = stream.readable() => {
                ready.context("socket readiness wait failed")?;
                let line = keyboard.recv().now_or_never().map(Option::transpose);
                Ok(Readiness { keyboard: line, socket: true })
            }
        }
    }

    async fn handle_keyboard(
        &mut self,
        line: io::Result<Option<String>>,
    ) -> Result<Option<SessionEnd>> {
        let Some(line) = line.context("failed to read keyboard")? else {
            return Ok(Some(SessionEnd::KeyboardClosed));
        };
        let line = line.trim_end_matches('\r');

        self.stream
            .write_all(message::compose(&self.username, line).as_bytes())
            .await
            .context("failed to send message")?;

        if message::is_client_exit(line) {
            return Ok(Some(SessionEnd::UserQuit));
        }
        Ok(None)
    }

    async fn handle_socket<W>(&mut self, terminal: &mut W) -> Result<Option<SessionEnd>>
    where
        W: AsyncWrite + Unpin,
    {
        match self.stream.try_read(&mut self.buffer) {
            Ok(0) => {
                write_terminal(terminal, "\n*** server closed the connection\n").await?;
                Ok(Some(SessionEnd::ServerClosed))
            }
            Ok(n) => {
                let text = String::from_utf8_lossy(&self.buffer[..n]);
                write_terminal(terminal, &format!("\nrecv: {text}\n")).await?;
                Ok(None)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err).context("failed to read from server"),
        }
    }
}

/// Writes and flushes so the text is visible before the next blocking wait.
async fn write_terminal<W>(terminal: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    terminal.write_all(text.as_bytes()).await?;
    terminal.flush().await
}
