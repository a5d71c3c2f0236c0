//! Client endpoint: connect, authenticate, then drive command, completion
//! and help requests while relaying streamed stdout/stderr chunks.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::errors::ProtocolError;
use crate::exec::CancelFlag;
use crate::wire::{read_frame, tags, write_frame, Frame, Opcode};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    WaitCmd,
    WaitCompletion,
    WaitHelp,
    Disconnected,
}

/// Completed command: final status plus the collected stream bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub status: i32,
    pub cancelled: bool,
    /// Server signalled session end; the connection is about to close.
    pub done: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionReply {
    pub prefix: String,
    pub candidates: Vec<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HelpReply {
    pub items: Vec<(String, String)>,
    pub error: Option<String>,
}

/// Streamed output observed while a command runs.
pub enum ExecEvent<'a> {
    Stdout(&'a [u8]),
    Stderr(&'a [u8]),
}

pub struct ClientSession {
    reader: OwnedReadHalf,
    out_tx: Arc<ArcSwapOption<mpsc::Sender<Frame>>>,
    writer_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    state: ClientState,
    user: Option<String>,
}

impl ClientSession {
    /// Connect to the daemon socket and run the auth handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|err| ProtocolError::Io(format!("connect {:?}: {err}", config.socket_path)))?;
        let (mut reader, mut writer) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<Frame>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        });

        let user = config.user.clone().or_else(|| std::env::var("USER").ok());
        let mut auth = Frame::new(Opcode::Auth);
        if let Some(user) = &user {
            auth = auth.with_str(tags::USER, user);
        }
        tx.send(auth)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let ack = read_frame(&mut reader)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;
        if ack.opcode != Opcode::AuthAck {
            return Err(ProtocolError::UnexpectedOpcode {
                opcode: ack.opcode.as_char(),
                state: "auth".to_owned(),
            });
        }
        if let Some(error) = ack.first_str(tags::ERROR) {
            return Err(ProtocolError::AuthFailed(error.to_owned()));
        }

        let keepalive_task = config.keepalive_interval.map(|interval| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tx.send(Frame::new(Opcode::Keepalive)).await.is_err() {
                        break;
                    }
                }
            })
        });

        Ok(Self {
            reader,
            out_tx: Arc::new(ArcSwapOption::from_pointee(tx)),
            writer_task: Some(writer_task),
            keepalive_task,
            state: ClientState::Idle,
            user,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Handle for streaming stdin chunks while a command runs.
    pub fn stdin_writer(&self) -> StdinWriter {
        StdinWriter {
            out_tx: Arc::clone(&self.out_tx),
        }
    }

    /// Run one command, collecting all streamed output.
    pub async fn exec(&mut self, line: &str) -> Result<CommandResult, ProtocolError> {
        self.exec_with(line, None, |_event| {}).await
    }

    /// Run one command with optional cancellation and a streaming observer.
    /// Chunks arriving before the ack are both surfaced and collected.
    pub async fn exec_with(
        &mut self,
        line: &str,
        cancel: Option<CancelFlag>,
        mut on_event: impl FnMut(ExecEvent<'_>),
    ) -> Result<CommandResult, ProtocolError> {
        self.ensure_idle('c')?;
        self.send(Frame::new(Opcode::Cmd).with_str(tags::LINE, line))
            .await?;
        self.state = ClientState::WaitCmd;

        let mut result = CommandResult::default();
        let mut cancel_requested = false;
        loop {
            let maybe_frame = match (&cancel, cancel_requested) {
                (Some(cancel), false) => {
                    tokio::select! {
                        maybe = read_frame(&mut self.reader) => maybe,
                        _ = cancel.cancelled() => {
                            cancel_requested = true;
                            let frame =
                                Frame::new(Opcode::Notification).with_str(tags::REASON, "cancel");
                            self.send(frame).await?;
                            continue;
                        }
                    }
                }
                _ => read_frame(&mut self.reader).await,
            };
            let frame = self.expect_frame(maybe_frame)?;
            match frame.opcode {
                Opcode::Stdout => {
                    if let Some(chunk) = frame.first(tags::CHUNK) {
                        on_event(ExecEvent::Stdout(chunk));
                        result.stdout.extend_from_slice(chunk);
                    }
                }
                Opcode::Stderr => {
                    if let Some(chunk) = frame.first(tags::CHUNK) {
                        on_event(ExecEvent::Stderr(chunk));
                        result.stderr.extend_from_slice(chunk);
                    }
                }
                Opcode::Keepalive => {}
                Opcode::CmdAck => {
                    result.status = frame
                        .first_str(tags::RETCODE)
                        .and_then(|text| text.parse::<i32>().ok())
                        .unwrap_or(-1);
                    result.cancelled = frame.has(tags::CANCELLED);
                    result.done = frame.has(tags::DONE);
                    result.error = frame.first_str(tags::ERROR).map(str::to_owned);
                    self.state = if result.done {
                        ClientState::Disconnected
                    } else {
                        ClientState::Idle
                    };
                    return Ok(result);
                }
                other => return Err(self.unexpected(other)),
            }
        }
    }

    /// Completion request for a partial line.
    pub async fn complete(&mut self, line: &str) -> Result<CompletionReply, ProtocolError> {
        self.ensure_idle('v')?;
        self.send(Frame::new(Opcode::Completion).with_str(tags::LINE, line))
            .await?;
        self.state = ClientState::WaitCompletion;

        loop {
            let maybe_frame = read_frame(&mut self.reader).await;
            let frame = self.expect_frame(maybe_frame)?;
            match frame.opcode {
                Opcode::Keepalive => {}
                Opcode::CompletionAck => {
                    self.state = ClientState::Idle;
                    return Ok(CompletionReply {
                        prefix: frame.first_str(tags::PREFIX).unwrap_or("").to_owned(),
                        candidates: frame
                            .all(tags::CANDIDATE)
                            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                            .collect(),
                        error: frame.first_str(tags::ERROR).map(str::to_owned),
                    });
                }
                other => return Err(self.unexpected(other)),
            }
        }
    }

    /// Contextual help request for a partial line.
    pub async fn help(&mut self, line: &str) -> Result<HelpReply, ProtocolError> {
        self.ensure_idle('h')?;
        self.send(Frame::new(Opcode::Help).with_str(tags::LINE, line))
            .await?;
        self.state = ClientState::WaitHelp;

        loop {
            let maybe_frame = read_frame(&mut self.reader).await;
            let frame = self.expect_frame(maybe_frame)?;
            match frame.opcode {
                Opcode::Keepalive => {}
                Opcode::HelpAck => {
                    self.state = ClientState::Idle;
                    let names: Vec<String> = frame
                        .all(tags::HELP_NAME)
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .collect();
                    let texts: Vec<String> = frame
                        .all(tags::HELP_TEXT)
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .collect();
                    return Ok(HelpReply {
                        items: names.into_iter().zip(texts).collect(),
                        error: frame.first_str(tags::ERROR).map(str::to_owned),
                    });
                }
                other => return Err(self.unexpected(other)),
            }
        }
    }

    /// Announce exit and tear the connection down.
    pub async fn exit(mut self) {
        let _ = self.send(Frame::new(Opcode::Exit)).await;
        self.state = ClientState::Disconnected;
        self.teardown().await;
    }

    async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        let Some(tx) = self.out_tx.load_full() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        tx.send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn ensure_idle(&self, opcode: char) -> Result<(), ProtocolError> {
        if self.state != ClientState::Idle {
            return Err(ProtocolError::UnexpectedOpcode {
                opcode,
                state: format!("{:?}", self.state),
            });
        }
        Ok(())
    }

    fn expect_frame(
        &mut self,
        maybe_frame: Result<Option<Frame>, ProtocolError>,
    ) -> Result<Frame, ProtocolError> {
        match maybe_frame {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                self.state = ClientState::Disconnected;
                self.out_tx.store(None);
                Err(ProtocolError::ConnectionClosed)
            }
            Err(err) => {
                self.state = ClientState::Disconnected;
                self.out_tx.store(None);
                Err(err)
            }
        }
    }

    fn unexpected(&mut self, opcode: Opcode) -> ProtocolError {
        let state = format!("{:?}", self.state);
        self.state = ClientState::Disconnected;
        ProtocolError::UnexpectedOpcode {
            opcode: opcode.as_char(),
            state,
        }
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
        self.out_tx.store(None);
        if let Some(task) = self.writer_task.take() {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    tracing::debug!(error = %err, "writer task join failed");
                }
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
        self.out_tx.store(None);
    }
}

/// Clonable stdin feeder usable while `exec_with` is in flight.
#[derive(Clone)]
pub struct StdinWriter {
    out_tx: Arc<ArcSwapOption<mpsc::Sender<Frame>>>,
}

impl StdinWriter {
    pub async fn send(&self, chunk: impl Into<Vec<u8>>) -> Result<(), ProtocolError> {
        let Some(tx) = self.out_tx.load_full() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        tx.send(Frame::new(Opcode::Stdin).with_bytes(tags::CHUNK, chunk))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
