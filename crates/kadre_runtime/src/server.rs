//! Daemon endpoint: accepts local-socket clients, runs one reader and one
//! writer task per client (single-writer invariant keeps the wire ordered),
//! and serializes execution requests per client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kadre_plugin_core::SessionHandle;
use kadre_scheme::Scheme;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::errors::ProtocolError;
use crate::exec::{ByteTx, CancelFlag, ExecIo, Executor, PIPE_CAPACITY};
use crate::locks::LockRegistry;
use crate::session::{PeerIdentity, Session};
use crate::wire::{read_frame, tags, write_frame, Frame, Opcode};

/// Long-lived daemon serving one prepared scheme to many clients.
pub struct Daemon {
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Bind the unix socket and start accepting clients. A stale socket
    /// file at the path is removed first.
    pub async fn bind(scheme: Arc<Scheme>, config: DaemonConfig) -> Result<Self, ProtocolError> {
        let _ = std::fs::remove_file(&config.socket_path);
        let listener = UnixListener::bind(&config.socket_path)
            .map_err(|err| ProtocolError::Io(format!("bind {:?}: {err}", config.socket_path)))?;
        tracing::debug!(path = ?config.socket_path, "daemon listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let socket_path = config.socket_path.clone();
        let locks = LockRegistry::new();
        let accept_task = tokio::spawn(accept_loop(listener, scheme, config, locks, shutdown_rx));

        Ok(Self {
            socket_path,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Stop accepting, abort live client tasks, remove the socket file.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "accept loop join failed");
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn accept_loop(
    listener: UnixListener,
    scheme: Arc<Scheme>,
    config: DaemonConfig,
    locks: LockRegistry,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let client_id = Uuid::new_v4();
                    let scheme = Arc::clone(&scheme);
                    let config = config.clone();
                    let locks = locks.clone();
                    clients.spawn(async move {
                        tracing::debug!(client = %client_id, "client connected");
                        match serve_client(stream, scheme, config, locks).await {
                            Ok(()) => tracing::debug!(client = %client_id, "client disconnected"),
                            Err(err) => {
                                tracing::warn!(client = %client_id, error = %err, "client dropped");
                            }
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    clients.abort_all();
    while clients.join_next().await.is_some() {}
}

struct InFlight {
    stdin_tx: ByteTx,
    cancel: CancelFlag,
    /// Resolves to the session-done flag when the pipeline finishes.
    done_rx: oneshot::Receiver<bool>,
}

async fn serve_client(
    stream: UnixStream,
    scheme: Arc<Scheme>,
    config: DaemonConfig,
    locks: LockRegistry,
) -> Result<(), ProtocolError> {
    let peer_cred = stream.peer_cred().ok();
    let (mut reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(config.write_channel_capacity);
    let writer_task = tokio::spawn(writer_loop(out_rx, writer));

    let result = client_loop(&mut reader, &out_tx, scheme, &config, locks, peer_cred).await;

    drop(out_tx);
    if let Err(err) = writer_task.await {
        tracing::warn!(error = %err, "writer task join failed");
    }
    result
}

async fn client_loop(
    reader: &mut tokio::net::unix::OwnedReadHalf,
    out_tx: &mpsc::Sender<Frame>,
    scheme: Arc<Scheme>,
    config: &DaemonConfig,
    locks: LockRegistry,
    peer_cred: Option<tokio::net::unix::UCred>,
) -> Result<(), ProtocolError> {
    let session = authenticate(reader, out_tx, scheme, config, peer_cred).await?;

    let mut in_flight: Option<InFlight> = None;
    let idle_limit = config.keepalive_interval * config.keepalive_misses.max(1);
    let mut last_seen = Instant::now();

    loop {
        let frame = tokio::select! {
            maybe = read_frame(reader) => {
                match maybe? {
                    Some(frame) => frame,
                    None => break,
                }
            }
            _ = tokio::time::sleep(config.keepalive_interval),
                if config.keepalive_interval > Duration::ZERO =>
            {
                if last_seen.elapsed() > idle_limit {
                    if let Some(flight) = &in_flight {
                        flight.cancel.cancel();
                    }
                    return Err(ProtocolError::KeepaliveTimeout);
                }
                continue;
            }
        };
        last_seen = Instant::now();
        refresh_in_flight(&mut in_flight);
        let busy = in_flight.is_some();
        let state = if busy { "waitForProcess" } else { "idle" };

        match frame.opcode {
            Opcode::Keepalive => {
                let _ = out_tx.send(Frame::new(Opcode::Keepalive)).await;
            }
            Opcode::Exit => break,
            Opcode::Cmd => {
                if busy {
                    if let Some(flight) = &in_flight {
                        flight.cancel.cancel();
                    }
                    return Err(ProtocolError::UnexpectedOpcode {
                        opcode: 'c',
                        state: state.to_owned(),
                    });
                }
                let line = frame.first_str(tags::LINE).unwrap_or("").to_owned();
                in_flight = start_exec(&session, &locks, line, out_tx.clone()).await;
            }
            Opcode::Completion => {
                let line = frame.first_str(tags::LINE).unwrap_or("");
                let _ = out_tx.send(completion_ack(&session, line)).await;
            }
            Opcode::Help => {
                let line = frame.first_str(tags::LINE).unwrap_or("");
                let _ = out_tx.send(help_ack(&session, line)).await;
            }
            Opcode::Stdin => {
                if let Some(flight) = &in_flight {
                    if let Some(chunk) = frame.first(tags::CHUNK) {
                        let _ = flight.stdin_tx.send(chunk.to_vec()).await;
                    }
                }
                // Chunks racing a just-finished pipeline are dropped.
            }
            Opcode::Notification => {
                if frame.first_str(tags::REASON) == Some("cancel") {
                    if let Some(flight) = &in_flight {
                        flight.cancel.cancel();
                    }
                }
            }
            Opcode::Auth => {
                return Err(ProtocolError::UnexpectedOpcode {
                    opcode: 'a',
                    state: state.to_owned(),
                });
            }
            other => {
                return Err(ProtocolError::UnexpectedOpcode {
                    opcode: other.as_char(),
                    state: state.to_owned(),
                });
            }
        }
    }

    if let Some(flight) = &in_flight {
        flight.cancel.cancel();
    }
    Ok(())
}

async fn authenticate(
    reader: &mut tokio::net::unix::OwnedReadHalf,
    out_tx: &mpsc::Sender<Frame>,
    scheme: Arc<Scheme>,
    config: &DaemonConfig,
    peer_cred: Option<tokio::net::unix::UCred>,
) -> Result<Session, ProtocolError> {
    let frame = read_frame(reader)
        .await?
        .ok_or(ProtocolError::ConnectionClosed)?;
    if frame.opcode != Opcode::Auth {
        return Err(ProtocolError::AuthFailed(format!(
            "first frame must be auth, got {:?}",
            frame.opcode.as_char()
        )));
    }

    // Client-supplied USER value backs the peer name when the socket
    // credential lookup cannot produce one.
    let user = frame
        .first_str(tags::USER)
        .map(str::to_owned)
        .or_else(|| std::env::var("USER").ok());

    let session = match Session::new(scheme, config.start_entry.as_deref()) {
        Ok(session) => session,
        Err(err) => {
            let _ = out_tx
                .send(Frame::new(Opcode::AuthAck).with_str(tags::ERROR, err.to_string()))
                .await;
            return Err(ProtocolError::AuthFailed(err.to_string()));
        }
    };
    session.set_dry_run(config.dry_run);
    session.set_peer(PeerIdentity {
        pid: peer_cred.as_ref().and_then(|cred| cred.pid()),
        uid: peer_cred.as_ref().map(|cred| cred.uid()),
        user: user.clone(),
    });

    let mut ack = Frame::new(Opcode::AuthAck);
    if let Some(user) = &user {
        ack = ack.with_str(tags::USER, user);
    }
    let _ = out_tx.send(ack).await;
    Ok(session)
}

/// Launch one pipeline. Returns None when the line failed to parse; the
/// failure ack has already been sent.
async fn start_exec(
    session: &Session,
    locks: &LockRegistry,
    line: String,
    out_tx: mpsc::Sender<Frame>,
) -> Option<InFlight> {
    let plan = match session.parse_for_exec(&line) {
        Ok(plan) => plan,
        Err(failure) => {
            let _ = out_tx
                .send(Frame::new(Opcode::Stderr).with_str(tags::CHUNK, format!("{failure}\n")))
                .await;
            let _ = out_tx
                .send(
                    Frame::new(Opcode::CmdAck)
                        .with_str(tags::RETCODE, "1")
                        .with_str(tags::ERROR, failure.to_string()),
                )
                .await;
            return None;
        }
    };
    let first_entry = plan.contexts()[0].entry;

    let (stdin_tx, stdin_rx) = mpsc::channel(PIPE_CAPACITY);
    let (stdout_tx, mut stdout_rx) = mpsc::channel(PIPE_CAPACITY);
    let (stderr_tx, mut stderr_rx) = mpsc::channel(PIPE_CAPACITY);
    let cancel = CancelFlag::new();
    let (done_tx, done_rx) = oneshot::channel();

    let stdout_pump = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stdout_rx.recv().await {
                let frame = Frame::new(Opcode::Stdout).with_bytes(tags::CHUNK, chunk);
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };
    let stderr_pump = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = stderr_rx.recv().await {
                let frame = Frame::new(Opcode::Stderr).with_bytes(tags::CHUNK, chunk);
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    let exec_session = session.clone();
    let exec_cancel = cancel.clone();
    let locks = locks.clone();
    tokio::spawn(async move {
        let executor = Executor::new(exec_session.handle(), locks);
        let io = ExecIo {
            stdin: stdin_rx,
            stdout: stdout_tx,
            stderr: stderr_tx,
        };
        let outcome = executor.run(plan, io, exec_cancel).await;

        // All stdout/stderr chunks reach the writer queue before the ack:
        // the pumps drain to completion first.
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;

        exec_session.apply_restore(first_entry);
        exec_session.run_log(&line, outcome.status());
        let done = exec_session.done();

        let mut ack =
            Frame::new(Opcode::CmdAck).with_str(tags::RETCODE, outcome.status().to_string());
        if outcome.cancelled {
            ack = ack.with_str(tags::CANCELLED, "1");
        }
        if done {
            ack = ack.with_str(tags::DONE, "1");
        }
        let _ = out_tx.send(ack).await;
        if done {
            let _ = out_tx.send(Frame::new(Opcode::Exit)).await;
        }
        let _ = done_tx.send(done);
    });

    Some(InFlight {
        stdin_tx,
        cancel,
        done_rx,
    })
}

fn refresh_in_flight(in_flight: &mut Option<InFlight>) {
    if let Some(flight) = in_flight {
        match flight.done_rx.try_recv() {
            Ok(_) | Err(oneshot::error::TryRecvError::Closed) => *in_flight = None,
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
    }
}

fn completion_ack(session: &Session, line: &str) -> Frame {
    match session.parse_for_completion(line) {
        Ok(pargv) => {
            let set = session.resolve_completions(&pargv);
            let mut frame =
                Frame::new(Opcode::CompletionAck).with_str(tags::PREFIX, set.prefix);
            for candidate in set.candidates {
                frame = frame.with_str(tags::CANDIDATE, candidate);
            }
            frame
        }
        Err(failure) => {
            Frame::new(Opcode::CompletionAck).with_str(tags::ERROR, failure.to_string())
        }
    }
}

fn help_ack(session: &Session, line: &str) -> Frame {
    match session.parse_for_help(line) {
        Ok(pargv) => {
            let mut frame = Frame::new(Opcode::HelpAck);
            for (name, text) in session.resolve_help(&pargv) {
                frame = frame
                    .with_str(tags::HELP_NAME, name)
                    .with_str(tags::HELP_TEXT, text);
            }
            frame
        }
        Err(failure) => Frame::new(Opcode::HelpAck).with_str(tags::ERROR, failure.to_string()),
    }
}

async fn writer_loop(mut rx: mpsc::Receiver<Frame>, mut writer: OwnedWriteHalf) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            tracing::debug!(error = %err, "writer loop ended");
            break;
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = writer.shutdown().await;
}
