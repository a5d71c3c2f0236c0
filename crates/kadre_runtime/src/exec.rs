//! Executor: runs pipelines of contexts produced by `parse_for_exec`,
//! shuttling standard streams between segments over bounded byte channels.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use kadre_plugin_core::{ContextKind, ContextSpec, PargView, SessionHandle, SymContext, SymStdio};
use kadre_scheme::{Action, ActionIo, EntryId, Scheme};
use tokio::sync::{mpsc, Notify};

use crate::locks::LockRegistry;
use crate::pargv::Pargv;


/// Bounded capacity of inter-segment byte channels; backpressure for
/// producers that outrun their consumer.
pub const PIPE_CAPACITY: usize = 64;

/// Exit status reported when a pipeline is torn down by cancellation.
pub const CANCELLED_RETCODE: i32 = 130;

pub type ByteTx = mpsc::Sender<Vec<u8>>;
pub type ByteRx = mpsc::Receiver<Vec<u8>>;

/// Cooperative cancel signal shared by the endpoint, the executor, and the
/// symbol contexts. Symbols observe it through `SymContext::cancelled`.
#[derive(Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }

    pub(crate) fn as_atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// One pipe segment: the matched command entry, its pargv, an action-list
/// snapshot and the raw segment text. Entry names are resolved into
/// `parg_views` at plan-build time so symbol contexts stay scheme-free.
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub entry: EntryId,
    pub command_name: String,
    pub actions: Vec<Action>,
    pub pargv: Pargv,
    pub parg_views: Vec<PargView>,
    pub line: String,
}

/// Ordered, non-empty list of contexts for one command line.
#[derive(Clone, Debug)]
pub struct ExecPlan {
    contexts: Vec<ExecContext>,
}

impl ExecPlan {
    pub fn new(contexts: Vec<ExecContext>) -> Self {
        Self { contexts }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contexts(&self) -> &[ExecContext] {
        &self.contexts
    }

    pub fn into_contexts(self) -> Vec<ExecContext> {
        self.contexts
    }
}

/// Client-side stream endpoints for one pipeline run.
pub struct ExecIo {
    pub stdin: ByteRx,
    pub stdout: ByteTx,
    pub stderr: ByteTx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    pub retcode: i32,
    pub cancelled: bool,
}

impl ExecOutcome {
    /// Status reported on the wire: cancellation overrides the accumulated
    /// retcode.
    pub fn status(&self) -> i32 {
        if self.cancelled {
            CANCELLED_RETCODE
        } else {
            self.retcode
        }
    }
}

struct SegmentResult {
    retcode: i32,
    cancelled: bool,
}

/// Runs pipelines against a prepared scheme. The executor holds the
/// process-wide lock registry and the session handle that symbol contexts
/// expose.
pub struct Executor {
    session: Arc<dyn SessionHandle>,
    locks: LockRegistry,
}

impl Executor {
    pub fn new(session: Arc<dyn SessionHandle>, locks: LockRegistry) -> Self {
        Self { session, locks }
    }

    /// Run every segment concurrently, joined by bounded byte channels;
    /// segment N's stdout is segment N+1's stdin. The pipeline retcode is
    /// the last segment's retcode.
    pub async fn run(&self, plan: ExecPlan, io: ExecIo, cancel: CancelFlag) -> ExecOutcome {
        let contexts = plan.into_contexts();
        let count = contexts.len();
        if count == 0 {
            return ExecOutcome {
                retcode: 0,
                cancelled: cancel.is_cancelled(),
            };
        }

        let mut handles = Vec::with_capacity(count);
        let mut client_stdin = Some(io.stdin);
        let mut prev_rx: Option<ByteRx> = None;

        for (index, context) in contexts.into_iter().enumerate() {
            let stdin = if index == 0 {
                client_stdin.take()
            } else {
                prev_rx.take()
            };
            let stdout = if index + 1 == count {
                io.stdout.clone()
            } else {
                let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
                prev_rx = Some(rx);
                tx
            };
            let stderr = io.stderr.clone();
            let session = Arc::clone(&self.session);
            let locks = self.locks.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                run_segment(context, session, locks, stdin, stdout, stderr, cancel).await
            }));
        }
        drop(io.stdout);

        let mut outcome = ExecOutcome {
            retcode: 0,
            cancelled: false,
        };
        for handle in handles {
            match handle.await {
                Ok(result) => {
                    outcome.retcode = result.retcode;
                    outcome.cancelled |= result.cancelled;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pipeline segment task failed");
                    outcome.retcode = -1;
                }
            }
        }
        outcome.cancelled |= cancel.is_cancelled();
        outcome
    }
}

async fn run_segment(
    context: ExecContext,
    session: Arc<dyn SessionHandle>,
    locks: LockRegistry,
    stdin: Option<ByteRx>,
    stdout: ByteTx,
    stderr: ByteTx,
    cancel: CancelFlag,
) -> SegmentResult {
    let mut stdin = stdin;
    let mut retcode = 0i32;
    let mut cancelled = false;
    let dry_run = session.dry_run();
    let pargs = context.parg_views.clone();
    let command = Some(context.command_name.clone());

    for action in &context.actions {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if !action.meet_exec_conditions(retcode) {
            continue;
        }
        if dry_run && !action.is_permanent() {
            // Dry-run treats the action as a clean no-op.
            if action.update_retcode() {
                retcode = 0;
            }
            continue;
        }

        let _guard = match action.lock() {
            Some(name) => match locks.acquire(name).await {
                Ok(guard) => Some(guard),
                Err(err) => {
                    let _ = stderr.send(format!("{err}\n").into_bytes()).await;
                    if action.update_retcode() {
                        retcode = -1;
                    }
                    if action.interrupt() {
                        break;
                    }
                    continue;
                }
            },
            None => None,
        };

        let Some(bound) = action.symbol() else {
            tracing::warn!(sym = action.sym_ref(), "action has no bound symbol");
            let _ = stderr
                .send(format!("unbound symbol {:?}\n", action.sym_ref()).into_bytes())
                .await;
            if action.update_retcode() {
                retcode = 127;
            }
            if action.interrupt() {
                break;
            }
            continue;
        };

        let spec = ContextSpec {
            kind: ContextKind::Action,
            script: action.script().map(str::to_owned),
            command: command.clone(),
            candidate: None,
            pargs: pargs.clone(),
            retcode,
        };

        let status = if action.is_sync() {
            invoke_sync(bound.symbol.clone(), spec, action, &stdout, &stderr, &cancel, &session)
                .await
        } else {
            invoke_isolated(
                bound.symbol.clone(),
                spec,
                action,
                &mut stdin,
                &stdout,
                &stderr,
                &cancel,
                &session,
            )
            .await
        };

        let status = match status {
            Some(status) => status,
            None => {
                cancelled = true;
                break;
            }
        };
        if action.update_retcode() {
            retcode = status;
        }
        if action.interrupt() && status != 0 {
            break;
        }
    }

    SegmentResult { retcode, cancelled }
}

/// Inline invocation for sync symbols: buffered stdio flushed to the
/// channels after the call. Sync symbols cannot block on channel I/O from
/// inside the async loop, so they never see the streaming stdin.
async fn invoke_sync(
    symbol: kadre_plugin_core::Symbol,
    spec: ContextSpec,
    action: &Action,
    stdout: &ByteTx,
    stderr: &ByteTx,
    cancel: &CancelFlag,
    session: &Arc<dyn SessionHandle>,
) -> Option<i32> {
    let out_buffer = SharedBuffer::new();
    let err_buffer = SharedBuffer::new();
    let stdio = if action.is_silent() {
        SymStdio::detached()
    } else {
        SymStdio {
            stdin: Box::new(std::io::empty()),
            stdout: Box::new(out_buffer.clone()),
            stderr: Box::new(err_buffer.clone()),
        }
    };
    let mut ctx = SymContext::new(spec, stdio, cancel.as_atomic(), Arc::clone(session));
    let status = symbol.invoke(&mut ctx);

    if wants_output(action.output()) {
        let bytes = out_buffer.take();
        if !bytes.is_empty() {
            let _ = stdout.send(bytes).await;
        }
    }
    let err_bytes = err_buffer.take();
    if !err_bytes.is_empty() {
        let _ = stderr.send(err_bytes).await;
    }
    Some(status)
}

/// Isolated invocation for non-sync symbols: a blocking task with streaming
/// channel adapters. Returns None when cancellation fired before the task
/// finished; the detached task observes the cancel flag on its own.
#[allow(clippy::too_many_arguments)]
async fn invoke_isolated(
    symbol: kadre_plugin_core::Symbol,
    spec: ContextSpec,
    action: &Action,
    stdin: &mut Option<ByteRx>,
    stdout: &ByteTx,
    stderr: &ByteTx,
    cancel: &CancelFlag,
    session: &Arc<dyn SessionHandle>,
) -> Option<i32> {
    let stdio = if action.is_silent() {
        SymStdio::detached()
    } else {
        let stdin_stream: Box<dyn Read + Send> = if wants_input(action.input()) {
            match stdin.take() {
                Some(rx) => Box::new(ChannelReader::new(rx)),
                None => Box::new(std::io::empty()),
            }
        } else {
            Box::new(std::io::empty())
        };
        let stdout_stream: Box<dyn Write + Send> = if wants_output(action.output()) {
            Box::new(ChannelWriter::new(stdout.clone()))
        } else {
            Box::new(std::io::sink())
        };
        SymStdio {
            stdin: stdin_stream,
            stdout: stdout_stream,
            stderr: Box::new(ChannelWriter::new(stderr.clone())),
        }
    };

    let cancel_atomic = cancel.as_atomic();
    let session = Arc::clone(session);
    let mut handle = tokio::task::spawn_blocking(move || {
        let mut ctx = SymContext::new(spec, stdio, cancel_atomic, session);
        symbol.invoke(&mut ctx)
    });

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(error = %err, "symbol task failed");
                Some(-1)
            }
        },
        _ = cancel.cancelled() => None,
    }
}

/// Unset output disposition keeps stdout wired; unset input leaves stdin
/// detached (a command must opt into consuming the stream).
fn wants_output(io: ActionIo) -> bool {
    matches!(io, ActionIo::None | ActionIo::True | ActionIo::Tty)
}

fn wants_input(io: ActionIo) -> bool {
    matches!(io, ActionIo::True | ActionIo::Tty)
}

/// Run an entry's actions inline for service purposes (ptype validation,
/// prompt, cond, completion, help, log). No locks, no dry-run gating, no
/// stream wiring; stdout is captured and returned.
pub fn run_service_actions(
    scheme: &Scheme,
    entry: EntryId,
    candidate: Option<&str>,
    pargs: Vec<PargView>,
    session: Arc<dyn SessionHandle>,
) -> (i32, String) {
    let mut retcode = 0i32;
    let out_buffer = SharedBuffer::new();

    for action in scheme.entry(entry).actions() {
        if !action.meet_exec_conditions(retcode) {
            continue;
        }
        let Some(bound) = action.symbol() else {
            tracing::warn!(sym = action.sym_ref(), "service action has no bound symbol");
            if action.update_retcode() {
                retcode = 127;
            }
            continue;
        };
        let spec = ContextSpec {
            kind: ContextKind::ServiceAction,
            script: action.script().map(str::to_owned),
            command: None,
            candidate: candidate.map(str::to_owned),
            pargs: pargs.clone(),
            retcode,
        };
        let stdio = if action.is_silent() {
            SymStdio::detached()
        } else {
            SymStdio {
                stdin: Box::new(std::io::empty()),
                stdout: Box::new(out_buffer.clone()),
                stderr: Box::new(std::io::sink()),
            }
        };
        let mut ctx = SymContext::new(
            spec,
            stdio,
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&session),
        );
        let status = bound.symbol.invoke(&mut ctx);
        if action.update_retcode() {
            retcode = status;
        }
        if action.interrupt() && status != 0 {
            break;
        }
    }

    (retcode, String::from_utf8_lossy(&out_buffer.take()).into_owned())
}

/// Shared in-memory write buffer handed to inline symbol invocations.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer {
    inner: Arc<StdMutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take(&self) -> Vec<u8> {
        match self.inner.lock() {
            Ok(mut bytes) => std::mem::take(&mut *bytes),
            Err(_) => Vec::new(),
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.inner.lock() {
            Ok(mut bytes) => {
                bytes.extend_from_slice(buf);
                Ok(buf.len())
            }
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "buffer poisoned",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// `std::io::Write` over a byte channel; used from blocking symbol tasks.
pub(crate) struct ChannelWriter {
    tx: ByteTx,
}

impl ChannelWriter {
    pub(crate) fn new(tx: ByteTx) -> Self {
        Self { tx }
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// `std::io::Read` over a byte channel; EOF when the sender side closes.
pub(crate) struct ChannelReader {
    rx: ByteRx,
    buffer: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub(crate) fn new(rx: ByteRx) -> Self {
        Self {
            rx,
            buffer: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.buffer.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buffer = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.buffer[self.pos..];
        let taking = available.len().min(buf.len());
        buf[..taking].copy_from_slice(&available[..taking]);
        self.pos += taking;
        Ok(taking)
    }
}
