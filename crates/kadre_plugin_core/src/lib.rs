use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginContractVersion {
    pub major: u8,
    pub minor: u8,
}

impl PluginContractVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Host-side compatibility gate: a plugin is accepted when its major
    /// matches the host major and its minor does not exceed the host minor.
    pub const fn accepts(self, plugin: Self) -> bool {
        self.major == plugin.major && plugin.minor <= self.minor
    }
}

/// Tri-valued flag: scheme attributes may leave a symbol policy undefined so
/// the symbol's own default applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tri {
    #[default]
    Undefined,
    False,
    True,
}

impl Tri {
    pub const fn resolve(self, default: bool) -> bool {
        match self {
            Tri::Undefined => default,
            Tri::False => false,
            Tri::True => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextKind {
    /// Regular command action.
    Action,
    /// Auxiliary invocation: ptype validation, cond, prompt, completion, log.
    ServiceAction,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PluginIssue {
    #[error("plugin init failed: {0}")]
    Init(String),
    #[error("plugin fini failed: {0}")]
    Fini(String),
    #[error("symbol {0:?} is already registered")]
    DuplicateSymbol(String),
    #[error("plugin {0:?} is already registered")]
    DuplicatePlugin(String),
}

pub type SymbolFn = Arc<dyn Fn(&mut SymContext) -> i32 + Send + Sync>;

/// Named callable with execution policy metadata.
#[derive(Clone)]
pub struct Symbol {
    name: String,
    handler: SymbolFn,
    permanent: Tri,
    sync: Tri,
    silent: bool,
}

impl Symbol {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&mut SymContext) -> i32 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            permanent: Tri::Undefined,
            sync: Tri::Undefined,
            silent: false,
        }
    }

    /// Permanent symbols keep executing in dry-run sessions.
    pub fn with_permanent(mut self, permanent: Tri) -> Self {
        self.permanent = permanent;
        self
    }

    /// Sync symbols are invoked inline instead of on an isolated task.
    pub fn with_sync(mut self, sync: Tri) -> Self {
        self.sync = sync;
        self
    }

    /// Silent symbols run with detached stdio.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn permanent(&self) -> Tri {
        self.permanent
    }

    pub fn sync(&self) -> Tri {
        self.sync
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    pub fn invoke(&self, context: &mut SymContext) -> i32 {
        (self.handler)(context)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("permanent", &self.permanent)
            .field("sync", &self.sync)
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

/// Ordered, name-unique symbol collection filled during plugin init.
#[derive(Clone, Debug, Default)]
pub struct SymbolRegistry {
    symbols: Vec<Symbol>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, symbol: Symbol) -> Result<(), PluginIssue> {
        if self.find(symbol.name()).is_some() {
            return Err(PluginIssue::DuplicateSymbol(symbol.name().to_owned()));
        }
        self.symbols.push(symbol);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|sym| sym.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn into_symbols(self) -> Vec<Symbol> {
        self.symbols
    }
}

/// In-process plugin implementation. The scheme's prepare step checks the
/// contract version, then calls `init` exactly once to collect symbols;
/// `fini` runs in reverse registration order at scheme teardown.
pub trait PluginHandler: Send + Sync + 'static {
    fn version(&self) -> PluginContractVersion;

    fn init(&self, registry: &mut SymbolRegistry, conf: Option<&str>) -> Result<(), PluginIssue>;

    fn fini(&self) -> Result<(), PluginIssue> {
        Ok(())
    }
}

/// Maps plugin ids to handlers. This is the entire loader interface: any
/// mechanism able to hand out an in-process `PluginHandler` can populate it.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    handlers: Vec<(String, Arc<dyn PluginHandler>)>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        handler: Arc<dyn PluginHandler>,
    ) -> Result<(), PluginIssue> {
        let id = id.into();
        if self.find(&id).is_some() {
            return Err(PluginIssue::DuplicatePlugin(id));
        }
        self.handlers.push((id, handler));
        Ok(())
    }

    pub fn with(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn PluginHandler>,
    ) -> Result<Self, PluginIssue> {
        self.register(id, handler)?;
        Ok(self)
    }

    pub fn find(&self, id: &str) -> Option<&Arc<dyn PluginHandler>> {
        self.handlers
            .iter()
            .find(|(handler_id, _)| handler_id == id)
            .map(|(_, handler)| handler)
    }
}

impl fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.handlers.iter().map(|(id, _)| id.as_str()).collect();
        f.debug_struct("PluginCatalog").field("ids", &ids).finish()
    }
}

/// Session surface visible to symbols. Navigation-style symbols mutate the
/// path through this handle; they never see scheme internals.
pub trait SessionHandle: Send + Sync + 'static {
    fn done(&self) -> bool;
    fn set_done(&self, done: bool);
    fn dry_run(&self) -> bool;
    fn path_depth(&self) -> usize;
    fn path_names(&self) -> Vec<String>;
    /// Push the view at `view_path` (scheme path, e.g. "/configure").
    fn push_view(&self, view_path: &str) -> Result<(), String>;
    /// Pop one level. Returns false when already at the root.
    fn pop_view(&self) -> bool;
    /// Swap the top level for another view; works at the root too.
    fn replace_view(&self, view_path: &str) -> Result<(), String>;
    fn user(&self) -> Option<String>;
    fn pid(&self) -> Option<i32>;
    fn uid(&self) -> Option<u32>;
}

/// One matched (entry name, token) pair as exposed to symbols.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PargView {
    pub entry: String,
    pub value: String,
}

/// Construction-side description of a symbol invocation.
#[derive(Clone, Debug)]
pub struct ContextSpec {
    pub kind: ContextKind,
    pub script: Option<String>,
    pub command: Option<String>,
    pub candidate: Option<String>,
    pub pargs: Vec<PargView>,
    pub retcode: i32,
}

impl ContextSpec {
    pub fn service(script: Option<String>) -> Self {
        Self {
            kind: ContextKind::ServiceAction,
            script,
            command: None,
            candidate: None,
            pargs: Vec::new(),
            retcode: 0,
        }
    }
}

pub struct SymStdio {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl SymStdio {
    /// Detached streams for silent symbols: reads see EOF, writes vanish.
    pub fn detached() -> Self {
        Self {
            stdin: Box::new(std::io::empty()),
            stdout: Box::new(std::io::sink()),
            stderr: Box::new(std::io::sink()),
        }
    }
}

/// Runtime record passed to a symbol invocation. Accessors only; the scheme
/// and session internals stay on the host side of this boundary.
pub struct SymContext {
    kind: ContextKind,
    script: Option<String>,
    command: Option<String>,
    candidate: Option<String>,
    pargs: Vec<PargView>,
    retcode: i32,
    stdio: SymStdio,
    cancel: Arc<AtomicBool>,
    session: Arc<dyn SessionHandle>,
}

impl SymContext {
    pub fn new(
        spec: ContextSpec,
        stdio: SymStdio,
        cancel: Arc<AtomicBool>,
        session: Arc<dyn SessionHandle>,
    ) -> Self {
        Self {
            kind: spec.kind,
            script: spec.script,
            command: spec.command,
            candidate: spec.candidate,
            pargs: spec.pargs,
            retcode: spec.retcode,
            stdio,
            cancel,
            session,
        }
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Token under validation when a ptype action runs.
    pub fn candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    pub fn pargs(&self) -> &[PargView] {
        &self.pargs
    }

    pub fn parg_value(&self, entry: &str) -> Option<&str> {
        self.pargs
            .iter()
            .find(|parg| parg.entry == entry)
            .map(|parg| parg.value.as_str())
    }

    /// Accumulated retcode of the surrounding action list.
    pub fn retcode(&self) -> i32 {
        self.retcode
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn stdin(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.stdio.stdin
    }

    pub fn stdout(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.stdio.stdout
    }

    pub fn stderr(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.stdio.stderr
    }

    /// All three streams at once, for symbols that pump them concurrently.
    pub fn stdio_mut(
        &mut self,
    ) -> (
        &mut (dyn Read + Send),
        &mut (dyn Write + Send),
        &mut (dyn Write + Send),
    ) {
        (
            &mut *self.stdio.stdin,
            &mut *self.stdio.stdout,
            &mut *self.stdio.stderr,
        )
    }

    /// Take ownership of the input stream, leaving an empty one behind.
    /// Lets a symbol pump stdin from a thread that outlives the borrow.
    pub fn take_stdin(&mut self) -> Box<dyn Read + Send> {
        std::mem::replace(&mut self.stdio.stdin, Box::new(std::io::empty()))
    }

    /// Shared cancel flag, for symbols that poll it from worker threads.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn session(&self) -> &Arc<dyn SessionHandle> {
        &self.session
    }
}
