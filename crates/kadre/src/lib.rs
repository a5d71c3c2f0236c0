//! Public facade for the kadre workspace: builtin plugins, server and
//! client builders. Use `kadre::runtime` / `kadre::scheme` for low-level
//! control.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

pub mod builtin;

pub use builtin::{default_catalog, KadrePlugin, ShellPlugin};
pub use kadre_plugin_core::{
    ContextKind, ContextSpec, PargView, PluginCatalog, PluginContractVersion, PluginHandler,
    PluginIssue, SessionHandle, SymContext, SymStdio, Symbol, SymbolRegistry, Tri,
};
pub use kadre_runtime::{
    CancelFlag, ClientConfig, ClientSession, ClientState, CommandResult, CompletionReply,
    CompletionSet, DaemonConfig, Daemon, ExecEvent, HelpReply, ParseFailure, ProtocolError,
    Session, SessionError, DEFAULT_SOCKET_PATH,
};
pub use kadre_scheme::{
    parse_deploy, serialize_image, Scheme, SchemeError, SchemeErrorStack, SchemeImage,
};

pub use kadre_plugin_core as plugin_core;
pub use kadre_runtime as runtime;
pub use kadre_scheme as scheme;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("scheme load failed:\n{0}")]
    Scheme(#[from] SchemeErrorStack),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to read scheme {path:?}: {message}")]
    SchemeFile { path: PathBuf, message: String },
}

/// One-stop daemon builder: deploy text in, bound daemon out. The builtin
/// catalog is preloaded; add or replace plugins before serving.
#[derive(Debug)]
pub struct ServerBuilder {
    catalog: PluginCatalog,
    config: DaemonConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            catalog: default_catalog(),
            config: DaemonConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DaemonConfig) -> Self {
        self.config = config;
        self
    }

    /// Drop the builtin plugins; useful when a scheme brings its own set.
    pub fn with_empty_catalog(mut self) -> Self {
        self.catalog = PluginCatalog::new();
        self
    }

    pub fn with_plugin(
        mut self,
        id: impl Into<String>,
        handler: Arc<dyn PluginHandler>,
    ) -> Result<Self, PluginIssue> {
        self.catalog.register(id, handler)?;
        Ok(self)
    }

    /// Load, prepare, and serve a scheme given in deploy text form.
    pub async fn serve_deploy_text(self, text: &str) -> Result<Daemon, ServeError> {
        let image = parse_deploy(text)?;
        let mut scheme = Scheme::from_image(&image)?;
        scheme.prepare(&self.catalog)?;
        let daemon = Daemon::bind(Arc::new(scheme), self.config).await?;
        Ok(daemon)
    }

    pub async fn serve_deploy_file(self, path: impl AsRef<Path>) -> Result<Daemon, ServeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ServeError::SchemeFile {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        self.serve_deploy_text(&text).await
    }
}

/// Connect a client session to a running daemon.
pub async fn connect(config: ClientConfig) -> Result<ClientSession, ProtocolError> {
    ClientSession::connect(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_duplicate_plugin_ids() {
        let err = ServerBuilder::new()
            .with_plugin("kadre", Arc::new(KadrePlugin))
            .expect_err("kadre is already in the default catalog");
        assert_eq!(err, PluginIssue::DuplicatePlugin("kadre".to_owned()));
    }

    #[test]
    fn empty_catalog_accepts_custom_plugins() {
        let builder = ServerBuilder::new()
            .with_empty_catalog()
            .with_plugin("kadre", Arc::new(KadrePlugin))
            .expect("fresh catalog");
        let _ = builder;
    }
}
