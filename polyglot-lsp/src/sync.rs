//! Blocking mirrors of the query surface.
//!
//! A [`SyncSession`] owns a dedicated background execution context (a tokio
//! runtime with a single worker thread); every blocking method submits the
//! async counterpart to it and waits on the calling thread. Each call is
//! additionally bounded by the session's configured wait, so a stalled event
//! loop surfaces as a timeout instead of hanging the caller.

use crate::{
    config::ClientConfig,
    jsonrpc, lsp,
    query::{CompletionEntry, DocumentSymbols, NavigationTarget},
    session::Session,
    Error, Result,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Extra headroom a blocking wrapper grants its inner async operation
/// (which carries the real per-request timeout) before giving up on the
/// event loop itself.
const SYNC_SLACK: Duration = Duration::from_secs(2);
/// Budget for spawn + handshake on top of the readiness wait, dominated by
/// a first-use runtime-dependency install.
const START_SLACK: Duration = Duration::from_secs(120);
/// Budget for the whole teardown ladder.
const STOP_BUDGET: Duration = Duration::from_secs(30);

pub struct SyncSession {
    session: Arc<Session>,
    runtime: tokio::runtime::Runtime,
}

impl SyncSession {
    pub fn create(config: ClientConfig, workspace_root: impl AsRef<Path>) -> Result<Self> {
        Self::with_session(Session::create(config, workspace_root)?)
    }

    /// Like [`SyncSession::create`], but with a caller-provided server
    /// profile.
    pub fn create_with_profile(
        config: ClientConfig,
        workspace_root: impl AsRef<Path>,
        profile: Arc<dyn crate::languages::ServerProfile>,
    ) -> Result<Self> {
        Self::with_session(Session::create_with_profile(config, workspace_root, profile)?)
    }

    fn with_session(session: Session) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("polyglot-lsp")
            .enable_all()
            .build()?;

        Ok(Self {
            session: Arc::new(session),
            runtime,
        })
    }

    /// The underlying async session, for callers that want to mix modes.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn block_with<T>(&self, budget: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.runtime.block_on(async move {
            match tokio::time::timeout(budget, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(jsonrpc::Id::Null)),
            }
        })
    }

    fn query_budget(&self) -> Duration {
        self.session.request_timeout() + SYNC_SLACK
    }

    /// Spawn the server and wait for readiness. The returned guard tears the
    /// server down when dropped, so a panic inside the scope still leaves no
    /// processes behind.
    pub fn start_server(&self) -> Result<ServerGuard<'_>> {
        let budget = self.session.readiness_timeout() + START_SLACK;
        self.block_with(budget, self.session.start())?;
        Ok(ServerGuard {
            owner: self,
            active: true,
        })
    }

    fn stop(&self) -> Result<()> {
        self.runtime.block_on(async {
            let _ = tokio::time::timeout(STOP_BUDGET, self.session.stop()).await;
        });
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub fn request_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.block_with(
            self.query_budget(),
            self.session.request_definition(relative_path, line, column),
        )
    }

    pub fn request_references(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.block_with(
            self.query_budget(),
            self.session.request_references(relative_path, line, column),
        )
    }

    pub fn request_type_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.block_with(
            self.query_budget(),
            self.session
                .request_type_definition(relative_path, line, column),
        )
    }

    pub fn request_implementation(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.block_with(
            self.query_budget(),
            self.session
                .request_implementation(relative_path, line, column),
        )
    }

    pub fn request_hover(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Option<lsp::Hover>> {
        self.block_with(
            self.query_budget(),
            self.session.request_hover(relative_path, line, column),
        )
    }

    pub fn request_document_symbols(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<DocumentSymbols> {
        self.block_with(
            self.query_budget(),
            self.session.request_document_symbols(relative_path),
        )
    }

    pub fn request_workspace_symbol(&self, query: &str) -> Result<Vec<lsp::SymbolInformation>> {
        self.block_with(
            self.query_budget(),
            self.session.request_workspace_symbol(query),
        )
    }

    pub fn request_completions(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<CompletionEntry>> {
        self.block_with(
            self.query_budget(),
            self.session.request_completions(relative_path, line, column),
        )
    }

    // -----------------------------------------------------------------
    // Overlay operations
    // -----------------------------------------------------------------

    pub fn open_file(&self, relative_path: impl AsRef<Path>) -> Result<()> {
        self.block_with(self.query_budget(), self.session.open_file(relative_path))
    }

    pub fn close_file(&self, relative_path: impl AsRef<Path>) -> Result<()> {
        self.block_with(self.query_budget(), self.session.close_file(relative_path))
    }

    pub fn insert_text_at_position(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        text: &str,
    ) -> Result<lsp::Position> {
        self.block_with(
            self.query_budget(),
            self.session
                .insert_text_at_position(relative_path, line, column, text),
        )
    }

    pub fn delete_text_between_positions(
        &self,
        relative_path: impl AsRef<Path>,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Result<String> {
        self.block_with(
            self.query_budget(),
            self.session.delete_text_between_positions(
                relative_path,
                start_line,
                start_column,
                end_line,
                end_column,
            ),
        )
    }

    pub fn get_open_file_text(&self, relative_path: impl AsRef<Path>) -> Result<String> {
        self.session.get_open_file_text(relative_path)
    }

    pub fn diagnostics_for(&self, relative_path: impl AsRef<Path>) -> Vec<lsp::Diagnostic> {
        self.session.diagnostics_for(relative_path)
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        // harmless when already stopped; a leaked guard or panic still tears
        // the process tree down
        let _ = self.stop();
    }
}

/// Scope handle for a running server. Leaving the scope (drop or an explicit
/// [`ServerGuard::stop`]) performs shutdown + teardown.
pub struct ServerGuard<'a> {
    owner: &'a SyncSession,
    active: bool,
}

impl ServerGuard<'_> {
    pub fn stop(mut self) -> Result<()> {
        self.active = false;
        self.owner.stop()
    }
}

impl Drop for ServerGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            let _ = self.owner.stop();
        }
    }
}
