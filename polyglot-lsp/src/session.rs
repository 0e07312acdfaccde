//! The per-workspace session: spawn, handshake, readiness, dispatch of
//! server-originated traffic, and the open-document overlay.

use crate::{
    client::Client,
    config::ClientConfig,
    document::DocumentStore,
    install, jsonrpc,
    languages::{self, ServerProfile},
    lsp,
    process::ProcessSupervisor,
    transport::{Payload, Transport, TransportTasks},
    Error, Result,
};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    Notify,
};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Budget for the graceful shutdown request before teardown proceeds anyway.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a session. Transitions only move forward; queries are
/// rejected in every state but `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawned,
    Initialized,
    Ready,
    ShuttingDown,
    Stopped,
}

/// A boolean signal that latches once and supports wait-until-set. Readiness
/// notifications set these; they are never cleared.
#[derive(Debug, Default)]
pub struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.set.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before the flag check so a concurrent set() cannot slip
        // between the check and the await
        notified.as_mut().enable();
        if self.is_set() {
            return;
        }
        notified.await;
    }
}

/// Handler for a server->client request. A returned [`jsonrpc::Error`]
/// (downcast from anyhow) is sent back verbatim; any other error becomes an
/// `InternalError` response.
pub type RequestHandler = Box<dyn FnMut(jsonrpc::Params) -> anyhow::Result<Value> + Send>;
/// Handler for a server->client notification.
pub type NotificationHandler = Box<dyn FnMut(jsonrpc::Params) -> anyhow::Result<()> + Send>;

/// State shared between the session and its dispatch task.
struct Shared {
    server_name: &'static str,
    state: Mutex<SessionState>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
    diagnostics: Arc<Mutex<HashMap<lsp::Url, Vec<lsp::Diagnostic>>>>,
    latches: HashMap<&'static str, Arc<Latch>>,
    profile: Arc<dyn ServerProfile>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, to: SessionState) {
        *self.state.lock() = to;
    }
}

/// One language server instance bound to one workspace root.
pub struct Session {
    config: ClientConfig,
    root: PathBuf,
    shared: Arc<Shared>,
    client: OnceCell<Arc<Client>>,
    pub(crate) documents: Mutex<DocumentStore>,
    supervisor: Mutex<Option<ProcessSupervisor>>,
    transport_tasks: Mutex<Option<TransportTasks>>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl Session {
    /// Validate the configuration and bind the session to a workspace root.
    /// Fatal here: an unknown language or a relative root that cannot be
    /// resolved. The server itself is not touched until [`Session::start`].
    pub fn create(config: ClientConfig, workspace_root: impl AsRef<Path>) -> Result<Self> {
        let profile = languages::profile(config.code_language)?;
        Self::create_with_profile(config, workspace_root, profile)
    }

    /// Like [`Session::create`], but with a caller-provided server profile
    /// instead of the compiled-in one for the configured language.
    pub fn create_with_profile(
        config: ClientConfig,
        workspace_root: impl AsRef<Path>,
        profile: Arc<dyn ServerProfile>,
    ) -> Result<Self> {
        let root = workspace_root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        let latches = profile
            .readiness_latches()
            .iter()
            .map(|name| (*name, Arc::new(Latch::new())))
            .collect();

        let shared = Arc::new(Shared {
            server_name: profile.name(),
            state: Mutex::new(SessionState::Stopped),
            request_handlers: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            diagnostics: Arc::new(Mutex::new(HashMap::new())),
            latches,
            profile,
        });

        Ok(Self {
            config,
            root,
            shared,
            client: OnceCell::new(),
            documents: Mutex::new(DocumentStore::new()),
            supervisor: Mutex::new(None),
            transport_tasks: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn language(&self) -> crate::Language {
        self.config.code_language
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.config
            .readiness_timeout()
            .unwrap_or_else(|| self.shared.profile.readiness_timeout())
    }

    /// Spawn the server and run the handshake; the session answers queries
    /// once this returns. On failure the process tree is torn down before
    /// the error is surfaced.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other(anyhow::anyhow!(
                "session was already started; create a new session to restart"
            )));
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("{}: startup failed: {err}", self.shared.server_name);
                self.stop().await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let profile = self.shared.profile.clone();
        let static_dir = install::static_dir(profile.language());

        let launch = match profile.launch_info(&self.root, &static_dir) {
            Ok(launch) => launch,
            Err(Error::MissingBinary(_)) => {
                // first use: materialize the runtime dependencies
                let for_install = profile.clone();
                tokio::task::spawn_blocking(move || install::ensure_installed(for_install.as_ref()))
                    .await
                    .map_err(|err| Error::Other(err.into()))??;
                profile.launch_info(&self.root, &static_dir)?
            }
            Err(err) => return Err(err),
        };

        let (supervisor, io) = ProcessSupervisor::spawn(
            &launch,
            self.config.start_independent_lsp_process,
            profile.name(),
        )?;
        *self.supervisor.lock() = Some(supervisor);
        self.shared.set_state(SessionState::Spawned);

        let (server_rx, server_tx, transport, tasks) = Transport::start(
            io.stdout,
            io.stdin,
            io.stderr,
            profile.name().to_string(),
            self.config.trace_lsp_communication,
        );
        *self.transport_tasks.lock() = Some(tasks);

        let root_uri = lsp::Url::from_file_path(&self.root)
            .map_err(|_| anyhow::anyhow!("workspace root is not an absolute path"))?;
        let client = Arc::new(Client::new(
            profile.name().to_string(),
            server_tx.clone(),
            transport,
            self.root.clone(),
            root_uri,
            self.config.request_timeout(),
        ));
        self.client
            .set(client.clone())
            .map_err(|_| anyhow::anyhow!("session client initialized twice"))?;

        self.register_default_handlers();
        let handle = tokio::spawn(dispatch(server_rx, self.shared.clone(), server_tx));
        *self.dispatch_task.lock() = Some(handle);

        // handshake
        let params =
            languages::substitute_initialize_params(profile.initialize_params_template(), &self.root)?;
        let readiness_timeout = self.readiness_timeout();

        info!(
            "{}: initializing for workspace {}",
            profile.name(),
            self.root.display()
        );
        let init_result = client.initialize(params, readiness_timeout).await?;
        for warning in profile.validate_capabilities(&init_result.capabilities) {
            warn!("{}: {warning}", profile.name());
        }
        let _ = client.capabilities.set(init_result.capabilities);
        client.initialized();
        self.shared.set_state(SessionState::Initialized);

        for (name, latch) in &self.shared.latches {
            if tokio::time::timeout(readiness_timeout, latch.wait())
                .await
                .is_err()
            {
                return Err(Error::Other(anyhow::anyhow!(
                    "timed out waiting for readiness signal '{name}'"
                )));
            }
        }
        self.shared.set_state(SessionState::Ready);
        info!("{}: ready", profile.name());

        Ok(())
    }

    /// Shut the server down and tear the process tree down. Always leaves
    /// the session in `Stopped`; safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, SessionState::Stopped)
                && self.supervisor.lock().is_none()
                && self.transport_tasks.lock().is_none()
            {
                return;
            }
            *state = SessionState::ShuttingDown;
        }

        if let Some(client) = self.client.get() {
            if client.is_initialized() {
                if tokio::time::timeout(SHUTDOWN_REQUEST_TIMEOUT, client.shutdown_and_exit())
                    .await
                    .is_err()
                {
                    warn!(
                        "{}: shutdown request timed out, exiting anyway",
                        self.shared.server_name
                    );
                    client.exit();
                }
            } else {
                client.exit();
            }
        }

        let tasks = self.transport_tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }

        let supervisor = self.supervisor.lock().take();
        if let Some(mut supervisor) = supervisor {
            supervisor.teardown().await;
        }

        if let Some(handle) = self.dispatch_task.lock().take() {
            handle.abort();
        }

        self.shared.set_state(SessionState::Stopped);
        debug!("{}: stopped", self.shared.server_name);
    }

    /// Replace the handler for a server->client request method.
    /// Last writer wins; reassigning over a default is expected.
    pub fn register_request_handler(&self, method: impl Into<String>, handler: RequestHandler) {
        self.shared
            .request_handlers
            .lock()
            .insert(method.into(), handler);
    }

    /// Replace the handler for a server->client notification method.
    pub fn register_notification_handler(
        &self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) {
        self.shared
            .notification_handlers
            .lock()
            .insert(method.into(), handler);
    }

    fn register_default_handlers(&self) {
        let name = self.shared.server_name;

        self.register_request_handler(
            "client/registerCapability",
            Box::new(|_params| Ok(Value::Null)),
        );
        self.register_request_handler(
            "workspace/executeClientCommand",
            Box::new(|_params| Ok(Value::Array(Vec::new()))),
        );
        self.register_request_handler(
            "window/workDoneProgress/create",
            Box::new(|_params| Ok(Value::Null)),
        );
        self.register_request_handler(
            "workspace/configuration",
            Box::new(|params| {
                // one null per requested item; servers fall back to defaults
                let count = match &params {
                    jsonrpc::Params::Map(map) => map
                        .get("items")
                        .and_then(|items| items.as_array())
                        .map(|items| items.len())
                        .unwrap_or(0),
                    _ => 0,
                };
                Ok(Value::Array(vec![Value::Null; count]))
            }),
        );

        self.register_notification_handler(
            "window/logMessage",
            Box::new(move |params| {
                let params: lsp::LogMessageParams = params.parse()?;
                info!("{name} window/logMessage: {}", params.message);
                Ok(())
            }),
        );
        self.register_notification_handler(
            "window/showMessage",
            Box::new(move |params| {
                let params: lsp::ShowMessageParams = params.parse()?;
                info!("{name} window/showMessage: {}", params.message);
                Ok(())
            }),
        );
        self.register_notification_handler("$/progress", Box::new(|_params| Ok(())));
        self.register_notification_handler(
            "language/status",
            Box::new(move |params| {
                debug!("{name} language/status: {:?}", Value::from(params));
                Ok(())
            }),
        );

        // buffered diagnostics: keep the latest publish per document
        let diagnostics = self.shared.diagnostics.clone();
        self.register_notification_handler(
            "textDocument/publishDiagnostics",
            Box::new(move |params| {
                let params: lsp::PublishDiagnosticsParams = params.parse()?;
                diagnostics.lock().insert(params.uri, params.diagnostics);
                Ok(())
            }),
        );
    }

    // ---------------------------------------------------------------------
    // Open-document overlay
    // ---------------------------------------------------------------------

    pub(crate) fn ensure_ready(&self) -> Result<Arc<Client>> {
        match self.shared.state() {
            SessionState::Ready => Ok(self
                .client
                .get()
                .expect("ready session always has a client")
                .clone()),
            state => Err(Error::NotReady(state)),
        }
    }

    pub(crate) fn absolute(&self, relative_path: &Path) -> PathBuf {
        self.root.join(relative_path)
    }

    pub(crate) fn uri_for(&self, relative_path: &Path) -> Result<lsp::Url> {
        let absolute = self.absolute(relative_path);
        lsp::Url::from_file_path(&absolute).map_err(|_| {
            Error::Other(anyhow::anyhow!(
                "cannot build a file uri for {}",
                absolute.display()
            ))
        })
    }

    /// Open a document in the overlay. The first open per path reads the
    /// on-disk text and announces the document to the server; further opens
    /// only bump a reference count.
    pub async fn open_file(&self, relative_path: impl AsRef<Path>) -> Result<()> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;

        if self.documents.lock().bump_open(relative_path) {
            return Ok(());
        }

        let absolute = self.absolute(relative_path);
        let text = tokio::fs::read_to_string(&absolute).await?;
        let uri = self.uri_for(relative_path)?;
        let language_id = self.shared.profile.language_id();

        let announce = {
            let mut documents = self.documents.lock();
            if documents.bump_open(relative_path) {
                None // lost the race to a concurrent open
            } else {
                let doc = documents.insert_new(relative_path, uri, language_id, text);
                Some((doc.uri.clone(), doc.version, doc.text.to_string()))
            }
        };

        if let Some((uri, version, text)) = announce {
            client.text_document_did_open(uri, version, text, language_id.to_string());
        }
        Ok(())
    }

    /// Close a document. The last close per path drops the overlay entry and
    /// sends `didClose`, leaving server state as if it was never opened.
    pub async fn close_file(&self, relative_path: impl AsRef<Path>) -> Result<()> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;

        let closed_uri = self.documents.lock().close(relative_path)?;
        if let Some(uri) = closed_uri {
            client.text_document_did_close(uri);
        }
        Ok(())
    }

    /// Insert text into the overlay at a zero-based position. Returns the
    /// position just past the inserted text.
    pub async fn insert_text_at_position(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        text: &str,
    ) -> Result<lsp::Position> {
        let client = self.ensure_ready()?;
        let encoding = client.offset_encoding();

        let (uri, version, new_text, end) = self.documents.lock().insert_text(
            relative_path.as_ref(),
            lsp::Position::new(line, column),
            text,
            encoding,
        )?;
        client.text_document_did_change_full(uri, version, new_text);
        Ok(end)
    }

    /// Delete the overlay text between two zero-based positions. Returns the
    /// deleted text.
    pub async fn delete_text_between_positions(
        &self,
        relative_path: impl AsRef<Path>,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Result<String> {
        let client = self.ensure_ready()?;
        let encoding = client.offset_encoding();

        let (uri, version, new_text, deleted) = self.documents.lock().delete_text(
            relative_path.as_ref(),
            lsp::Position::new(start_line, start_column),
            lsp::Position::new(end_line, end_column),
            encoding,
        )?;
        client.text_document_did_change_full(uri, version, new_text);
        Ok(deleted)
    }

    /// The overlay text of an opened document.
    pub fn get_open_file_text(&self, relative_path: impl AsRef<Path>) -> Result<String> {
        self.documents.lock().text(relative_path.as_ref())
    }

    /// The latest published diagnostics for a document, if any.
    pub fn diagnostics_for(&self, relative_path: impl AsRef<Path>) -> Vec<lsp::Diagnostic> {
        let Ok(uri) = self.uri_for(relative_path.as_ref()) else {
            return Vec::new();
        };
        self.shared
            .diagnostics
            .lock()
            .get(&uri)
            .cloned()
            .unwrap_or_default()
    }
}

/// Consume server-originated calls in arrival order. Each handler runs to
/// completion before the next message is dispatched.
async fn dispatch(
    rx: UnboundedReceiver<jsonrpc::Call>,
    shared: Arc<Shared>,
    server_tx: UnboundedSender<Payload>,
) {
    let mut incoming = UnboundedReceiverStream::new(rx);
    while let Some(call) = incoming.next().await {
        match call {
            jsonrpc::Call::MethodCall(method_call) => {
                handle_server_request(&shared, &server_tx, method_call);
            }
            jsonrpc::Call::Notification(notification) => {
                handle_server_notification(&shared, notification);
            }
            jsonrpc::Call::Invalid { id } => {
                let output = jsonrpc::Output::Failure(jsonrpc::Failure {
                    jsonrpc: Some(jsonrpc::Version::V2),
                    id,
                    error: jsonrpc::Error::invalid_request(),
                });
                let _ = server_tx.send(Payload::Response(output));
            }
        }
    }
}

fn handle_server_request(
    shared: &Shared,
    server_tx: &UnboundedSender<Payload>,
    method_call: jsonrpc::MethodCall,
) {
    let jsonrpc::MethodCall {
        method, params, id, ..
    } = method_call;

    let result = {
        let mut handlers = shared.request_handlers.lock();
        match handlers.get_mut(&method) {
            Some(handler) => handler(params),
            None => Err(jsonrpc::Error::method_not_found(&method).into()),
        }
    };

    let output = match result {
        Ok(value) => jsonrpc::Output::Success(jsonrpc::Success {
            jsonrpc: Some(jsonrpc::Version::V2),
            id,
            result: value,
        }),
        Err(err) => {
            let error = match err.downcast::<jsonrpc::Error>() {
                Ok(protocol_error) => protocol_error,
                Err(other) => jsonrpc::Error::internal_error(other.to_string()),
            };
            jsonrpc::Output::Failure(jsonrpc::Failure {
                jsonrpc: Some(jsonrpc::Version::V2),
                id,
                error,
            })
        }
    };

    let _ = server_tx.send(Payload::Response(output));
}

fn handle_server_notification(shared: &Shared, notification: jsonrpc::Notification) {
    let jsonrpc::Notification { method, params, .. } = notification;

    if method == "exit" {
        // sent by a dying server, or injected by the transport when the
        // stream breaks; either way the session is done answering queries
        let mut state = shared.state.lock();
        if !matches!(*state, SessionState::Stopped) {
            *state = SessionState::ShuttingDown;
        }
        return;
    }

    if let Some(latch_name) = shared.profile.readiness_latch_for(&method, &params) {
        if let Some(latch) = shared.latches.get(latch_name) {
            debug!("{}: readiness signal '{latch_name}' observed", shared.server_name);
            latch.set();
        }
    }

    let mut handlers = shared.notification_handlers.lock();
    match handlers.get_mut(&method) {
        Some(handler) => {
            if let Err(err) = handler(params) {
                // swallowed during shutdown so teardown can finish
                if !matches!(
                    shared.state(),
                    SessionState::ShuttingDown | SessionState::Stopped
                ) {
                    error!(
                        "{}: notification handler for '{method}' failed: {err}",
                        shared.server_name
                    );
                }
            }
        }
        None => debug!("{}: unhandled notification {method}", shared.server_name),
    }
}
