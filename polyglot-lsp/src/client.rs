use crate::{
    jsonrpc, lsp,
    transport::{Payload, Transport},
    Error, OffsetEncoding, Result,
};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{
    mpsc::{channel, UnboundedSender},
    OnceCell,
};

/// The RPC half of a session: allocates request ids, pairs responses with
/// callers, and exposes typed wrappers for the LSP requests and
/// notifications the query surface uses.
#[derive(Debug)]
pub struct Client {
    name: String,
    server_tx: UnboundedSender<Payload>,
    transport: Arc<Transport>,
    request_counter: AtomicU64,
    pub(crate) capabilities: OnceCell<lsp::ServerCapabilities>,
    root_path: PathBuf,
    root_uri: lsp::Url,
    req_timeout: Duration,
}

impl Client {
    pub(crate) fn new(
        name: String,
        server_tx: UnboundedSender<Payload>,
        transport: Arc<Transport>,
        root_path: PathBuf,
        root_uri: lsp::Url,
        req_timeout: Duration,
    ) -> Self {
        Self {
            name,
            server_tx,
            transport,
            request_counter: AtomicU64::new(0),
            capabilities: OnceCell::new(),
            root_path,
            root_uri,
            req_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root_path
    }

    pub fn root_uri(&self) -> &lsp::Url {
        &self.root_uri
    }

    pub fn request_timeout(&self) -> Duration {
        self.req_timeout
    }

    fn next_request_id(&self) -> jsonrpc::Id {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        jsonrpc::Id::Num(id)
    }

    fn value_into_params(value: Value) -> jsonrpc::Params {
        use jsonrpc::Params;

        match value {
            Value::Null => Params::None,
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Params::Array(vec![value]),
            Value::Array(vec) => Params::Array(vec),
            Value::Object(map) => Params::Map(map),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.capabilities.get().is_some()
    }

    pub fn capabilities(&self) -> &lsp::ServerCapabilities {
        self.capabilities
            .get()
            .expect("language server not yet initialized!")
    }

    pub fn offset_encoding(&self) -> OffsetEncoding {
        self.capabilities()
            .position_encoding
            .as_ref()
            .and_then(|encoding| match encoding.as_str() {
                "utf-8" => Some(OffsetEncoding::Utf8),
                "utf-16" => Some(OffsetEncoding::Utf16),
                "utf-32" => Some(OffsetEncoding::Utf32),
                encoding => {
                    error!(
                        "{}: server provided invalid position encoding {encoding}, defaulting to utf-16",
                        self.name
                    );
                    None
                }
            })
            .unwrap_or_default()
    }

    /// Execute an RPC request on the language server, correlating the
    /// response by id. On timeout the pending entry is discarded and a
    /// `$/cancelRequest` is sent best-effort.
    pub(crate) fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> impl Future<Output = Result<Value>> + 'static {
        let server_tx = self.server_tx.clone();
        let transport = self.transport.clone();
        let id = self.next_request_id();

        // It's important that the send is not part of the future so that it
        // happens right away and the request order stays consistent.
        let rx = {
            let request = jsonrpc::MethodCall {
                jsonrpc: Some(jsonrpc::Version::V2),
                id: id.clone(),
                method: method.to_string(),
                params: Self::value_into_params(params),
            };
            let (tx, rx) = channel::<Result<Value>>(1);
            server_tx
                .send(Payload::Request {
                    chan: tx,
                    value: request,
                })
                .map(|_| rx)
                .map_err(|err| Error::Other(err.into()))
        };

        async move {
            let mut rx = rx?;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(response) => response.unwrap_or(Err(Error::StreamClosed)),
                Err(_) => {
                    transport.forget_request(&id).await;
                    let params = match &id {
                        jsonrpc::Id::Num(n) => serde_json::json!({ "id": n }),
                        jsonrpc::Id::Str(s) => serde_json::json!({ "id": s }),
                        jsonrpc::Id::Null => Value::Null,
                    };
                    let _ = server_tx.send(Payload::Notification(jsonrpc::Notification {
                        jsonrpc: Some(jsonrpc::Version::V2),
                        method: "$/cancelRequest".to_string(),
                        params: Self::value_into_params(params),
                    }));
                    Err(Error::Timeout(id))
                }
            }
        }
    }

    fn call_with_timeout<R: lsp::request::Request>(
        &self,
        params: &R::Params,
        timeout: Duration,
    ) -> impl Future<Output = Result<R::Result>> + 'static
    where
        R::Params: serde::Serialize,
        R::Result: DeserializeOwned,
    {
        let raw = serde_json::to_value(params)
            .map_err(Error::from)
            .map(|params| self.call_raw(R::METHOD, params, timeout));

        async move {
            let value = raw?.await?;
            serde_json::from_value(value).map_err(Into::into)
        }
    }

    fn call<R: lsp::request::Request>(
        &self,
        params: &R::Params,
    ) -> impl Future<Output = Result<R::Result>> + 'static
    where
        R::Params: serde::Serialize,
        R::Result: DeserializeOwned,
    {
        self.call_with_timeout::<R>(params, self.req_timeout)
    }

    /// Send an RPC notification to the language server.
    pub fn notify<N: lsp::notification::Notification>(&self, params: N::Params)
    where
        N::Params: serde::Serialize,
    {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(err) => {
                error!(
                    "{}: failed to serialize params for notification '{}': {err}",
                    self.name,
                    N::METHOD,
                );
                return;
            }
        };

        let notification = jsonrpc::Notification {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: N::METHOD.to_string(),
            params: Self::value_into_params(params),
        };

        if let Err(err) = self.server_tx.send(Payload::Notification(notification)) {
            error!(
                "{}: failed to send notification '{}': {err}",
                self.name,
                N::METHOD
            );
        }
    }

    /// Reply to a language server RPC call.
    pub fn reply(
        &self,
        id: jsonrpc::Id,
        result: core::result::Result<Value, jsonrpc::Error>,
    ) -> Result<()> {
        use jsonrpc::{Failure, Output, Success, Version};

        let output = match result {
            Ok(result) => Output::Success(Success {
                jsonrpc: Some(Version::V2),
                id,
                result,
            }),
            Err(error) => Output::Failure(Failure {
                jsonrpc: Some(Version::V2),
                id,
                error,
            }),
        };

        self.server_tx
            .send(Payload::Response(output))
            .map_err(|err| Error::Other(err.into()))?;

        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // General messages
    // -------------------------------------------------------------------------------------------

    /// Send the `initialize` request. The params are a fully substituted
    /// per-language template, so they travel as a raw value.
    pub(crate) async fn initialize(
        &self,
        params: Value,
        timeout: Duration,
    ) -> Result<lsp::InitializeResult> {
        let value = self.call_raw("initialize", params, timeout).await?;
        serde_json::from_value(value).map_err(Into::into)
    }

    pub fn initialized(&self) {
        self.notify::<lsp::notification::Initialized>(lsp::InitializedParams {})
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call::<lsp::request::Shutdown>(&()).await
    }

    pub fn exit(&self) {
        self.notify::<lsp::notification::Exit>(())
    }

    /// Shut the server down gracefully, ignoring a failed or missing
    /// shutdown response so that teardown can proceed regardless.
    pub async fn shutdown_and_exit(&self) -> Result<()> {
        if let Err(err) = self.shutdown().await {
            warn!(
                "{}: language server failed to terminate gracefully - {err}",
                self.name
            );
        }
        self.exit();
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Text document
    // -------------------------------------------------------------------------------------------

    pub fn text_document_did_open(
        &self,
        uri: lsp::Url,
        version: i32,
        text: String,
        language_id: String,
    ) {
        self.notify::<lsp::notification::DidOpenTextDocument>(lsp::DidOpenTextDocumentParams {
            text_document: lsp::TextDocumentItem {
                uri,
                language_id,
                version,
                text,
            },
        })
    }

    /// Full-text sync: the overlay is small and authoritative, so every edit
    /// ships the whole document.
    pub fn text_document_did_change_full(&self, uri: lsp::Url, version: i32, text: String) {
        self.notify::<lsp::notification::DidChangeTextDocument>(lsp::DidChangeTextDocumentParams {
            text_document: lsp::VersionedTextDocumentIdentifier { uri, version },
            content_changes: vec![lsp::TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        })
    }

    pub fn text_document_did_close(&self, uri: lsp::Url) {
        self.notify::<lsp::notification::DidCloseTextDocument>(lsp::DidCloseTextDocumentParams {
            text_document: lsp::TextDocumentIdentifier { uri },
        })
    }

    fn goto_request<
        T: lsp::request::Request<
            Params = lsp::GotoDefinitionParams,
            Result = Option<lsp::GotoDefinitionResponse>,
        >,
    >(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> impl Future<Output = Result<T::Result>> + 'static {
        let params = lsp::GotoDefinitionParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
            partial_result_params: lsp::PartialResultParams::default(),
        };

        self.call_with_timeout::<T>(&params, timeout)
    }

    pub fn goto_definition(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>> + 'static> {
        match self.capabilities().definition_provider {
            Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_)) => (),
            _ => return None,
        }

        Some(self.goto_request::<lsp::request::GotoDefinition>(text_document, position, timeout))
    }

    pub fn goto_type_definition(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>> + 'static> {
        match self.capabilities().type_definition_provider {
            Some(
                lsp::TypeDefinitionProviderCapability::Simple(true)
                | lsp::TypeDefinitionProviderCapability::Options(_),
            ) => (),
            _ => return None,
        }

        Some(self.goto_request::<lsp::request::GotoTypeDefinition>(text_document, position, timeout))
    }

    pub fn goto_implementation(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::GotoDefinitionResponse>>> + 'static> {
        match self.capabilities().implementation_provider {
            Some(
                lsp::ImplementationProviderCapability::Simple(true)
                | lsp::ImplementationProviderCapability::Options(_),
            ) => (),
            _ => return None,
        }

        Some(self.goto_request::<lsp::request::GotoImplementation>(text_document, position, timeout))
    }

    pub fn goto_reference(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        include_declaration: bool,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<Vec<lsp::Location>>>> + 'static> {
        match self.capabilities().references_provider {
            Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_)) => (),
            _ => return None,
        }

        let params = lsp::ReferenceParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            context: lsp::ReferenceContext {
                include_declaration,
            },
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
            partial_result_params: lsp::PartialResultParams::default(),
        };

        Some(self.call_with_timeout::<lsp::request::References>(&params, timeout))
    }

    pub fn text_document_hover(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::Hover>>> + 'static> {
        match self.capabilities().hover_provider {
            Some(
                lsp::HoverProviderCapability::Simple(true)
                | lsp::HoverProviderCapability::Options(_),
            ) => (),
            _ => return None,
        }

        let params = lsp::HoverParams {
            text_document_position_params: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
        };

        Some(self.call_with_timeout::<lsp::request::HoverRequest>(&params, timeout))
    }

    pub fn document_symbols(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::DocumentSymbolResponse>>> + 'static> {
        match self.capabilities().document_symbol_provider {
            Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_)) => (),
            _ => return None,
        }

        let params = lsp::DocumentSymbolParams {
            text_document,
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
            partial_result_params: lsp::PartialResultParams::default(),
        };

        Some(self.call_with_timeout::<lsp::request::DocumentSymbolRequest>(&params, timeout))
    }

    // empty string to get all symbols
    pub fn workspace_symbols(
        &self,
        query: String,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::WorkspaceSymbolResponse>>> + 'static> {
        match self.capabilities().workspace_symbol_provider {
            Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_)) => (),
            _ => return None,
        }

        let params = lsp::WorkspaceSymbolParams {
            query,
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
            partial_result_params: lsp::PartialResultParams::default(),
        };

        Some(self.call_with_timeout::<lsp::request::WorkspaceSymbolRequest>(&params, timeout))
    }

    pub fn completion(
        &self,
        text_document: lsp::TextDocumentIdentifier,
        position: lsp::Position,
        timeout: Duration,
    ) -> Option<impl Future<Output = Result<Option<lsp::CompletionResponse>>> + 'static> {
        self.capabilities().completion_provider.as_ref()?;

        let params = lsp::CompletionParams {
            text_document_position: lsp::TextDocumentPositionParams {
                text_document,
                position,
            },
            context: None,
            work_done_progress_params: lsp::WorkDoneProgressParams::default(),
            partial_result_params: lsp::PartialResultParams::default(),
        };

        Some(self.call_with_timeout::<lsp::request::Completion>(&params, timeout))
    }
}
