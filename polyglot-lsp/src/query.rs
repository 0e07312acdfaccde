//! The language-agnostic query surface.
//!
//! Each query opens the target document in the overlay (closing it again
//! afterwards, so open/close stays symmetric), issues the LSP request with
//! an effective timeout, and normalizes the response: URIs inside the
//! workspace become relative + absolute paths, URIs outside keep only their
//! absolute form.

use crate::{lsp, session::Session, Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One resolved code location.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTarget {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub uri: lsp::Url,
    pub range: lsp::Range,
}

/// One completion candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEntry {
    pub completion_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<lsp::CompletionItemKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_text: Option<String>,
}

/// Document symbols in both shapes: servers answer with either a flat
/// `SymbolInformation` list or a `DocumentSymbol` tree, and both views are
/// derived from whichever arrived so callers can pick.
#[derive(Debug, Clone, Default)]
pub struct DocumentSymbols {
    pub flat: Vec<lsp::SymbolInformation>,
    pub tree: Vec<lsp::DocumentSymbol>,
}

impl Session {
    // -----------------------------------------------------------------
    // Goto family
    // -----------------------------------------------------------------

    pub async fn request_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.request_definition_with_timeout(relative_path, line, column, self.request_timeout())
            .await
    }

    pub async fn request_definition_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Vec<NavigationTarget>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.goto_definition(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/definition")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(goto_targets(response, self.workspace_root()))
    }

    pub async fn request_type_definition(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.request_type_definition_with_timeout(
            relative_path,
            line,
            column,
            self.request_timeout(),
        )
        .await
    }

    pub async fn request_type_definition_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Vec<NavigationTarget>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.goto_type_definition(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/typeDefinition")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(goto_targets(response, self.workspace_root()))
    }

    pub async fn request_implementation(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.request_implementation_with_timeout(
            relative_path,
            line,
            column,
            self.request_timeout(),
        )
        .await
    }

    pub async fn request_implementation_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Vec<NavigationTarget>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.goto_implementation(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/implementation")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(goto_targets(response, self.workspace_root()))
    }

    // -----------------------------------------------------------------
    // References
    // -----------------------------------------------------------------

    pub async fn request_references(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<NavigationTarget>> {
        self.request_references_with_options(
            relative_path,
            line,
            column,
            true,
            self.request_timeout(),
        )
        .await
    }

    pub async fn request_references_with_options(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        include_declaration: bool,
        timeout: Duration,
    ) -> Result<Vec<NavigationTarget>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.goto_reference(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            include_declaration,
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/references")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(location_targets(response, self.workspace_root()))
    }

    // -----------------------------------------------------------------
    // Hover
    // -----------------------------------------------------------------

    pub async fn request_hover(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Option<lsp::Hover>> {
        self.request_hover_with_timeout(relative_path, line, column, self.request_timeout())
            .await
    }

    /// Hover contents are passed through verbatim; both the plain-string and
    /// marked-up forms survive untouched.
    pub async fn request_hover_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Option<lsp::Hover>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.text_document_hover(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/hover")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(response)
    }

    // -----------------------------------------------------------------
    // Symbols
    // -----------------------------------------------------------------

    pub async fn request_document_symbols(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<DocumentSymbols> {
        self.request_document_symbols_with_timeout(relative_path, self.request_timeout())
            .await
    }

    pub async fn request_document_symbols_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        timeout: Duration,
    ) -> Result<DocumentSymbols> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let document_uri = uri.clone();
        let outcome = match client.document_symbols(lsp::TextDocumentIdentifier { uri }, timeout) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/documentSymbol")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(document_symbols(response, &document_uri))
    }

    pub async fn request_workspace_symbol(
        &self,
        query: &str,
    ) -> Result<Vec<lsp::SymbolInformation>> {
        self.request_workspace_symbol_with_timeout(query, self.request_timeout())
            .await
    }

    pub async fn request_workspace_symbol_with_timeout(
        &self,
        query: &str,
        timeout: Duration,
    ) -> Result<Vec<lsp::SymbolInformation>> {
        let client = self.ensure_ready()?;

        let response = match client.workspace_symbols(query.to_string(), timeout) {
            Some(request) => request.await?,
            None => return Err(Error::Unsupported("workspace/symbol")),
        };
        Ok(workspace_symbols(response))
    }

    // -----------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------

    pub async fn request_completions(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
    ) -> Result<Vec<CompletionEntry>> {
        self.request_completions_with_timeout(relative_path, line, column, self.request_timeout())
            .await
    }

    pub async fn request_completions_with_timeout(
        &self,
        relative_path: impl AsRef<Path>,
        line: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Vec<CompletionEntry>> {
        let relative_path = relative_path.as_ref();
        let client = self.ensure_ready()?;
        self.open_file(relative_path).await?;

        let (uri, _) = self.documents.lock().identifier(relative_path)?;
        let outcome = match client.completion(
            lsp::TextDocumentIdentifier { uri },
            lsp::Position::new(line, column),
            timeout,
        ) {
            Some(request) => request.await,
            None => Err(Error::Unsupported("textDocument/completion")),
        };

        let close_result = self.close_file(relative_path).await;
        let response = outcome?;
        close_result?;
        Ok(completion_entries(response))
    }
}

// ---------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------

fn target(uri: lsp::Url, range: lsp::Range, root: &Path) -> NavigationTarget {
    let absolute_path = uri
        .to_file_path()
        .unwrap_or_else(|_| PathBuf::from(uri.path()));
    let relative_path = absolute_path
        .strip_prefix(root)
        .map(|relative| relative.to_string_lossy().into_owned())
        // outside the workspace: keep the absolute form
        .unwrap_or_else(|_| absolute_path.to_string_lossy().into_owned());

    NavigationTarget {
        relative_path,
        absolute_path,
        uri,
        range,
    }
}

pub(crate) fn goto_targets(
    response: Option<lsp::GotoDefinitionResponse>,
    root: &Path,
) -> Vec<NavigationTarget> {
    match response {
        None => Vec::new(),
        Some(lsp::GotoDefinitionResponse::Scalar(location)) => {
            vec![target(location.uri, location.range, root)]
        }
        Some(lsp::GotoDefinitionResponse::Array(locations)) => locations
            .into_iter()
            .map(|location| target(location.uri, location.range, root))
            .collect(),
        Some(lsp::GotoDefinitionResponse::Link(links)) => links
            .into_iter()
            .map(|link| target(link.target_uri, link.target_selection_range, root))
            .collect(),
    }
}

pub(crate) fn location_targets(
    locations: Option<Vec<lsp::Location>>,
    root: &Path,
) -> Vec<NavigationTarget> {
    locations
        .unwrap_or_default()
        .into_iter()
        .map(|location| target(location.uri, location.range, root))
        .collect()
}

pub(crate) fn completion_entries(
    response: Option<lsp::CompletionResponse>,
) -> Vec<CompletionEntry> {
    let items = match response {
        None => return Vec::new(),
        Some(lsp::CompletionResponse::Array(items)) => items,
        Some(lsp::CompletionResponse::List(list)) => list.items,
    };

    items.into_iter().map(completion_entry).collect()
}

fn completion_entry(item: lsp::CompletionItem) -> CompletionEntry {
    let completion_text = match &item.text_edit {
        Some(lsp::CompletionTextEdit::Edit(edit)) => edit.new_text.clone(),
        Some(lsp::CompletionTextEdit::InsertAndReplace(edit)) => edit.new_text.clone(),
        None => item
            .insert_text
            .clone()
            .unwrap_or_else(|| item.label.clone()),
    };

    CompletionEntry {
        completion_text,
        kind: item.kind,
        detail: item.detail,
        sort_text: item.sort_text,
    }
}

pub(crate) fn document_symbols(
    response: Option<lsp::DocumentSymbolResponse>,
    uri: &lsp::Url,
) -> DocumentSymbols {
    match response {
        None => DocumentSymbols::default(),
        Some(lsp::DocumentSymbolResponse::Nested(tree)) => {
            let mut flat = Vec::new();
            flatten_symbols(&tree, uri, None, &mut flat);
            DocumentSymbols { flat, tree }
        }
        Some(lsp::DocumentSymbolResponse::Flat(flat)) => {
            let tree = tree_from_flat(&flat);
            DocumentSymbols { flat, tree }
        }
    }
}

fn flatten_symbols(
    symbols: &[lsp::DocumentSymbol],
    uri: &lsp::Url,
    container: Option<&str>,
    out: &mut Vec<lsp::SymbolInformation>,
) {
    for symbol in symbols {
        #[allow(deprecated)]
        out.push(lsp::SymbolInformation {
            name: symbol.name.clone(),
            kind: symbol.kind,
            tags: symbol.tags.clone(),
            deprecated: symbol.deprecated,
            location: lsp::Location {
                uri: uri.clone(),
                range: symbol.range,
            },
            container_name: container.map(str::to_owned),
        });
        if let Some(children) = &symbol.children {
            flatten_symbols(children, uri, Some(&symbol.name), out);
        }
    }
}

/// Rebuild a hierarchy from a flat symbol list: a symbol becomes a child of
/// the innermost symbol whose range contains its range.
fn tree_from_flat(flat: &[lsp::SymbolInformation]) -> Vec<lsp::DocumentSymbol> {
    fn node(symbol: &lsp::SymbolInformation) -> lsp::DocumentSymbol {
        #[allow(deprecated)]
        let node = lsp::DocumentSymbol {
            name: symbol.name.clone(),
            detail: None,
            kind: symbol.kind,
            tags: symbol.tags.clone(),
            deprecated: symbol.deprecated,
            range: symbol.location.range,
            selection_range: symbol.location.range,
            children: None,
        };
        node
    }

    fn contains(outer: &lsp::Range, inner: &lsp::Range) -> bool {
        outer.start <= inner.start && inner.end <= outer.end
    }

    fn attach(parent: &mut lsp::DocumentSymbol, child: lsp::DocumentSymbol) {
        parent.children.get_or_insert_with(Vec::new).push(child);
    }

    let mut ordered: Vec<&lsp::SymbolInformation> = flat.iter().collect();
    ordered.sort_by(|a, b| {
        a.location
            .range
            .start
            .cmp(&b.location.range.start)
            .then(b.location.range.end.cmp(&a.location.range.end))
    });

    let mut roots: Vec<lsp::DocumentSymbol> = Vec::new();
    let mut stack: Vec<lsp::DocumentSymbol> = Vec::new();

    for symbol in ordered {
        let current = node(symbol);
        while let Some(top) = stack.last() {
            if contains(&top.range, &current.range) {
                break;
            }
            let finished = stack.pop().expect("stack top exists");
            match stack.last_mut() {
                Some(parent) => attach(parent, finished),
                None => roots.push(finished),
            }
        }
        stack.push(current);
    }

    while let Some(finished) = stack.pop() {
        match stack.last_mut() {
            Some(parent) => attach(parent, finished),
            None => roots.push(finished),
        }
    }

    roots
}

pub(crate) fn workspace_symbols(
    response: Option<lsp::WorkspaceSymbolResponse>,
) -> Vec<lsp::SymbolInformation> {
    match response {
        None => Vec::new(),
        Some(lsp::WorkspaceSymbolResponse::Flat(symbols)) => symbols,
        Some(lsp::WorkspaceSymbolResponse::Nested(symbols)) => symbols
            .into_iter()
            .map(|symbol| {
                let location = match symbol.location {
                    lsp::OneOf::Left(location) => location,
                    lsp::OneOf::Right(workspace_location) => lsp::Location {
                        uri: workspace_location.uri,
                        range: lsp::Range::default(),
                    },
                };
                #[allow(deprecated)]
                let information = lsp::SymbolInformation {
                    name: symbol.name,
                    kind: symbol.kind,
                    tags: symbol.tags,
                    deprecated: None,
                    location,
                    container_name: symbol.container_name,
                };
                information
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/work/repo")
    }

    fn loc(path: &str, start: (u32, u32), end: (u32, u32)) -> lsp::Location {
        lsp::Location {
            uri: lsp::Url::from_file_path(path).unwrap(),
            range: lsp::Range {
                start: lsp::Position::new(start.0, start.1),
                end: lsp::Position::new(end.0, end.1),
            },
        }
    }

    #[test]
    fn scalar_array_and_link_responses_normalize_alike() {
        let location = loc("/work/repo/db.go", (177, 5), (177, 9));

        let from_scalar = goto_targets(
            Some(lsp::GotoDefinitionResponse::Scalar(location.clone())),
            &root(),
        );
        let from_array = goto_targets(
            Some(lsp::GotoDefinitionResponse::Array(vec![location.clone()])),
            &root(),
        );
        let from_link = goto_targets(
            Some(lsp::GotoDefinitionResponse::Link(vec![lsp::LocationLink {
                origin_selection_range: None,
                target_uri: location.uri.clone(),
                target_range: lsp::Range {
                    start: lsp::Position::new(170, 0),
                    end: lsp::Position::new(190, 1),
                },
                target_selection_range: location.range,
            }])),
            &root(),
        );

        assert_eq!(from_scalar, from_array);
        assert_eq!(from_scalar, from_link);
        let target = &from_scalar[0];
        assert_eq!(target.relative_path, "db.go");
        assert_eq!(target.absolute_path, PathBuf::from("/work/repo/db.go"));
        assert_eq!(target.range.start, lsp::Position::new(177, 5));
    }

    #[test]
    fn locations_outside_the_workspace_stay_absolute() {
        let targets = location_targets(
            Some(vec![loc("/usr/lib/go/src/fmt/print.go", (10, 0), (10, 5))]),
            &root(),
        );
        assert_eq!(targets[0].relative_path, "/usr/lib/go/src/fmt/print.go");
        assert_eq!(
            targets[0].absolute_path,
            PathBuf::from("/usr/lib/go/src/fmt/print.go")
        );
    }

    #[test]
    fn empty_responses_are_empty_lists() {
        assert!(goto_targets(None, &root()).is_empty());
        assert!(location_targets(None, &root()).is_empty());
        assert!(location_targets(Some(Vec::new()), &root()).is_empty());
        assert!(completion_entries(None).is_empty());
    }

    #[test]
    fn completion_text_prefers_the_text_edit() {
        let mut item = lsp::CompletionItem::new_simple("label".into(), "detail".into());
        assert_eq!(completion_entry(item.clone()).completion_text, "label");

        item.insert_text = Some("insert".into());
        assert_eq!(completion_entry(item.clone()).completion_text, "insert");

        item.text_edit = Some(lsp::CompletionTextEdit::Edit(lsp::TextEdit {
            range: lsp::Range::default(),
            new_text: "edited".into(),
        }));
        assert_eq!(completion_entry(item).completion_text, "edited");
    }

    fn flat_symbol(name: &str, start: (u32, u32), end: (u32, u32)) -> lsp::SymbolInformation {
        #[allow(deprecated)]
        let symbol = lsp::SymbolInformation {
            name: name.to_string(),
            kind: lsp::SymbolKind::FUNCTION,
            tags: None,
            deprecated: None,
            location: loc("/work/repo/main.go", start, end),
            container_name: None,
        };
        symbol
    }

    #[test]
    fn nested_document_symbols_flatten_with_containers() {
        #[allow(deprecated)]
        let tree = vec![lsp::DocumentSymbol {
            name: "DB".to_string(),
            detail: None,
            kind: lsp::SymbolKind::STRUCT,
            tags: None,
            deprecated: None,
            range: lsp::Range {
                start: lsp::Position::new(0, 0),
                end: lsp::Position::new(20, 0),
            },
            selection_range: lsp::Range {
                start: lsp::Position::new(0, 5),
                end: lsp::Position::new(0, 7),
            },
            children: Some(vec![
                lsp::DocumentSymbol {
                    name: "Open".to_string(),
                    detail: None,
                    kind: lsp::SymbolKind::METHOD,
                    tags: None,
                    deprecated: None,
                    range: lsp::Range {
                        start: lsp::Position::new(2, 0),
                        end: lsp::Position::new(6, 0),
                    },
                    selection_range: lsp::Range {
                        start: lsp::Position::new(2, 5),
                        end: lsp::Position::new(2, 9),
                    },
                    children: None,
                },
            ]),
        }];

        let uri = lsp::Url::from_file_path("/work/repo/db.go").unwrap();
        let symbols = document_symbols(Some(lsp::DocumentSymbolResponse::Nested(tree)), &uri);

        assert_eq!(symbols.flat.len(), 2);
        assert_eq!(symbols.flat[0].name, "DB");
        assert_eq!(symbols.flat[1].name, "Open");
        assert_eq!(symbols.flat[1].container_name.as_deref(), Some("DB"));
        assert_eq!(symbols.tree.len(), 1);
    }

    #[test]
    fn flat_document_symbols_grow_a_tree_by_containment() {
        let flat = vec![
            flat_symbol("outer", (0, 0), (10, 0)),
            flat_symbol("inner", (2, 0), (4, 0)),
            flat_symbol("sibling", (12, 0), (14, 0)),
        ];

        let uri = lsp::Url::from_file_path("/work/repo/main.go").unwrap();
        let symbols = document_symbols(Some(lsp::DocumentSymbolResponse::Flat(flat)), &uri);

        assert_eq!(symbols.flat.len(), 3);
        assert_eq!(symbols.tree.len(), 2);
        assert_eq!(symbols.tree[0].name, "outer");
        let children = symbols.tree[0].children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "inner");
        assert_eq!(symbols.tree[1].name, "sibling");
    }

    #[test]
    fn nested_workspace_symbols_normalize_to_symbol_information() {
        let response = lsp::WorkspaceSymbolResponse::Nested(vec![lsp::WorkspaceSymbol {
            name: "Config".to_string(),
            kind: lsp::SymbolKind::STRUCT,
            tags: None,
            container_name: Some("config".to_string()),
            location: lsp::OneOf::Right(lsp::WorkspaceLocation {
                uri: lsp::Url::from_file_path("/work/repo/config.go").unwrap(),
            }),
            data: None,
        }]);

        let symbols = workspace_symbols(Some(response));
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "Config");
        assert_eq!(symbols[0].location.range, lsp::Range::default());
    }
}
