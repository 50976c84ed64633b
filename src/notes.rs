//! Host document store: enumerates notes, reads them and splits them into
//! heading sections.
//!
//! The index never holds a live handle into the store. Records carry a
//! denormalized [`DocumentMeta`] and are re-resolved into a [`DocumentRef`]
//! on demand.

use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// File statistics, times in epoch milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStat {
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

/// Minimal description of a note, as stored alongside each embedding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Path relative to the notes root, `/`-separated
    pub path: String,
    /// File name with extension
    pub name: String,
    /// File name without extension
    pub basename: String,
    pub stat: DocumentStat,
}

impl DocumentMeta {
    pub fn new(path: &str, stat: DocumentStat) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let basename = match name.rfind('.') {
            Some(idx) if idx > 0 => name[..idx].to_string(),
            _ => name.clone(),
        };

        Self {
            path: path.to_string(),
            name,
            basename,
            stat,
        }
    }
}

/// Reference from an index record to its owning document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentRef {
    /// Confirmed against the document store
    Live(DocumentMeta),
    /// Document is gone (or not yet re-resolved); last known snapshot
    Stale(DocumentMeta),
}

impl DocumentRef {
    pub fn meta(&self) -> &DocumentMeta {
        match self {
            DocumentRef::Live(meta) | DocumentRef::Stale(meta) => meta,
        }
    }

    pub fn path(&self) -> &str {
        &self.meta().path
    }

    pub fn is_live(&self) -> bool {
        matches!(self, DocumentRef::Live(_))
    }

    /// Re-resolve against the store, falling back to the stored snapshot.
    pub fn resolve(self, store: &dyn DocumentStore) -> Self {
        let meta = match self {
            DocumentRef::Live(meta) | DocumentRef::Stale(meta) => meta,
        };
        match store.stat(&meta.path) {
            Some(live) => DocumentRef::Live(live),
            None => DocumentRef::Stale(meta),
        }
    }
}

impl Serialize for DocumentRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.meta().serialize(serializer)
    }
}

/// One heading-delimited part of a note.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub content: String,
}

/// A note split for indexing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedNote {
    /// Text after the front matter
    pub body: String,
    /// Heading sections in document order; empty when the note has no headings
    pub sections: Vec<Section>,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document path: {0}")]
    InvalidPath(String),

    #[error("io error: {0:?}")]
    Io(#[from] std::io::Error),
}

pub trait DocumentStore: Send + Sync {
    /// Every markdown document in the store, sorted by path.
    fn list_documents(&self) -> Result<Vec<DocumentMeta>, DocumentStoreError>;
    /// Current metadata of a document, `None` if it no longer exists.
    fn stat(&self, path: &str) -> Option<DocumentMeta>;
    /// Read and split a document.
    fn read(&self, path: &str) -> Result<ParsedNote, DocumentStoreError>;
}

/// Whether a document path is excluded from indexing.
///
/// Only markdown files are indexed; anything under one of `ignored_folders`
/// is skipped.
pub fn is_ignored(path: &str, ignored_folders: &[String]) -> bool {
    if !path.ends_with(".md") {
        return true;
    }

    ignored_folders.iter().any(|folder| {
        let folder = folder.trim_end_matches('/');
        !folder.is_empty() && path.starts_with(&format!("{folder}/"))
    })
}

/// Split raw note text into body and heading sections.
pub fn parse_note(raw: &str) -> ParsedNote {
    let body = strip_front_matter(raw);
    let headings = find_headings(body);

    let mut sections: Vec<Section> = Vec::new();
    for (idx, heading) in headings.iter().enumerate() {
        let end = headings
            .get(idx + 1)
            .map(|next| next.line_start)
            .unwrap_or(body.len());
        let content = body[heading.line_end..end].trim();

        // duplicate heading names share one key
        match sections.iter_mut().find(|s| s.name == heading.name) {
            Some(existing) => {
                if !content.is_empty() {
                    if !existing.content.is_empty() {
                        existing.content.push_str("\n\n");
                    }
                    existing.content.push_str(content);
                }
            }
            None => sections.push(Section {
                name: heading.name.clone(),
                content: content.to_string(),
            }),
        }
    }

    ParsedNote {
        body: body.trim().to_string(),
        sections,
    }
}

fn strip_front_matter(raw: &str) -> &str {
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return raw;
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        offset += line.len();
        if trimmed == "---" || trimmed == "..." {
            return &rest[offset..];
        }
    }

    // unterminated front matter is treated as regular text
    raw
}

struct Heading {
    name: String,
    line_start: usize,
    line_end: usize,
}

fn find_headings(body: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut in_fence = false;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || indent > 3 {
            continue;
        }

        if let Some(name) = heading_text(trimmed.trim_end()) {
            headings.push(Heading {
                name,
                line_start,
                line_end: offset,
            });
        }
    }

    headings
}

fn heading_text(line: &str) -> Option<String> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }

    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }

    let name = rest.trim().trim_end_matches('#').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Document store over a directory of markdown files.
#[derive(Clone, Debug)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert an absolute path under the root into a store path.
    pub fn relative_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, DocumentStoreError> {
        let rel = Path::new(path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DocumentStoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn scan_directory(&self, dir: &Path, out: &mut Vec<DocumentMeta>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_name = entry.file_name();
            if file_name.to_string_lossy().starts_with('.') {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.scan_directory(&path, out)?;
            } else if file_type.is_file() {
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let Some(rel) = self.relative_path(&path) else {
                    continue;
                };
                match std::fs::metadata(&path) {
                    Ok(metadata) => out.push(DocumentMeta::new(&rel, stat_from(&metadata))),
                    Err(e) => log::warn!("failed to stat {}: {e}", path.display()),
                }
            }
        }

        Ok(())
    }
}

impl DocumentStore for FsDocumentStore {
    fn list_documents(&self) -> Result<Vec<DocumentMeta>, DocumentStoreError> {
        let mut docs = Vec::new();
        self.scan_directory(&self.root, &mut docs)?;
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    fn stat(&self, path: &str) -> Option<DocumentMeta> {
        let full = self.full_path(path).ok()?;
        let metadata = std::fs::metadata(full).ok()?;
        if !metadata.is_file() {
            return None;
        }
        Some(DocumentMeta::new(path, stat_from(&metadata)))
    }

    fn read(&self, path: &str) -> Result<ParsedNote, DocumentStoreError> {
        let full = self.full_path(path)?;
        let raw = match std::fs::read_to_string(&full) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DocumentStoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(parse_note(&raw))
    }
}

fn stat_from(metadata: &std::fs::Metadata) -> DocumentStat {
    let mtime = metadata.modified().map(epoch_millis).unwrap_or(0);
    let ctime = metadata.created().map(epoch_millis).unwrap_or(mtime);

    DocumentStat {
        mtime,
        ctime,
        size: metadata.len(),
    }
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
