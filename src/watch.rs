//! Filesystem watching for the `watch` command.
//!
//! Translates `notify` events on the notes directory into
//! [`DocumentEvent`]s and pumps them through the change watcher until
//! shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use crate::notes::{DocumentStore, FsDocumentStore};
use crate::semantic::{ChangeWatcherAdapter, DocumentEvent, EmbeddingService};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Watch the notes directory until `running` is cleared.
pub fn run(
    service: &mut EmbeddingService,
    adapter: &mut ChangeWatcherAdapter,
    store: &FsDocumentStore,
    running: &AtomicBool,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(tx).context("failed to create file watcher")?;
    watcher
        .watch(store.root(), RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", store.root().display()))?;
    log::info!("watching {} for changes", store.root().display());

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(TICK_INTERVAL) {
            Ok(Ok(event)) => {
                for doc_event in translate(&event, store, service) {
                    log::debug!("{doc_event:?}");
                    if let Err(e) = adapter.handle(service, doc_event) {
                        log::error!("failed to update embeddings: {e}");
                    }
                }
            }
            Ok(Err(e)) => log::error!("watch error: {e}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        for (path, e) in adapter.tick(service) {
            log::error!("failed to update embeddings for {path}: {e}");
        }
    }

    log::info!("stopped watching {}", store.root().display());
    Ok(())
}

/// Map one notify event to document events. Paths outside the notes root
/// or inside hidden directories are dropped.
///
/// Folder events fan out to the notes below the folder: indexed notes for the
/// side that is gone, notes found on disk for the side that appeared.
fn translate(
    event: &Event,
    store: &FsDocumentStore,
    service: &EmbeddingService,
) -> Vec<DocumentEvent> {
    let paths: Vec<Option<String>> = event
        .paths
        .iter()
        .map(|path| document_path(store, path))
        .collect();

    match (&event.kind, paths.as_slice()) {
        (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), [from, to]) => match (from, to) {
            (Some(old_path), Some(path)) => renamed(store, service, old_path, path),
            (Some(old_path), None) => gone(service, old_path),
            (None, Some(path)) => appeared(store, path),
            (None, None) => Vec::new(),
        },
        (EventKind::Modify(ModifyKind::Name(RenameMode::From)), _) => paths
            .iter()
            .flatten()
            .flat_map(|path| gone(service, path))
            .collect(),
        (EventKind::Modify(ModifyKind::Name(RenameMode::To)), _)
        | (EventKind::Create(CreateKind::Folder), _) => paths
            .iter()
            .flatten()
            .flat_map(|path| appeared(store, path))
            .collect(),
        (EventKind::Create(CreateKind::File | CreateKind::Any), _) => {
            paths.into_iter().flatten().map(DocumentEvent::Created).collect()
        }
        (EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any), _) => {
            paths.into_iter().flatten().map(DocumentEvent::Modified).collect()
        }
        (EventKind::Remove(_), _) => paths
            .iter()
            .flatten()
            .flat_map(|path| gone(service, path))
            .collect(),
        _ => Vec::new(),
    }
}

fn renamed(
    store: &FsDocumentStore,
    service: &EmbeddingService,
    old_path: &str,
    path: &str,
) -> Vec<DocumentEvent> {
    let below = indexed_under(service, old_path);
    if below.is_empty() && !store.root().join(path).is_dir() {
        return vec![DocumentEvent::Renamed {
            path: path.to_string(),
            old_path: old_path.to_string(),
        }];
    }

    let mut events: Vec<DocumentEvent> = below
        .into_iter()
        .map(|old| DocumentEvent::Renamed {
            path: format!("{path}{}", &old[old_path.len()..]),
            old_path: old,
        })
        .collect();

    // notes that were never indexed under the old name, e.g. a hidden folder
    // renamed to a visible one
    for doc in listed_under(store, path) {
        let known = events
            .iter()
            .any(|e| matches!(e, DocumentEvent::Renamed { path: moved, .. } if *moved == doc));
        if !known {
            events.push(DocumentEvent::Created(doc));
        }
    }
    events
}

/// A path left the tree. When it was a folder the files are gone already, so
/// the notes to evict come from the index.
fn gone(service: &EmbeddingService, path: &str) -> Vec<DocumentEvent> {
    let below = indexed_under(service, path);
    if below.is_empty() {
        vec![DocumentEvent::Deleted(path.to_string())]
    } else {
        below.into_iter().map(DocumentEvent::Deleted).collect()
    }
}

fn appeared(store: &FsDocumentStore, path: &str) -> Vec<DocumentEvent> {
    if store.root().join(path).is_dir() {
        listed_under(store, path)
            .into_iter()
            .map(DocumentEvent::Created)
            .collect()
    } else {
        vec![DocumentEvent::Created(path.to_string())]
    }
}

fn indexed_under(service: &EmbeddingService, folder: &str) -> Vec<String> {
    let prefix = format!("{folder}/");
    service
        .index()
        .document_paths()
        .into_iter()
        .filter(|doc| doc.starts_with(&prefix))
        .collect()
}

fn listed_under(store: &FsDocumentStore, folder: &str) -> Vec<String> {
    let prefix = format!("{folder}/");
    match store.list_documents() {
        Ok(docs) => docs
            .into_iter()
            .map(|meta| meta.path)
            .filter(|doc| doc.starts_with(&prefix))
            .collect(),
        Err(e) => {
            log::error!("failed to list notes under {folder}: {e}");
            Vec::new()
        }
    }
}

fn document_path(store: &FsDocumentStore, path: &Path) -> Option<String> {
    let rel = store.relative_path(path)?;
    if rel.split('/').any(|part| part.starts_with('.')) {
        return None;
    }
    Some(rel)
}

/// Ctrl+C clears `running` and cancels any batch in progress.
pub fn install_shutdown_handler(running: Arc<AtomicBool>, cancel: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        running.store(false, Ordering::SeqCst);
        cancel.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use notify::event::RemoveKind;

    use super::*;
    use crate::semantic::clock::ManualClock;
    use crate::semantic::{EmbeddingStorage, NullSink, ServiceConfig};
    use crate::tests::fakes::BagOfWordsEmbedder;

    struct Tree {
        notes: tempfile::TempDir,
        _data: tempfile::TempDir,
        store: Arc<FsDocumentStore>,
        service: EmbeddingService,
    }

    impl Tree {
        fn new(files: &[(&str, &str)]) -> Self {
            let notes = tempfile::tempdir().unwrap();
            let data = tempfile::tempdir().unwrap();
            for (path, text) in files {
                let full = notes.path().join(path);
                fs::create_dir_all(full.parent().unwrap()).unwrap();
                fs::write(full, text).unwrap();
            }

            let store = Arc::new(FsDocumentStore::new(notes.path()));
            let mut service = EmbeddingService::new(
                ServiceConfig {
                    throttle_pause: Duration::ZERO,
                    ..ServiceConfig::default()
                },
                Arc::new(BagOfWordsEmbedder::new()),
                store.clone(),
                EmbeddingStorage::in_dir(data.path()),
                Arc::new(NullSink),
            );
            service.initialize().unwrap();

            Tree {
                notes,
                _data: data,
                store,
                service,
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.notes.path().join(rel)
        }

        fn translate(&self, kind: EventKind, paths: &[PathBuf]) -> Vec<DocumentEvent> {
            let event = paths
                .iter()
                .fold(Event::new(kind), |event, path| event.add_path(path.clone()));
            translate(&event, &self.store, &self.service)
        }

        fn keys(&self) -> Vec<String> {
            self.service.index().keys().map(str::to_string).collect()
        }
    }

    fn rename(mode: RenameMode) -> EventKind {
        EventKind::Modify(ModifyKind::Name(mode))
    }

    fn renamed(path: &str, old_path: &str) -> DocumentEvent {
        DocumentEvent::Renamed {
            path: path.to_string(),
            old_path: old_path.to_string(),
        }
    }

    #[test]
    fn test_folder_rename_moves_its_notes() {
        let mut tree = Tree::new(&[("proj/a.md", "# A\nalpha"), ("top.md", "top note")]);
        assert_eq!(tree.keys(), vec!["proj/a.md#A", "top.md"]);

        fs::rename(tree.path("proj"), tree.path("archive2")).unwrap();
        let events = tree.translate(
            rename(RenameMode::Both),
            &[tree.path("proj"), tree.path("archive2")],
        );
        assert_eq!(events, vec![renamed("archive2/a.md", "proj/a.md")]);

        let mut adapter =
            ChangeWatcherAdapter::new(Duration::from_secs(10), Arc::new(ManualClock::new()));
        for event in events {
            adapter.handle(&mut tree.service, event).unwrap();
        }
        assert_eq!(tree.keys(), vec!["archive2/a.md#A", "top.md"]);
    }

    #[test]
    fn test_hidden_folder_made_visible_is_indexed() {
        let tree = Tree::new(&[(".drafts/idea.md", "an idea"), ("top.md", "top note")]);
        assert_eq!(tree.keys(), vec!["top.md"]);

        fs::rename(tree.path(".drafts"), tree.path("drafts")).unwrap();
        let events = tree.translate(
            rename(RenameMode::Both),
            &[tree.path(".drafts"), tree.path("drafts")],
        );
        assert_eq!(events, vec![DocumentEvent::Created("drafts/idea.md".to_string())]);
    }

    #[test]
    fn test_file_renames() {
        let tree = Tree::new(&[("a.md", "alpha")]);
        fs::rename(tree.path("a.md"), tree.path("b.md")).unwrap();

        assert_eq!(
            tree.translate(rename(RenameMode::Both), &[tree.path("a.md"), tree.path("b.md")]),
            vec![renamed("b.md", "a.md")]
        );
        assert_eq!(
            tree.translate(rename(RenameMode::From), &[tree.path("a.md")]),
            vec![DocumentEvent::Deleted("a.md".to_string())]
        );
        assert_eq!(
            tree.translate(rename(RenameMode::To), &[tree.path("b.md")]),
            vec![DocumentEvent::Created("b.md".to_string())]
        );
    }

    #[test]
    fn test_rename_across_the_root() {
        let tree = Tree::new(&[("a.md", "alpha")]);
        let outside = tempfile::tempdir().unwrap();
        let away = outside.path().join("a.md");

        assert_eq!(
            tree.translate(rename(RenameMode::Both), &[tree.path("a.md"), away.clone()]),
            vec![DocumentEvent::Deleted("a.md".to_string())]
        );
        assert_eq!(
            tree.translate(rename(RenameMode::Both), &[away, tree.path("a.md")]),
            vec![DocumentEvent::Created("a.md".to_string())]
        );
    }

    #[test]
    fn test_folder_removal_evicts_indexed_notes() {
        let tree = Tree::new(&[
            ("proj/a.md", "alpha"),
            ("proj/deep/b.md", "beta"),
            ("project.md", "not inside"),
        ]);
        fs::remove_dir_all(tree.path("proj")).unwrap();

        let expected = vec![
            DocumentEvent::Deleted("proj/a.md".to_string()),
            DocumentEvent::Deleted("proj/deep/b.md".to_string()),
        ];
        assert_eq!(
            tree.translate(EventKind::Remove(RemoveKind::Folder), &[tree.path("proj")]),
            expected
        );
        // some backends cannot tell what kind of entry went away
        assert_eq!(
            tree.translate(EventKind::Remove(RemoveKind::Any), &[tree.path("proj")]),
            expected
        );
    }

    #[test]
    fn test_hidden_paths_are_dropped() {
        let tree = Tree::new(&[("a.md", "alpha")]);
        fs::create_dir_all(tree.path(".obsidian")).unwrap();
        fs::write(tree.path(".obsidian/workspace.md"), "hidden").unwrap();

        assert!(tree
            .translate(
                EventKind::Create(CreateKind::File),
                &[tree.path(".obsidian/workspace.md")],
            )
            .is_empty());
        assert_eq!(
            tree.translate(
                EventKind::Modify(ModifyKind::Any),
                &[tree.path(".obsidian/workspace.md"), tree.path("a.md")],
            ),
            vec![DocumentEvent::Modified("a.md".to_string())]
        );
    }
}
