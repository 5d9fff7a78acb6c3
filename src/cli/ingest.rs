use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::QuarryConfig;
use crate::knowledge::NewContext;
use crate::rag::types::ContextKind;
use crate::server::build_services;

/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 256 * 1024;
const BATCH_SIZE: usize = 32;

const SKIP_DIRS: &[&str] = &["target", "node_modules", "dist", "build", "vendor", "__pycache__"];
const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "rst", "txt", "adoc"];

pub struct IngestOptions {
    pub agent: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct IngestSummary {
    created: usize,
    updated: usize,
    skipped: usize,
}

/// Walk `paths` and index every readable text file as one context item.
pub async fn ingest(config: QuarryConfig, paths: &[PathBuf], opts: IngestOptions) -> Result<()> {
    let services = build_services(config)?;
    let agent = opts
        .agent
        .unwrap_or_else(|| services.config.storage.default_agent.clone());

    let mut summary = IngestSummary::default();
    let mut batch = Vec::with_capacity(BATCH_SIZE);

    for root in paths {
        anyhow::ensure!(root.exists(), "path not found: {}", root.display());
        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e))
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "walk error");
                    summary.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match read_item(root, entry.path())? {
                Some(item) => batch.push(item),
                None => summary.skipped += 1,
            }
            if batch.len() >= BATCH_SIZE {
                flush(&services.store, &agent, &mut batch, &mut summary).await?;
            }
        }
    }
    flush(&services.store, &agent, &mut batch, &mut summary).await?;

    println!(
        "Indexed {} new and {} updated item(s) for agent '{agent}'; skipped {}.",
        summary.created, summary.updated, summary.skipped
    );
    Ok(())
}

async fn flush(
    store: &crate::knowledge::SqliteKnowledgeStore,
    agent: &str,
    batch: &mut Vec<NewContext>,
    summary: &mut IngestSummary,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let items = std::mem::take(batch);
    tracing::info!(agent, items = items.len(), "indexing batch");
    for outcome in store.index_batch(agent, items).await? {
        if outcome.created {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
    }
    Ok(())
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()))
}

/// Read one file into a context item. `None` for large, binary, or
/// non-UTF-8 files.
fn read_item(root: &Path, path: &Path) -> Result<Option<NewContext>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if meta.len() == 0 || meta.len() > MAX_FILE_BYTES {
        tracing::debug!(path = %path.display(), bytes = meta.len(), "skipping by size");
        return Ok(None);
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.iter().take(8192).any(|b| *b == 0) {
        return Ok(None);
    }
    let Ok(content) = String::from_utf8(bytes) else {
        return Ok(None);
    };
    if content.trim().is_empty() {
        return Ok(None);
    }

    let display = display_path(root, path);
    let lines = content.lines().count().max(1) as u32;
    Ok(Some(
        NewContext::new(kind_for(path), display, content).with_lines(1, lines),
    ))
}

fn kind_for(path: &Path) -> ContextKind {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if DOC_EXTENSIONS.contains(&ext.as_str()) {
        ContextKind::Documentation
    } else {
        ContextKind::File
    }
}

/// Path relative to the ingest root, or the path itself for single files.
fn display_path(root: &Path, path: &Path) -> String {
    let rel = if root.is_file() {
        path.file_name().map(Path::new).unwrap_or(path)
    } else {
        path.strip_prefix(root).unwrap_or(path)
    };
    rel.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_text_and_skips_binary() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("src").join("lib.rs");
        std::fs::create_dir_all(text.parent().unwrap()).unwrap();
        std::fs::write(&text, "fn main() {}\n// done\n").unwrap();
        let bin = dir.path().join("blob.bin");
        std::fs::write(&bin, [0u8, 1, 2, 3]).unwrap();

        let item = read_item(dir.path(), &text).unwrap().unwrap();
        assert_eq!(item.source_path, "src/lib.rs");
        assert_eq!(item.kind, ContextKind::File);
        assert_eq!(item.end_line, Some(2));
        assert!(read_item(dir.path(), &bin).unwrap().is_none());
    }

    #[test]
    fn docs_are_documentation() {
        assert_eq!(kind_for(Path::new("README.md")), ContextKind::Documentation);
        assert_eq!(kind_for(Path::new("main.rs")), ContextKind::File);
    }

    #[test]
    fn hidden_and_build_dirs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        for d in [".git", "target", "src"] {
            std::fs::create_dir_all(dir.path().join(d)).unwrap();
        }
        let skipped: Vec<String> = WalkDir::new(dir.path())
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(is_skipped_dir)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(skipped.contains(&".git".to_string()));
        assert!(skipped.contains(&"target".to_string()));
        assert!(!skipped.contains(&"src".to_string()));
    }
}
