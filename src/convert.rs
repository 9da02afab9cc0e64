//! Link conversion: remember parsed documents during the run, rewrite their
//! embedded links once all retrieval has ended.
//!
//! Every recorded link that resolves to a file we actually saved becomes a
//! path relative to the document's own location; everything else becomes an
//! absolute URL. The rewrite phase is single-threaded and holds no locks.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use url::Url;

use crate::config::Config;
use crate::fname;
use crate::url_utils;

/// One parsed document awaiting link rewriting.
#[derive(Debug, Clone)]
pub struct ConversionEntry {
    pub filename: PathBuf,
    pub base: Url,
    /// URL literals exactly as they appeared in the document source.
    pub urls: Vec<String>,
}

/// Mutex-guarded store of conversion entries, appended by parse fan-out.
#[derive(Debug, Default)]
pub struct ConversionRecorder {
    entries: Mutex<Vec<ConversionEntry>>,
}

impl ConversionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, entry: ConversionEntry) {
        self.entries.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn take(&self) -> Vec<ConversionEntry> {
        std::mem::take(&mut self.entries.lock())
    }
}

/// Terminal conversion pass over every recorded document.
pub fn convert_all(config: &Config, recorder: &ConversionRecorder) {
    for entry in recorder.take() {
        if let Err(e) = convert_file(config, &entry) {
            tracing::error!("link conversion failed for {}: {}", entry.filename.display(), e);
        }
    }
}

fn convert_file(config: &Config, entry: &ConversionEntry) -> std::io::Result<()> {
    let original = std::fs::read_to_string(&entry.filename)?;
    let mut rewritten = original.clone();
    let mut changed = false;

    for literal in &entry.urls {
        if literal.starts_with('#') {
            continue;
        }
        let Some(absolute) = url_utils::parse_with_base(Some(&entry.base), literal) else {
            continue;
        };
        let absolute = url_utils::normalize(absolute);

        let replacement = match local_target(config, &absolute) {
            Some(target) => relative_path(&entry.filename, &target),
            None => absolute.to_string(),
        };

        if replacement != *literal && replace_attr_value(&mut rewritten, literal, &replacement) {
            changed = true;
            tracing::debug!("  {} -> {}", literal, replacement);
        }
    }

    if changed {
        if config.backup_converted {
            let mut backup = entry.filename.as_os_str().to_owned();
            backup.push(".orig");
            std::fs::rename(&entry.filename, PathBuf::from(backup))?;
        }
        std::fs::write(&entry.filename, rewritten)?;
    }

    Ok(())
}

/// The saved local path for a URL, when that file exists and is readable.
fn local_target(config: &Config, url: &Url) -> Option<PathBuf> {
    let path = fname::local_filename(config, url)?;
    path.is_file().then_some(path)
}

/// Relative path from the directory of `doc` to `target`: strip the common
/// directory prefix, then one `..` per remaining directory level of the
/// document.
fn relative_path(doc: &Path, target: &Path) -> String {
    let doc_str = doc.to_string_lossy();
    let target_str = target.to_string_lossy();
    let doc_bytes = doc_str.as_bytes();
    let target_bytes = target_str.as_bytes();

    // Find the last path separator inside the common prefix.
    let mut common = 0;
    let mut i = 0;
    while i < doc_bytes.len() && i < target_bytes.len() && doc_bytes[i] == target_bytes[i] {
        if doc_bytes[i] == b'/' {
            common = i + 1;
        }
        i += 1;
    }

    let ups = doc_str[common..].matches('/').count();
    let mut rel = String::new();
    for _ in 0..ups {
        rel.push_str("../");
    }
    rel.push_str(&target_str[common..]);
    rel
}

/// Replace `old` with `new` where it appears as a quoted attribute value or
/// inside `url(...)`. Unquoted exact matches are left alone to avoid
/// clobbering look-alike text.
fn replace_attr_value(text: &mut String, old: &str, new: &str) -> bool {
    let mut changed = false;
    for (open, close) in [
        (format!("\"{}\"", old), format!("\"{}\"", new)),
        (format!("'{}'", old), format!("'{}'", new)),
        (format!("url({})", old), format!("url({})", new)),
    ] {
        if text.contains(&open) {
            *text = text.replace(&open, &close);
            changed = true;
        }
    }
    changed
}
