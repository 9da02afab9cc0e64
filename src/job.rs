//! Job and part records: one Job per pending retrieval, with optional
//! multi-part state shared between workers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use crate::auth::Challenge;
use crate::host::HostKey;
use crate::metalink::Metalink;

static NEXT_JOB_ID: AtomicUsize = AtomicUsize::new(1);

/// One pending resource retrieval.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    /// Current target (may differ from `original_url` after redirects).
    pub url: Url,
    /// The URL as first admitted, before any redirect.
    pub original_url: Option<Url>,
    pub referer: Option<Url>,
    /// Destination path; `None` means discard (spider) or stdout (-O -).
    pub local_path: Option<PathBuf>,
    pub redirection_level: u32,
    pub level: u32,
    /// Issue HEAD before GET (spider, chunk probing, pattern-driven
    /// content-type checks).
    pub head_first: bool,
    pub is_robots: bool,
    pub is_sitemap: bool,
    /// Plugin accepted this URL explicitly; skip pre-save pattern filters.
    pub ignore_patterns: bool,
    pub challenges: Vec<Challenge>,
    pub proxy_challenges: Vec<Challenge>,
    pub auth_failure_count: u32,
    /// Multi-part download state, shared across the workers fetching parts.
    pub parts: Option<Arc<PartSet>>,
    /// Set on the per-part assignment a worker receives from the queue.
    pub part_id: Option<usize>,
    pub host: HostKey,
}

impl Job {
    pub fn new(url: Url, host: HostKey) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            url,
            original_url: None,
            referer: None,
            local_path: None,
            redirection_level: 0,
            level: 0,
            head_first: false,
            is_robots: false,
            is_sitemap: false,
            ignore_patterns: false,
            challenges: Vec::new(),
            proxy_challenges: Vec::new(),
            auth_failure_count: 0,
            parts: None,
            part_id: None,
            host,
        }
    }

    pub fn is_part(&self) -> bool {
        self.part_id.is_some()
    }

    /// The byte range this assignment covers, when it is a part job.
    pub fn part(&self) -> Option<Part> {
        let set = self.parts.as_ref()?;
        let id = self.part_id?;
        set.part(id)
    }
}

/// A byte range of a multi-part job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub id: usize,
    pub position: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartFlag {
    Free,
    InUse,
    Done,
}

/// Shared state of a multi-part download: the Metalink descriptor, the
/// output path, and the per-part claim flags. Workers claim parts, write
/// at the part offset, and mark them done; the worker completing the last
/// part validates the whole file.
#[derive(Debug)]
pub struct PartSet {
    pub metalink: Metalink,
    pub output: PathBuf,
    parts: Mutex<Vec<(Part, PartFlag)>>,
}

impl PartSet {
    /// Carve `metalink` into parts, one per piece. Pieces already verified
    /// on disk are pre-marked done via `done_ids`.
    pub fn new(metalink: Metalink, output: PathBuf, done_ids: &[usize]) -> Self {
        let parts = metalink
            .pieces
            .iter()
            .enumerate()
            .map(|(id, piece)| {
                let flag = if done_ids.contains(&id) {
                    PartFlag::Done
                } else {
                    PartFlag::Free
                };
                (
                    Part {
                        id,
                        position: piece.position,
                        length: piece.length,
                    },
                    flag,
                )
            })
            .collect();

        Self {
            metalink,
            output,
            parts: Mutex::new(parts),
        }
    }

    pub fn part(&self, id: usize) -> Option<Part> {
        self.parts.lock().get(id).map(|(p, _)| *p)
    }

    pub fn part_count(&self) -> usize {
        self.parts.lock().len()
    }

    /// Claim a free part for a worker. Returns None when every part is
    /// either in flight or done.
    pub fn claim(&self) -> Option<Part> {
        let mut parts = self.parts.lock();
        for (part, flag) in parts.iter_mut() {
            if *flag == PartFlag::Free {
                *flag = PartFlag::InUse;
                return Some(*part);
            }
        }
        None
    }

    /// Mark a part done. Returns true when this was the last open part.
    pub fn complete(&self, id: usize) -> bool {
        let mut parts = self.parts.lock();
        if let Some((_, flag)) = parts.get_mut(id) {
            *flag = PartFlag::Done;
        }
        parts.iter().all(|(_, flag)| *flag == PartFlag::Done)
    }

    /// Return a part to the pool after a retryable failure.
    pub fn release(&self, id: usize) {
        let mut parts = self.parts.lock();
        if let Some((_, flag)) = parts.get_mut(id) {
            if *flag == PartFlag::InUse {
                *flag = PartFlag::Free;
            }
        }
    }

    pub fn all_done(&self) -> bool {
        self.parts.lock().iter().all(|(_, f)| *f == PartFlag::Done)
    }

    pub fn open_parts(&self) -> usize {
        self.parts
            .lock()
            .iter()
            .filter(|(_, f)| *f != PartFlag::Done)
            .count()
    }
}
