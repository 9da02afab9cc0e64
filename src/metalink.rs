//! Metalink descriptors: RFC 5854 XML parsing, synthetic descriptors for
//! `--chunk-size` splitting, and checksum validation of downloaded files.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use md5::Md5;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use sha2::{Digest, Sha256};
use url::Url;

/// Checksum algorithms the validator understands. Unknown algorithms in a
/// descriptor are kept out of the model entirely (treated as "no hash").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Md5,
}

impl HashAlgo {
    fn from_type(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha-256" | "sha256" => Some(Self::Sha256),
            "md5" => Some(Self::Md5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    pub algo: HashAlgo,
    pub hex: String,
}

impl FileHash {
    pub fn matches(&self, data: &[u8]) -> bool {
        let computed = match self.algo {
            HashAlgo::Sha256 => hex_digest(Sha256::new(), data),
            HashAlgo::Md5 => hex_digest(Md5::new(), data),
        };
        computed.eq_ignore_ascii_case(&self.hex)
    }
}

fn hex_digest<D: Digest>(mut hasher: D, data: &[u8]) -> String {
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// One piece of the file, with its byte range and optional checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub position: u64,
    pub length: u64,
    pub hash: Option<FileHash>,
}

/// One download source, lowest priority value first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub url: Url,
    pub priority: u32,
    pub location: Option<String>,
}

/// A file described as a set of mirrors plus a set of checksummed pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metalink {
    pub name: String,
    pub size: u64,
    pub hash: Option<FileHash>,
    pub pieces: Vec<Piece>,
    pub mirrors: Vec<Mirror>,
}

impl Metalink {
    /// Sort mirrors so the highest-priority (lowest value) source is tried
    /// first.
    pub fn sort_mirrors(&mut self) {
        self.mirrors.sort_by_key(|m| m.priority);
    }

    /// Build a synthetic descriptor for `--chunk-size`: one mirror (the
    /// origin), unhashed pieces of `chunk_size` bytes.
    pub fn synthetic(origin: Url, name: &str, total: u64, chunk_size: u64) -> Self {
        let mut pieces = Vec::new();
        let mut position = 0;
        while position < total {
            let length = chunk_size.min(total - position);
            pieces.push(Piece {
                position,
                length,
                hash: None,
            });
            position += length;
        }

        Self {
            name: name.to_string(),
            size: total,
            hash: None,
            pieces,
            mirrors: vec![Mirror {
                url: origin,
                priority: 1,
                location: None,
            }],
        }
    }

    /// Validate the on-disk file against the descriptor. Returns the list
    /// of piece ids that already verify (all of them when the whole file is
    /// good), or an empty list when nothing usable is on disk.
    ///
    /// Pieces without hashes verify only through the file size: when the
    /// file is complete and the whole-file hash (if any) passes, every piece
    /// is considered done.
    pub fn validate_file(&self, path: &Path) -> Vec<usize> {
        let Ok(mut file) = std::fs::File::open(path) else {
            return Vec::new();
        };
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);

        // Whole-file check first: complete size + matching total hash means
        // every piece is done.
        if file_len == self.size {
            match &self.hash {
                Some(hash) => {
                    let mut data = Vec::new();
                    if file.read_to_end(&mut data).is_ok() && hash.matches(&data) {
                        return (0..self.pieces.len()).collect();
                    }
                }
                None if self.pieces.iter().all(|p| p.hash.is_none()) => {
                    // No checksums at all: size is the only signal we have.
                    return (0..self.pieces.len()).collect();
                }
                None => {}
            }
        }

        // Piece-level resume: keep every piece whose range is present and
        // hashes correctly.
        let mut done = Vec::new();
        for (id, piece) in self.pieces.iter().enumerate() {
            let Some(hash) = &piece.hash else { continue };
            if piece.position + piece.length > file_len {
                continue;
            }
            if file.seek(SeekFrom::Start(piece.position)).is_err() {
                continue;
            }
            let mut buf = vec![0u8; piece.length as usize];
            if file.read_exact(&mut buf).is_ok() && hash.matches(&buf) {
                done.push(id);
            }
        }
        done
    }

    /// Validate the fully assembled file. True when the size matches and the
    /// whole-file checksum (when present) passes.
    pub fn verify_complete(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        if meta.len() != self.size {
            return false;
        }
        match &self.hash {
            Some(hash) => std::fs::read(path).map(|d| hash.matches(&d)).unwrap_or(false),
            None => true,
        }
    }
}

/// Parse a Metalink (RFC 5854, with tolerance for the v3 element names)
/// document into a descriptor. Only the first `<file>` entry is used.
pub fn parse(xml: &str) -> Option<Metalink> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut name = String::new();
    let mut size = 0u64;
    let mut file_hash: Option<FileHash> = None;
    let mut pieces: Vec<Piece> = Vec::new();
    let mut mirrors: Vec<Mirror> = Vec::new();

    // Parser cursor state.
    let mut in_file = false;
    let mut text_target: Option<&'static str> = None;
    let mut pending_hash_algo: Option<HashAlgo> = None;
    let mut piece_len = 0u64;
    let mut piece_algo: Option<HashAlgo> = None;
    let mut in_pieces = false;
    let mut pending_mirror: Option<(u32, Option<String>)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = local_name(e.name().as_ref());
                match tag.as_str() {
                    "file" => {
                        if in_file {
                            // Only the first file entry is honored.
                            break;
                        }
                        in_file = true;
                        name = attr(&e, "name").unwrap_or_default();
                    }
                    "size" if in_file => text_target = Some("size"),
                    "pieces" if in_file => {
                        in_pieces = true;
                        piece_len = attr(&e, "length")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        piece_algo = attr(&e, "type").and_then(|t| HashAlgo::from_type(&t));
                    }
                    "hash" if in_file => {
                        pending_hash_algo = attr(&e, "type").and_then(|t| HashAlgo::from_type(&t));
                        text_target = Some(if in_pieces { "piece_hash" } else { "file_hash" });
                    }
                    "url" if in_file => {
                        let priority = attr(&e, "priority")
                            .or_else(|| attr(&e, "preference"))
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(999_999);
                        pending_mirror = Some((priority, attr(&e, "location")));
                        text_target = Some("url");
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let Some(target) = text_target.take() else {
                    continue;
                };
                let text = t.unescape().unwrap_or_default().to_string();
                match target {
                    "size" => size = text.trim().parse().unwrap_or(0),
                    "file_hash" => {
                        if let Some(algo) = pending_hash_algo.take() {
                            file_hash = Some(FileHash {
                                algo,
                                hex: text.trim().to_string(),
                            });
                        }
                    }
                    "piece_hash" => {
                        let algo = pending_hash_algo.take().or(piece_algo);
                        let position = pieces.len() as u64 * piece_len;
                        pieces.push(Piece {
                            position,
                            length: piece_len,
                            hash: algo.map(|algo| FileHash {
                                algo,
                                hex: text.trim().to_string(),
                            }),
                        });
                    }
                    "url" => {
                        if let Some((priority, location)) = pending_mirror.take() {
                            if let Ok(url) = Url::parse(text.trim()) {
                                mirrors.push(Mirror {
                                    url,
                                    priority,
                                    location,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let tag = local_name(e.name().as_ref());
                match tag.as_str() {
                    "pieces" => in_pieces = false,
                    "file" => break,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    if size == 0 || mirrors.is_empty() {
        return None;
    }

    // The last piece usually runs short; clamp its length to the file size.
    if let Some(last) = pieces.last_mut() {
        if last.position + last.length > size {
            last.length = size - last.position;
        }
    }
    // A descriptor without pieces is still downloadable as one span.
    if pieces.is_empty() {
        pieces.push(Piece {
            position: 0,
            length: size,
            hash: None,
        });
    }

    Some(Metalink {
        name,
        size,
        hash: file_hash,
        pieces,
        mirrors,
    })
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if local_name(a.key.as_ref()) == name {
            a.unescape_value().ok().map(|v| v.to_string())
        } else {
            None
        }
    })
}
