//! Local filename derivation and save-time filesystem policy.
//!
//! Derivation walks the URL through the output-layout options (prefix,
//! protocol/host directories, --cut-dirs, query handling, restrict modes).
//! The save helpers create missing directories, move obstructing files
//! aside, rotate backups, and fall back to numbered unique names.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use url::Url;

use crate::config::{Config, RestrictNames};

/// Derive the local path for a URL, or None when nothing is saved
/// (spider mode, or -O without -c).
pub fn local_filename(config: &Config, url: &Url) -> Option<PathBuf> {
    if (config.spider || config.output_document.is_some()) && !config.continue_download {
        return None;
    }
    if config.delete_after {
        return None;
    }

    let mut directories = config.recursive;
    if !config.directories {
        directories = false;
    }
    if config.force_directories {
        directories = true;
    }

    let mut path = config.directory_prefix.clone();

    if directories {
        if config.protocol_directories {
            path.push(url.scheme());
        }
        if config.host_directories {
            if let Some(host) = url.host_str() {
                path.push(host);
            }
        }

        let segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(percent_decode).collect())
            .unwrap_or_default();
        let (dirs, file) = match segments.split_last() {
            Some((file, dirs)) => (dirs, file.clone()),
            None => (&[][..], String::new()),
        };

        for dir in dirs.iter().skip(config.cut_directories as usize) {
            if dir.is_empty() || dir == "." || dir == ".." {
                continue;
            }
            path.push(restrict_file_name(dir, &config.restrict_file_names));
        }

        let fname = build_file_component(config, url, &file);
        path.push(restrict_file_name(&fname, &config.restrict_file_names));
    } else {
        let file = url
            .path_segments()
            .and_then(|s| s.last().map(percent_decode))
            .unwrap_or_default();
        let fname = build_file_component(config, url, &file);
        path.push(restrict_file_name(&fname, &config.restrict_file_names));
    }

    Some(path)
}

fn build_file_component(config: &Config, url: &Url, file: &str) -> String {
    let mut fname = if file.is_empty() {
        config.default_page.clone()
    } else {
        file.to_string()
    };

    if !config.cut_file_get_vars {
        if let Some(query) = url.query() {
            fname.push('?');
            fname.push_str(query);
        }
    }

    fname
}

/// Percent-decode a path segment; invalid escapes pass through literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Apply `--restrict-file-names` to one path component.
pub fn restrict_file_name(name: &str, modes: &RestrictNames) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let escaped = match c {
            '/' | '\0' => true,
            c if (c as u32) < 32 && !modes.nocontrol => true,
            '\\' | '|' | '<' | '>' | ':' | '"' | '*' | '?' if modes.windows => true,
            c if modes.ascii && !c.is_ascii() => true,
            _ => false,
        };
        if escaped {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }

    if modes.lowercase {
        out = out.to_lowercase();
    } else if modes.uppercase {
        out = out.to_uppercase();
    }
    out
}

/// Create every missing parent directory of `path`. When a regular file
/// blocks a directory component, it is moved aside with a numeric suffix
/// first (the file/directory clash rule).
pub fn mkdir_path(path: &Path) -> std::io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    let mut built = PathBuf::new();
    for component in parent.components() {
        built.push(component);
        match std::fs::create_dir(&built) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if built.is_file() {
                    move_aside(&built)?;
                    std::fs::create_dir(&built)?;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn move_aside(path: &Path) -> std::io::Result<()> {
    for n in 1..=999 {
        let dst = numbered(path, n);
        if !dst.exists() {
            return std::fs::rename(path, dst);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "no free numeric suffix",
    ))
}

fn numbered(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{}", n));
    PathBuf::from(os)
}

/// Rotate `file` -> `file.1` -> ... -> `file.N` before a fresh write.
pub fn rotate_backups(path: &Path, backups: u32) {
    for n in (1..=backups).rev() {
        let src = if n > 1 {
            numbered(path, n - 1)
        } else {
            path.to_path_buf()
        };
        let dst = numbered(path, n);
        if src.exists() {
            if let Err(e) = std::fs::rename(&src, &dst) {
                tracing::error!("failed to rotate {} to {}: {}", src.display(), dst.display(), e);
            }
        }
    }
}

/// Open `path` with `opts`. When opening fails with EEXIST (no-clobber
/// style) or EISDIR and `multiple` is allowed, try `.1` through `.999`.
/// Returns the opened file and the path actually used.
pub fn open_unique(
    path: &Path,
    opts: &OpenOptions,
    multiple: bool,
) -> std::io::Result<(File, PathBuf)> {
    match opts.open(path) {
        Ok(f) => Ok((f, path.to_path_buf())),
        Err(e)
            if multiple
                && matches!(
                    e.kind(),
                    std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::IsADirectory
                ) =>
        {
            for n in 1..=999 {
                let candidate = numbered(path, n);
                match opts.open(&candidate) {
                    Ok(f) => return Ok((f, candidate)),
                    Err(e2)
                        if matches!(
                            e2.kind(),
                            std::io::ErrorKind::AlreadyExists | std::io::ErrorKind::IsADirectory
                        ) =>
                    {
                        continue
                    }
                    Err(e2) => return Err(e2),
                }
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recursive_config() -> Config {
        let mut config = Config::default();
        config.recursive = true;
        config.directory_prefix = PathBuf::from(".");
        config
    }

    #[test]
    fn test_recursive_layout_with_host_dir() {
        let config = recursive_config();
        let url = Url::parse("http://test.local/dir/page.html").unwrap();
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./test.local/dir/page.html")
        );
    }

    #[test]
    fn test_root_uses_default_page() {
        let config = recursive_config();
        let url = Url::parse("http://test.local/").unwrap();
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./test.local/index.html")
        );
    }

    #[test]
    fn test_no_directories_flat() {
        let mut config = recursive_config();
        config.directories = false;
        let url = Url::parse("http://test.local/a/b/file.bin").unwrap();
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./file.bin")
        );
    }

    #[test]
    fn test_cut_dirs() {
        let mut config = recursive_config();
        config.cut_directories = 1;
        let url = Url::parse("http://test.local/skip/keep/f.txt").unwrap();
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./test.local/keep/f.txt")
        );
    }

    #[test]
    fn test_query_kept_unless_cut() {
        let mut config = recursive_config();
        let url = Url::parse("http://test.local/p?id=1").unwrap();
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./test.local/p?id=1")
        );

        config.cut_file_get_vars = true;
        assert_eq!(
            local_filename(&config, &url).unwrap(),
            PathBuf::from("./test.local/p")
        );
    }

    #[test]
    fn test_spider_saves_nothing() {
        let mut config = recursive_config();
        config.spider = true;
        let url = Url::parse("http://test.local/x").unwrap();
        assert!(local_filename(&config, &url).is_none());
    }

    #[test]
    fn test_restrict_windows_chars() {
        let modes = RestrictNames {
            windows: true,
            ..RestrictNames::default()
        };
        assert_eq!(restrict_file_name("a:b?c", &modes), "a%3Ab%3Fc");
    }

    #[test]
    fn test_restrict_case_folding() {
        let modes = RestrictNames {
            lowercase: true,
            ..RestrictNames::default()
        };
        assert_eq!(restrict_file_name("MiXeD.TXT", &modes), "mixed.txt");
    }

    #[test]
    fn test_percent_decode_segments() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn test_mkdir_path_moves_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let obstruction = dir.path().join("site");
        std::fs::write(&obstruction, b"flat file").unwrap();

        let target = dir.path().join("site/sub/page.html");
        mkdir_path(&target).unwrap();
        assert!(dir.path().join("site").is_dir());
        assert!(dir.path().join("site.1").is_file());
    }

    #[test]
    fn test_rotate_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"v1").unwrap();
        rotate_backups(&path, 2);
        std::fs::write(&path, b"v2").unwrap();
        rotate_backups(&path, 2);

        assert_eq!(std::fs::read(dir.path().join("f.1")).unwrap(), b"v2");
        assert_eq!(std::fs::read(dir.path().join("f.2")).unwrap(), b"v1");
    }

    #[test]
    fn test_open_unique_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"original").unwrap();

        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        let (_, used) = open_unique(&path, &opts, true).unwrap();
        assert_eq!(used, dir.path().join("f.1"));

        let (_, used) = open_unique(&path, &opts, true).unwrap();
        assert_eq!(used, dir.path().join("f.2"));
    }
}
