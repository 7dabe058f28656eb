//! Content digests for transfer verification.
//!
//! Local digests are computed with sha2, remote ones with `sha256sum`, so the
//! two sides are compared as lowercase hex strings keyed by relative path.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use keel_common::{Error, Result};

use crate::shell;

/// Digests keyed by path relative to the transfer root (`.` for a single file).
pub type Digests = BTreeMap<String, String>;

/// Placeholder used when one side lacks a file.
pub const MISSING: &str = "<missing>";

/// SHA-256 of one local file.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).map_err(|e| Error::io(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digests of a local file or every regular file under a directory.
///
/// Symlinks are followed, matching `scp -r`, which copies the target's
/// contents under the link's name. A link that resolves to a directory
/// already on the walk is skipped.
pub fn digest_local(root: &Path) -> Result<Digests> {
    let mut out = Digests::new();
    if root.is_file() {
        out.insert(".".to_string(), digest_file(root)?);
        return Ok(out);
    }
    let mut ancestors = Vec::new();
    walk(root, root, &mut ancestors, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, ancestors: &mut Vec<PathBuf>, out: &mut Digests) -> Result<()> {
    let canonical =
        std::fs::canonicalize(dir).map_err(|e| Error::io(format!("resolve {}", dir.display()), e))?;
    if ancestors.contains(&canonical) {
        debug!(dir = %dir.display(), "symlink loop, not descending");
        return Ok(());
    }
    ancestors.push(canonical);

    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::io(format!("list {}", dir.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(format!("list {}", dir.display()), e))?;
        let path = entry.path();
        let metadata = std::fs::metadata(&path)
            .map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
        if metadata.is_dir() {
            walk(root, &path, ancestors, out)?;
        } else if metadata.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| Error::internal_with_context("checksum", e.to_string()))?;
            out.insert(format!("./{}", rel.display()), digest_file(&path)?);
        }
    }

    ancestors.pop();
    Ok(())
}

/// Remote command printing digests in the shape [`parse_sha256sum`] reads.
pub fn remote_digest_command(path: &str, is_dir: bool) -> String {
    let quoted = shell::quote(path);
    if is_dir {
        format!("cd {quoted} && find . -type f -print0 | xargs -0 -r sha256sum")
    } else {
        format!("sha256sum {quoted} | cut -d' ' -f1")
    }
}

/// Parse `sha256sum` output.
///
/// Accepts both `<hex>  <path>` lines and a bare `<hex>` (keyed as `.`).
pub fn parse_sha256sum(output: &str) -> Digests {
    let mut out = Digests::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once(char::is_whitespace) {
            Some((hex, path)) => {
                let path = path.trim_start().trim_start_matches('*');
                out.insert(path.to_string(), hex.to_lowercase());
            }
            None => {
                out.insert(".".to_string(), line.to_lowercase());
            }
        }
    }
    out
}

/// First path whose digest differs, as `(path, local, remote)`.
pub fn first_mismatch(local: &Digests, remote: &Digests) -> Option<(String, String, String)> {
    for (path, digest) in local {
        match remote.get(path) {
            Some(r) if r == digest => {}
            Some(r) => return Some((path.clone(), digest.clone(), r.clone())),
            None => return Some((path.clone(), digest.clone(), MISSING.to_string())),
        }
    }
    remote
        .keys()
        .find(|path| !local.contains_key(*path))
        .map(|path| (path.clone(), MISSING.to_string(), remote[path].clone()))
}
