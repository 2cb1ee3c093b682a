// src/unit/hash.rs

//! Content hashing for units that skip unchanged inputs.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher;
use tracing::{debug, trace};

/// Compute the hash of a single file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file =
        File::open(path).with_context(|| format!("opening file for hashing: {path:?}"))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading file for hashing: {path:?}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute a deterministic hash over the names and contents of the given
/// files.
///
/// Order of `paths` does not matter; they are sorted before hashing. Paths
/// that are not regular files are skipped. A file that is renamed without
/// changing its content still changes the hash.
pub fn compute_hash_for_paths<I, P>(paths: I) -> Result<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut hasher = Hasher::new();

    let mut paths_vec: Vec<PathBuf> = paths
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .collect();
    paths_vec.sort();
    paths_vec.dedup();

    for path in paths_vec {
        if path.is_file() {
            trace!("hashing file {:?}", path);
            let file_hash = compute_file_hash(&path)?;
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            hasher.update(file_hash.as_bytes());
        }
    }

    let hash = hasher.finalize().to_hex().to_string();
    debug!(hash = %hash, "computed aggregate hash");
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn hash_is_order_independent_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "beta").unwrap();

        let h1 = compute_hash_for_paths([&a, &b]).unwrap();
        let h2 = compute_hash_for_paths([&b, &a]).unwrap();
        assert_eq!(h1, h2);

        fs::write(&b, "beta2").unwrap();
        let h3 = compute_hash_for_paths([&a, &b]).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn missing_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "alpha").unwrap();

        let with_ghost = compute_hash_for_paths([a.clone(), dir.path().join("ghost")]).unwrap();
        let without = compute_hash_for_paths([a]).unwrap();
        assert_eq!(with_ghost, without);
    }

    #[test]
    fn renaming_a_file_changes_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        fs::write(&a, "same").unwrap();
        let before = compute_hash_for_paths([&a]).unwrap();

        let renamed = dir.path().join("renamed.txt");
        fs::rename(&a, &renamed).unwrap();
        let after = compute_hash_for_paths([&renamed]).unwrap();
        assert_ne!(before, after);
    }
}
