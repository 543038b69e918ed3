use crate::error::{AttestError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting state files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Render `value` as JSON with sorted keys and four-space indentation.
///
/// Going through `serde_json::Value` sorts object keys, so the output is
/// byte-stable for equal content regardless of struct field order.
pub fn to_sorted_json(value: &impl Serialize) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Atomically write a deterministic JSON document.
pub fn write_json_sorted(path: &Path, value: &impl Serialize) -> Result<()> {
    let data = to_sorted_json(value)?;
    atomic_write(path, &data)
}

/// Write an immutable record: fails if `path` already exists, then marks the
/// file read-only.
pub fn write_immutable(path: &Path, value: &impl Serialize) -> Result<()> {
    let data = to_sorted_json(value)?;
    write_immutable_bytes(path, &data)
}

/// Byte-level [`write_immutable`], for copies that must stay exact.
pub fn write_immutable_bytes(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::AlreadyExists {
            AttestError::RecordExists(path.display().to_string())
        } else {
            AttestError::Io(e.error)
        }
    })?;
    set_readonly(path, true)
}

/// Remove a record previously written by [`write_immutable`].
pub fn remove_immutable(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    set_readonly(path, false)?;
    std::fs::remove_file(path)?;
    Ok(())
}

fn set_readonly(path: &Path, readonly: bool) -> Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(if readonly { 0o444 } else { 0o644 });
    }
    #[cfg(not(unix))]
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Append one line to a file and flush it to disk.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    f.sync_all()?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Recursively copy `src` into `dst`, creating `dst`.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replace `dst` with a copy of `src`.
///
/// The copy is staged in a hidden sibling directory and renamed into place,
/// so a crash mid-copy never leaves a half-populated `dst`.
pub fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging: PathBuf = parent.join(format!(".{name}.staging-{}", uuid::Uuid::new_v4()));
    if let Err(e) = copy_dir_all(src, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    if dst.exists() {
        std::fs::remove_dir_all(dst)?;
    }
    std::fs::rename(&staging, dst)?;
    Ok(())
}

/// List `*.json` files in `dir`, sorted by file name. Missing dir → empty.
pub fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/test.json");
        atomic_write(&path, b"data").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn sorted_json_orders_keys_and_indents_four_spaces() {
        #[derive(Serialize)]
        struct Marker {
            zeta: u32,
            alpha: &'static str,
        }
        let out = to_sorted_json(&Marker {
            zeta: 1,
            alpha: "a",
        })
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "{\n    \"alpha\": \"a\",\n    \"zeta\": 1\n}\n");
    }

    #[test]
    fn immutable_record_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rec.json");
        write_immutable(&path, &serde_json::json!({"a": 1})).unwrap();
        let err = write_immutable(&path, &serde_json::json!({"a": 2})).unwrap_err();
        assert!(matches!(err, AttestError::RecordExists(_)));
        assert!(std::fs::metadata(&path).unwrap().permissions().readonly());
        remove_immutable(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn replace_dir_swaps_stale_copy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/a.txt"), "fresh").unwrap();
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&dst).unwrap();
        std::fs::write(dst.join("stale.txt"), "old").unwrap();

        replace_dir(&src, &dst).unwrap();

        assert!(!dst.join("stale.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dst.join("nested/a.txt")).unwrap(),
            "fresh"
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("staging"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
