//! Plugin archive extraction.
//!
//! Plugins ship as `.tar.gz` or `.zip` bundles containing a YAML manifest
//! and a `.wasm` module. Extraction writes directories with mode `0755` and
//! regular files with mode `0644`; entries that would escape the output
//! directory are skipped. Unknown extensions are ignored by the engine's
//! discovery walk, which visits directories in lexical order so that
//! registration order is deterministic for a given tree.

use std::fs;
use std::fs::File;
use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use tracing::warn;

use crate::error::EngineError;

const TAR_GZ_SUFFIX: &str = ".tar.gz";
const ZIP_SUFFIX: &str = ".zip";

/// Expand a plugin archive under `output_dir`, dispatching on extension.
///
/// # Errors
///
/// `Archive` when the archive cannot be opened or an entry fails to
/// extract. Callers extracting a batch treat this as per-archive and
/// continue.
pub fn extract_archive(archive: &Path, output_dir: &Path) -> Result<(), EngineError> {
    let name = archive.to_string_lossy();
    if name.ends_with(TAR_GZ_SUFFIX) {
        untar(archive, output_dir)
    } else if name.ends_with(ZIP_SUFFIX) {
        unzip(archive, output_dir)
    } else {
        // Not a plugin archive; nothing to do.
        Ok(())
    }
}

/// Derive the plugin directory name from an archive file name by stripping
/// the `.tar.gz`/`.zip` suffix and any leading path. Returns `None` for
/// files that are not plugin archives or whose name is empty after
/// stripping.
pub fn plugin_name_from_archive(archive: &Path) -> Option<String> {
    let file_name = archive.file_name()?.to_string_lossy();
    let stem = file_name
        .strip_suffix(TAR_GZ_SUFFIX)
        .or_else(|| file_name.strip_suffix(ZIP_SUFFIX))?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Collect files under `root` whose names end in one of `extensions`,
/// walking directories in lexical order. A file `root` is matched directly.
pub fn find_files_with_extensions(root: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    if root.is_file() {
        if matches_extension(root, extensions) {
            matches.push(root.to_path_buf());
        }
        return Ok(matches);
    }
    walk(root, extensions, &mut matches)?;
    Ok(matches)
}

fn walk(dir: &Path, extensions: &[&str], matches: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, extensions, matches)?;
        } else if matches_extension(&path, extensions) {
            matches.push(path);
        }
    }
    Ok(())
}

fn matches_extension(path: &Path, extensions: &[&str]) -> bool {
    let name = path.to_string_lossy();
    extensions.iter().any(|ext| name.ends_with(ext))
}

fn untar(archive: &Path, output_dir: &Path) -> Result<(), EngineError> {
    let archive_err = |e: &dyn std::fmt::Display| EngineError::Archive {
        path: archive.to_path_buf(),
        message: e.to_string(),
    };

    let file = File::open(archive).map_err(|e| archive_err(&e))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    create_dir(output_dir).map_err(|e| archive_err(&e))?;

    for entry in tar.entries().map_err(|e| archive_err(&e))? {
        let mut entry = entry.map_err(|e| archive_err(&e))?;
        let rel = entry.path().map_err(|e| archive_err(&e))?.into_owned();
        let Some(dest) = safe_join(output_dir, &rel) else {
            warn!(archive = %archive.display(), entry = %rel.display(), "skipping entry escaping output directory");
            continue;
        };
        match entry.header().entry_type() {
            tar::EntryType::Directory => create_dir(&dest).map_err(|e| archive_err(&e))?,
            tar::EntryType::Regular => {
                write_file(&dest, &mut entry).map_err(|e| archive_err(&e))?;
            }
            // Symlinks, devices and the rest have no place in a plugin bundle.
            _ => {}
        }
    }
    Ok(())
}

fn unzip(archive: &Path, output_dir: &Path) -> Result<(), EngineError> {
    let archive_err = |e: &dyn std::fmt::Display| EngineError::Archive {
        path: archive.to_path_buf(),
        message: e.to_string(),
    };

    let file = File::open(archive).map_err(|e| archive_err(&e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| archive_err(&e))?;
    create_dir(output_dir).map_err(|e| archive_err(&e))?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| archive_err(&e))?;
        let Some(rel) = entry.enclosed_name() else {
            warn!(archive = %archive.display(), entry = %entry.name(), "skipping entry escaping output directory");
            continue;
        };
        let dest = output_dir.join(rel);
        if entry.is_dir() {
            create_dir(&dest).map_err(|e| archive_err(&e))?;
        } else {
            write_file(&dest, &mut entry).map_err(|e| archive_err(&e))?;
        }
    }
    Ok(())
}

/// Join `rel` under `base`, rejecting absolute paths and `..` components.
fn safe_join(base: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Create a directory (and parents) with mode `0755`.
fn create_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    set_mode(path, 0o755)
}

/// Write a regular file with mode `0644`, creating parent directories.
fn write_file(path: &Path, reader: &mut impl io::Read) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let mut file = File::create(path)?;
    io::copy(reader, &mut file)?;
    set_mode(path, 0o644)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn create_test_tarball(dir: &Path) -> PathBuf {
        let archive_path = dir.join("bundle.tar.gz");
        let file = File::create(&archive_path).expect("create archive");
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut header = tar::Header::new_gnu();
        header.set_size(14);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, "nested/file1.txt", &b"file1 contents"[..]).expect("append");

        let mut header = tar::Header::new_gnu();
        header.set_size(14);
        header.set_mode(0o777);
        header.set_cksum();
        builder.append_data(&mut header, "file2.txt", &b"file2 contents"[..]).expect("append");

        builder.into_inner().expect("finish tar").finish().expect("finish gzip");
        archive_path
    }

    fn create_test_zip(dir: &Path) -> PathBuf {
        let archive_path = dir.join("bundle.zip");
        let file = File::create(&archive_path).expect("create archive");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("inner/data.txt", options).expect("start file");
        writer.write_all(b"zip contents").expect("write");
        writer.finish().expect("finish zip");
        archive_path
    }

    #[test]
    fn untar_extracts_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = create_test_tarball(tmp.path());
        let out = tmp.path().join("extracted");

        extract_archive(&archive, &out).expect("extraction should succeed");

        assert_eq!(fs::read(out.join("nested/file1.txt")).expect("file1"), b"file1 contents");
        assert_eq!(fs::read(out.join("file2.txt")).expect("file2"), b"file2 contents");
    }

    #[cfg(unix)]
    #[test]
    fn extraction_applies_mode_discipline() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = create_test_tarball(tmp.path());
        let out = tmp.path().join("extracted");
        extract_archive(&archive, &out).expect("extraction should succeed");

        let dir_mode = fs::metadata(out.join("nested")).expect("dir metadata").permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o755, "directories are created 0755");

        // Archive modes (0600/0777) are not preserved.
        let file_mode =
            fs::metadata(out.join("file2.txt")).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o644, "regular files are created 0644");
    }

    #[test]
    fn unzip_extracts_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let archive = create_test_zip(tmp.path());
        let out = tmp.path().join("extracted");

        extract_archive(&archive, &out).expect("extraction should succeed");
        assert_eq!(fs::read(out.join("inner/data.txt")).expect("data"), b"zip contents");
    }

    #[test]
    fn unreadable_archive_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let result = extract_archive(&tmp.path().join("missing.tar.gz"), &tmp.path().join("out"));
        assert!(matches!(result, Err(EngineError::Archive { .. })));
    }

    #[test]
    fn unknown_extension_is_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stray = tmp.path().join("notes.txt");
        fs::write(&stray, b"not an archive").expect("write");
        extract_archive(&stray, &tmp.path().join("out")).expect("unknown extensions are a no-op");
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn plugin_name_strips_suffix_and_path() {
        assert_eq!(plugin_name_from_archive(Path::new("/plugins/greeter.tar.gz")).as_deref(), Some("greeter"));
        assert_eq!(plugin_name_from_archive(Path::new("tools.zip")).as_deref(), Some("tools"));
        assert_eq!(plugin_name_from_archive(Path::new("/plugins/module.wasm")), None);
        assert_eq!(plugin_name_from_archive(Path::new(".tar.gz")), None);
    }

    #[test]
    fn safe_join_rejects_traversal() {
        let base = Path::new("/out");
        assert!(safe_join(base, Path::new("../evil")).is_none());
        assert!(safe_join(base, Path::new("/abs/evil")).is_none());
        assert_eq!(safe_join(base, Path::new("ok/./child")), Some(PathBuf::from("/out/ok/child")));
    }

    #[test]
    fn walk_order_is_lexical() {
        let tmp = tempfile::tempdir().expect("tempdir");
        for name in ["b.yaml", "a.yaml", "sub"] {
            if name == "sub" {
                fs::create_dir(tmp.path().join(name)).expect("mkdir");
            } else {
                fs::write(tmp.path().join(name), b"x").expect("write");
            }
        }
        fs::write(tmp.path().join("sub/c.yaml"), b"x").expect("write");

        let found = find_files_with_extensions(tmp.path(), &[".yaml"]).expect("walk");
        let names: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).expect("prefix").to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.yaml", "b.yaml", "sub/c.yaml"]);
    }
}
