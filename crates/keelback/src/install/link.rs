//! Linking a single extracted package into a prefix.

use std::path::{Path, PathBuf};

use keelback_digest::{digest_bytes, Sha256};
use keelback_types::{
    package::{PackagePathType, PackagePathsEntry, PathsJson},
    FileMode, LinkType, NoArchType, PathType, PathsEntry,
};
use memchr::memmem;

use super::python::PythonInfo;

/// Errors from linking files into the prefix.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The package metadata could not be read.
    #[error("failed to read package metadata from {0}: {1}")]
    InvalidPackage(PathBuf, std::io::Error),

    /// A file operation in the prefix failed.
    #[error("failed to link {path}: {source}")]
    FailedToLink {
        /// The file that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A binary placeholder is shorter than the target prefix.
    #[error("the target prefix is too long for the binary placeholder in {0}")]
    PrefixTooLong(PathBuf),
}

/// Picks the best link type for transferring files from the cache into the
/// prefix: hard links when both live on the same filesystem, then symbolic
/// links, then plain copies.
pub fn determine_link_type(cache_dir: &Path, target_prefix: &Path) -> LinkType {
    let probe_source = cache_dir.join(".probe-source");
    let probe_target = target_prefix.join(".probe-target");
    let _ = fs_err::create_dir_all(target_prefix);

    let hardlink_works = fs_err::write(&probe_source, b"probe").is_ok()
        && fs_err::hard_link(&probe_source, &probe_target).is_ok();
    let _ = fs_err::remove_file(&probe_target);

    if hardlink_works {
        let _ = fs_err::remove_file(&probe_source);
        return LinkType::HardLink;
    }

    #[cfg(unix)]
    {
        let symlink_works =
            std::os::unix::fs::symlink(&probe_source, &probe_target).is_ok();
        let _ = fs_err::remove_file(&probe_target);
        let _ = fs_err::remove_file(&probe_source);
        if symlink_works {
            return LinkType::SoftLink;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = fs_err::remove_file(&probe_source);
    }

    LinkType::Copy
}

/// Links all files of an extracted package into the prefix and returns the
/// manifest entries for the prefix record. `python_info` must be given for
/// `noarch: python` packages so their files can be relocated.
pub fn link_package(
    extracted_dir: &Path,
    target_prefix: &Path,
    link_type: LinkType,
    noarch: NoArchType,
    python_info: Option<&PythonInfo>,
) -> Result<Vec<PathsEntry>, LinkError> {
    let paths = PathsJson::from_package_directory(extracted_dir)
        .map_err(|e| LinkError::InvalidPackage(extracted_dir.to_owned(), e))?;

    let mut entries = Vec::with_capacity(paths.paths.len());
    for entry in &paths.paths {
        let target_relative = match (noarch.is_python(), python_info) {
            (true, Some(python)) => python.map_noarch_path(&entry.relative_path),
            _ => entry.relative_path.clone(),
        };
        entries.push(link_file(
            entry,
            extracted_dir,
            target_prefix,
            &target_relative,
            link_type,
        )?);
    }
    Ok(entries)
}

fn link_file(
    entry: &PackagePathsEntry,
    extracted_dir: &Path,
    target_prefix: &Path,
    target_relative: &Path,
    link_type: LinkType,
) -> Result<PathsEntry, LinkError> {
    let source = extracted_dir.join(&entry.relative_path);
    let target = target_prefix.join(target_relative);
    let io_err = |source: std::io::Error| LinkError::FailedToLink {
        path: target_relative.to_owned(),
        source,
    };

    if let Some(parent) = target.parent() {
        fs_err::create_dir_all(parent).map_err(io_err)?;
    }

    let manifest = |path_type: PathType, sha256_in_prefix: Option<_>| PathsEntry {
        relative_path: target_relative.to_owned(),
        path_type,
        no_link: entry.no_link,
        sha256: entry.sha256,
        sha256_in_prefix,
        size_in_bytes: entry.size_in_bytes,
        file_mode: entry.file_mode,
        prefix_placeholder: entry.prefix_placeholder.clone(),
    };

    // Empty directories are materialized as directories.
    if entry.path_type == PackagePathType::Directory {
        fs_err::create_dir_all(&target).map_err(io_err)?;
        return Ok(manifest(PathType::Directory, None));
    }

    // Files carrying a prefix placeholder must be rewritten, which rules
    // out sharing the cached bytes.
    if let Some(placeholder) = &entry.prefix_placeholder {
        let rewritten = rewrite_placeholder(
            &fs_err::read(&source).map_err(io_err)?,
            placeholder,
            target_prefix,
            entry.file_mode.unwrap_or(FileMode::Text),
        )
        .ok_or_else(|| LinkError::PrefixTooLong(entry.relative_path.clone()))?;
        let rewritten = rewrite_long_shebang(rewritten);

        let sha256_in_prefix = digest_bytes::<Sha256>(&rewritten);
        fs_err::write(&target, &rewritten).map_err(io_err)?;
        copy_permissions(&source, &target).map_err(io_err)?;
        return Ok(manifest(PathType::HardLink, Some(sha256_in_prefix)));
    }

    // Symlinks inside the package are replicated as symlinks.
    if entry.path_type == PackagePathType::SoftLink {
        #[cfg(unix)]
        {
            let link_target = fs_err::read_link(&source).map_err(io_err)?;
            remove_existing(&target);
            std::os::unix::fs::symlink(&link_target, &target).map_err(io_err)?;
            return Ok(manifest(PathType::SoftLink, None));
        }
        #[cfg(not(unix))]
        {
            fs_err::copy(&source, &target).map_err(io_err)?;
            return Ok(manifest(PathType::HardLink, None));
        }
    }

    // Regular files: hard link, soft link, or copy, with graceful
    // degradation when the preferred mechanism fails.
    let effective = if entry.no_link { LinkType::Copy } else { link_type };
    remove_existing(&target);
    let used = match effective {
        LinkType::HardLink => match fs_err::hard_link(&source, &target) {
            Ok(()) => PathType::HardLink,
            Err(_) => {
                fs_err::copy(&source, &target).map_err(io_err)?;
                PathType::HardLink
            }
        },
        #[cfg(unix)]
        LinkType::SoftLink => match std::os::unix::fs::symlink(&source, &target) {
            Ok(()) => PathType::SoftLink,
            Err(_) => {
                fs_err::copy(&source, &target).map_err(io_err)?;
                PathType::HardLink
            }
        },
        _ => {
            fs_err::copy(&source, &target).map_err(io_err)?;
            PathType::HardLink
        }
    };
    Ok(manifest(used, None))
}

fn remove_existing(target: &Path) {
    let _ = fs_err::remove_file(target);
}

fn copy_permissions(source: &Path, target: &Path) -> Result<(), std::io::Error> {
    let permissions = fs_err::metadata(source)?.permissions();
    fs_err::set_permissions(target, permissions)
}

/// Replaces every occurrence of the placeholder with the target prefix.
///
/// In text mode the file simply grows or shrinks. In binary mode the
/// placeholder is part of NUL-terminated strings whose length must not
/// change: the tail after the placeholder is shifted and the string is
/// padded with NULs. Returns `None` when the target prefix is longer than a
/// binary placeholder.
pub(crate) fn rewrite_placeholder(
    contents: &[u8],
    placeholder: &str,
    target_prefix: &Path,
    file_mode: FileMode,
) -> Option<Vec<u8>> {
    let old = placeholder.as_bytes();
    let new = target_prefix.as_os_str().to_string_lossy().into_owned();
    let new = new.as_bytes();

    match file_mode {
        FileMode::Text => {
            let mut out = Vec::with_capacity(contents.len());
            let mut last = 0;
            for position in memmem::find_iter(contents, old) {
                out.extend_from_slice(&contents[last..position]);
                out.extend_from_slice(new);
                last = position + old.len();
            }
            out.extend_from_slice(&contents[last..]);
            Some(out)
        }
        FileMode::Binary => {
            if new.len() > old.len() {
                return None;
            }
            let mut out = contents.to_vec();
            // Occurrences are processed in order; replacement preserves the
            // total length so positions stay valid.
            let positions: Vec<usize> = memmem::find_iter(contents, old).collect();
            for position in positions {
                // The NUL-terminated string the placeholder is part of.
                let string_end = out[position..]
                    .iter()
                    .position(|&byte| byte == 0)
                    .map_or(out.len(), |nul| position + nul);
                let tail: Vec<u8> = out[position + old.len()..string_end].to_vec();

                let mut replacement = Vec::with_capacity(string_end - position);
                replacement.extend_from_slice(new);
                replacement.extend_from_slice(&tail);
                replacement.resize(string_end - position, 0);
                out[position..string_end].copy_from_slice(&replacement);
            }
            Some(out)
        }
    }
}

/// Kernels reject shebang lines longer than 127 bytes; such lines are
/// rewritten to the `/usr/bin/env` form.
pub(crate) fn rewrite_long_shebang(contents: Vec<u8>) -> Vec<u8> {
    const SHEBANG_LIMIT: usize = 127;

    if !contents.starts_with(b"#!") {
        return contents;
    }
    let line_end = memchr::memchr(b'\n', &contents).unwrap_or(contents.len());
    if line_end <= SHEBANG_LIMIT {
        return contents;
    }

    let line = String::from_utf8_lossy(&contents[2..line_end]);
    let interpreter = line.split_whitespace().next().unwrap_or_default();
    let program = Path::new(interpreter)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if program.is_empty() {
        return contents;
    }

    let mut out = format!("#!/usr/bin/env {program}").into_bytes();
    out.extend_from_slice(&contents[line_end..]);
    out
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use keelback_types::FileMode;

    use super::{rewrite_long_shebang, rewrite_placeholder};

    #[test]
    fn text_rewrite_changes_length() {
        let contents = b"prefix=/opt/placeholder/lib\n";
        let result = rewrite_placeholder(
            contents,
            "/opt/placeholder",
            Path::new("/envs/test"),
            FileMode::Text,
        )
        .unwrap();
        assert_eq!(result, b"prefix=/envs/test/lib\n");
    }

    #[test]
    fn binary_rewrite_preserves_length() {
        let mut contents = Vec::new();
        contents.extend_from_slice(b"ELF....");
        contents.extend_from_slice(b"/opt/placeholder/lib\0more-data");
        let result = rewrite_placeholder(
            &contents,
            "/opt/placeholder",
            Path::new("/envs/x"),
            FileMode::Binary,
        )
        .unwrap();

        assert_eq!(result.len(), contents.len());
        let rewritten = &result[7..];
        assert!(rewritten.starts_with(b"/envs/x/lib\0"));
        assert!(result.ends_with(b"more-data"));
    }

    #[test]
    fn binary_rewrite_rejects_longer_prefix() {
        let contents = b"/short\0".to_vec();
        assert!(rewrite_placeholder(
            &contents,
            "/short",
            Path::new("/a/very/long/target/prefix/path"),
            FileMode::Binary,
        )
        .is_none());
    }

    #[test]
    fn long_shebang_is_rewritten() {
        let long_prefix = "x".repeat(150);
        let script = format!("#!/{long_prefix}/bin/python3.11\nprint()\n").into_bytes();
        let rewritten = rewrite_long_shebang(script);
        assert!(rewritten.starts_with(b"#!/usr/bin/env python3.11\n"));

        let short = b"#!/envs/test/bin/python\nprint()\n".to_vec();
        assert_eq!(rewrite_long_shebang(short.clone()), short);
    }
}
