use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::BidsError;

/// Unpacks `zip_path` under `target_dir`, returning the number of files written.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, BidsError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| BidsError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| BidsError::Filesystem(err.to_string()))?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(BidsError::Filesystem(format!(
                "zip entry path traversal detected in {}",
                zip_path.display()
            )));
        };
        let entry_path = target_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| BidsError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        written += 1;
    }
    Ok(written)
}

/// Streams `reader` into `destination` through a temp file in the same directory.
///
/// `destination` only appears once the whole body has been written.
pub fn stream_to_file(reader: &mut impl io::Read, destination: &Path) -> Result<(), BidsError> {
    let parent = destination
        .parent()
        .ok_or_else(|| BidsError::Filesystem("invalid destination path".to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".shanoir-bids-download")
        .tempfile_in(parent)
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    io::copy(reader, temp.as_file_mut()).map_err(|err| {
        BidsError::Filesystem(format!("write {}: {err}", destination.display()))
    })?;
    temp.as_file()
        .sync_all()
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    temp.persist(destination)
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Files directly inside `dir` whose name ends with `.{suffix}`, sorted.
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Result<Vec<PathBuf>, BidsError> {
    let wanted = format!(".{}", suffix.to_ascii_lowercase());
    let mut out = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|err| BidsError::Filesystem(format!("list {}: {err}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|err| BidsError::Filesystem(err.to_string()))?;
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.to_ascii_lowercase().ends_with(&wanted))
            .unwrap_or(false);
        if path.is_file() && matches {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Deletes every file under `root` whose extension is not `keep_ext`.
pub fn remove_files_except(root: &Path, keep_ext: &str) -> Result<usize, BidsError> {
    let mut removed = 0usize;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| BidsError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let keep = path
                .extension()
                .and_then(|value| value.to_str())
                .map(|value| value.eq_ignore_ascii_case(keep_ext))
                .unwrap_or(false);
            if !keep {
                fs::remove_file(&path).map_err(|err| BidsError::Filesystem(err.to_string()))?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    struct BrokenBody {
        sent: bool,
    }

    impl Read for BrokenBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.sent {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            self.sent = true;
            buf[..4].copy_from_slice(b"PK\x03\x04");
            Ok(4)
        }
    }

    #[test]
    fn interrupted_stream_leaves_no_file() {
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("4211_T1.zip");

        let err = stream_to_file(&mut BrokenBody { sent: false }, &destination).unwrap_err();
        assert!(matches!(err, BidsError::Filesystem(_)));
        assert!(!destination.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn complete_stream_lands_at_destination() {
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("4211.zip");

        stream_to_file(&mut &b"archive"[..], &destination).unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"archive");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn extract_and_prune() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("series.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("series/IM_0001.dcm", options).unwrap();
            writer.write_all(b"dicom").unwrap();
            writer.start_file("series/readme.txt", options).unwrap();
            writer.write_all(b"text").unwrap();
            writer.finish().unwrap();
        }

        let target = temp.path().join("dicom");
        assert_eq!(extract_zip(&zip_path, &target).unwrap(), 2);
        assert_eq!(remove_files_except(&target, "dcm").unwrap(), 1);
        assert!(target.join("series/IM_0001.dcm").exists());
        assert!(!target.join("series/readme.txt").exists());
    }
}
