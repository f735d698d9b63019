use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

use crate::document::{Document, SourceId};
use crate::error::{Error, Result};

/// Write the given sources back to disk.
///
/// Every file is first staged as a synced temp file next to its target;
/// only when all are staged is each renamed into place. A failure while
/// staging leaves every target untouched. A failure while replacing puts
/// back the files already replaced, so either all targets change or none.
pub(crate) fn write_sources(document: &Document, ids: &BTreeSet<SourceId>) -> Result<Vec<PathBuf>> {
    let mut staged = Vec::new();
    for id in ids {
        let Some(source) = document.source(*id) else {
            continue;
        };
        let bytes = source.to_bytes()?;
        staged.push((stage(&source.path, &bytes)?, source.path.clone()));
    }

    let mut replaced: Vec<(PathBuf, Option<Vec<u8>>)> = Vec::with_capacity(staged.len());
    for (temp, path) in staged {
        let result = previous_contents(&path).and_then(|previous| {
            temp.persist(&path).map_err(|e| Error::CommitIo {
                path: path.clone(),
                source: e.error,
            })?;
            Ok(previous)
        });
        match result {
            Ok(previous) => {
                debug!(path = %path.display(), "Replaced configuration file");
                replaced.push((path, previous));
            }
            Err(e) => {
                restore(replaced);
                return Err(e);
            }
        }
    }
    Ok(replaced.into_iter().map(|(path, _)| path).collect())
}

/// Current bytes of a target, `None` if it does not exist yet
fn previous_contents(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::CommitIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Undo replacements, newest first. Files that did not exist are removed.
fn restore(replaced: Vec<(PathBuf, Option<Vec<u8>>)>) {
    for (path, previous) in replaced.into_iter().rev() {
        let result = match previous {
            Some(bytes) => stage(&path, &bytes).and_then(|temp| {
                temp.persist(&path).map_err(|e| Error::CommitIo {
                    path: path.clone(),
                    source: e.error,
                })?;
                Ok(())
            }),
            None => std::fs::remove_file(&path).map_err(|source| Error::CommitIo {
                path: path.clone(),
                source,
            }),
        };
        match result {
            Ok(()) => warn!(path = %path.display(), "Restored configuration file after failed commit"),
            Err(e) => error!(path = %path.display(), error = %e, "Could not restore configuration file"),
        }
    }
}

fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let commit_err = |source: std::io::Error| Error::CommitIo {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(commit_err)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".siteadmin-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(commit_err)?;
    temp.write_all(bytes).map_err(commit_err)?;
    if let Ok(existing) = std::fs::metadata(path) {
        temp.as_file()
            .set_permissions(existing.permissions())
            .map_err(commit_err)?;
    }
    temp.as_file().sync_all().map_err(commit_err)?;
    Ok(temp)
}
