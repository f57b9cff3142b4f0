use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates a file name offered by a peer before it touches the local disk.
///
/// Only a single plain file name is allowed. Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Nested paths (`dir/file`)
pub fn validate_offer_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let path = Path::new(file_name);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_name}"
                )));
            }
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
        }
    }

    match normal {
        0 => Err(TransferError::InvalidPath(format!(
            "no file name in: {file_name}"
        ))),
        1 => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "nested paths not allowed: {file_name}"
        ))),
    }
}

/// Resolves where an offered file lands inside `download_dir`.
pub fn destination_for(download_dir: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    validate_offer_name(file_name)?;
    let name = Path::new(file_name)
        .file_name()
        .ok_or_else(|| TransferError::InvalidPath(format!("no file name in: {file_name}")))?;
    Ok(download_dir.join(name))
}
