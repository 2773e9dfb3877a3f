//! Translation of local save folders onto the remote filesystem layout.
//!
//! The workstation and the cluster mount the same data under different roots,
//! e.g. `Z:\imaging\2024` locally and `/groups/lab/imaging/2024` on the
//! cluster. Everything below the local root is carried over verbatim; every
//! rendered path uses `/` regardless of the host OS.

use std::path::{Component, Path};

use crate::error::{DispatchError, DispatchResult};

/// Render a path with forward-slash separators.
pub fn unix_path(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().replace('\\', "/")
}

/// Join a forward-slash base path with a single child name.
pub fn join_remote(base: &str, child: &str) -> String {
    if base.is_empty() {
        return child.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child)
}

/// Remote locations derived from one local save folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    /// Remote counterpart of the local save folder.
    pub remote_save_folder: String,

    /// Parent of `remote_save_folder`.
    pub remote_base_path: String,

    /// Final component of `remote_save_folder`.
    pub remote_folder_name: String,
}

impl RemoteLayout {
    /// Map `local_save_folder` (which must lie under `local_root`) onto
    /// `remote_root`.
    ///
    /// When the save folder is the local root itself, the translation
    /// degenerates to `remote_root`.
    pub fn translate(
        local_root: &Path,
        remote_root: &str,
        local_save_folder: &Path,
    ) -> DispatchResult<Self> {
        let relative =
            local_save_folder
                .strip_prefix(local_root)
                .map_err(|_| DispatchError::PathOutsideRoot {
                    path: unix_path(local_save_folder),
                    root: unix_path(local_root),
                })?;

        let mut remote_save_folder = normalize_root(remote_root);
        for component in relative.components() {
            if let Component::Normal(part) = component {
                remote_save_folder = join_remote(&remote_save_folder, &part.to_string_lossy());
            }
        }

        let (remote_base_path, remote_folder_name) = split_parent(&remote_save_folder);

        Ok(Self {
            remote_save_folder,
            remote_base_path,
            remote_folder_name,
        })
    }

    /// Remote working directory for one plane.
    pub fn plane_dir(&self, plane: u32) -> String {
        join_remote(
            &join_remote(&self.remote_base_path, &self.remote_folder_name),
            &format!("plane{plane}"),
        )
    }
}

fn normalize_root(remote_root: &str) -> String {
    let root = unix_path(remote_root);
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() && root.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn split_parent(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (".".to_string(), path.to_string()),
    }
}
