//! Discovery of plane folders inside a save folder.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{DispatchError, DispatchResult};

/// Literal prefix of every plane folder name.
pub const PLANE_PREFIX: &str = "plane";

/// Name of the descriptor file inside each plane folder.
pub const DESCRIPTOR_FILE: &str = "ops.json";

/// One plane folder on the local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneDir {
    /// Plane index parsed from the folder name.
    pub index: u32,

    /// Absolute folder path.
    pub path: PathBuf,
}

impl PlaneDir {
    /// Path of the plane's descriptor file.
    pub fn descriptor_path(&self) -> PathBuf {
        self.path.join(DESCRIPTOR_FILE)
    }
}

/// Parse the plane index from a folder name such as `plane12`.
pub fn parse_plane_index(name: &str) -> DispatchResult<u32> {
    let digits = name
        .strip_prefix(PLANE_PREFIX)
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| DispatchError::InvalidPlaneFolder(name.to_string()))?;

    digits
        .parse()
        .map_err(|_| DispatchError::InvalidPlaneFolder(name.to_string()))
}

/// Compare two strings treating runs of ASCII digits as numbers.
///
/// `plane2` sorts before `plane10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.as_bytes();
    let mut right = b.as_bytes();

    loop {
        match (left.first(), right.first()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (lnum, lrest) = split_digits(left);
                let (rnum, rrest) = split_digits(right);
                let ltrim = trim_zeros(lnum);
                let rtrim = trim_zeros(rnum);
                let ord = ltrim
                    .len()
                    .cmp(&rtrim.len())
                    .then_with(|| ltrim.cmp(rtrim));
                if ord != Ordering::Equal {
                    return ord;
                }
                left = lrest;
                right = rrest;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(y);
                }
                left = &left[1..];
                right = &right[1..];
            }
        }
    }
}

fn split_digits(s: &[u8]) -> (&[u8], &[u8]) {
    let end = s.iter().position(|b| !b.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn trim_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&b| b != b'0').unwrap_or(s.len());
    &s[start..]
}

/// List the plane folders of `save_folder` in natural order.
///
/// Every subdirectory is treated as a plane; a name that is not
/// `plane<digits>` is an error, and so are two names with the same index.
pub async fn discover_planes(save_folder: &Path) -> DispatchResult<Vec<PlaneDir>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(save_folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort_by(|a, b| natural_cmp(a, b));

    let mut seen: HashMap<u32, String> = HashMap::new();
    let mut planes = Vec::with_capacity(names.len());
    for name in names {
        let index = parse_plane_index(&name)?;
        if let Some(first) = seen.get(&index) {
            return Err(DispatchError::DuplicatePlaneIndex {
                index,
                first: first.clone(),
                second: name,
            });
        }
        planes.push(PlaneDir {
            index,
            path: save_folder.join(&name),
        });
        seen.insert(index, name);
    }
    Ok(planes)
}
