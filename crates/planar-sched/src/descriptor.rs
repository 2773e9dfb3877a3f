//! Per-plane job descriptors.
//!
//! A descriptor is the pipeline's configuration record for one plane: an
//! ordered map from string keys to tagged values. It is stored as JSON with
//! each value tagged by kind, so a path and a plain string stay distinct
//! across load/save cycles:
//!
//! ```json
//! {
//!   "fast_disk": { "path": "/scratch/run1/suite2p/plane0" },
//!   "nchannels": { "int": 1 },
//!   "do_registration": { "bool": true }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{DispatchError, DispatchResult};

/// Well-known descriptor keys.
pub mod keys {
    /// Local staging directory holding the plane's binary files.
    pub const FAST_DISK: &str = "fast_disk";
    /// Base directory containing the save folder.
    pub const SAVE_PATH0: &str = "save_path0";
    /// Name of the save folder.
    pub const SAVE_FOLDER: &str = "save_folder";
    /// The plane's working directory.
    pub const SAVE_PATH: &str = "save_path";
    /// Location of the descriptor itself.
    pub const OPS_PATH: &str = "ops_path";
    /// Registered binary, first channel.
    pub const REG_FILE: &str = "reg_file";
    /// Registered binary, second channel.
    pub const REG_FILE_CHAN2: &str = "reg_file_chan2";
    /// Raw (pre-registration) binary, first channel.
    pub const RAW_FILE: &str = "raw_file";
    /// Raw (pre-registration) binary, second channel.
    pub const RAW_FILE_CHAN2: &str = "raw_file_chan2";
}

/// A single descriptor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(String),
    List(Vec<DescriptorValue>),
    Map(BTreeMap<String, DescriptorValue>),
}

impl DescriptorValue {
    /// The value as a filesystem path, if it is a path or a string.
    pub fn as_path(&self) -> Option<&str> {
        match self {
            DescriptorValue::Path(p) | DescriptorValue::Str(p) => Some(p),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            DescriptorValue::Bool(_) => "bool",
            DescriptorValue::Int(_) => "int",
            DescriptorValue::Float(_) => "float",
            DescriptorValue::Str(_) => "str",
            DescriptorValue::Path(_) => "path",
            DescriptorValue::List(_) => "list",
            DescriptorValue::Map(_) => "map",
        }
    }
}

impl From<bool> for DescriptorValue {
    fn from(v: bool) -> Self {
        DescriptorValue::Bool(v)
    }
}

impl From<i64> for DescriptorValue {
    fn from(v: i64) -> Self {
        DescriptorValue::Int(v)
    }
}

impl From<f64> for DescriptorValue {
    fn from(v: f64) -> Self {
        DescriptorValue::Float(v)
    }
}

impl From<&str> for DescriptorValue {
    fn from(v: &str) -> Self {
        DescriptorValue::Str(v.to_string())
    }
}

impl From<String> for DescriptorValue {
    fn from(v: String) -> Self {
        DescriptorValue::Str(v)
    }
}

/// The configuration record of one plane, bound to the file it lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    file: PathBuf,
    entries: BTreeMap<String, DescriptorValue>,
}

impl JobDescriptor {
    /// Create an empty descriptor that will be saved to `file`.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load a descriptor from disk.
    pub async fn load(file: impl AsRef<Path>) -> DispatchResult<Self> {
        let file = file.as_ref();
        let content = fs::read_to_string(file).await?;
        let entries = serde_json::from_str(&content)?;
        Ok(Self {
            file: file.to_path_buf(),
            entries,
        })
    }

    /// Write the descriptor back to its file.
    pub async fn save(&self) -> DispatchResult<()> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.file, json).await?;
        Ok(())
    }

    /// File this descriptor is loaded from and saved to.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&DescriptorValue> {
        self.entries.get(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DescriptorValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Insert or replace a path value.
    pub fn set_path(&mut self, key: impl Into<String>, path: impl Into<String>) {
        self.entries
            .insert(key.into(), DescriptorValue::Path(path.into()));
    }

    /// Iterate over all entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &DescriptorValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the descriptor has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A path-valued entry, if present.
    pub fn path(&self, key: &str) -> DispatchResult<Option<PathBuf>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(value) => value.as_path().map(|p| Some(PathBuf::from(p))).ok_or_else(|| {
                DispatchError::InvalidValue {
                    key: key.to_string(),
                    message: format!("expected a path, found {}", value.kind()),
                }
            }),
        }
    }

    /// A path-valued entry that must be present.
    pub fn require_path(&self, key: &str) -> DispatchResult<PathBuf> {
        self.path(key)?.ok_or_else(|| DispatchError::MissingKey {
            path: self.file.display().to_string(),
            key: key.to_string(),
        })
    }

    /// Whether the plane carries raw (pre-registration) data.
    pub fn has_raw_data(&self) -> bool {
        self.contains(keys::RAW_FILE)
    }

    /// Whether the raw data has a second channel.
    pub fn has_raw_chan2(&self) -> bool {
        self.contains(keys::RAW_FILE_CHAN2)
    }

    /// Whether the registered data has a second channel.
    pub fn has_reg_chan2(&self) -> bool {
        self.contains(keys::REG_FILE_CHAN2)
    }
}
