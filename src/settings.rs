use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Collation pragma stored in the datafile header at creation time.
///
/// Higher layers use it to order index keys; the storage core only persists
/// the single-byte code and hands it back on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Collation {
    /// Byte-wise ordinal comparison.
    #[default]
    Binary,
    /// Ordinal comparison ignoring ASCII case.
    IgnoreCase,
}

impl Collation {
    pub fn to_code(self) -> u8 {
        match self {
            Collation::Binary => 0,
            Collation::IgnoreCase => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Collation::Binary),
            1 => Some(Collation::IgnoreCase),
            _ => None,
        }
    }
}

/// Engine configuration recognised by the storage core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Path to the datafile. The log file lives alongside it.
    pub filename: PathBuf,

    /// Open both files read-only and reject every mutating operation.
    pub read_only: bool,

    /// Collation written to the header pragma on initial creation; ignored
    /// when the datafile already exists.
    pub collation: Collation,

    /// Read by the engine shell to decide whether to invoke rebuild when the
    /// invalid-state flag is found set on open. The core only stores it.
    pub auto_rebuild: bool,
}

impl EngineSettings {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            read_only: false,
            collation: Collation::default(),
            auto_rebuild: false,
        }
    }

    /// Log file path: `<stem>-log.<ext>` next to the datafile.
    pub fn log_path(&self) -> PathBuf {
        let stem = self
            .filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let name = match self.filename.extension() {
            Some(ext) => format!("{}-log.{}", stem, ext.to_string_lossy()),
            None => format!("{}-log", stem),
        };

        self.filename.with_file_name(name)
    }
}
