//! Remote path layouts.
//!
//! A vault's layout decides where tablet data lives inside the backend and
//! how to read identifiers back out of an object key. The check loops only
//! ever go through these methods, so adding a layout version is local to
//! this module.

/// Identifiers recovered from a segment object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPathParts {
    pub tablet_id: i64,
    pub rowset_id: String,
}

/// Versioned remote path layout.
///
/// V0: `data/{tablet_id}/{rowset_id}_{seg_idx}.dat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathVersion {
    #[default]
    V0,
}

impl PathVersion {
    /// Directory holding every segment of a tablet.
    pub fn tablet_path(&self, tablet_id: i64) -> String {
        match self {
            PathVersion::V0 => format!("data/{tablet_id}"),
        }
    }

    /// Object key of one segment file.
    pub fn segment_path(&self, tablet_id: i64, rowset_id: &str, seg_idx: i32) -> String {
        match self {
            PathVersion::V0 => format!("data/{tablet_id}/{rowset_id}_{seg_idx}.dat"),
        }
    }

    /// Recover `(tablet_id, rowset_id)` from a segment object key.
    pub fn parse_segment_path(&self, path: &str) -> Result<SegmentPathParts, PathParseError> {
        match self {
            PathVersion::V0 => parse_segment_path_v0(path),
        }
    }
}

fn parse_segment_path_v0(path: &str) -> Result<SegmentPathParts, PathParseError> {
    let components: Vec<&str> = path.split('/').collect();
    if components.len() < 3 {
        return Err(PathParseError::TooFewComponents(path.to_string()));
    }

    let tablet_id: i64 = components[1]
        .parse()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| PathParseError::InvalidTabletId(path.to_string()))?;

    let last = components.last().unwrap();
    let rowset_id = match last.find('_') {
        Some(pos) => last[..pos].to_string(),
        None => return Err(PathParseError::MissingRowsetId(path.to_string())),
    };

    Ok(SegmentPathParts {
        tablet_id,
        rowset_id,
    })
}

/// An object key that does not match the vault's layout.
#[derive(Debug, thiserror::Error)]
pub enum PathParseError {
    #[error("too few path components: {0}")]
    TooFewComponents(String),
    #[error("failed to parse tablet_id from path: {0}")]
    InvalidTabletId(String),
    #[error("failed to parse rowset_id from path: {0}")]
    MissingRowsetId(String),
}
