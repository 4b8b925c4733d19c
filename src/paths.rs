/// Defines [ResourcePath], the slash separated address of a resource within the resource graph.
///
/// A path names a resource as it is reached from a top-level resource, possibly passing through
/// references. The *location* of a resource is the path of the real resource it resolves to, so
/// `path == location` holds exactly when no reference was followed.
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::PatternError;

pub const PATH_SEP: char = '/';

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The (empty) path above all top-level resources.
    pub fn root() -> ResourcePath {
        ResourcePath::default()
    }

    pub fn top_level(name: &str) -> Result<ResourcePath, PatternError> {
        ResourcePath::root().child(name)
    }

    pub fn child(&self, name: &str) -> Result<ResourcePath, PatternError> {
        validate_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(ResourcePath { segments })
    }

    pub fn parent(&self) -> Option<ResourcePath> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(ResourcePath { segments })
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_top_level(&self) -> bool {
        self.segments.len() == 1
    }

    /// True if `self` equals `other` or lies below it.
    pub fn starts_with(&self, other: &ResourcePath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Appends every segment of `relative` to this path.
    pub fn join(&self, relative: &str) -> Result<ResourcePath, PatternError> {
        let mut path = self.clone();
        for segment in relative.split(PATH_SEP).filter(|s| !s.is_empty()) {
            path = path.child(segment)?;
        }
        Ok(path)
    }
}

fn validate_segment(name: &str) -> Result<(), PatternError> {
    if name.is_empty() {
        return Err(PatternError::Usage(
            "resource names must not be empty".to_string(),
        ));
    }
    if name.contains(PATH_SEP) || name.chars().any(char::is_whitespace) {
        return Err(PatternError::Usage(format!(
            "invalid resource name '{name}': names may not contain '{PATH_SEP}' or whitespace"
        )));
    }
    Ok(())
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for ResourcePath {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourcePath::root().join(s)
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = PatternError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&str> for ResourcePath {
    type Error = PatternError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> String {
        path.to_string()
    }
}
