use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized absolute namespace path. Always starts with "/", never ends
/// with "/" except for the root itself, empty components collapsed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NsPath(String);

impl NsPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let mut normalized = String::from("/");
        for part in path.as_ref().split('/') {
            if part.is_empty() || part == "." {
                continue;
            }
            if !normalized.ends_with('/') {
                normalized.push('/');
            }
            normalized.push_str(part);
        }
        NsPath(normalized)
    }

    pub fn root() -> Self {
        NsPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn components(&self) -> Vec<&str> {
        if self.is_root() {
            return Vec::new();
        }
        self.0[1..].split('/').collect()
    }

    pub fn parent(&self) -> Option<NsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(NsPath::root()),
            Some(pos) => Some(NsPath(self.0[..pos].to_string())),
            None => None,
        }
    }

    /// Split into (parent, leaf name). None for the root.
    pub fn split_parent_name(&self) -> Option<(NsPath, String)> {
        let parent = self.parent()?;
        let name = self.components().last().map(|s| s.to_string())?;
        Some((parent, name))
    }

    /// Prefix test on component boundaries: "/a/b" starts with "/a" but not
    /// with "/a/bc" and everything starts with the root.
    pub fn starts_with(&self, prefix: &NsPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    pub fn join(&self, name: &str) -> NsPath {
        if self.is_root() {
            NsPath::new(format!("/{}", name))
        } else {
            NsPath::new(format!("{}/{}", self.0, name))
        }
    }
}

impl fmt::Display for NsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NsPath({})", self.0)
    }
}

impl From<&str> for NsPath {
    fn from(s: &str) -> Self {
        NsPath::new(s)
    }
}
