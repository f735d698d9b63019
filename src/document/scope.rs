use std::fmt;

/// A location in the configuration hierarchy.
///
/// Scopes are slash-separated paths such as `Default Web Site/app1`. The
/// empty path is the server root. Leading and trailing slashes are ignored,
/// and `.` is accepted as an alias for "this scope" in location paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigScope {
    segments: Vec<String>,
}

impl ConfigScope {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: &str) -> Self {
        let segments = path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != ".")
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Every scope from the server root down to and including `self`.
    pub fn ancestry(&self) -> Vec<ConfigScope> {
        (0..=self.segments.len())
            .map(|n| ConfigScope {
                segments: self.segments[..n].to_vec(),
            })
            .collect()
    }

    pub fn parent(&self) -> Option<ConfigScope> {
        if self.is_root() {
            return None;
        }
        Some(ConfigScope {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True when `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &ConfigScope) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn contains(&self, other: &ConfigScope) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    pub fn join(&self, relative: &str) -> ConfigScope {
        let mut segments = self.segments.clone();
        segments.extend(ConfigScope::parse(relative).segments);
        ConfigScope { segments }
    }

    /// Path of `self` relative to `base`, as written in a `location` element.
    pub fn relative_to(&self, base: &ConfigScope) -> Option<String> {
        if !base.contains(self) {
            return None;
        }
        Some(self.segments[base.segments.len()..].join("/"))
    }
}

impl fmt::Display for ConfigScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl From<&str> for ConfigScope {
    fn from(path: &str) -> Self {
        ConfigScope::parse(path)
    }
}
