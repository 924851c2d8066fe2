// ABOUTME: Image references as written in rollout.yml and produced by builds.
// ABOUTME: Parses `[registry/]name[:tag][@digest]` and re-pins images to per-run tags.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ParseImageRefError {
    #[error("image reference cannot be empty")]
    Empty,

    #[error("invalid character in image reference: {0}")]
    InvalidChar(char),

    #[error("image reference has an empty path component: {0}")]
    EmptyComponent(String),

    #[error("invalid image tag: {0}")]
    InvalidTag(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    registry: Option<String>,
    name: String,
    tag: Option<String>,
    digest: Option<String>,
}

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '-' | '_' | '@')
}

/// Docker's tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && tag.len() <= MAX_TAG_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// The first path segment names a registry when it looks like a host.
fn is_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl ImageRef {
    pub fn parse(input: &str) -> Result<Self, ParseImageRefError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ParseImageRefError::Empty);
        }
        if let Some(c) = input.chars().find(|c| !allowed(*c)) {
            return Err(ParseImageRefError::InvalidChar(c));
        }

        let (reference, digest) = match input.split_once('@') {
            Some((reference, digest)) => (reference, Some(digest.to_string())),
            None => (input, None),
        };

        // A colon after the last slash separates the tag; earlier ones belong to a registry port.
        let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
        let (path, tag) = match reference[last_slash..].rfind(':') {
            Some(i) => {
                let at = last_slash + i;
                (&reference[..at], Some(reference[at + 1..].to_string()))
            }
            None => (reference, None),
        };

        if let Some(tag) = &tag
            && !valid_tag(tag)
        {
            return Err(ParseImageRefError::InvalidTag(tag.clone()));
        }
        if path.split('/').any(str::is_empty) {
            return Err(ParseImageRefError::EmptyComponent(input.to_string()));
        }

        let (registry, name) = match path.split_once('/') {
            Some((first, rest)) if is_registry(first) => (Some(first.to_string()), rest.to_string()),
            _ => (None, path.to_string()),
        };

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            name,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Registry and name without tag or digest, e.g. `ghcr.io/org/app`.
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.name),
            None => self.name.clone(),
        }
    }

    /// Same repository pinned to a different tag. Any digest is dropped.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            name: self.name.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }
}

impl TryFrom<String> for ImageRef {
    type Error = ParseImageRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(image: ImageRef) -> Self {
        image.to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
