//! Paths into the response tree.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// A json object
pub type Object = serde_json::Map<String, serde_json::Value>;

/// A GraphQL path element that is composed of strings or numbers.
/// e.g `/book/3/name`
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index path element.
    Index(usize),

    /// A key path element.
    Key(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => write!(f, "{key}"),
        }
    }
}

/// A path to a field in the response, serialized as a plain JSON array.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Default::default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    /// Returns a new path with `key` appended.
    pub fn key(&self, key: impl Into<String>) -> Path {
        let mut elements = self.0.clone();
        elements.push(PathElement::Key(key.into()));
        Path(elements)
    }

    /// Returns a new path with `index` appended.
    pub fn index(&self, index: usize) -> Path {
        let mut elements = self.0.clone();
        elements.push(PathElement::Index(index));
        Path(elements)
    }

    pub fn join(&self, other: impl AsRef<Self>) -> Self {
        let other = other.as_ref();
        let mut new = Vec::with_capacity(self.len() + other.len());
        new.extend(self.iter().cloned());
        new.extend(other.iter().cloned());
        Path(new)
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|x| !x.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_slash_separated_paths() {
        let path = Path::from("/hero/friends/1/name");
        assert_eq!(
            path,
            Path(vec![
                PathElement::Key("hero".to_string()),
                PathElement::Key("friends".to_string()),
                PathElement::Index(1),
                PathElement::Key("name".to_string()),
            ])
        );
        assert_eq!(path.to_string(), "/hero/friends/1/name");
    }

    #[test]
    fn serializes_as_a_plain_array() {
        let path = Path::empty().key("hero").index(2).key("name");
        assert_eq!(
            serde_json::to_value(&path).unwrap(),
            json!(["hero", 2, "name"])
        );
        let back: Path = serde_json::from_value(json!(["hero", 2, "name"])).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn joins_paths() {
        let parent = Path::from("/hero");
        assert_eq!(parent.join(Path::from("/friends/0")).to_string(), "/hero/friends/0");
        assert!(Path::empty().is_empty());
    }
}
