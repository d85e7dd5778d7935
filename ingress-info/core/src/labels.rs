use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;

/// Metadata labels of a single resource.
#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// A set of `label=value` pairs.
///
/// Used with AND semantics as an include filter (see [`Selector::matches_all`])
/// and with OR semantics as an exclude filter (see [`Selector::matches_any`]).
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector(Map);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("label selector '{0}' must be of the form label=value")]
    MissingValue(String),

    #[error("label selector '{0}' has an empty label name")]
    EmptyKey(String),
}

/// Returns true if `labels` carries at least one of the exclude selector's
/// pairs with exactly the same value.
///
/// An absent or empty selector never excludes anything.
pub fn should_exclude(labels: &Labels, exclude: Option<&Selector>) -> bool {
    exclude.is_some_and(|sel| sel.matches_any(labels))
}

// === Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every pair must be present on `labels`.
    pub fn matches_all(&self, labels: &Labels) -> bool {
        self.0.iter().all(|(k, v)| labels.0.get(k) == Some(v))
    }

    /// Returns the first pair present on `labels`, if any.
    pub fn first_match<'s>(&'s self, labels: &Labels) -> Option<(&'s str, &'s str)> {
        self.iter().find(|(k, v)| labels.get(k) == Some(*v))
    }

    pub fn matches_any(&self, labels: &Labels) -> bool {
        self.first_match(labels).is_some()
    }
}

/// Parses a comma-delimited list of `label=value` pairs. Blank entries are
/// ignored; when a label is repeated the last value wins.
impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                let (k, v) = raw
                    .split_once('=')
                    .ok_or_else(|| ParseError::MissingValue(raw.to_string()))?;
                let k = k.trim();
                if k.is_empty() {
                    return Err(ParseError::EmptyKey(raw.to_string()));
                }
                Ok((k.to_string(), v.trim().to_string()))
            })
            .collect()
    }
}

/// Renders the selector in the form the Kubernetes API accepts for a
/// `labelSelector` query parameter.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

// === Labels ===

impl Labels {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.map(Self::from).unwrap_or_default()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
