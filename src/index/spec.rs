//! Flexible integer index specifications.
//!
//! Region, tile and GPU selections arrive from the command line or a run-options
//! file in several shapes. [`IndexSpec`] is the closed set of those shapes and
//! [`IndexSpec::resolve`] turns any of them into an ordered list of integers.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user-supplied index selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<RawIndexSpec>", into = "Option<RawIndexSpec>")]
pub enum IndexSpec {
    /// No selection; the caller supplies a default.
    #[default]
    Absent,
    /// A single index.
    Single(i64),
    /// A single index in textual form, parsed on resolution.
    Text(String),
    /// Half-open range `[start, stop)`.
    Range(i64, i64),
    /// Explicit indexes, used as given.
    List(Vec<i64>),
}

impl IndexSpec {
    /// Resolve to an ordered list of indexes.
    ///
    /// `Absent` resolves to `None`. Order and duplicates are preserved.
    pub fn resolve(&self) -> Result<Option<Vec<i64>>, ConfigError> {
        match self {
            IndexSpec::Absent => Ok(None),
            IndexSpec::Single(v) => Ok(Some(vec![*v])),
            IndexSpec::Text(s) => {
                let v = s.trim().parse::<i64>().map_err(|e| ConfigError::Parse {
                    input: s.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Some(vec![v]))
            }
            IndexSpec::Range(start, stop) => Ok(Some((*start..*stop).collect())),
            IndexSpec::List(values) => Ok(Some(values.clone())),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, IndexSpec::Absent)
    }
}

/// Parses the textual forms accepted on the command line:
///
/// - `7` (kept as text and parsed by [`IndexSpec::resolve`])
/// - `(1,4)` as a half-open range; items past the second are ignored
/// - `[1,2,3]` or `1,2,3` as an explicit list
impl FromStr for IndexSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(IndexSpec::Absent);
        }

        if let Some(inner) = trimmed.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
            let items = parse_items(s, inner)?;
            if items.len() < 2 {
                return Err(ConfigError::Parse {
                    input: s.to_string(),
                    reason: "a range needs a start and a stop".to_string(),
                });
            }
            return Ok(IndexSpec::Range(items[0], items[1]));
        }

        if let Some(inner) = trimmed.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            return Ok(IndexSpec::List(parse_items(s, inner)?));
        }

        if trimmed.contains(',') {
            return Ok(IndexSpec::List(parse_items(s, trimmed)?));
        }

        Ok(IndexSpec::Text(trimmed.to_string()))
    }
}

fn parse_items(input: &str, inner: &str) -> Result<Vec<i64>, ConfigError> {
    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<i64>().map_err(|e| ConfigError::Parse {
                input: input.to_string(),
                reason: format!("{item:?}: {e}"),
            })
        })
        .collect()
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexSpec::Absent => write!(f, "<default>"),
            IndexSpec::Single(v) => write!(f, "{v}"),
            IndexSpec::Text(s) => write!(f, "{s}"),
            IndexSpec::Range(start, stop) => write!(f, "({start},{stop})"),
            IndexSpec::List(values) => {
                let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(","))
            }
        }
    }
}

/// Wire form used in run-option files: an integer, a list, or text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIndexSpec {
    Int(i64),
    List(Vec<i64>),
    Text(String),
}

impl From<Option<RawIndexSpec>> for IndexSpec {
    fn from(raw: Option<RawIndexSpec>) -> Self {
        match raw {
            None => IndexSpec::Absent,
            Some(RawIndexSpec::Int(v)) => IndexSpec::Single(v),
            Some(RawIndexSpec::List(values)) => IndexSpec::List(values),
            // Malformed text stays text so resolution reports the parse error.
            Some(RawIndexSpec::Text(s)) => s.parse().unwrap_or(IndexSpec::Text(s)),
        }
    }
}

impl From<IndexSpec> for Option<RawIndexSpec> {
    fn from(spec: IndexSpec) -> Self {
        match spec {
            IndexSpec::Absent => None,
            IndexSpec::Single(v) => Some(RawIndexSpec::Int(v)),
            IndexSpec::List(values) => Some(RawIndexSpec::List(values)),
            IndexSpec::Text(s) => Some(RawIndexSpec::Text(s)),
            range @ IndexSpec::Range(..) => Some(RawIndexSpec::Text(range.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_shapes() {
        assert_eq!(IndexSpec::Absent.resolve().unwrap(), None);
        assert_eq!(IndexSpec::Single(5).resolve().unwrap(), Some(vec![5]));
        assert_eq!(IndexSpec::Text("7".into()).resolve().unwrap(), Some(vec![7]));
        assert_eq!(IndexSpec::Range(1, 4).resolve().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(IndexSpec::Range(3, 3).resolve().unwrap(), Some(vec![]));
        assert_eq!(IndexSpec::Range(5, 2).resolve().unwrap(), Some(vec![]));
    }

    #[test]
    fn test_resolve_list_preserves_order_and_duplicates() {
        let spec = IndexSpec::List(vec![2, 2, 9]);
        assert_eq!(spec.resolve().unwrap(), Some(vec![2, 2, 9]));

        let spec = IndexSpec::List(vec![9, 1]);
        assert_eq!(spec.resolve().unwrap(), Some(vec![9, 1]));
    }

    #[test]
    fn test_resolve_bad_text() {
        let err = IndexSpec::Text("seven".into()).resolve().unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_from_str_forms() {
        assert_eq!("".parse::<IndexSpec>().unwrap(), IndexSpec::Absent);
        assert_eq!("7".parse::<IndexSpec>().unwrap(), IndexSpec::Text("7".into()));
        assert_eq!("(1,4)".parse::<IndexSpec>().unwrap(), IndexSpec::Range(1, 4));
        assert_eq!("(1, 4, 9)".parse::<IndexSpec>().unwrap(), IndexSpec::Range(1, 4));
        assert_eq!("[3,1,3]".parse::<IndexSpec>().unwrap(), IndexSpec::List(vec![3, 1, 3]));
        assert_eq!("0,2".parse::<IndexSpec>().unwrap(), IndexSpec::List(vec![0, 2]));
    }

    #[test]
    fn test_from_str_errors() {
        assert!("(1)".parse::<IndexSpec>().is_err());
        assert!("(1,x)".parse::<IndexSpec>().is_err());
        assert!("1,a".parse::<IndexSpec>().is_err());
    }

    #[test]
    fn test_serde_forms() {
        #[derive(Deserialize, Serialize)]
        struct Holder {
            #[serde(default)]
            regions: IndexSpec,
        }

        let h: Holder = serde_yaml::from_str("regions: 3").unwrap();
        assert_eq!(h.regions, IndexSpec::Single(3));

        let h: Holder = serde_yaml::from_str("regions: [1, 2]").unwrap();
        assert_eq!(h.regions, IndexSpec::List(vec![1, 2]));

        let h: Holder = serde_yaml::from_str("regions: \"(1,4)\"").unwrap();
        assert_eq!(h.regions, IndexSpec::Range(1, 4));

        let h: Holder = serde_yaml::from_str("{}").unwrap();
        assert!(h.regions.is_absent());

        let json = serde_json::to_string(&Holder { regions: IndexSpec::Range(2, 5) }).unwrap();
        assert_eq!(json, r#"{"regions":"(2,5)"}"#);
    }
}
