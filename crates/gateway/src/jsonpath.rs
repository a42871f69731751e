//! Restricted JSONPath helpers for body transforms and validation.
//!
//! Paths have the form `$.field.nested[0].leaf`. Only object fields and
//! non-negative array indexes are supported; that is the entire surface
//! the transform and validation configs may reference.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static INDEXED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w*)\[(\d+)\]$").expect("valid regex"));

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    /// `field[idx]`; the field may be empty for bare `[idx]` continuation.
    Indexed { field: String, index: usize },
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let rest = path.strip_prefix("$.")?;
    if rest.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    for part in rest.split('.') {
        if part.is_empty() {
            return None;
        }
        if let Some(caps) = INDEXED_RE.captures(part) {
            segments.push(Segment::Indexed {
                field: caps[1].to_owned(),
                index: caps[2].parse().ok()?,
            });
        } else if part.chars().all(|c| c.is_alphanumeric() || c == '_') {
            segments.push(Segment::Field(part.to_owned()));
        } else {
            return None;
        }
    }
    Some(segments)
}

/// Get the value at `path`, if present.
#[must_use]
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse(path)?;
    let mut current = data;
    for segment in &segments {
        match segment {
            Segment::Field(name) => {
                current = current.as_object()?.get(name)?;
            }
            Segment::Indexed { field, index } => {
                if !field.is_empty() {
                    current = current.as_object()?.get(field)?;
                }
                current = current.as_array()?.get(*index)?;
            }
        }
    }
    Some(current)
}

/// Set `value` at `path`, creating intermediate objects/arrays as needed.
/// Invalid paths leave `data` untouched.
pub fn set_path(data: &mut Value, path: &str, value: Value) {
    let Some(segments) = parse(path) else {
        return;
    };
    let mut current = data;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        match segment {
            Segment::Field(name) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                let map = current.as_object_mut().expect("just ensured object");
                if last {
                    map.insert(name.clone(), value);
                    return;
                }
                current = map
                    .entry(name.clone())
                    .or_insert(Value::Object(serde_json::Map::new()));
            }
            Segment::Indexed { field, index } => {
                if !field.is_empty() {
                    if !current.is_object() {
                        *current = Value::Object(serde_json::Map::new());
                    }
                    let map = current.as_object_mut().expect("just ensured object");
                    current = map
                        .entry(field.clone())
                        .or_insert(Value::Array(Vec::new()));
                }
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let arr = current.as_array_mut().expect("just ensured array");
                while arr.len() <= *index {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*index] = value;
                    return;
                }
                current = &mut arr[*index];
            }
        }
    }
}

/// Delete the value at `path`. Returns `true` if something was removed.
pub fn delete_path(data: &mut Value, path: &str) -> bool {
    let Some(segments) = parse(path) else {
        return false;
    };
    delete_segments(data, &segments)
}

fn delete_segments(current: &mut Value, segments: &[Segment]) -> bool {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return false,
    };
    if rest.is_empty() {
        return match head {
            Segment::Field(name) => current
                .as_object_mut()
                .is_some_and(|map| map.remove(name).is_some()),
            Segment::Indexed { field, index } => {
                let arr = if field.is_empty() {
                    current.as_array_mut()
                } else {
                    current
                        .as_object_mut()
                        .and_then(|map| map.get_mut(field))
                        .and_then(Value::as_array_mut)
                };
                match arr {
                    Some(arr) if *index < arr.len() => {
                        arr.remove(*index);
                        true
                    }
                    _ => false,
                }
            }
        };
    }
    let next = match head {
        Segment::Field(name) => current.as_object_mut().and_then(|map| map.get_mut(name)),
        Segment::Indexed { field, index } => {
            let arr = if field.is_empty() {
                current.as_array_mut()
            } else {
                current
                    .as_object_mut()
                    .and_then(|map| map.get_mut(field))
                    .and_then(Value::as_array_mut)
            };
            arr.and_then(|arr| arr.get_mut(*index))
        }
    };
    next.is_some_and(|next| delete_segments(next, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_nested_and_indexed() {
        let data = json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(get_path(&data, "$.a.b[0].c"), Some(&json!(7)));
        assert_eq!(get_path(&data, "$.a.b[1].c"), None);
        assert_eq!(get_path(&data, "$.missing"), None);
        assert_eq!(get_path(&data, "no-dollar"), None);
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut data = json!({});
        set_path(&mut data, "$.user.name", json!("alice"));
        assert_eq!(get_path(&data, "$.user.name"), Some(&json!("alice")));
    }

    #[test]
    fn set_creates_arrays_with_null_padding() {
        let mut data = json!({});
        set_path(&mut data, "$.items[2]", json!("third"));
        assert_eq!(data, json!({"items": [null, null, "third"]}));
    }

    #[test]
    fn set_then_delete_removes_field() {
        let mut data = json!({});
        set_path(&mut data, "$.a.b", json!(1));
        assert!(delete_path(&mut data, "$.a.b"));
        assert_eq!(get_path(&data, "$.a.b"), None);
        assert!(!delete_path(&mut data, "$.a.b"));
    }

    #[test]
    fn delete_array_element_shifts() {
        let mut data = json!({"xs": [1, 2, 3]});
        assert!(delete_path(&mut data, "$.xs[1]"));
        assert_eq!(data, json!({"xs": [1, 3]}));
    }

    #[test]
    fn deep_set_overwrites_scalar_intermediate() {
        let mut data = json!({"a": 5});
        set_path(&mut data, "$.a.b", json!(true));
        assert_eq!(get_path(&data, "$.a.b"), Some(&json!(true)));
    }

    #[test]
    fn invalid_path_is_a_noop() {
        let mut data = json!({"a": 1});
        set_path(&mut data, "bad path", json!(2));
        assert_eq!(data, json!({"a": 1}));
    }
}
