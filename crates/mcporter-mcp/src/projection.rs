//! Result projection: keep only configured dotted paths of a JSON value,
//! preserving nested structure and array shape.

use serde_json::{Map, Value};

/// Project `value` onto the dotted `picks` paths.
///
/// Arrays are traversed element-wise. Keys absent in the source produce no
/// entry. An empty pick list is the identity.
pub fn project(value: &Value, picks: &[String]) -> Value {
    let paths: Vec<Vec<&str>> = picks
        .iter()
        .map(|p| p.split('.').filter(|s| !s.is_empty()).collect::<Vec<_>>())
        .filter(|p: &Vec<&str>| !p.is_empty())
        .collect();
    if paths.is_empty() {
        return value.clone();
    }
    project_paths(value, &paths)
}

fn project_paths(value: &Value, paths: &[Vec<&str>]) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project_paths(item, paths))
                .collect(),
        ),
        Value::Object(source) => {
            let mut out = Map::new();
            // Group tails under each head key, preserving pick order.
            let mut heads: Vec<&str> = Vec::new();
            for path in paths {
                if !heads.contains(&path[0]) {
                    heads.push(path[0]);
                }
            }
            for head in heads {
                let Some(child) = source.get(head) else {
                    continue;
                };
                let tails: Vec<Vec<&str>> = paths
                    .iter()
                    .filter(|p| p[0] == head)
                    .map(|p| p[1..].to_vec())
                    .collect();
                if tails.iter().any(Vec::is_empty) {
                    // A full pick of this key wins over deeper ones.
                    out.insert(head.to_string(), child.clone());
                } else {
                    out.insert(head.to_string(), project_paths(child, &tails));
                }
            }
            Value::Object(out)
        }
        // A scalar cannot satisfy a deeper path.
        _ => Value::Object(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn picks(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_nested_projection() {
        let source = json!({
            "id": 7,
            "name": "ada",
            "profile": {
                "email": "ada@example.com",
                "phone": "555",
                "location": {"city": "London", "country": "UK"}
            },
            "extra": true
        });
        let projected = project(
            &source,
            &picks(&["id", "profile.email", "profile.location.city"]),
        );
        assert_eq!(
            projected,
            json!({
                "id": 7,
                "profile": {
                    "email": "ada@example.com",
                    "location": {"city": "London"}
                }
            })
        );
    }

    #[test]
    fn test_array_elements_projected() {
        let source = json!({
            "users": [
                {"id": 1, "name": "a", "secret": "x"},
                {"id": 2, "name": "b", "secret": "y"}
            ]
        });
        let projected = project(&source, &picks(&["users.id"]));
        assert_eq!(projected, json!({"users": [{"id": 1}, {"id": 2}]}));
    }

    #[test]
    fn test_top_level_array_shape_preserved() {
        let source = json!([{"a": 1, "b": 2}, {"a": 3}]);
        let projected = project(&source, &picks(&["a"]));
        assert_eq!(projected, json!([{"a": 1}, {"a": 3}]));
    }

    #[test]
    fn test_absent_keys_produce_no_entry() {
        let source = json!({"present": 1});
        let projected = project(&source, &picks(&["present", "missing", "nested.missing"]));
        assert_eq!(projected, json!({"present": 1}));
    }

    #[test]
    fn test_empty_picks_is_identity() {
        let source = json!({"a": 1});
        assert_eq!(project(&source, &[]), source);
    }

    #[test]
    fn test_full_pick_wins_over_deeper() {
        let source = json!({"a": {"b": 1, "c": 2}});
        let projected = project(&source, &picks(&["a", "a.b"]));
        assert_eq!(projected, json!({"a": {"b": 1, "c": 2}}));
    }

    #[test]
    fn test_scalar_under_deep_path_yields_no_entry() {
        let source = json!({"a": 5});
        let projected = project(&source, &picks(&["a.b"]));
        assert_eq!(projected, json!({"a": {}}));
    }
}
