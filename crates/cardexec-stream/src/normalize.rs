//! Payload normalization for streamed items and emitted records.

use serde_json::Value;

/// Unwrap common server envelopes before post-processing.
///
/// Order matters: validation errors pass through untouched, `{__raw}`
/// wrappers yield their payload, card-shaped envelopes (`kind`,
/// `report_id` or `card_id`) yield `data` when present, and any other
/// object with `data` yields it. Table-shaped and everything else passes
/// through unchanged.
pub fn normalize_item(item: Value) -> Value {
    let Value::Object(mut map) = item else {
        return item;
    };

    if map.contains_key("__validation_error") {
        return Value::Object(map);
    }

    if let Some(raw) = map.remove("__raw") {
        return raw;
    }

    let card_shaped = ["kind", "report_id", "card_id"]
        .iter()
        .any(|key| map.contains_key(*key));
    if card_shaped {
        return match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        };
    }

    match map.remove("data") {
        Some(data) => data,
        None => Value::Object(map),
    }
}

/// Repair records that arrive with stringified or nested fields.
///
/// A batch holding a single nested array is flattened one level. On each
/// object record a string `meta` is parsed, a string `rows` is parsed when
/// it holds an array, and string elements of a `rows` array whose first
/// element is a string are parsed individually.
pub fn normalize_records(mut records: Vec<Value>) -> Vec<Value> {
    if records.len() == 1 && records[0].is_array() {
        if let Some(Value::Array(inner)) = records.pop() {
            records = inner;
        }
    }

    for record in records.iter_mut() {
        let Value::Object(map) = record else {
            continue;
        };

        if let Some(Value::String(meta)) = map.get("meta") {
            if let Ok(parsed) = serde_json::from_str::<Value>(meta) {
                map.insert("meta".to_string(), parsed);
            }
        }

        if let Some(Value::String(rows)) = map.get("rows") {
            if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(rows) {
                map.insert("rows".to_string(), parsed);
            }
        }

        if let Some(Value::Array(rows)) = map.get_mut("rows") {
            if rows.first().is_some_and(Value::is_string) {
                for row in rows.iter_mut() {
                    if let Value::String(text) = row {
                        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                            *row = parsed;
                        }
                    }
                }
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_error_passes_through() {
        let item = json!({"__validation_error": "bad", "__raw": 1, "data": 2});
        assert_eq!(normalize_item(item.clone()), item);
    }

    #[test]
    fn test_raw_wrapper_is_unwrapped() {
        let item = json!({"__sseEvent": "update", "__raw": {"x": 1}, "x": 1});
        assert_eq!(normalize_item(item), json!({"x": 1}));
    }

    #[test]
    fn test_card_envelope_yields_data() {
        assert_eq!(
            normalize_item(json!({"kind": "number", "data": {"value": 3}})),
            json!({"value": 3})
        );
        assert_eq!(
            normalize_item(json!({"kind": "number", "value": 3})),
            json!({"kind": "number", "value": 3})
        );
        assert_eq!(normalize_item(json!({"data": [1, 2]})), json!([1, 2]));
    }

    #[test]
    fn test_table_and_scalars_pass_through() {
        let table = json!({"rows": [[1]], "columns": ["a"]});
        assert_eq!(normalize_item(table.clone()), table);
        assert_eq!(normalize_item(json!("text")), json!("text"));
        assert_eq!(normalize_item(Value::Null), Value::Null);
    }

    #[test]
    fn test_records_flatten_single_nested_array() {
        let records = normalize_records(vec![json!([{"a": 1}, {"a": 2}])]);
        assert_eq!(records, vec![json!({"a": 1}), json!({"a": 2})]);

        // Two entries are left alone.
        let records = normalize_records(vec![json!([1]), json!([2])]);
        assert_eq!(records, vec![json!([1]), json!([2])]);
    }

    #[test]
    fn test_records_parse_stringified_fields() {
        let records = normalize_records(vec![
            json!({"kind": "table", "meta": "{\"title\":\"T\"}", "rows": "[{\"id\":1}]"}),
            json!({"kind": "table", "rows": ["{\"id\":2}", "oops", {"id": 3}]}),
            json!({"kind": "table", "meta": "not json", "rows": "{\"id\":4}"}),
        ]);
        assert_eq!(records[0]["meta"], json!({"title": "T"}));
        assert_eq!(records[0]["rows"], json!([{"id": 1}]));
        assert_eq!(records[1]["rows"], json!([{"id": 2}, "oops", {"id": 3}]));
        assert_eq!(records[2]["meta"], json!("not json"));
        assert_eq!(records[2]["rows"], json!("{\"id\":4}"));
    }
}
