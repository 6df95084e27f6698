//! SQL construction helpers.
//!
//! All statements are built at runtime because the tracked table set is
//! configuration. Identifiers are always quoted (column names containing
//! spaces are legal); row values are carried as a single `jsonb` parameter,
//! so the column-to-parameter encoding is simply the sorted column order of
//! the value map.

use serde_json::Value;
use tandem_engine::{RowValues, SyncError, TableRef};

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Schema-qualified, quoted table name.
pub fn table_ident(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

/// Escape a string literal for direct embedding in generated DDL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// The key columns of `values` as a jsonb object, for change-table lookups.
pub fn key_object(
    table: &TableRef,
    key_columns: &[String],
    values: &RowValues,
) -> Result<Value, SyncError> {
    let mut object = serde_json::Map::new();
    for column in key_columns {
        let value = values.get(column).ok_or_else(|| {
            SyncError::InvalidArgument(format!(
                "missing key column '{column}' for table '{table}'"
            ))
        })?;
        object.insert(column.clone(), value.clone());
    }
    Ok(Value::Object(object))
}

/// The full value map as one jsonb object.
pub fn values_object(values: &RowValues) -> Value {
    Value::Object(values.clone().into_iter().collect())
}

/// `t."k1" = r."k1" AND t."k2" = r."k2"`: join the target table to the
/// populated record on the key columns.
pub fn key_join(key_columns: &[String]) -> String {
    key_columns
        .iter()
        .map(|c| {
            let ident = quote_ident(c);
            format!("t.{ident} = r.{ident}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `"c1" = r."c1", "c2" = r."c2"`: assignments for every carried non-key
/// column. Falls back to self-assigning the keys when the item carries
/// nothing else, so the statement still reports whether the row matched.
pub fn set_list(key_columns: &[String], values: &RowValues) -> String {
    let assignments: Vec<String> = values
        .keys()
        .filter(|column| !key_columns.contains(column))
        .map(|column| {
            let ident = quote_ident(column);
            format!("{ident} = r.{ident}")
        })
        .collect();

    if assignments.is_empty() {
        key_columns
            .iter()
            .map(|column| {
                let ident = quote_ident(column);
                format!("{ident} = r.{ident}")
            })
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        assignments.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> RowValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn quotes_plain_identifiers() {
        assert_eq!(quote_ident("notes"), "\"notes\"");
    }

    #[test]
    fn quotes_identifiers_with_spaces_and_quotes() {
        assert_eq!(quote_ident("order line"), "\"order line\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn qualifies_table_names() {
        assert_eq!(table_ident(&TableRef::new("notes")), "\"notes\"");
        assert_eq!(
            table_ident(&TableRef::with_schema("app", "notes")),
            "\"app\".\"notes\""
        );
    }

    #[test]
    fn quotes_literals() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn key_object_extracts_key_columns() {
        let vals = values(&[("id", json!(1)), ("label", json!("x"))]);
        let key = key_object(&TableRef::new("notes"), &["id".to_string()], &vals).unwrap();
        assert_eq!(key, json!({"id": 1}));
    }

    #[test]
    fn key_object_rejects_missing_key() {
        let vals = values(&[("label", json!("x"))]);
        let err = key_object(&TableRef::new("notes"), &["id".to_string()], &vals).unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
    }

    #[test]
    fn key_join_covers_composite_keys() {
        let join = key_join(&["a".to_string(), "b c".to_string()]);
        assert_eq!(join, "t.\"a\" = r.\"a\" AND t.\"b c\" = r.\"b c\"");
    }

    #[test]
    fn set_list_skips_key_columns() {
        let vals = values(&[("id", json!(1)), ("label", json!("x")), ("body", json!(null))]);
        let set = set_list(&["id".to_string()], &vals);
        // Sorted column order; explicit nulls are assigned like any value.
        assert_eq!(set, "\"body\" = r.\"body\", \"label\" = r.\"label\"");
    }

    #[test]
    fn set_list_falls_back_to_keys_for_key_only_items() {
        let vals = values(&[("id", json!(1))]);
        assert_eq!(set_list(&["id".to_string()], &vals), "\"id\" = r.\"id\"");
    }
}
