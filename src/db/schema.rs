use std::collections::BTreeMap;
use tokio_postgres::Client;

use super::query::TableMap;

/// Tables of every user schema with their columns in ordinal order.
///
/// Tables outside `public` are reported as `schema.table`.
pub async fn get_table_columns(client: &Client) -> Result<TableMap, tokio_postgres::Error> {
    let rows = client
        .query(
            r#"
            SELECT
                c.table_schema as schema,
                c.table_name as table_name,
                c.column_name as column_name
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema
                AND t.table_name = c.table_name
            WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
              AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY c.table_schema, c.table_name, c.ordinal_position
            "#,
            &[],
        )
        .await?;

    let entries = rows.iter().map(|row| {
        let schema: String = row.get("schema");
        let table: String = row.get("table_name");
        let column: String = row.get("column_name");
        (qualified_name(&schema, &table), column)
    });

    Ok(group_columns(entries))
}

fn qualified_name(schema: &str, table: &str) -> String {
    if schema == "public" {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

fn group_columns(entries: impl IntoIterator<Item = (String, String)>) -> TableMap {
    let mut tables: TableMap = BTreeMap::new();
    for (table, column) in entries {
        tables.entry(table).or_default().push(column);
    }
    tables
}

/// Merge per-engine table maps into one view. Columns of a table present
/// in several engines are unioned, keeping first-seen order.
pub fn merge_table_maps<'a>(maps: impl IntoIterator<Item = &'a TableMap>) -> TableMap {
    let mut merged: TableMap = BTreeMap::new();
    for map in maps {
        for (table, columns) in map {
            let entry = merged.entry(table.clone()).or_default();
            for column in columns {
                if !entry.contains(column) {
                    entry.push(column.clone());
                }
            }
        }
    }
    merged
}
