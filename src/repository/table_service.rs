use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &["lease_contracts", "payments", "rent_changes"];

/// Upper bound for a single page; `list_all_rows` walks pages of this size.
pub const PAGE_SIZE: i64 = 1000;

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let mut query = build_select_query(table, filters, limit, offset, order_by, ascending)?;
    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

/// Reads every matching row, page by page.
pub async fn list_all_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let mut collected = Vec::new();
    let mut offset = 0;
    loop {
        let page = list_rows(pool, table, filters, PAGE_SIZE, offset, order_by, ascending).await?;
        let fetched = page.len() as i64;
        collected.extend(page);
        if fetched < PAGE_SIZE {
            return Ok(collected);
        }
        offset += fetched;
    }
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Inserts all rows in one statement. Rows rejected by a unique constraint
/// are skipped; only the rows actually written are returned.
pub async fn create_rows(
    pool: &sqlx::PgPool,
    table: &str,
    rows: &[Map<String, Value>],
) -> Result<Vec<Value>, AppError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let mut query = build_bulk_insert_query(table, rows)?;
    let inserted = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(inserted))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let keys = sorted_keys(payload.keys())?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        id_name,
        FilterOperator::Eq,
        infer_scalar_filter(id_name, &Value::String(row_id.to_string())),
    );
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

pub(crate) fn build_select_query(
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<QueryBuilder<'static, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "id"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, PAGE_SIZE))
        .push(" OFFSET ")
        .push_bind(offset.max(0));
    Ok(query)
}

// jsonb_populate_recordset lets PostgreSQL resolve column types (uuid, date,
// numeric) from the table definition.
fn build_bulk_insert_query(
    table: &str,
    rows: &[Map<String, Value>],
) -> Result<QueryBuilder<'static, Postgres>, AppError> {
    let table_name = validate_table(table)?;
    let keys = sorted_keys(rows.iter().flat_map(Map::keys))?;
    if keys.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} records."
        )));
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_recordset(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Array(
        rows.iter().cloned().map(Value::Object).collect(),
    ));
    query
        .push(") r ON CONFLICT DO NOTHING RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn sorted_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Result<Vec<String>, AppError> {
    let mut unique = Vec::<String>::new();
    for key in keys {
        let valid = validate_identifier(key)?;
        if !unique.iter().any(|existing| existing == valid) {
            unique.push(valid.to_string());
        }
    }
    unique.sort_unstable();
    Ok(unique)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    let well_formed = trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) && !trimmed.starts_with(|first: char| first.is_ascii_digit());
    if !well_formed {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gte,
    IsNull,
}

impl FilterOperator {
    fn sql(self) -> &'static str {
        match self {
            Self::Eq | Self::IsNull => " = ",
            Self::Gte => " >= ",
        }
    }
}

/// `column__gte` or `column__is_null`; a bare column means equality.
fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let (column, operator) = match filter_key.rsplit_once("__") {
        Some((column, "gte")) => (column, FilterOperator::Gte),
        Some((column, "is_null")) => (column, FilterOperator::IsNull),
        _ => (filter_key, FilterOperator::Eq),
    };
    Ok((validate_identifier(column)?, operator))
}

fn parse_bool_filter_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|parsed| parsed != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

fn push_filter_clause(
    query: &mut QueryBuilder<'static, Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        query.push(" AND t.").push(column);
        query.push(if parse_bool_filter_value(value) {
            " IS NULL"
        } else {
            " IS NOT NULL"
        });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(_) | Value::Object(_) => Err(AppError::BadRequest(format!(
            "Filter '{filter_key}' only supports scalar values."
        ))),
        _ => {
            query.push(" AND ");
            push_scalar_filter(query, column, operator, infer_scalar_filter(column, value));
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<'static, Postgres>,
    column: &str,
    operator: FilterOperator,
    value: ScalarFilter,
) {
    query.push("t.").push(column);
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(operator.sql()).push_bind(text);
        }
        ScalarFilter::Uuid(id) => {
            query.push(operator.sql()).push_bind(id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(operator.sql()).push_bind(flag);
        }
        ScalarFilter::Date(date) => {
            query.push(operator.sql()).push_bind(date);
        }
    }
}

fn infer_scalar_filter(filter_key: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(filter_key) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_date_identifier(filter_key) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        other => ScalarFilter::Text(other.to_string()),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_date")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{
        build_bulk_insert_query, build_select_query, parse_filter_key, validate_table,
        FilterOperator,
    };
    use crate::error::AppError;

    fn filters(entries: Value) -> Map<String, Value> {
        entries.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn rejects_tables_outside_allow_list() {
        assert!(validate_table("payments").is_ok());
        assert!(matches!(
            validate_table("app_users"),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            validate_table("payments; drop table x"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn parses_filter_suffixes() {
        assert_eq!(
            parse_filter_key("end_date__gte").expect("valid"),
            ("end_date", FilterOperator::Gte)
        );
        assert_eq!(
            parse_filter_key("end_date__is_null").expect("valid"),
            ("end_date", FilterOperator::IsNull)
        );
        assert_eq!(
            parse_filter_key("contract_id").expect("valid"),
            ("contract_id", FilterOperator::Eq)
        );
    }

    #[test]
    fn numeric_filters_compare_as_text() {
        let filter_map = filters(json!({ "rent_due_day": 5 }));
        let query = build_select_query("lease_contracts", Some(&filter_map), 10, 0, "id", true)
            .expect("valid query");
        assert!(query.sql().contains("AND t.rent_due_day::text = $1"), "got: {}", query.sql());
    }

    #[test]
    fn select_sql_binds_typed_filters() {
        let filter_map = filters(json!({
            "contract_id": "550e8400-e29b-41d4-a716-446655440000",
            "end_date__gte": "2026-01-01",
            "status": "pending"
        }));
        let query = build_select_query("payments", Some(&filter_map), 5000, -3, "payment_month", true)
            .expect("valid query");
        let sql = query.sql();
        assert!(sql.starts_with("SELECT row_to_json(t) AS row FROM payments t WHERE 1=1"));
        assert!(sql.contains("AND t.contract_id = $1"), "got: {sql}");
        assert!(sql.contains("AND t.end_date >= $2"), "got: {sql}");
        assert!(sql.contains("AND t.status::text = $3"), "got: {sql}");
        assert!(sql.contains("ORDER BY t.payment_month ASC"), "got: {sql}");
    }

    #[test]
    fn is_null_filter_renders_without_binding() {
        let filter_map = filters(json!({ "end_date__is_null": true }));
        let query = build_select_query("lease_contracts", Some(&filter_map), 10, 0, "", false)
            .expect("valid query");
        let sql = query.sql();
        assert!(sql.contains("AND t.end_date IS NULL"), "got: {sql}");
        assert!(sql.contains("ORDER BY t.id DESC"), "got: {sql}");
    }

    #[test]
    fn bulk_insert_uses_recordset_and_skips_conflicts() {
        let rows = vec![
            filters(json!({ "contract_id": "c-1", "payment_month": "2024-01", "amount": 0 })),
            filters(json!({ "contract_id": "c-1", "payment_month": "2024-02", "tenant_id": "t-1" })),
        ];
        let query = build_bulk_insert_query("payments", &rows).expect("valid query");
        let sql = query.sql();
        assert!(
            sql.starts_with("INSERT INTO payments (amount, contract_id, payment_month, tenant_id)"),
            "got: {sql}"
        );
        assert!(
            sql.contains("SELECT r.amount, r.contract_id, r.payment_month, r.tenant_id"),
            "got: {sql}"
        );
        assert!(sql.contains("jsonb_populate_recordset(NULL::payments, $1)"), "got: {sql}");
        assert!(sql.contains("ON CONFLICT DO NOTHING"), "got: {sql}");
    }

    #[test]
    fn bulk_insert_rejects_bad_column_names() {
        let rows = vec![filters(json!({ "Contract-Id": "c-1" }))];
        assert!(matches!(
            build_bulk_insert_query("payments", &rows),
            Err(AppError::BadRequest(_))
        ));
    }
}
