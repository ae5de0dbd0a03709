//! Postgres rendering of resolved plans.
//!
//! Identifiers are double-quoted, values travel as `$n` parameters and the
//! root table is aliased `t0`. Reference paths render as correlated scalar
//! sub-selects, `Any` as `EXISTS`. Null handling follows the in-memory
//! evaluator: a negated predicate that evaluates to NULL counts as false
//! before negation, and ordering puts nulls first ascending.

use repokit_core::types::SortDirection;
use repokit_core::{AppError, AppResult};
use repokit_entity::{EntityKey, EntitySchema, FieldKind, Record, RelationDescriptor, Value};

use crate::expr::Expr;
use crate::plan::{Aggregate, Assignment, QueryPlan};

/// One bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParam {
    /// The value to bind.
    pub value: Value,
    /// Column kind the value binds as; `None` binds by value type.
    pub kind: Option<FieldKind>,
}

/// SQL text with its parameters in placeholder order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlStatement {
    /// SQL text.
    pub sql: String,
    /// Parameters for `$1..$n`.
    pub params: Vec<SqlParam>,
}

/// Quote an identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escape `%`, `_` and `\` and wrap the needle for a containment `LIKE`.
pub fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[derive(Default)]
struct Builder {
    params: Vec<SqlParam>,
    aliases: usize,
}

impl Builder {
    fn bind(&mut self, value: Value, kind: Option<FieldKind>) -> String {
        self.params.push(SqlParam { value, kind });
        format!("${}", self.params.len())
    }

    fn alias(&mut self) -> String {
        self.aliases += 1;
        format!("t{}", self.aliases)
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }

    /// SQL for the value at a canonical field path, plus the leaf kind.
    fn column(&mut self, schema: &EntitySchema, alias: &str, path: &str) -> AppResult<(String, FieldKind)> {
        match path.split_once('.') {
            None => {
                let field = schema.field(path).ok_or_else(|| unknown(schema, path))?;
                Ok((format!("{alias}.{}", quote(&field.name)), field.kind))
            }
            Some((head, rest)) => {
                let relation = schema.relation(head).ok_or_else(|| unknown(schema, head))?;
                let target = relation.target();
                let inner_alias = self.alias();
                let (inner, kind) = self.column(&target, &inner_alias, rest)?;
                let join = reference_join(schema, relation, &target, alias, &inner_alias)?;
                Ok((
                    format!("(SELECT {inner} FROM {} {inner_alias} WHERE {join})", quote(target.table())),
                    kind,
                ))
            }
        }
    }

    fn predicate(&mut self, expr: &Expr, schema: &EntitySchema, alias: &str) -> AppResult<String> {
        Ok(match expr {
            Expr::Const(true) => "TRUE".to_string(),
            Expr::Const(false) => "FALSE".to_string(),
            Expr::Compare { path, op, value } => {
                if value.is_null() {
                    return Ok("FALSE".to_string());
                }
                let (column, kind) = self.column(schema, alias, path)?;
                let param = self.bind(value.clone(), Some(kind));
                format!("{column} {} {param}", op.as_sql())
            }
            Expr::Contains {
                path,
                needle,
                stringify,
            } => {
                let (column, _) = self.column(schema, alias, path)?;
                let operand = if *stringify {
                    format!("CAST({column} AS TEXT)")
                } else {
                    column
                };
                let param = self.bind(Value::Text(like_pattern(needle)), Some(FieldKind::Text));
                format!("LOWER({operand}) LIKE {param} ESCAPE '\\'")
            }
            Expr::IsNull(path) => format!("{} IS NULL", self.column(schema, alias, path)?.0),
            Expr::NotNull(path) => format!("{} IS NOT NULL", self.column(schema, alias, path)?.0),
            Expr::In { path, values } => {
                let candidates: Vec<&Value> = values.iter().filter(|value| !value.is_null()).collect();
                if candidates.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let (column, kind) = self.column(schema, alias, path)?;
                let params: Vec<String> = candidates
                    .into_iter()
                    .map(|value| self.bind(value.clone(), Some(kind)))
                    .collect();
                format!("{column} IN ({})", params.join(", "))
            }
            Expr::And(items) => self.junction(items, "AND", "TRUE", schema, alias)?,
            Expr::Or(items) => self.junction(items, "OR", "FALSE", schema, alias)?,
            Expr::Not(inner) => format!("NOT COALESCE(({}), FALSE)", self.predicate(inner, schema, alias)?),
            Expr::Any {
                relation,
                predicate,
            } => self.any(schema, alias, relation, predicate)?,
        })
    }

    fn junction(
        &mut self,
        items: &[Expr],
        keyword: &str,
        empty: &str,
        schema: &EntitySchema,
        alias: &str,
    ) -> AppResult<String> {
        if items.is_empty() {
            return Ok(empty.to_string());
        }
        let parts = items
            .iter()
            .map(|item| Ok(format!("({})", self.predicate(item, schema, alias)?)))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(parts.join(&format!(" {keyword} ")))
    }

    fn any(&mut self, schema: &EntitySchema, alias: &str, path: &str, predicate: &Expr) -> AppResult<String> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let relation = schema.relation(head).ok_or_else(|| unknown(schema, head))?;
        let target = relation.target();
        let inner_alias = self.alias();
        match rest {
            Some(rest) => {
                let join = reference_join(schema, relation, &target, alias, &inner_alias)?;
                let inner = self.any(&target, &inner_alias, rest, predicate)?;
                Ok(format!(
                    "COALESCE((SELECT {inner} FROM {} {inner_alias} WHERE {join}), FALSE)",
                    quote(target.table())
                ))
            }
            None => {
                let parent_key = schema.single_key()?;
                let condition = self.predicate(predicate, &target, &inner_alias)?;
                Ok(format!(
                    "EXISTS (SELECT 1 FROM {} {inner_alias} WHERE {inner_alias}.{} = {alias}.{} AND ({condition}))",
                    quote(target.table()),
                    quote(&relation.foreign_key),
                    quote(&parent_key.name),
                ))
            }
        }
    }

    fn where_clause(&mut self, plan: &QueryPlan) -> AppResult<String> {
        let predicate = plan.predicate();
        if predicate.is_always() {
            return Ok(String::new());
        }
        Ok(format!(" WHERE {}", self.predicate(&predicate, plan.schema(), "t0")?))
    }

    fn order_clause(&mut self, plan: &QueryPlan) -> AppResult<String> {
        if plan.order.is_empty() {
            return Ok(String::new());
        }
        let keys = plan
            .order
            .iter()
            .map(|sort| {
                let (column, _) = self.column(plan.schema(), "t0", &sort.field)?;
                Ok(match sort.direction {
                    SortDirection::Asc => format!("{column} ASC NULLS FIRST"),
                    SortDirection::Desc => format!("{column} DESC NULLS LAST"),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(format!(" ORDER BY {}", keys.join(", ")))
    }

    fn window_clause(&mut self, plan: &QueryPlan) -> String {
        let mut clause = String::new();
        if let Some(take) = plan.take {
            let param = self.bind(window_value(take), Some(FieldKind::BigInt));
            clause.push_str(&format!(" LIMIT {param}"));
        }
        if let Some(skip) = plan.skip {
            let param = self.bind(window_value(skip), Some(FieldKind::BigInt));
            clause.push_str(&format!(" OFFSET {param}"));
        }
        clause
    }

    fn key_condition(&mut self, schema: &EntitySchema, key: &EntityKey) -> AppResult<String> {
        let key = key.clone().coerce(schema)?;
        let parts: Vec<String> = schema
            .key_fields()
            .into_iter()
            .zip(key.values())
            .map(|(field, value)| {
                let param = self.bind(value.clone(), Some(field.kind));
                format!("{} = {param}", quote(&field.name))
            })
            .collect();
        Ok(parts.join(" AND "))
    }
}

fn window_value(count: u64) -> Value {
    Value::Int(i64::try_from(count).unwrap_or(i64::MAX))
}

fn unknown(schema: &EntitySchema, member: &str) -> AppError {
    AppError::argument(format!(
        "Property '{member}' does not exist on type {}",
        schema.name()
    ))
}

/// Join condition of a to-one hop from `alias` (owner) to `inner` (target).
fn reference_join(
    schema: &EntitySchema,
    relation: &RelationDescriptor,
    target: &EntitySchema,
    alias: &str,
    inner: &str,
) -> AppResult<String> {
    if relation.is_collection() {
        return Err(AppError::argument(format!(
            "Property '{}' on type {} is a collection",
            relation.name,
            schema.name()
        )));
    }
    let target_key = target.single_key()?;
    Ok(format!(
        "{inner}.{} = {alias}.{}",
        quote(&target_key.name),
        quote(&relation.foreign_key)
    ))
}

fn select_list(plan: &QueryPlan, builder: &mut Builder) -> AppResult<String> {
    match &plan.projection {
        Some(projection) => {
            let columns = projection
                .columns()
                .iter()
                .map(|column| {
                    let (sql, _) = builder.column(plan.schema(), "t0", &column.source)?;
                    Ok(format!("{sql} AS {}", quote(&column.output)))
                })
                .collect::<AppResult<Vec<_>>>()?;
            Ok(columns.join(", "))
        }
        None => Ok(plan
            .schema()
            .fields()
            .iter()
            .map(|field| format!("t0.{}", quote(&field.name)))
            .collect::<Vec<_>>()
            .join(", ")),
    }
}

/// `SELECT` of the plan's rows: scalar columns or the projection, then
/// filter, order and window.
pub fn select(plan: &QueryPlan) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let columns = select_list(plan, &mut builder)?;
    let filter = builder.where_clause(plan)?;
    let order = builder.order_clause(plan)?;
    let window = builder.window_clause(plan);
    let sql = format!(
        "SELECT {columns} FROM {} t0{filter}{order}{window}",
        quote(plan.schema().table())
    );
    Ok(builder.finish(sql))
}

/// `SELECT COUNT(*)` over the plan's filter.
pub fn count(plan: &QueryPlan) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let filter = builder.where_clause(plan)?;
    let sql = format!("SELECT COUNT(*) FROM {} t0{filter}", quote(plan.schema().table()));
    Ok(builder.finish(sql))
}

/// An aggregate over one field of the filtered rows. Sum and average are
/// computed as `NUMERIC` and are zero over no rows.
pub fn aggregate(plan: &QueryPlan, function: Aggregate, field: &str) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let (column, _) = builder.column(plan.schema(), "t0", field)?;
    let expression = match function {
        Aggregate::Max | Aggregate::Min => format!("{}({column})", function.as_sql()),
        Aggregate::Sum | Aggregate::Average => {
            format!("COALESCE({}(CAST({column} AS NUMERIC)), 0)", function.as_sql())
        }
    };
    let filter = builder.where_clause(plan)?;
    let sql = format!(
        "SELECT {expression} FROM {} t0{filter}",
        quote(plan.schema().table())
    );
    Ok(builder.finish(sql))
}

/// `INSERT` of the scalar members of `record`.
pub fn insert(schema: &EntitySchema, record: &Record) -> SqlStatement {
    let mut builder = Builder::default();
    let values = schema.scalar_values(record);
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for field in schema.fields() {
        let value = values.get(&field.name).cloned().unwrap_or_default();
        columns.push(quote(&field.name));
        params.push(builder.bind(value, Some(field.kind)));
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote(schema.table()),
        columns.join(", "),
        params.join(", ")
    );
    builder.finish(sql)
}

/// `UPDATE` of the given non-key members of the row with `key`.
pub fn update(schema: &EntitySchema, key: &EntityKey, values: &Record) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let assignments: Vec<String> = schema
        .fields()
        .iter()
        .filter(|field| !field.is_key)
        .filter_map(|field| values.get(&field.name).map(|value| (field, value)))
        .map(|(field, value)| {
            let param = builder.bind(value.clone(), Some(field.kind));
            format!("{} = {param}", quote(&field.name))
        })
        .collect();
    if assignments.is_empty() {
        return Err(AppError::argument(format!(
            "Nothing to update on {} {key}",
            schema.name()
        )));
    }
    let condition = builder.key_condition(schema, key)?;
    let sql = format!(
        "UPDATE {} SET {} WHERE {condition}",
        quote(schema.table()),
        assignments.join(", ")
    );
    Ok(builder.finish(sql))
}

/// `DELETE` of the row with `key`.
pub fn delete(schema: &EntitySchema, key: &EntityKey) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let condition = builder.key_condition(schema, key)?;
    let sql = format!("DELETE FROM {} WHERE {condition}", quote(schema.table()));
    Ok(builder.finish(sql))
}

/// Set-based `DELETE` of the plan's rows.
pub fn delete_where(plan: &QueryPlan) -> AppResult<SqlStatement> {
    let mut builder = Builder::default();
    let filter = builder.where_clause(plan)?;
    let sql = format!("DELETE FROM {} AS t0{filter}", quote(plan.schema().table()));
    Ok(builder.finish(sql))
}

/// Set-based `UPDATE` of the plan's rows. Assignments must be resolved.
pub fn update_where(plan: &QueryPlan, assignments: &[Assignment]) -> AppResult<SqlStatement> {
    if assignments.is_empty() {
        return Err(AppError::argument("A set-based update needs at least one assignment"));
    }
    let mut builder = Builder::default();
    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let assignment = assignment.resolve(plan.schema())?;
        let kind = plan.schema().field(&assignment.field).map(|field| field.kind);
        let param = builder.bind(assignment.value, kind);
        sets.push(format!("{} = {param}", quote(&assignment.field)));
    }
    let filter = builder.where_clause(plan)?;
    let sql = format!(
        "UPDATE {} AS t0 SET {}{filter}",
        quote(plan.schema().table()),
        sets.join(", ")
    );
    Ok(builder.finish(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::path::fixtures::Product;
    use crate::plan::Query;
    use crate::projection::Projection;
    use repokit_entity::Reflect;

    fn plan(query: Query<Product>) -> QueryPlan {
        query.into_plan().unwrap()
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_select_with_filter_order_and_window() {
        let statement = select(&plan(
            Query::new()
                .filter(col("name").contains("Rake"))
                .order_by_descending("price")
                .skip(20)
                .take(10),
        ))
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT t0.\"id\", t0.\"name\", t0.\"code\", t0.\"price\", t0.\"released\", \
             t0.\"category_id\", t0.\"is_deleted\" FROM \"products\" t0 \
             WHERE (t0.\"is_deleted\" = $1) AND (LOWER(t0.\"name\") LIKE $2 ESCAPE '\\') \
             ORDER BY t0.\"price\" DESC NULLS LAST, t0.\"id\" ASC NULLS FIRST LIMIT $3 OFFSET $4"
        );
        assert_eq!(statement.params.len(), 4);
        assert_eq!(statement.params[0].value, Value::Bool(false));
        assert_eq!(statement.params[1].value, Value::from("%rake%"));
        assert_eq!(statement.params[2].value, Value::Int(10));
        assert_eq!(statement.params[3].value, Value::Int(20));
    }

    #[test]
    fn test_reference_and_collection_paths() {
        let statement = count(&plan(
            Query::new()
                .ignore_query_filters()
                .filter(col("category.name").eq("Garden"))
                .filter(col("tags").any(col("label").text_contains("red")).not()),
        ))
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT COUNT(*) FROM \"products\" t0 WHERE \
             ((SELECT t1.\"name\" FROM \"category\" t1 WHERE t1.\"id\" = t0.\"category_id\") = $1) AND \
             (NOT COALESCE((EXISTS (SELECT 1 FROM \"tag\" t2 WHERE t2.\"product_id\" = t0.\"id\" AND \
             (LOWER(t2.\"label\") LIKE $2 ESCAPE '\\'))), FALSE))"
        );
        assert_eq!(statement.params[0].kind, Some(FieldKind::Text));
    }

    #[test]
    fn test_projection_and_empty_in() {
        let statement = select(&plan(
            Query::new()
                .ignore_query_filters()
                .filter(col("id").is_in(Vec::<i32>::new()))
                .select(Projection::new().field("id").column("categoryName", "category.name")),
        ))
        .unwrap();
        assert_eq!(
            statement.sql,
            "SELECT t0.\"id\" AS \"id\", (SELECT t1.\"name\" FROM \"category\" t1 WHERE t1.\"id\" = t0.\"category_id\") \
             AS \"categoryName\" FROM \"products\" t0 WHERE FALSE"
        );
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_aggregates() {
        let statement = aggregate(&plan(Query::new()), Aggregate::Sum, "price").unwrap();
        assert_eq!(
            statement.sql,
            "SELECT COALESCE(SUM(CAST(t0.\"price\" AS NUMERIC)), 0) FROM \"products\" t0 WHERE t0.\"is_deleted\" = $1"
        );
        let statement = aggregate(&plan(Query::new()), Aggregate::Max, "released").unwrap();
        assert!(statement.sql.starts_with("SELECT MAX(t0.\"released\")"));
    }

    #[test]
    fn test_row_statements() {
        let schema = Product::schema();
        let key = EntityKey::single(7);

        let mut values = Record::new();
        values.insert("name".into(), Value::from("Hoe"));
        let statement = update(&schema, &key, &values).unwrap();
        assert_eq!(statement.sql, "UPDATE \"products\" SET \"name\" = $1 WHERE \"id\" = $2");
        assert_eq!(statement.params[1].value, Value::Int(7));

        let statement = delete(&schema, &key).unwrap();
        assert_eq!(statement.sql, "DELETE FROM \"products\" WHERE \"id\" = $1");

        let mut record = Record::new();
        record.insert("id".into(), Value::Int(7));
        record.insert("name".into(), Value::from("Hoe"));
        let statement = insert(&schema, &record);
        assert!(statement.sql.starts_with("INSERT INTO \"products\" (\"id\", \"name\", \"code\""));
        assert_eq!(statement.params.len(), schema.fields().len());
        assert_eq!(statement.params[2].value, Value::Null);
    }

    #[test]
    fn test_set_based_statements() {
        let filtered = plan(Query::new().filter(col("price").lt(5)));
        let statement = delete_where(&filtered).unwrap();
        assert_eq!(
            statement.sql,
            "DELETE FROM \"products\" AS t0 WHERE (t0.\"is_deleted\" = $1) AND (t0.\"price\" < $2)"
        );

        let assignment = Assignment::set("name", "Cheap").resolve(&Product::schema()).unwrap();
        let statement = update_where(&filtered, &[assignment]).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"products\" AS t0 SET \"name\" = $1 WHERE (t0.\"is_deleted\" = $2) AND (t0.\"price\" < $3)"
        );
        assert!(update_where(&filtered, &[]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_like_pattern_unescapes_to_needle(needle in "\\PC{0,24}") {
            let pattern = like_pattern(&needle);
            let inner = &pattern[1..pattern.len() - 1];
            let mut unescaped = String::new();
            let mut chars = inner.chars();
            while let Some(ch) = chars.next() {
                if ch == '\\' {
                    unescaped.extend(chars.next());
                } else {
                    proptest::prop_assert!(ch != '%' && ch != '_');
                    unescaped.push(ch);
                }
            }
            proptest::prop_assert_eq!(unescaped, needle);
        }
    }
}
