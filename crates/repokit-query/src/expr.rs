//! Predicate expression trees.
//!
//! Predicates are composed once as data and evaluated where the rows live:
//! the in-memory store walks the tree ([`crate::eval`]), the Postgres store
//! renders it to SQL ([`crate::sql`]).

use repokit_core::{AppError, AppResult};
use repokit_entity::{EntitySchema, Value};

use crate::path::{resolve_field_path, resolve_relation_path};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    /// SQL spelling.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// A boolean predicate over one entity row.
///
/// Paths are dotted member paths relative to the entity the expression is
/// evaluated against; inside [`Expr::Any`] they are relative to the
/// collection element.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Always true or always false.
    Const(bool),
    /// Compare a field with a constant. Null on either side never matches.
    Compare {
        /// Field path.
        path: String,
        /// Operator.
        op: CompareOp,
        /// Constant operand.
        value: Value,
    },
    /// Case-insensitive substring test. With `stringify` the field is
    /// rendered as text first.
    Contains {
        /// Field path.
        path: String,
        /// Lowercase needle.
        needle: String,
        /// Render non-text fields as text.
        stringify: bool,
    },
    /// Field is null (or a reference on the way is missing).
    IsNull(String),
    /// Field is not null.
    NotNull(String),
    /// Field equals one of the values.
    In {
        /// Field path.
        path: String,
        /// Candidate values.
        values: Vec<Value>,
    },
    /// All sub-predicates hold. Empty is true.
    And(Vec<Expr>),
    /// Any sub-predicate holds. Empty is false.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Some element of a to-many relation satisfies `predicate`.
    Any {
        /// Relation path: references, then one collection.
        relation: String,
        /// Predicate over the element type.
        predicate: Box<Expr>,
    },
}

impl Expr {
    /// The always-true predicate.
    pub fn always() -> Self {
        Self::Const(true)
    }

    /// The always-false predicate.
    pub fn never() -> Self {
        Self::Const(false)
    }

    /// Conjunction of two predicates, flattening nested conjunctions.
    pub fn and(self, other: Expr) -> Self {
        Self::all([self, other])
    }

    /// Disjunction of two predicates, flattening nested disjunctions.
    pub fn or(self, other: Expr) -> Self {
        Self::any_of([self, other])
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            Self::Const(value) => Self::Const(!value),
            other => Self::Not(Box::new(other)),
        }
    }

    /// Conjunction of many predicates.
    pub fn all(items: impl IntoIterator<Item = Expr>) -> Self {
        let mut parts = Vec::new();
        for item in items {
            match item {
                Self::Const(true) => {}
                Self::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        if parts.contains(&Self::Const(false)) {
            return Self::Const(false);
        }
        match parts.len() {
            0 => Self::Const(true),
            1 => parts.remove(0),
            _ => Self::And(parts),
        }
    }

    /// Disjunction of many predicates.
    pub fn any_of(items: impl IntoIterator<Item = Expr>) -> Self {
        let mut parts = Vec::new();
        for item in items {
            match item {
                Self::Const(false) => {}
                Self::Or(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        if parts.contains(&Self::Const(true)) {
            return Self::Const(true);
        }
        match parts.len() {
            0 => Self::Const(false),
            1 => parts.remove(0),
            _ => Self::Or(parts),
        }
    }

    /// Whether this is the always-true predicate.
    pub fn is_always(&self) -> bool {
        matches!(self, Self::Const(true))
    }

    /// Resolve member names against `schema`, canonicalising paths and
    /// coercing constants to the field kinds. Unknown members are
    /// argument errors.
    pub fn resolve(&self, schema: &EntitySchema) -> AppResult<Expr> {
        Ok(match self {
            Self::Const(value) => Self::Const(*value),
            Self::Compare { path, op, value } => {
                let field = resolve_field_path(schema, path)?;
                Self::Compare {
                    op: *op,
                    value: value.clone().coerce(field.field.kind)?,
                    path: field.canonical,
                }
            }
            Self::Contains {
                path,
                needle,
                stringify,
            } => {
                let field = resolve_field_path(schema, path)?;
                let textual = field.field.kind == repokit_entity::FieldKind::Text;
                if !textual && !stringify {
                    return Err(AppError::argument(format!(
                        "Property '{}' is not text; use a stringified contains",
                        field.canonical
                    )));
                }
                Self::Contains {
                    path: field.canonical,
                    needle: needle.to_lowercase(),
                    stringify: *stringify && !textual,
                }
            }
            Self::IsNull(path) => Self::IsNull(resolve_field_path(schema, path)?.canonical),
            Self::NotNull(path) => Self::NotNull(resolve_field_path(schema, path)?.canonical),
            Self::In { path, values } => {
                let field = resolve_field_path(schema, path)?;
                let values = values
                    .iter()
                    .map(|value| value.clone().coerce(field.field.kind))
                    .collect::<AppResult<Vec<_>>>()?;
                Self::In {
                    path: field.canonical,
                    values,
                }
            }
            Self::And(items) => Self::And(
                items
                    .iter()
                    .map(|item| item.resolve(schema))
                    .collect::<AppResult<_>>()?,
            ),
            Self::Or(items) => Self::Or(
                items
                    .iter()
                    .map(|item| item.resolve(schema))
                    .collect::<AppResult<_>>()?,
            ),
            Self::Not(inner) => Self::Not(Box::new(inner.resolve(schema)?)),
            Self::Any {
                relation,
                predicate,
            } => {
                let path = resolve_relation_path(schema, relation, false)?;
                let target = path.target().ok_or_else(|| {
                    AppError::argument(format!("Invalid relation path '{relation}'"))
                })?;
                Self::Any {
                    predicate: Box::new(predicate.resolve(&target)?),
                    relation: path.canonical,
                }
            }
        })
    }
}

/// Start a predicate on the member at `path`.
pub fn col(path: impl Into<String>) -> Column {
    Column { path: path.into() }
}

/// A member path awaiting an operator. Created by [`col`].
#[derive(Debug, Clone)]
pub struct Column {
    path: String,
}

impl Column {
    fn compare(self, op: CompareOp, value: impl Into<Value>) -> Expr {
        Expr::Compare {
            path: self.path,
            op,
            value: value.into(),
        }
    }

    /// `path = value`
    pub fn eq(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Eq, value)
    }

    /// `path <> value`
    pub fn ne(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Ne, value)
    }

    /// `path > value`
    pub fn gt(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Gt, value)
    }

    /// `path >= value`
    pub fn ge(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Ge, value)
    }

    /// `path < value`
    pub fn lt(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Lt, value)
    }

    /// `path <= value`
    pub fn le(self, value: impl Into<Value>) -> Expr {
        self.compare(CompareOp::Le, value)
    }

    /// Case-insensitive substring test on a text field.
    pub fn contains(self, needle: impl AsRef<str>) -> Expr {
        Expr::Contains {
            path: self.path,
            needle: needle.as_ref().to_lowercase(),
            stringify: false,
        }
    }

    /// Case-insensitive substring test on the text rendering of any field.
    pub fn text_contains(self, needle: impl AsRef<str>) -> Expr {
        Expr::Contains {
            path: self.path,
            needle: needle.as_ref().to_lowercase(),
            stringify: true,
        }
    }

    /// `path IS NULL`
    pub fn is_null(self) -> Expr {
        Expr::IsNull(self.path)
    }

    /// `path IS NOT NULL`
    pub fn not_null(self) -> Expr {
        Expr::NotNull(self.path)
    }

    /// `path IN (values)`
    pub fn is_in<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::In {
            path: self.path,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Some element of the collection at `path` satisfies `predicate`.
    pub fn any(self, predicate: Expr) -> Expr {
        Expr::Any {
            relation: self.path,
            predicate: Box::new(predicate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::fixtures::Product;
    use repokit_core::ErrorKind;
    use repokit_entity::Reflect;

    #[test]
    fn test_combinators_flatten() {
        let expr = col("a").eq(1).and(col("b").eq(2)).and(col("c").eq(3));
        assert!(matches!(&expr, Expr::And(parts) if parts.len() == 3));
        assert_eq!(Expr::all(Vec::<Expr>::new()), Expr::always());
        assert_eq!(Expr::any_of(Vec::<Expr>::new()), Expr::never());
        assert_eq!(Expr::all([Expr::never(), col("a").eq(1)]), Expr::never());
        assert_eq!(col("a").is_null().not().not(), col("a").is_null());
    }

    #[test]
    fn test_resolve_canonicalises_and_coerces() {
        let schema = Product::schema();
        let expr = col("Category.Name")
            .contains("Tools")
            .and(col("ID").eq("7"))
            .and(col("Tags").any(col("Label").eq("red")))
            .resolve(&schema)
            .unwrap();

        let Expr::And(parts) = expr else {
            panic!("expected conjunction");
        };
        assert_eq!(
            parts[0],
            Expr::Contains {
                path: "category.name".into(),
                needle: "tools".into(),
                stringify: false,
            }
        );
        assert_eq!(parts[1], col("id").eq(7i64));
        assert!(matches!(&parts[2], Expr::Any { relation, .. } if relation == "tags"));
    }

    #[test]
    fn test_resolve_rejects_unknown_members() {
        let schema = Product::schema();
        let err = col("Nme").eq("x").resolve(&schema).unwrap_err();
        assert!(err.is(ErrorKind::Argument));
        let err = col("price").contains("1").resolve(&schema).unwrap_err();
        assert!(err.is(ErrorKind::Argument));
        assert!(col("price").text_contains("1").resolve(&schema).is_ok());
    }
}
