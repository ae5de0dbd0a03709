//! Entity schemas.
//!
//! An [`EntitySchema`] is the typed-property-descriptor table of one
//! entity type: its scalar fields, its relations, its key and its
//! optional capabilities. Schemas are built once per type through
//! [`EntitySchemaBuilder`] and cached by [`crate::registry`].

use std::fmt;
use std::sync::Arc;

use repokit_core::{AppError, AppResult};

use crate::entity::{EntityKey, Reflect};
use crate::registry::schema_of;
use crate::value::{Record, Value};

/// Scalar member kinds. Every kind is searchable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// UTF-8 text.
    Text,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// Double precision float.
    Float,
    /// Exact decimal.
    Decimal,
    /// Boolean.
    Bool,
    /// Unique identifier.
    Uuid,
    /// Date without a time component.
    Date,
    /// UTC timestamp.
    DateTime,
}

impl FieldKind {
    /// The PostgreSQL column type for this kind.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Int => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
            Self::Decimal => "NUMERIC",
            Self::Bool => "BOOLEAN",
            Self::Uuid => "UUID",
            Self::Date => "DATE",
            Self::DateTime => "TIMESTAMPTZ",
        }
    }

    /// Whether values of this kind are summed and averaged.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int | Self::BigInt | Self::Float | Self::Decimal)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Bool => "bool",
            Self::Uuid => "uuid",
            Self::Date => "date",
            Self::DateTime => "datetime",
        };
        write!(f, "{name}")
    }
}

/// A scalar member of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Member name, identical to the serialized field name and the column name.
    pub name: String,
    /// Value kind.
    pub kind: FieldKind,
    /// Whether the member may hold null.
    pub nullable: bool,
    /// Whether the member is part of the key.
    pub is_key: bool,
}

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// To-one. The foreign key is a field of the declaring entity.
    Reference,
    /// To-many. The foreign key is a field of the related entity.
    Collection,
}

/// A navigation member of an entity.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    /// Member name.
    pub name: String,
    /// Cardinality.
    pub kind: RelationKind,
    /// Foreign-key field name (see [`RelationKind`] for which side owns it).
    pub foreign_key: String,
    target: fn() -> Arc<EntitySchema>,
}

impl RelationDescriptor {
    /// The related entity's schema, resolved on first use.
    pub fn target(&self) -> Arc<EntitySchema> {
        (self.target)()
    }

    /// Whether this is a to-many relation.
    pub fn is_collection(&self) -> bool {
        self.kind == RelationKind::Collection
    }
}

/// Member names of the audit capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFields {
    /// Actor that inserted the row.
    pub created_by: String,
    /// Insert timestamp.
    pub created_on: String,
    /// Actor of the last modification.
    pub modified_by: String,
    /// Timestamp of the last modification.
    pub modified_on: String,
}

impl Default for AuditFields {
    fn default() -> Self {
        Self {
            created_by: "created_by".to_string(),
            created_on: "created_on".to_string(),
            modified_by: "modified_by".to_string(),
            modified_on: "modified_on".to_string(),
        }
    }
}

/// A resolved member of an entity.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    /// Scalar field.
    Field(&'a FieldDescriptor),
    /// Navigation member.
    Relation(&'a RelationDescriptor),
}

impl Member<'_> {
    /// The canonical member name.
    pub fn name(&self) -> &str {
        match self {
            Self::Field(field) => &field.name,
            Self::Relation(relation) => &relation.name,
        }
    }
}

/// The property descriptor table of one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    table: String,
    fields: Vec<FieldDescriptor>,
    relations: Vec<RelationDescriptor>,
    key: Vec<String>,
    soft_delete: Option<String>,
    audit: Option<AuditFields>,
}

impl EntitySchema {
    /// Start describing an entity named `name`.
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        let name = name.into();
        EntitySchemaBuilder {
            schema: EntitySchema {
                table: to_snake_case(&name),
                name,
                fields: Vec::new(),
                relations: Vec::new(),
                key: Vec::new(),
                soft_delete: None,
                audit: None,
            },
        }
    }

    /// Entity type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scalar fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Relations in declaration order.
    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    /// Key field names in key order.
    pub fn key_names(&self) -> &[String] {
        &self.key
    }

    /// Key fields in key order.
    pub fn key_fields(&self) -> Vec<&FieldDescriptor> {
        self.key
            .iter()
            .filter_map(|name| self.fields.iter().find(|f| &f.name == name))
            .collect()
    }

    /// The single key field, or an argument error for composite keys.
    pub fn single_key(&self) -> AppResult<&FieldDescriptor> {
        match self.key_fields().as_slice() {
            [field] => Ok(*field),
            _ => Err(AppError::argument(format!(
                "Entity {} does not have a single-column key",
                self.name
            ))),
        }
    }

    /// Soft-delete flag field, if the capability is declared.
    pub fn soft_delete_field(&self) -> Option<&str> {
        self.soft_delete.as_deref()
    }

    /// Audit member names, if the capability is declared.
    pub fn audit_fields(&self) -> Option<&AuditFields> {
        self.audit.as_ref()
    }

    /// Fields eligible for global search.
    pub fn searchable_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    /// Look up a scalar field. Matching ignores ASCII case and, failing
    /// that, underscores (`CreatedOn` finds `created_on`).
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        find_by_name(&self.fields, name, |f| f.name.as_str())
    }

    /// Look up a relation using the same matching rules as [`Self::field`].
    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        find_by_name(&self.relations, name, |r| r.name.as_str())
    }

    /// Look up any member.
    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        self.field(name)
            .map(Member::Field)
            .or_else(|| self.relation(name).map(Member::Relation))
    }

    /// Look up a member or fail with an argument error.
    pub fn require_member(&self, name: &str) -> AppResult<Member<'_>> {
        self.member(name).ok_or_else(|| {
            AppError::argument(format!(
                "Property '{name}' does not exist on type {}",
                self.name
            ))
        })
    }

    /// Convert the serde form of an entity into a record, coercing
    /// scalars by kind and nested relations by their target schemas.
    pub fn record_from_json(&self, json: serde_json::Value) -> AppResult<Record> {
        let serde_json::Value::Object(map) = json else {
            return Err(AppError::serialization(format!(
                "Entity {} did not serialize to an object",
                self.name
            )));
        };

        let mut record = Record::new();
        for (key, value) in map {
            let converted = if let Some(field) = self.fields.iter().find(|f| f.name == key) {
                Value::from_json(&value, Some(field.kind))?
            } else if let Some(relation) = self.relations.iter().find(|r| r.name == key) {
                self.relation_from_json(relation, value)?
            } else {
                Value::from_json(&value, None)?
            };
            record.insert(key, converted);
        }
        Ok(record)
    }

    fn relation_from_json(
        &self,
        relation: &RelationDescriptor,
        json: serde_json::Value,
    ) -> AppResult<Value> {
        let target = relation.target();
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| target.record_from_json(item).map(Value::Record))
                .collect::<AppResult<Vec<_>>>()
                .map(Value::List),
            object => target.record_from_json(object).map(Value::Record),
        }
    }

    /// Project a record onto the scalar fields, filling absent members with null.
    pub fn scalar_values(&self, record: &Record) -> Record {
        self.fields
            .iter()
            .map(|field| {
                let value = record.get(&field.name).cloned().unwrap_or_default();
                (field.name.clone(), value)
            })
            .collect()
    }

    /// Extract the key of a record.
    pub fn key_of(&self, record: &Record) -> AppResult<EntityKey> {
        if self.key.is_empty() {
            return Err(AppError::argument(format!(
                "Entity {} does not declare a key",
                self.name
            )));
        }
        let values = self
            .key
            .iter()
            .map(|name| match record.get(name) {
                Some(value) if !value.is_null() => Ok(value.clone()),
                _ => Err(AppError::argument(format!(
                    "Key member '{name}' of {} is missing",
                    self.name
                ))),
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(EntityKey::composite(values))
    }
}

/// Builder for [`EntitySchema`].
#[derive(Debug)]
pub struct EntitySchemaBuilder {
    schema: EntitySchema,
}

impl EntitySchemaBuilder {
    /// Override the table name (defaults to the snake-cased entity name).
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.schema.table = table.into();
        self
    }

    /// Declare a key field. Call repeatedly for composite keys.
    pub fn key(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        self.schema.key.push(name.clone());
        self.push_field(name, kind, false, true)
    }

    /// Declare a non-null scalar field.
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push_field(name.into(), kind, false, false)
    }

    /// Declare a nullable scalar field.
    pub fn nullable(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push_field(name.into(), kind, true, false)
    }

    /// Declare a to-one relation whose foreign key is a field of this entity.
    pub fn reference<C: Reflect>(
        mut self,
        name: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.schema.relations.push(RelationDescriptor {
            name: name.into(),
            kind: RelationKind::Reference,
            foreign_key: foreign_key.into(),
            target: schema_of::<C>,
        });
        self
    }

    /// Declare a to-many relation whose foreign key is a field of `C`.
    pub fn collection<C: Reflect>(
        mut self,
        name: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.schema.relations.push(RelationDescriptor {
            name: name.into(),
            kind: RelationKind::Collection,
            foreign_key: foreign_key.into(),
            target: schema_of::<C>,
        });
        self
    }

    /// Declare the soft-delete capability on a boolean flag field.
    /// The field is added when it was not declared explicitly.
    pub fn soft_delete(mut self, flag: impl Into<String>) -> Self {
        let flag = flag.into();
        if !self.schema.fields.iter().any(|f| f.name == flag) {
            self = self.push_field(flag.clone(), FieldKind::Bool, false, false);
        }
        self.schema.soft_delete = Some(flag);
        self
    }

    /// Declare the audit capability. The four members must be declared as fields.
    pub fn auditable(mut self, fields: AuditFields) -> Self {
        self.schema.audit = Some(fields);
        self
    }

    /// Finish the schema. Without an explicit key, a field named `id`
    /// (any case) becomes the key.
    pub fn build(mut self) -> EntitySchema {
        if self.schema.key.is_empty() {
            if let Some(field) = self
                .schema
                .fields
                .iter_mut()
                .find(|f| f.name.eq_ignore_ascii_case("id"))
            {
                field.is_key = true;
                self.schema.key.push(field.name.clone());
            }
        }
        self.schema
    }

    fn push_field(mut self, name: String, kind: FieldKind, nullable: bool, is_key: bool) -> Self {
        self.schema.fields.retain(|f| f.name != name);
        self.schema.fields.push(FieldDescriptor {
            name,
            kind,
            nullable,
            is_key,
        });
        self
    }
}

fn find_by_name<'a, T>(items: &'a [T], name: &str, name_of: impl Fn(&T) -> &str) -> Option<&'a T> {
    items
        .iter()
        .find(|item| name_of(item).eq_ignore_ascii_case(name))
        .or_else(|| {
            let wanted = fold_name(name);
            items.iter().find(|item| fold_name(name_of(item)) == wanted)
        })
}

fn fold_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
