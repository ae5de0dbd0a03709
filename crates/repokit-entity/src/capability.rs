//! Runtime capability probes.
//!
//! Capabilities are opt-in per entity type and discovered from the schema,
//! never from a shared base type. A probe returns a typed view that knows
//! which members to read and write, or a `CapabilityMismatch` error.

use chrono::{DateTime, Utc};

use repokit_core::{AppError, AppResult};

use crate::schema::{AuditFields, EntitySchema, FieldDescriptor, FieldKind};
use crate::value::{Record, Value};

/// View of an entity type that carries a soft-delete flag.
#[derive(Debug, Clone, Copy)]
pub struct SoftDeletable<'a> {
    schema: &'a EntitySchema,
    flag: &'a FieldDescriptor,
}

impl<'a> SoftDeletable<'a> {
    /// Probe `schema` for the soft-delete capability.
    pub fn probe(schema: &'a EntitySchema) -> AppResult<Self> {
        let flag = schema
            .soft_delete_field()
            .and_then(|name| schema.field(name))
            .filter(|field| field.kind == FieldKind::Bool)
            .ok_or_else(|| {
                AppError::capability_mismatch(format!(
                    "Entity {} does not support soft delete",
                    schema.name()
                ))
            })?;
        Ok(Self { schema, flag })
    }

    /// The probed schema.
    pub fn schema(&self) -> &'a EntitySchema {
        self.schema
    }

    /// Name of the flag field.
    pub fn flag(&self) -> &'a str {
        &self.flag.name
    }

    /// Whether `record` is flagged as deleted.
    pub fn is_deleted(&self, record: &Record) -> bool {
        record
            .get(&self.flag.name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Set or clear the flag on `record`.
    pub fn mark(&self, record: &mut Record, deleted: bool) {
        record.insert(self.flag.name.clone(), Value::Bool(deleted));
    }
}

/// View of an entity type that carries audit members.
#[derive(Debug, Clone, Copy)]
pub struct Auditable<'a> {
    schema: &'a EntitySchema,
    fields: &'a AuditFields,
}

impl<'a> Auditable<'a> {
    /// Probe `schema` for the audit capability. All four members must be
    /// declared fields.
    pub fn probe(schema: &'a EntitySchema) -> AppResult<Self> {
        let fields = schema
            .audit_fields()
            .filter(|audit| {
                [
                    &audit.created_by,
                    &audit.created_on,
                    &audit.modified_by,
                    &audit.modified_on,
                ]
                .iter()
                .all(|name| schema.field(name).is_some())
            })
            .ok_or_else(|| {
                AppError::capability_mismatch(format!(
                    "Entity {} is not auditable",
                    schema.name()
                ))
            })?;
        Ok(Self { schema, fields })
    }

    /// Stamp the insert members. A null actor leaves `created_by` untouched.
    pub fn stamp_created(&self, record: &mut Record, actor: &Value, now: DateTime<Utc>) -> AppResult<()> {
        self.write(record, &self.fields.created_on, Value::DateTime(now))?;
        if !actor.is_null() {
            self.write(record, &self.fields.created_by, actor.clone())?;
        }
        Ok(())
    }

    /// Stamp the modification members. A null actor leaves `modified_by` untouched.
    pub fn stamp_modified(&self, record: &mut Record, actor: &Value, now: DateTime<Utc>) -> AppResult<()> {
        self.write(record, &self.fields.modified_on, Value::DateTime(now))?;
        if !actor.is_null() {
            self.write(record, &self.fields.modified_by, actor.clone())?;
        }
        Ok(())
    }

    fn write(&self, record: &mut Record, name: &str, value: Value) -> AppResult<()> {
        let field = self.schema.field(name).ok_or_else(|| {
            AppError::capability_mismatch(format!(
                "Audit member '{name}' is missing on {}",
                self.schema.name()
            ))
        })?;
        record.insert(field.name.clone(), value.coerce(field.kind)?);
        Ok(())
    }
}
