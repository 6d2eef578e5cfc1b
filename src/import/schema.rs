//! Declarative dump schemas and positional row mapping.
//!
//! Each importable entity is described by a static column table. The table
//! fixes the positional layout of a dump row (12 columns for customers, 34 for
//! subscriptions) and carries the per-column rules used downstream:
//!
//! - the coercion applied to the raw token ([`ColumnKind`])
//! - the storage length limit enforced by the sanitizer
//! - whether the value is required, and whether it must be a well-formed identifier
//!
//! [`map_row`] turns a token list into a [`MappedRow`] of typed
//! [`FieldValue`]s according to that table.

use crate::import::tokenizer::unquote_literal;
use chrono::{NaiveDate, NaiveDateTime};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The two entity types carried by a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customers,
    Subscriptions,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customers => "customers",
            EntityKind::Subscriptions => "subscriptions",
        }
    }

    pub fn schema(&self) -> &'static EntitySchema {
        match self {
            EntityKind::Customers => &CUSTOMER_SCHEMA,
            EntityKind::Subscriptions => &SUBSCRIPTION_SCHEMA,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customers" | "customer" => Ok(EntityKind::Customers),
            "subscriptions" | "subscription" => Ok(EntityKind::Subscriptions),
            other => Err(format!("unknown entity type '{other}'")),
        }
    }
}

/// How a raw token is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Present in the dump but not imported (legacy auto-increment ids).
    Ignored,
    Text,
    Integer,
    Boolean,
    Timestamp,
}

/// One positional column of a dump row.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub max_len: Option<usize>,
    pub required: bool,
    pub identifier: bool,
}

const DEFAULT_TEXT_LIMIT: usize = 255;

const fn ignored(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Ignored,
        max_len: None,
        required: false,
        identifier: false,
    }
}

const fn text(name: &'static str, max_len: usize) -> Column {
    Column {
        name,
        kind: ColumnKind::Text,
        max_len: Some(max_len),
        required: false,
        identifier: false,
    }
}

const fn required_text(name: &'static str, max_len: usize) -> Column {
    Column {
        required: true,
        ..text(name, max_len)
    }
}

const fn identifier(name: &'static str) -> Column {
    Column {
        required: true,
        identifier: true,
        ..text(name, 100)
    }
}

const fn integer(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Integer,
        max_len: None,
        required: false,
        identifier: false,
    }
}

const fn boolean(name: &'static str) -> Column {
    Column {
        kind: ColumnKind::Boolean,
        ..integer(name)
    }
}

const fn timestamp(name: &'static str) -> Column {
    Column {
        kind: ColumnKind::Timestamp,
        ..integer(name)
    }
}

/// Positional layout and rules for one entity.
#[derive(Debug)]
pub struct EntitySchema {
    pub entity: EntityKind,
    /// Column holding the entity's natural key.
    pub key: &'static str,
    pub columns: &'static [Column],
}

impl EntitySchema {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

pub static CUSTOMER_SCHEMA: EntitySchema = EntitySchema {
    entity: EntityKind::Customers,
    key: "customer_id",
    columns: &[
        ignored("id"),
        identifier("customer_id"),
        required_text("name", DEFAULT_TEXT_LIMIT),
        text("email", DEFAULT_TEXT_LIMIT),
        text("phone", 50),
        text("address", 500),
        text("city", 100),
        text("postal_code", 20),
        text("identity_number", 50),
        text("notes", 1000),
        timestamp("created_at"),
        timestamp("updated_at"),
    ],
};

pub static SUBSCRIPTION_SCHEMA: EntitySchema = EntitySchema {
    entity: EntityKind::Subscriptions,
    key: "subscription_id",
    columns: &[
        ignored("id"),
        identifier("subscription_id"),
        identifier("customer_id"),
        required_text("service_name", DEFAULT_TEXT_LIMIT),
        text("package_name", DEFAULT_TEXT_LIMIT),
        integer("bandwidth_mbps"),
        integer("monthly_fee"),
        text("status", 50),
        boolean("is_active"),
        text("installation_address", 500),
        text("latitude", 50),
        text("longitude", 50),
        text("odp_code", 100),
        text("router_serial", 100),
        text("router_mac", 50),
        text("ip_address", 50),
        text("pppoe_username", 100),
        integer("vlan_id"),
        text("olt_name", 100),
        text("olt_port", 50),
        text("onu_serial", 100),
        integer("billing_day"),
        boolean("auto_renew"),
        boolean("is_suspended"),
        text("notes", 1000),
        text("sales_agent", DEFAULT_TEXT_LIMIT),
        text("technician", DEFAULT_TEXT_LIMIT),
        timestamp("activated_at"),
        timestamp("suspended_at"),
        timestamp("dismantled_at"),
        timestamp("approved_at"),
        timestamp("installed_at"),
        timestamp("created_at"),
        timestamp("updated_at"),
    ],
};

/// A coerced column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Ignored,
    Text(Option<String>),
    Integer(i64),
    Boolean(Option<bool>),
    Timestamp(Option<NaiveDateTime>),
}

/// A row whose tokens have been coerced according to an [`EntitySchema`].
#[derive(Debug, Clone)]
pub struct MappedRow {
    pub schema: &'static EntitySchema,
    pub values: Vec<FieldValue>,
}

impl MappedRow {
    fn value(&self, name: &str) -> Option<&FieldValue> {
        self.schema.index_of(name).and_then(|idx| self.values.get(idx))
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.value(name) {
            Some(FieldValue::Text(value)) => value.as_deref(),
            _ => None,
        }
    }

    /// Move a text value out of the row, leaving it absent.
    pub fn take_text(&mut self, name: &str) -> Option<String> {
        let idx = self.schema.index_of(name)?;
        match self.values.get_mut(idx) {
            Some(FieldValue::Text(value)) => value.take(),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> i64 {
        match self.value(name) {
            Some(FieldValue::Integer(value)) => *value,
            _ => 0,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.value(name) {
            Some(FieldValue::Boolean(value)) => *value,
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<NaiveDateTime> {
        match self.value(name) {
            Some(FieldValue::Timestamp(value)) => *value,
            _ => None,
        }
    }

    /// Natural key of the row, if present.
    pub fn key(&self) -> Option<&str> {
        self.text(self.schema.key)
    }
}

/// A row with fewer tokens than its schema requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row has {found} values, {entity} rows need {expected}")]
pub struct RowShapeError {
    pub entity: EntityKind,
    pub expected: usize,
    pub found: usize,
}

/// Map positional tokens onto `schema`, coercing each value.
///
/// Tokens beyond the schema's column count are ignored.
///
/// # Errors
///
/// [`RowShapeError`] when the row has fewer tokens than the schema has columns.
pub fn map_row(schema: &'static EntitySchema, tokens: &[String]) -> Result<MappedRow, RowShapeError> {
    if tokens.len() < schema.column_count() {
        return Err(RowShapeError {
            entity: schema.entity,
            expected: schema.column_count(),
            found: tokens.len(),
        });
    }

    let values = schema
        .columns
        .iter()
        .zip(tokens)
        .map(|(column, token)| coerce(column, token))
        .collect();

    Ok(MappedRow { schema, values })
}

fn coerce(column: &Column, token: &str) -> FieldValue {
    match column.kind {
        ColumnKind::Ignored => FieldValue::Ignored,
        // Keys are matched exactly, so surrounding whitespace is not part of them.
        ColumnKind::Text if column.identifier => {
            FieldValue::Text(unquote_literal(token).map(|value| value.trim().to_string()))
        }
        ColumnKind::Text => FieldValue::Text(unquote_literal(token)),
        ColumnKind::Integer => FieldValue::Integer(parse_integer(unquote_literal(token).as_deref())),
        ColumnKind::Boolean => FieldValue::Boolean(unquote_literal(token).map(|v| parse_bool(&v))),
        ColumnKind::Timestamp => {
            FieldValue::Timestamp(unquote_literal(token).and_then(|v| parse_timestamp(&v)))
        }
    }
}

/// Absent or unparseable integers become 0; decimals are rounded.
pub fn parse_integer(value: Option<&str>) -> i64 {
    let Some(value) = value.map(str::trim) else {
        return 0;
    };

    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|v| v.round() as i64))
        .unwrap_or(0)
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a dump date or datetime.
///
/// MySQL zero dates and anything unparseable map to `None`.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() || value.starts_with("0000-00-00") {
        return None;
    }

    const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}
