//! Typed records built from validated rows, and skip diagnostics.

use crate::import::sanitize::scrub_details;
use crate::import::schema::{EntityKind, EntitySchema, MappedRow};
use chrono::NaiveDateTime;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A record the batch importer can commit.
pub trait ImportRecord: Clone + Send + Sync + 'static {
    const ENTITY: EntityKind;

    fn schema() -> &'static EntitySchema {
        Self::ENTITY.schema()
    }

    /// Build the record from a validated and sanitized row.
    fn from_row(row: MappedRow) -> Self;

    /// Natural key used for upserts.
    fn key(&self) -> &str;

    /// Identifier of the record's parent, for entities that have one.
    fn parent_key(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub identity_number: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl ImportRecord for CustomerRecord {
    const ENTITY: EntityKind = EntityKind::Customers;

    fn from_row(mut row: MappedRow) -> Self {
        Self {
            customer_id: row.take_text("customer_id").unwrap_or_default(),
            name: row.take_text("name").unwrap_or_default(),
            email: row.take_text("email"),
            phone: row.take_text("phone"),
            address: row.take_text("address"),
            city: row.take_text("city"),
            postal_code: row.take_text("postal_code"),
            identity_number: row.take_text("identity_number"),
            notes: row.take_text("notes"),
            created_at: row.timestamp("created_at"),
            updated_at: row.timestamp("updated_at"),
        }
    }

    fn key(&self) -> &str {
        &self.customer_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRecord {
    pub subscription_id: String,
    pub customer_id: String,
    pub service_name: String,
    pub package_name: Option<String>,
    pub bandwidth_mbps: i64,
    pub monthly_fee: i64,
    pub status: Option<String>,
    pub is_active: Option<bool>,
    pub installation_address: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub odp_code: Option<String>,
    pub router_serial: Option<String>,
    pub router_mac: Option<String>,
    pub ip_address: Option<String>,
    pub pppoe_username: Option<String>,
    pub vlan_id: i64,
    pub olt_name: Option<String>,
    pub olt_port: Option<String>,
    pub onu_serial: Option<String>,
    pub billing_day: i64,
    pub auto_renew: Option<bool>,
    pub is_suspended: Option<bool>,
    pub notes: Option<String>,
    pub sales_agent: Option<String>,
    pub technician: Option<String>,
    pub activated_at: Option<NaiveDateTime>,
    pub suspended_at: Option<NaiveDateTime>,
    pub dismantled_at: Option<NaiveDateTime>,
    pub approved_at: Option<NaiveDateTime>,
    pub installed_at: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl ImportRecord for SubscriptionRecord {
    const ENTITY: EntityKind = EntityKind::Subscriptions;

    fn from_row(mut row: MappedRow) -> Self {
        Self {
            subscription_id: row.take_text("subscription_id").unwrap_or_default(),
            customer_id: row.take_text("customer_id").unwrap_or_default(),
            service_name: row.take_text("service_name").unwrap_or_default(),
            package_name: row.take_text("package_name"),
            bandwidth_mbps: row.integer("bandwidth_mbps"),
            monthly_fee: row.integer("monthly_fee"),
            status: row.take_text("status"),
            is_active: row.boolean("is_active"),
            installation_address: row.take_text("installation_address"),
            latitude: row.take_text("latitude"),
            longitude: row.take_text("longitude"),
            odp_code: row.take_text("odp_code"),
            router_serial: row.take_text("router_serial"),
            router_mac: row.take_text("router_mac"),
            ip_address: row.take_text("ip_address"),
            pppoe_username: row.take_text("pppoe_username"),
            vlan_id: row.integer("vlan_id"),
            olt_name: row.take_text("olt_name"),
            olt_port: row.take_text("olt_port"),
            onu_serial: row.take_text("onu_serial"),
            billing_day: row.integer("billing_day"),
            auto_renew: row.boolean("auto_renew"),
            is_suspended: row.boolean("is_suspended"),
            notes: row.take_text("notes"),
            sales_agent: row.take_text("sales_agent"),
            technician: row.take_text("technician"),
            activated_at: row.timestamp("activated_at"),
            suspended_at: row.timestamp("suspended_at"),
            dismantled_at: row.timestamp("dismantled_at"),
            approved_at: row.timestamp("approved_at"),
            installed_at: row.timestamp("installed_at"),
            created_at: row.timestamp("created_at"),
            updated_at: row.timestamp("updated_at"),
        }
    }

    fn key(&self) -> &str {
        &self.subscription_id
    }

    fn parent_key(&self) -> Option<&str> {
        Some(&self.customer_id)
    }
}

/// Why a row was not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Validation,
    Referential,
    Persistence,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Validation => "validation",
            SkipReason::Referential => "referential",
            SkipReason::Persistence => "persistence",
        })
    }
}

/// Placeholder identifier for rows whose key is missing.
pub const MISSING_ID: &str = "(empty)";

/// One rejected row, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SkippedRecord {
    pub entity_type: EntityKind,
    pub identifying_id: String,
    pub reason: SkipReason,
    pub details: String,
}

impl SkippedRecord {
    /// Build a skip entry; `details` is scrubbed and length-capped.
    pub fn new(
        entity_type: EntityKind,
        identifying_id: Option<&str>,
        reason: SkipReason,
        details: &str,
    ) -> Self {
        let identifying_id = identifying_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(MISSING_ID)
            .to_string();

        Self {
            entity_type,
            identifying_id,
            reason,
            details: scrub_details(details),
        }
    }
}
