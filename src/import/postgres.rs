//! PostgreSQL implementation of the import store.
//!
//! Records are converted into parallel column vectors and written with a
//! single `INSERT ... SELECT FROM UNNEST(...) ON CONFLICT DO UPDATE`
//! statement per chunk. Keys repeated inside a chunk are collapsed first
//! because PostgreSQL refuses to update the same row twice in one statement.

use crate::import::records::{CustomerRecord, SubscriptionRecord};
use crate::import::store::{ImportStore, RecordSink, StoreError, dedupe_by_key};
use chrono::NaiveDateTime;
use rocket_db_pools::sqlx::{self, PgPool};
use std::collections::HashSet;

/// Customer rows in columnar format. All vectors have the same length.
#[derive(Default)]
struct CustomersData {
    customer_ids: Vec<String>,
    names: Vec<String>,
    emails: Vec<Option<String>>,
    phones: Vec<Option<String>>,
    addresses: Vec<Option<String>>,
    cities: Vec<Option<String>>,
    postal_codes: Vec<Option<String>>,
    identity_numbers: Vec<Option<String>>,
    notes: Vec<Option<String>>,
    created_ats: Vec<Option<NaiveDateTime>>,
    updated_ats: Vec<Option<NaiveDateTime>>,
}

impl CustomersData {
    fn from_records(records: &[&CustomerRecord]) -> Self {
        let mut data = Self::default();
        for record in records {
            data.customer_ids.push(record.customer_id.clone());
            data.names.push(record.name.clone());
            data.emails.push(record.email.clone());
            data.phones.push(record.phone.clone());
            data.addresses.push(record.address.clone());
            data.cities.push(record.city.clone());
            data.postal_codes.push(record.postal_code.clone());
            data.identity_numbers.push(record.identity_number.clone());
            data.notes.push(record.notes.clone());
            data.created_ats.push(record.created_at);
            data.updated_ats.push(record.updated_at);
        }
        data
    }
}

/// Subscription rows in columnar format. All vectors have the same length.
#[derive(Default)]
struct SubscriptionsData {
    subscription_ids: Vec<String>,
    customer_ids: Vec<String>,
    service_names: Vec<String>,
    package_names: Vec<Option<String>>,
    bandwidths: Vec<i64>,
    monthly_fees: Vec<i64>,
    statuses: Vec<Option<String>>,
    is_active: Vec<Option<bool>>,
    installation_addresses: Vec<Option<String>>,
    latitudes: Vec<Option<String>>,
    longitudes: Vec<Option<String>>,
    odp_codes: Vec<Option<String>>,
    router_serials: Vec<Option<String>>,
    router_macs: Vec<Option<String>>,
    ip_addresses: Vec<Option<String>>,
    pppoe_usernames: Vec<Option<String>>,
    vlan_ids: Vec<i64>,
    olt_names: Vec<Option<String>>,
    olt_ports: Vec<Option<String>>,
    onu_serials: Vec<Option<String>>,
    billing_days: Vec<i64>,
    auto_renew: Vec<Option<bool>>,
    is_suspended: Vec<Option<bool>>,
    notes: Vec<Option<String>>,
    sales_agents: Vec<Option<String>>,
    technicians: Vec<Option<String>>,
    activated_ats: Vec<Option<NaiveDateTime>>,
    suspended_ats: Vec<Option<NaiveDateTime>>,
    dismantled_ats: Vec<Option<NaiveDateTime>>,
    approved_ats: Vec<Option<NaiveDateTime>>,
    installed_ats: Vec<Option<NaiveDateTime>>,
    created_ats: Vec<Option<NaiveDateTime>>,
    updated_ats: Vec<Option<NaiveDateTime>>,
}

impl SubscriptionsData {
    fn from_records(records: &[&SubscriptionRecord]) -> Self {
        let mut data = Self::default();
        for record in records {
            data.subscription_ids.push(record.subscription_id.clone());
            data.customer_ids.push(record.customer_id.clone());
            data.service_names.push(record.service_name.clone());
            data.package_names.push(record.package_name.clone());
            data.bandwidths.push(record.bandwidth_mbps);
            data.monthly_fees.push(record.monthly_fee);
            data.statuses.push(record.status.clone());
            data.is_active.push(record.is_active);
            data.installation_addresses
                .push(record.installation_address.clone());
            data.latitudes.push(record.latitude.clone());
            data.longitudes.push(record.longitude.clone());
            data.odp_codes.push(record.odp_code.clone());
            data.router_serials.push(record.router_serial.clone());
            data.router_macs.push(record.router_mac.clone());
            data.ip_addresses.push(record.ip_address.clone());
            data.pppoe_usernames.push(record.pppoe_username.clone());
            data.vlan_ids.push(record.vlan_id);
            data.olt_names.push(record.olt_name.clone());
            data.olt_ports.push(record.olt_port.clone());
            data.onu_serials.push(record.onu_serial.clone());
            data.billing_days.push(record.billing_day);
            data.auto_renew.push(record.auto_renew);
            data.is_suspended.push(record.is_suspended);
            data.notes.push(record.notes.clone());
            data.sales_agents.push(record.sales_agent.clone());
            data.technicians.push(record.technician.clone());
            data.activated_ats.push(record.activated_at);
            data.suspended_ats.push(record.suspended_at);
            data.dismantled_ats.push(record.dismantled_at);
            data.approved_ats.push(record.approved_at);
            data.installed_ats.push(record.installed_at);
            data.created_ats.push(record.created_at);
            data.updated_ats.push(record.updated_at);
        }
        data
    }
}

/// Import store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgImportStore {
    pool: PgPool,
}

impl PgImportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_customers(&self, records: &[&CustomerRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let data = CustomersData::from_records(records);

        let result = sqlx::query(
            r#"INSERT INTO customers (
                customer_id, name, email, phone, address, city, postal_code,
                identity_number, notes, created_at, updated_at
               )
               SELECT
                   customer_id, name, email, phone, address, city, postal_code,
                   identity_number, notes,
                   COALESCE(created_at, NOW()),
                   COALESCE(updated_at, NOW())
               FROM UNNEST(
                   $1::text[], $2::text[], $3::text[], $4::text[], $5::text[],
                   $6::text[], $7::text[], $8::text[], $9::text[],
                   $10::timestamp[], $11::timestamp[]
               ) AS t (
                   customer_id, name, email, phone, address, city, postal_code,
                   identity_number, notes, created_at, updated_at
               )
               ON CONFLICT (customer_id) DO UPDATE
               SET name = EXCLUDED.name,
                   email = EXCLUDED.email,
                   phone = EXCLUDED.phone,
                   address = EXCLUDED.address,
                   city = EXCLUDED.city,
                   postal_code = EXCLUDED.postal_code,
                   identity_number = EXCLUDED.identity_number,
                   notes = EXCLUDED.notes,
                   created_at = EXCLUDED.created_at,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(&data.customer_ids)
        .bind(&data.names)
        .bind(&data.emails)
        .bind(&data.phones)
        .bind(&data.addresses)
        .bind(&data.cities)
        .bind(&data.postal_codes)
        .bind(&data.identity_numbers)
        .bind(&data.notes)
        .bind(&data.created_ats)
        .bind(&data.updated_ats)
        .execute(&self.pool)
        .await?;

        log::trace!("upserted {} customers", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn write_subscriptions(
        &self,
        records: &[&SubscriptionRecord],
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let data = SubscriptionsData::from_records(records);

        let result = sqlx::query(
            r#"INSERT INTO subscriptions (
                subscription_id, customer_id, service_name, package_name,
                bandwidth_mbps, monthly_fee, status, is_active,
                installation_address, latitude, longitude, odp_code,
                router_serial, router_mac, ip_address, pppoe_username,
                vlan_id, olt_name, olt_port, onu_serial, billing_day,
                auto_renew, is_suspended, notes, sales_agent, technician,
                activated_at, suspended_at, dismantled_at, approved_at,
                installed_at, created_at, updated_at
               )
               SELECT
                   subscription_id, customer_id, service_name, package_name,
                   bandwidth_mbps, monthly_fee, status, is_active,
                   installation_address, latitude, longitude, odp_code,
                   router_serial, router_mac, ip_address, pppoe_username,
                   vlan_id, olt_name, olt_port, onu_serial, billing_day,
                   auto_renew, is_suspended, notes, sales_agent, technician,
                   activated_at, suspended_at, dismantled_at, approved_at,
                   installed_at,
                   COALESCE(created_at, NOW()),
                   COALESCE(updated_at, NOW())
               FROM UNNEST(
                   $1::text[], $2::text[], $3::text[], $4::text[],
                   $5::int8[], $6::int8[], $7::text[], $8::bool[],
                   $9::text[], $10::text[], $11::text[], $12::text[],
                   $13::text[], $14::text[], $15::text[], $16::text[],
                   $17::int8[], $18::text[], $19::text[], $20::text[], $21::int8[],
                   $22::bool[], $23::bool[], $24::text[], $25::text[], $26::text[],
                   $27::timestamp[], $28::timestamp[], $29::timestamp[], $30::timestamp[],
                   $31::timestamp[], $32::timestamp[], $33::timestamp[]
               ) AS t (
                   subscription_id, customer_id, service_name, package_name,
                   bandwidth_mbps, monthly_fee, status, is_active,
                   installation_address, latitude, longitude, odp_code,
                   router_serial, router_mac, ip_address, pppoe_username,
                   vlan_id, olt_name, olt_port, onu_serial, billing_day,
                   auto_renew, is_suspended, notes, sales_agent, technician,
                   activated_at, suspended_at, dismantled_at, approved_at,
                   installed_at, created_at, updated_at
               )
               ON CONFLICT (subscription_id) DO UPDATE
               SET customer_id = EXCLUDED.customer_id,
                   service_name = EXCLUDED.service_name,
                   package_name = EXCLUDED.package_name,
                   bandwidth_mbps = EXCLUDED.bandwidth_mbps,
                   monthly_fee = EXCLUDED.monthly_fee,
                   status = EXCLUDED.status,
                   is_active = EXCLUDED.is_active,
                   installation_address = EXCLUDED.installation_address,
                   latitude = EXCLUDED.latitude,
                   longitude = EXCLUDED.longitude,
                   odp_code = EXCLUDED.odp_code,
                   router_serial = EXCLUDED.router_serial,
                   router_mac = EXCLUDED.router_mac,
                   ip_address = EXCLUDED.ip_address,
                   pppoe_username = EXCLUDED.pppoe_username,
                   vlan_id = EXCLUDED.vlan_id,
                   olt_name = EXCLUDED.olt_name,
                   olt_port = EXCLUDED.olt_port,
                   onu_serial = EXCLUDED.onu_serial,
                   billing_day = EXCLUDED.billing_day,
                   auto_renew = EXCLUDED.auto_renew,
                   is_suspended = EXCLUDED.is_suspended,
                   notes = EXCLUDED.notes,
                   sales_agent = EXCLUDED.sales_agent,
                   technician = EXCLUDED.technician,
                   activated_at = EXCLUDED.activated_at,
                   suspended_at = EXCLUDED.suspended_at,
                   dismantled_at = EXCLUDED.dismantled_at,
                   approved_at = EXCLUDED.approved_at,
                   installed_at = EXCLUDED.installed_at,
                   created_at = EXCLUDED.created_at,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(&data.subscription_ids)
        .bind(&data.customer_ids)
        .bind(&data.service_names)
        .bind(&data.package_names)
        .bind(&data.bandwidths)
        .bind(&data.monthly_fees)
        .bind(&data.statuses)
        .bind(&data.is_active)
        .bind(&data.installation_addresses)
        .bind(&data.latitudes)
        .bind(&data.longitudes)
        .bind(&data.odp_codes)
        .bind(&data.router_serials)
        .bind(&data.router_macs)
        .bind(&data.ip_addresses)
        .bind(&data.pppoe_usernames)
        .bind(&data.vlan_ids)
        .bind(&data.olt_names)
        .bind(&data.olt_ports)
        .bind(&data.onu_serials)
        .bind(&data.billing_days)
        .bind(&data.auto_renew)
        .bind(&data.is_suspended)
        .bind(&data.notes)
        .bind(&data.sales_agents)
        .bind(&data.technicians)
        .bind(&data.activated_ats)
        .bind(&data.suspended_ats)
        .bind(&data.dismantled_ats)
        .bind(&data.approved_ats)
        .bind(&data.installed_ats)
        .bind(&data.created_ats)
        .bind(&data.updated_ats)
        .execute(&self.pool)
        .await?;

        log::trace!("upserted {} subscriptions", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[rocket::async_trait]
impl RecordSink<CustomerRecord> for PgImportStore {
    async fn upsert_batch(&self, records: &[CustomerRecord]) -> Result<u64, StoreError> {
        self.write_customers(&dedupe_by_key(records)).await
    }

    async fn upsert_one(&self, record: &CustomerRecord) -> Result<(), StoreError> {
        self.write_customers(&[record]).await.map(|_| ())
    }
}

#[rocket::async_trait]
impl RecordSink<SubscriptionRecord> for PgImportStore {
    async fn upsert_batch(&self, records: &[SubscriptionRecord]) -> Result<u64, StoreError> {
        self.write_subscriptions(&dedupe_by_key(records)).await
    }

    async fn upsert_one(&self, record: &SubscriptionRecord) -> Result<(), StoreError> {
        self.write_subscriptions(&[record]).await.map(|_| ())
    }
}

#[rocket::async_trait]
impl ImportStore for PgImportStore {
    async fn known_customer_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<(String,)> = sqlx::query_as("SELECT customer_id FROM customers")
            .fetch_all(&self.pool)
            .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
