//! redb table definitions for the fleetroll state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized resources).
//! Keys follow the pattern `{org_id}/{name}`.

use redb::TableDefinition;

/// Table of JSON-encoded resources keyed by `{org_id}/{name}`.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Fleets keyed by `{org_id}/{fleet_name}`.
pub const FLEETS: JsonTable = TableDefinition::new("fleets");

/// Devices keyed by `{org_id}/{device_name}`.
pub const DEVICES: JsonTable = TableDefinition::new("devices");

/// Build the composite key for a resource of an organization.
pub fn resource_key(org_id: &str, name: &str) -> String {
    format!("{org_id}/{name}")
}

/// Key prefix matching every resource of an organization.
pub fn org_prefix(org_id: &str) -> String {
    format!("{org_id}/")
}
