//! StateStore: redb-backed resource persistence for fleetroll.
//!
//! Provides typed operations over fleets and devices. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Each mutating method runs in exactly one write transaction, so bulk
//! operations such as [`StateStore::mark_rollout_selection`] are atomic with
//! respect to every other caller sharing the database.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::query::*;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(FLEETS).map_err(map_err!(Table))?;
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table_def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table_def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Deserialize every value whose key starts with the org prefix.
    fn scan_json<T: DeserializeOwned>(&self, table_def: JsonTable, org_id: &str) -> StateResult<Vec<T>> {
        let prefix = org_prefix(org_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table_def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write of one record inside a single write transaction.
    fn modify_json<T, F>(&self, table_def: JsonTable, key: &str, f: F) -> StateResult<()>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| StateError::NotFound(key.to_string()))?;
            let mut value: T =
                serde_json::from_slice(&current).map_err(map_err!(Deserialize))?;
            f(&mut value);
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Rewrite the devices of an org accepted by `select`, in one write
    /// transaction. `select` sees devices in key order and may flip state on
    /// the ones it returns `true` for. Returns the number of devices changed.
    fn modify_devices<F>(&self, org_id: &str, mut select: F) -> StateResult<usize>
    where
        F: FnMut(&mut Device) -> bool,
    {
        let prefix = org_prefix(org_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut changed = 0;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut entries = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    entries.push((key.value().to_string(), value.value().to_vec()));
                }
            }
            for (key, bytes) in entries {
                let mut device: Device =
                    serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                if !select(&mut device) {
                    continue;
                }
                let bytes = serde_json::to_vec(&device).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                changed += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(changed)
    }

    // ── Fleets ─────────────────────────────────────────────────────

    /// Insert or update a fleet.
    pub fn put_fleet(&self, org_id: &str, fleet: &Fleet) -> StateResult<()> {
        let key = resource_key(org_id, fleet.name());
        self.put_json(FLEETS, &key, fleet)?;
        debug!(%key, "fleet stored");
        Ok(())
    }

    /// Get a fleet by name.
    pub fn get_fleet(&self, org_id: &str, name: &str) -> StateResult<Option<Fleet>> {
        self.get_json(FLEETS, &resource_key(org_id, name))
    }

    /// List all fleets of an organization.
    pub fn list_fleets(&self, org_id: &str) -> StateResult<Vec<Fleet>> {
        self.scan_json(FLEETS, org_id)
    }

    /// Fleets whose rollout policy carries a device selection strategy.
    pub fn list_rollout_device_selection_fleets(&self, org_id: &str) -> StateResult<Vec<Fleet>> {
        let mut fleets = self.list_fleets(org_id)?;
        fleets.retain(|f| {
            f.spec
                .rollout_policy
                .as_ref()
                .is_some_and(|p| p.device_selection.is_some())
        });
        Ok(fleets)
    }

    /// Fleets whose rollout policy carries a disruption allowance.
    pub fn list_disruption_allowance_fleets(&self, org_id: &str) -> StateResult<Vec<Fleet>> {
        let mut fleets = self.list_fleets(org_id)?;
        fleets.retain(|f| {
            f.spec
                .rollout_policy
                .as_ref()
                .is_some_and(|p| p.disruption_allowance.is_some())
        });
        Ok(fleets)
    }

    /// Set and remove fleet annotations atomically. Keys in `unset` are
    /// removed after `set` is applied.
    pub fn update_fleet_annotations(
        &self,
        org_id: &str,
        name: &str,
        set: &BTreeMap<String, String>,
        unset: &[String],
    ) -> StateResult<()> {
        let key = resource_key(org_id, name);
        self.modify_json(FLEETS, &key, |fleet: &mut Fleet| {
            apply_annotations(&mut fleet.metadata.annotations, set, unset);
        })?;
        debug!(%key, set = set.len(), unset = unset.len(), "fleet annotations updated");
        Ok(())
    }

    /// Delete a fleet by name. Returns true if it existed.
    pub fn delete_fleet(&self, org_id: &str, name: &str) -> StateResult<bool> {
        let key = resource_key(org_id, name);
        let existed = self.delete_key(FLEETS, &key)?;
        debug!(%key, existed, "fleet deleted");
        Ok(existed)
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or update a device.
    pub fn put_device(&self, org_id: &str, device: &Device) -> StateResult<()> {
        self.put_json(DEVICES, &resource_key(org_id, device.name()), device)
    }

    /// Get a device by name.
    pub fn get_device(&self, org_id: &str, name: &str) -> StateResult<Option<Device>> {
        self.get_json(DEVICES, &resource_key(org_id, name))
    }

    /// Delete a device by name. Returns true if it existed.
    pub fn delete_device(&self, org_id: &str, name: &str) -> StateResult<bool> {
        self.delete_key(DEVICES, &resource_key(org_id, name))
    }

    /// List devices matching the parameters, in name order, honoring
    /// `params.limit`.
    pub fn list_devices(&self, org_id: &str, params: &ListParams) -> StateResult<Vec<Device>> {
        let mut devices: Vec<Device> = self.scan_json(DEVICES, org_id)?;
        devices.retain(|d| params.matches(d));
        if let Some(limit) = params.limit {
            devices.truncate(limit);
        }
        Ok(devices)
    }

    /// Count devices matching the parameters. `params.limit` is ignored.
    pub fn count_devices(&self, org_id: &str, params: &ListParams) -> StateResult<i64> {
        let devices: Vec<Device> = self.scan_json(DEVICES, org_id)?;
        Ok(devices.iter().filter(|d| params.matches(d)).count() as i64)
    }

    /// Count devices matching the parameters and every predicate, grouped by
    /// the values of the `group_by` label keys. Groups without devices are
    /// absent from the result; an empty `group_by` yields one group.
    pub fn count_devices_by_labels(
        &self,
        org_id: &str,
        params: &ListParams,
        group_by: &[String],
        predicates: &[DevicePredicate],
    ) -> StateResult<BTreeMap<LabelGroup, i64>> {
        let devices: Vec<Device> = self.scan_json(DEVICES, org_id)?;
        let mut counts = BTreeMap::new();
        for device in devices
            .iter()
            .filter(|d| params.matches(d) && predicates.iter().all(|p| p.matches(d)))
        {
            *counts.entry(label_group(device, group_by)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Completion states of the devices with the given owner that are
    /// currently selected for rollout.
    pub fn completion_counts(&self, org_id: &str, owner: &str) -> StateResult<Vec<CompletionCount>> {
        let devices: Vec<Device> = self.scan_json(DEVICES, org_id)?;
        let mut groups = BTreeMap::new();
        for device in devices.iter().filter(|d| {
            d.selected_for_rollout && d.metadata.owner.as_deref() == Some(owner)
        }) {
            let key = (
                device
                    .annotation(DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION)
                    .map(str::to_string),
                !device.is_converging(),
                device.status.summary,
                device.status.updating_reason,
            );
            *groups.entry(key).or_insert(0i64) += 1;
        }
        Ok(groups
            .into_iter()
            .map(
                |((rendered_template_version, same_rendered_version, summary_status, updating_reason), count)| {
                    CompletionCount {
                        rendered_template_version,
                        same_rendered_version,
                        summary_status,
                        updating_reason,
                        count,
                    }
                },
            )
            .collect())
    }

    /// Set and remove device annotations atomically.
    pub fn update_device_annotations(
        &self,
        org_id: &str,
        name: &str,
        set: &BTreeMap<String, String>,
        unset: &[String],
    ) -> StateResult<()> {
        self.modify_json(DEVICES, &resource_key(org_id, name), |device: &mut Device| {
            apply_annotations(&mut device.metadata.annotations, set, unset);
        })
    }

    /// Flag up to `limit` unselected devices matching `params` as selected
    /// for rollout (all of them when `limit` is `None`). Runs as a single
    /// write transaction. Returns the number of devices marked.
    pub fn mark_rollout_selection(
        &self,
        org_id: &str,
        params: &ListParams,
        limit: Option<usize>,
    ) -> StateResult<usize> {
        let mut remaining = limit;
        let marked = self.modify_devices(org_id, |device| {
            if remaining == Some(0) || device.selected_for_rollout || !params.matches(device) {
                return false;
            }
            device.selected_for_rollout = true;
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            true
        })?;
        debug!(%org_id, marked, ?limit, "devices marked for rollout");
        Ok(marked)
    }

    /// Clear the rollout selection flag of every device owned by the fleet.
    /// Returns the number of devices unmarked.
    pub fn unmark_rollout_selection(&self, org_id: &str, fleet_name: &str) -> StateResult<usize> {
        let owner = fleet_owner(fleet_name);
        let unmarked = self.modify_devices(org_id, |device| {
            if !device.selected_for_rollout || device.metadata.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
            device.selected_for_rollout = false;
            true
        })?;
        debug!(%org_id, fleet = %fleet_name, unmarked, "rollout selection cleared");
        Ok(unmarked)
    }
}

fn apply_annotations(
    annotations: &mut BTreeMap<String, String>,
    set: &BTreeMap<String, String>,
    unset: &[String],
) {
    annotations.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
    for key in unset {
        annotations.remove(key);
    }
}
