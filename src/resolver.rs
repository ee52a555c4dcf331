//! # Sensor schema resolver
//!
//! Inverse of the command table: maps the numeric triple at the start of an
//! inbound frame to the field layout needed to decode the rest of it.
//!
//! Unknown triples are expected (firmware evolves faster than the schema) so
//! a failed lookup is cached as well and only logged once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::commands::CommandDescriptor;
use crate::schema::{DroneFamily, FieldType, SchemaCatalog, SchemaEntry};

/// Second member of the enum table key
pub const ENUM_SENTINEL: &str = "enum";

/// Name returned for an enum index outside of the known variants
pub const UNKNOWN_ENUM_VALUE: &str = "UNKNOWN_ENUM_VALUE";

/// Enum variant names keyed by `(field_name, "enum")`
#[derive(Debug, Clone, Default)]
pub struct EnumTable {
    entries: HashMap<(String, String), Vec<String>>,
}

impl EnumTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the variant names of an enum field
    pub fn insert(&mut self, field_name: &str, names: Vec<String>) {
        self.entries.insert((field_name.to_string(), ENUM_SENTINEL.to_string()), names);
    }

    /// Variant names of a field, if it is an enum
    pub fn names(&self, field_name: &str) -> Option<&[String]> {
        self.entries
            .get(&(field_name.to_string(), ENUM_SENTINEL.to_string()))
            .map(|names| names.as_slice())
    }

    /// Name of variant `index`, [`UNKNOWN_ENUM_VALUE`] if out of range
    ///
    /// Returns `None` if the field is not an enum.
    pub fn variant_name(&self, field_name: &str, index: u64) -> Option<String> {
        let names = self.names(field_name)?;
        Some(
            usize::try_from(index)
                .ok()
                .and_then(|i| names.get(i))
                .cloned()
                .unwrap_or_else(|| UNKNOWN_ENUM_VALUE.to_string()),
        )
    }

    /// Number of enum fields in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no enum field is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Numeric triple to [`SchemaEntry`] lookup, memoized including misses
pub struct SensorSchemaResolver {
    catalog: Arc<SchemaCatalog>,
    family: DroneFamily,
    entries: Mutex<HashMap<CommandDescriptor, Option<Arc<SchemaEntry>>>>,
    enums: RwLock<EnumTable>,
    scans: AtomicUsize,
}

impl SensorSchemaResolver {
    /// Create a resolver for a drone family
    pub fn new(catalog: Arc<SchemaCatalog>, family: DroneFamily) -> Self {
        SensorSchemaResolver {
            catalog,
            family,
            entries: Mutex::new(HashMap::new()),
            enums: RwLock::new(EnumTable::new()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Resolve the field layout of a numeric triple
    ///
    /// The family project is searched first, then `common`. Both hits and
    /// misses are cached; enum fields of a hit are registered in the enum
    /// table.
    pub fn resolve(&self, project_id: u8, class_id: u8, command_id: u16) -> Option<Arc<SchemaEntry>> {
        let descriptor = CommandDescriptor::new(project_id, class_id, command_id);
        if let Some(cached) = self.entries.lock().get(&descriptor) {
            return cached.clone();
        }

        self.scans.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .catalog
            .search_order(self.family)
            .into_iter()
            .filter(|p| p.id == project_id)
            .find_map(|p| p.command_by_id(class_id, command_id))
            .map(|(_, cmd)| Arc::new(SchemaEntry::from_command(descriptor, cmd)));

        match &entry {
            Some(entry) => {
                let mut enums = self.enums.write();
                for field in &entry.fields {
                    if let Some(FieldType::Enum(names)) = &field.field_type {
                        enums.insert(&field.name, names.clone());
                    }
                }
            }
            None => log::debug!("No schema for sensor {}, caching miss", descriptor),
        }

        self.entries.lock().insert(descriptor, entry.clone());
        entry
    }

    /// Enum names registered so far
    pub fn enums(&self) -> RwLockReadGuard<'_, EnumTable> {
        self.enums.read()
    }

    /// Number of times the schema was actually scanned (cache misses)
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }
}
