//! # Command table
//!
//! Name based lookup of the numeric command triples sent to the drone.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::schema::{DroneFamily, FieldType, SchemaCatalog};

/// Numeric identity of a command: project, class and command id
///
/// The descriptor is what actually goes on the wire, names are only used to
/// find it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandDescriptor {
    /// Project id
    pub project_id: u8,
    /// Class id within the project
    pub class_id: u8,
    /// Command id within the class
    pub command_id: u16,
}

impl CommandDescriptor {
    /// Create a descriptor from its three ids
    pub fn new(project_id: u8, class_id: u8, command_id: u16) -> Self {
        CommandDescriptor { project_id, class_id, command_id }
    }

    /// Wire encoding: `project_id: u8, class_id: u8, command_id: u16` little-endian
    pub fn to_bytes(&self) -> [u8; 4] {
        let id = self.command_id.to_le_bytes();
        [self.project_id, self.class_id, id[0], id[1]]
    }
}

impl Display for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.project_id, self.class_id, self.command_id)
    }
}

type NameKey = (String, String, String);

/// Lookup from command names to [`CommandDescriptor`]
///
/// The family specific project is searched first, then the shared `common`
/// project. Resolutions are memoized by name.
pub struct CommandTable {
    catalog: Arc<SchemaCatalog>,
    family: DroneFamily,
    commands: Mutex<HashMap<NameKey, CommandDescriptor>>,
    enums: Mutex<HashMap<(NameKey, String), u32>>,
}

impl CommandTable {
    /// Create a command table for a drone family
    pub fn new(catalog: Arc<SchemaCatalog>, family: DroneFamily) -> Self {
        CommandTable {
            catalog,
            family,
            commands: Mutex::new(HashMap::new()),
            enums: Mutex::new(HashMap::new()),
        }
    }

    /// Drone family this table resolves for
    pub fn family(&self) -> DroneFamily {
        self.family
    }

    /// Resolve a command name triple
    ///
    /// # Arguments
    /// * `project` - Project name, e.g. `minidrone`, `ardrone3` or `common`
    /// * `class` - Class name within the project
    /// * `command` - Command name within the class
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the command is not found in the
    /// family project nor in the common project.
    pub fn resolve(&self, project: &str, class: &str, command: &str) -> Result<CommandDescriptor> {
        let key = (project.to_string(), class.to_string(), command.to_string());
        if let Some(descriptor) = self.commands.lock().get(&key) {
            return Ok(*descriptor);
        }

        let descriptor = self
            .find(project, class, command)
            .map(|(descriptor, _)| descriptor)
            .ok_or_else(|| Error::Configuration(format!("unknown command {}.{}.{}", project, class, command)))?;

        self.commands.lock().insert(key, descriptor);
        Ok(descriptor)
    }

    /// Resolve a command taking an enumerated argument, together with the index of `enum_name`
    ///
    /// The first enum argument of the command is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the command is unknown, has no enum
    /// argument or if `enum_name` is not one of its values.
    pub fn resolve_with_enum(
        &self,
        project: &str,
        class: &str,
        command: &str,
        enum_name: &str,
    ) -> Result<(CommandDescriptor, u32)> {
        let key = (project.to_string(), class.to_string(), command.to_string());
        let enum_key = (key.clone(), enum_name.to_string());
        if let Some(index) = self.enums.lock().get(&enum_key) {
            let descriptor = self.resolve(project, class, command)?;
            return Ok((descriptor, *index));
        }

        let (descriptor, names) = self
            .find(project, class, command)
            .ok_or_else(|| Error::Configuration(format!("unknown command {}.{}.{}", project, class, command)))?;
        let names = names.ok_or_else(|| {
            Error::Configuration(format!("command {}.{}.{} takes no enum argument", project, class, command))
        })?;
        let index = names.iter().position(|n| n == enum_name).ok_or_else(|| {
            Error::Configuration(format!("unknown enum value {} for {}.{}.{}", enum_name, project, class, command))
        })? as u32;

        self.commands.lock().insert(key, descriptor);
        self.enums.lock().insert(enum_key, index);
        Ok((descriptor, index))
    }

    /// Argument types of a command, in wire order
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the command is unknown.
    pub fn arg_types(&self, project: &str, class: &str, command: &str) -> Result<Vec<FieldType>> {
        self.catalog
            .search_order(self.family)
            .into_iter()
            .filter(|p| p.name == project)
            .find_map(|p| p.command_by_name(class, command))
            .map(|(_, cmd)| cmd.args.iter().map(|arg| arg.field_type()).collect())
            .ok_or_else(|| Error::Configuration(format!("unknown command {}.{}.{}", project, class, command)))
    }

    // Scan the schema, returns the descriptor and the names of the first enum argument if any
    fn find(&self, project: &str, class: &str, command: &str) -> Option<(CommandDescriptor, Option<Vec<String>>)> {
        self.catalog
            .search_order(self.family)
            .into_iter()
            .filter(|p| p.name == project)
            .find_map(|p| {
                let (class_def, cmd) = p.command_by_name(class, command)?;
                let enum_names = cmd.args.iter().find_map(|arg| match arg.field_type() {
                    FieldType::Enum(names) => Some(names),
                    _ => None,
                });
                Some((CommandDescriptor::new(p.id, class_def.id, cmd.id), enum_names))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(family: DroneFamily) -> CommandTable {
        CommandTable::new(Arc::new(SchemaCatalog::builtin().unwrap()), family)
    }

    #[test]
    fn test_resolve_takeoff() {
        let table = table(DroneFamily::ArDrone3);
        let descriptor = table.resolve("ardrone3", "Piloting", "TakeOff").unwrap();
        assert_eq!(descriptor, CommandDescriptor::new(1, 0, 1));
        assert_eq!(descriptor.to_bytes(), [1, 0, 1, 0]);
    }

    #[test]
    fn test_resolve_is_stable_across_cache() {
        let table = table(DroneFamily::Minidrone);
        let first = table.resolve("minidrone", "Piloting", "Landing").unwrap();
        let second = table.resolve("minidrone", "Piloting", "Landing").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, CommandDescriptor::new(2, 0, 3));
    }

    #[test]
    fn test_resolve_falls_back_to_common() {
        let table = table(DroneFamily::Minidrone);
        let descriptor = table.resolve("common", "Common", "AllStates").unwrap();
        assert_eq!(descriptor, CommandDescriptor::new(0, 4, 0));
    }

    #[test]
    fn test_unknown_command_is_configuration_error() {
        let table = table(DroneFamily::Minidrone);
        let err = table.resolve("minidrone", "Piloting", "Teleport").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_other_family_project_is_not_visible() {
        let table = table(DroneFamily::Minidrone);
        assert!(table.resolve("ardrone3", "Piloting", "TakeOff").is_err());
    }

    #[test]
    fn test_resolve_with_enum() {
        let table = table(DroneFamily::Minidrone);
        let (descriptor, index) = table.resolve_with_enum("minidrone", "Animations", "Flip", "left").unwrap();
        assert_eq!(descriptor, CommandDescriptor::new(2, 4, 0));
        assert_eq!(index, 3);

        let (_, index) = table.resolve_with_enum("minidrone", "UsbAccessory", "ClawControl", "close").unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_arg_types() {
        let table = table(DroneFamily::Minidrone);
        let types = table.arg_types("minidrone", "Piloting", "PCMD").unwrap();
        assert_eq!(types, vec![FieldType::U8, FieldType::I8, FieldType::I8, FieldType::I8, FieldType::I8, FieldType::U32]);
        assert!(table.arg_types("minidrone", "Piloting", "TakeOff").unwrap().is_empty());
        assert!(table.arg_types("minidrone", "Piloting", "Teleport").is_err());
    }

    #[test]
    fn test_resolve_with_unknown_enum_value() {
        let table = table(DroneFamily::Minidrone);
        let err = table.resolve_with_enum("minidrone", "Animations", "Flip", "sideways").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = table.resolve_with_enum("minidrone", "Piloting", "TakeOff", "left").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
