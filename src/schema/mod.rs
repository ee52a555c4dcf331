//! # Static command and sensor schema
//!
//! Parrot drones describe every command and every state notification with a
//! project/class/command triple. The layout of the arguments following the
//! triple is only known from the schema, so both the outbound command table
//! and the inbound sensor decoder are driven by the same static description.
//!
//! The built-in catalog is embedded in the crate as one JSON document per
//! project (`common`, `ardrone3`, `minidrone`) and parsed once per
//! [`SchemaCatalog`]. Additional or updated projects can be provided with
//! [`SchemaCatalog::from_json`] to follow firmware evolution.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::commands::CommandDescriptor;
use crate::error::{Error, Result};

const COMMON_SCHEMA: &str = include_str!("common.json");
const ARDRONE3_SCHEMA: &str = include_str!("ardrone3.json");
const MINIDRONE_SCHEMA: &str = include_str!("minidrone.json");

/// Name of the project shared by every drone family
pub const COMMON_PROJECT: &str = "common";

/// Drone family, selects the family specific project of the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DroneFamily {
    /// Mambo and Swing (BLE or Wi-Fi through the FPV camera)
    Minidrone,
    /// Bebop and Bebop 2 (Wi-Fi)
    ArDrone3,
}

impl DroneFamily {
    /// Name of the family specific project in the schema
    pub fn project_name(&self) -> &'static str {
        match self {
            DroneFamily::Minidrone => "minidrone",
            DroneFamily::ArDrone3 => "ardrone3",
        }
    }
}

/// Type of one schema field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// Unsigned 8 bit integer
    U8,
    /// Signed 8 bit integer
    I8,
    /// Unsigned 16 bit integer
    U16,
    /// Signed 16 bit integer
    I16,
    /// Unsigned 32 bit integer
    U32,
    /// Signed 32 bit integer
    I32,
    /// Unsigned 64 bit integer
    U64,
    /// Signed 64 bit integer
    I64,
    /// 32 bit float
    F32,
    /// 64 bit float
    F64,
    /// Variable length string
    Str,
    /// Enumerated value, encoded as its index in `names`
    Enum(Vec<String>),
    /// Type name not understood by this crate (schema/firmware skew)
    Unknown(String),
}

impl FieldType {
    /// Parse a schema type name
    ///
    /// `enum_names` is only used for the `enum` type.
    pub fn from_schema_name(type_name: &str, enum_names: &[String]) -> FieldType {
        match type_name {
            "u8" => FieldType::U8,
            "i8" => FieldType::I8,
            "u16" => FieldType::U16,
            "i16" => FieldType::I16,
            "u32" => FieldType::U32,
            "i32" => FieldType::I32,
            "u64" => FieldType::U64,
            "i64" => FieldType::I64,
            "float" => FieldType::F32,
            "double" => FieldType::F64,
            "string" => FieldType::Str,
            "enum" => FieldType::Enum(enum_names.to_vec()),
            other => FieldType::Unknown(other.to_string()),
        }
    }

    /// Fixed encoded width in bytes, `None` for strings and unknown types
    pub fn width(&self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::I8 => Some(1),
            FieldType::U16 | FieldType::I16 => Some(2),
            FieldType::U32 | FieldType::I32 | FieldType::F32 | FieldType::Enum(_) => Some(4),
            FieldType::U64 | FieldType::I64 | FieldType::F64 => Some(8),
            FieldType::Str | FieldType::Unknown(_) => None,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldType::U8 => write!(f, "u8"),
            FieldType::I8 => write!(f, "i8"),
            FieldType::U16 => write!(f, "u16"),
            FieldType::I16 => write!(f, "i16"),
            FieldType::U32 => write!(f, "u32"),
            FieldType::I32 => write!(f, "i32"),
            FieldType::U64 => write!(f, "u64"),
            FieldType::I64 => write!(f, "i64"),
            FieldType::F32 => write!(f, "float"),
            FieldType::F64 => write!(f, "double"),
            FieldType::Str => write!(f, "string"),
            FieldType::Enum(names) => write!(f, "enum({})", names.len()),
            FieldType::Unknown(name) => write!(f, "unknown({})", name),
        }
    }
}

/// One argument of a command, as written in the schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDef {
    /// Argument name
    pub name: String,
    /// Type name (`u8`, `float`, `enum`, ...)
    #[serde(rename = "type")]
    pub type_name: String,
    /// Enum variant names, in index order
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_names: Vec<String>,
}

impl ArgDef {
    /// Resolved type of the argument
    pub fn field_type(&self) -> FieldType {
        FieldType::from_schema_name(&self.type_name, &self.enum_names)
    }
}

/// One command (or state notification) of a class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDef {
    /// Command name
    pub name: String,
    /// Command id within its class
    pub id: u16,
    /// Arguments in wire order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgDef>,
}

/// A class of commands within a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    /// Class name
    pub name: String,
    /// Class id within its project
    pub id: u8,
    /// Commands of the class
    pub cmds: Vec<CommandDef>,
}

/// A project (feature set) of the schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDef {
    /// Project name
    pub name: String,
    /// Project id
    pub id: u8,
    /// Classes of the project
    pub classes: Vec<ClassDef>,
}

impl ProjectDef {
    /// Find a command by class and command name
    pub fn command_by_name(&self, class: &str, command: &str) -> Option<(&ClassDef, &CommandDef)> {
        let class_def = self.classes.iter().find(|c| c.name == class)?;
        let cmd = class_def.cmds.iter().find(|c| c.name == command)?;
        Some((class_def, cmd))
    }

    /// Find a command by class and command id
    pub fn command_by_id(&self, class_id: u8, command_id: u16) -> Option<(&ClassDef, &CommandDef)> {
        let class_def = self.classes.iter().find(|c| c.id == class_id)?;
        let cmd = class_def.cmds.iter().find(|c| c.id == command_id)?;
        Some((class_def, cmd))
    }
}

/// One decoded field of a schema entry
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    /// Sensor name, `<Command>_<arg>` or the bare command name for pure notifications
    pub name: String,
    /// Field type, `None` for a pure notification carrying no data
    pub field_type: Option<FieldType>,
}

/// Ordered field layout of one command triple
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    /// Numeric triple the entry describes
    pub descriptor: CommandDescriptor,
    /// Name of the command in the schema
    pub command_name: String,
    /// Fields in wire order
    pub fields: Vec<SchemaField>,
}

impl SchemaEntry {
    /// Build the field layout of a command definition
    pub fn from_command(descriptor: CommandDescriptor, cmd: &CommandDef) -> Self {
        let fields = if cmd.args.is_empty() {
            vec![SchemaField { name: cmd.name.clone(), field_type: None }]
        } else {
            cmd.args
                .iter()
                .map(|arg| SchemaField {
                    name: format!("{}_{}", cmd.name, arg.name),
                    field_type: Some(arg.field_type()),
                })
                .collect()
        };

        SchemaEntry { descriptor, command_name: cmd.name.clone(), fields }
    }
}

/// Immutable set of schema projects
///
/// Built once and shared read-only between the command table and the sensor
/// schema resolver.
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    projects: Vec<ProjectDef>,
}

impl SchemaCatalog {
    /// Catalog of the projects embedded in the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(&[COMMON_SCHEMA, ARDRONE3_SCHEMA, MINIDRONE_SCHEMA])
    }

    /// Build a catalog from JSON project documents
    ///
    /// # Errors
    ///
    /// Returns an error if a document does not parse or if two documents
    /// declare the same project name or id.
    pub fn from_json(documents: &[&str]) -> Result<Self> {
        let mut catalog = SchemaCatalog { projects: Vec::new() };
        for doc in documents {
            let project: ProjectDef = serde_json::from_str(doc)?;
            if catalog.projects.iter().any(|p| p.name == project.name || p.id == project.id) {
                return Err(Error::Configuration(format!(
                    "project {} (id {}) declared twice",
                    project.name, project.id
                )));
            }
            catalog.projects.push(project);
        }
        Ok(catalog)
    }

    /// Replace (or add) a project, keyed by its name
    pub fn with_project(mut self, project: ProjectDef) -> Self {
        self.projects.retain(|p| p.name != project.name);
        self.projects.push(project);
        self
    }

    /// All projects of the catalog
    pub fn projects(&self) -> &[ProjectDef] {
        &self.projects
    }

    /// Find a project by name
    pub fn project(&self, name: &str) -> Option<&ProjectDef> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Projects searched for a family: the family project first, then the shared one
    pub fn search_order(&self, family: DroneFamily) -> Vec<&ProjectDef> {
        [family.project_name(), COMMON_PROJECT]
            .iter()
            .filter_map(|name| self.project(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = SchemaCatalog::builtin().unwrap();
        assert_eq!(catalog.projects().len(), 3);
        assert_eq!(catalog.project("common").unwrap().id, 0);
        assert_eq!(catalog.project("ardrone3").unwrap().id, 1);
        assert_eq!(catalog.project("minidrone").unwrap().id, 2);
    }

    #[test]
    fn test_search_order_puts_family_first() {
        let catalog = SchemaCatalog::builtin().unwrap();
        let order: Vec<&str> = catalog
            .search_order(DroneFamily::Minidrone)
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(order, vec!["minidrone", "common"]);
    }

    #[test]
    fn test_schema_entry_field_names() {
        let catalog = SchemaCatalog::builtin().unwrap();
        let project = catalog.project("minidrone").unwrap();
        let (class, cmd) = project.command_by_name("UsbAccessoryState", "ClawState").unwrap();
        let descriptor = CommandDescriptor::new(project.id, class.id, cmd.id);
        let entry = SchemaEntry::from_command(descriptor, cmd);

        let names: Vec<&str> = entry.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ClawState_id", "ClawState_state", "ClawState_list_flags"]);
        assert!(matches!(entry.fields[1].field_type, Some(FieldType::Enum(ref n)) if n.len() == 4));
    }

    #[test]
    fn test_command_without_args_is_pure_notification() {
        let catalog = SchemaCatalog::builtin().unwrap();
        let project = catalog.project("ardrone3").unwrap();
        let (class, cmd) = project.command_by_name("PilotingState", "FlatTrimChanged").unwrap();
        let entry = SchemaEntry::from_command(CommandDescriptor::new(1, class.id, cmd.id), cmd);

        assert_eq!(entry.fields.len(), 1);
        assert_eq!(entry.fields[0].name, "FlatTrimChanged");
        assert_eq!(entry.fields[0].field_type, None);
    }

    #[test]
    fn test_unknown_type_name_is_kept() {
        assert_eq!(FieldType::from_schema_name("u128", &[]), FieldType::Unknown("u128".to_string()));
        assert_eq!(FieldType::Unknown("u128".to_string()).width(), None);
    }

    #[test]
    fn test_duplicate_project_is_rejected() {
        let doc = r#"{ "name": "extra", "id": 9, "classes": [] }"#;
        assert!(SchemaCatalog::from_json(&[doc, doc]).is_err());
    }

    #[test]
    fn test_with_project_replaces_by_name() {
        let catalog = SchemaCatalog::builtin().unwrap();
        let replacement = ProjectDef { name: "minidrone".to_string(), id: 2, classes: Vec::new() };
        let catalog = catalog.with_project(replacement);
        assert_eq!(catalog.projects().len(), 3);
        assert!(catalog.project("minidrone").unwrap().classes.is_empty());
    }
}
