use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every generated descriptor is deployed as version 1
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Name of the single model inside a generated descriptor
pub const MODEL_NAME: &str = "ispn";

/// Model property naming the schema resource to import
pub const PROTOBUF_IMPORT_PROPERTY: &str = "importer.ProtobufName";

/// Deployment unit binding a logical schema name to a translator, a data
/// source and the schema resource that describes its tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub version: u32,
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub sources: Vec<SourceBinding>,
    #[serde(default)]
    pub metadata_type: MetadataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBinding {
    pub name: String,
    pub translator_name: String,
    pub connection_name: String,
}

/// Where a model's metadata comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetadataType {
    /// Imported by the translator from the data source itself
    #[default]
    Native,
}

impl SchemaDescriptor {
    pub fn key(&self) -> DescriptorKey {
        DescriptorKey::new(&self.name, self.version)
    }

    /// The only model and source binding, when the descriptor has exactly one of each
    pub fn single_source(&self) -> Option<(&ModelDescriptor, &SourceBinding)> {
        match self.models.as_slice() {
            [model] => match model.sources.as_slice() {
                [source] => Some((model, source)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Identity of a deployed descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub name: String,
    pub version: u32,
}

impl DescriptorKey {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
        }
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// A schema-description file (a `.proto` definition) stored in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtobufResource {
    pub identifier: String,
    pub contents: String,
}

impl ProtobufResource {
    pub fn new(identifier: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            contents: contents.into(),
        }
    }
}
