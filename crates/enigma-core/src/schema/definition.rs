//! The engine's wire schema: type name → method table.
//!
//! ```json
//! {
//!   "structs": {
//!     "Doc": {
//!       "GetObject": { "In": [{ "Name": "qId", "DefaultValue": "" }], "Out": [] }
//!     }
//!   }
//! }
//! ```

use crate::error::{EnigmaError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Parsed schema document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub structs: BTreeMap<String, BTreeMap<String, MethodSchema>>,
}

/// One remote method as declared in the schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSchema {
    #[serde(rename = "In", default)]
    pub inputs: Vec<ParamSchema>,
    #[serde(rename = "Out", default)]
    pub outputs: Vec<OutParamSchema>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutParamSchema {
    #[serde(rename = "Name")]
    pub name: String,
}

impl SchemaDocument {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EnigmaError::Io {
            message: format!("Failed to read schema {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&content)
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.structs.contains_key(type_name)
    }
}

/// Which part of a result a method returns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum OutKey {
    /// The method declares exactly one output.
    Named(String),
    /// Zero or several outputs: the whole result object.
    #[default]
    Full,
}

impl OutKey {
    fn from_outputs(outputs: &[OutParamSchema]) -> Self {
        match outputs {
            [only] => OutKey::Named(only.name.clone()),
            _ => OutKey::Full,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            OutKey::Named(name) => Some(name),
            OutKey::Full => None,
        }
    }
}

/// A method ready to be called: declared parameters plus its out key.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<ParamSchema>,
    pub out_key: OutKey,
}

impl MethodDef {
    pub fn from_schema(name: &str, schema: &MethodSchema) -> Self {
        Self {
            name: name.to_string(),
            params: schema.inputs.clone(),
            out_key: OutKey::from_outputs(&schema.outputs),
        }
    }

    /// Expand a named-parameter call into positional arguments.
    ///
    /// A single object argument whose keys all name declared parameters is
    /// expanded in declared order; omitted parameters take their declared
    /// default (null without one). Any other call shape is returned as is.
    pub fn expand_named(&self, args: Vec<Value>) -> Vec<Value> {
        let named = match args.as_slice() {
            [Value::Object(map)]
                if map
                    .keys()
                    .all(|key| self.params.iter().any(|p| &p.name == key)) =>
            {
                map
            }
            _ => return args,
        };

        self.params
            .iter()
            .map(|param| match named.get(&param.name) {
                Some(value) => value.clone(),
                None => param.default_value.clone().unwrap_or(Value::Null),
            })
            .collect()
    }
}

/// All methods of one schema type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub name: String,
    pub methods: BTreeMap<String, MethodDef>,
}

impl TypeDef {
    pub(crate) fn from_schema(name: &str, methods: &BTreeMap<String, MethodSchema>) -> Self {
        Self {
            name: name.to_string(),
            methods: methods
                .iter()
                .map(|(method, schema)| (method.clone(), MethodDef::from_schema(method, schema)))
                .collect(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.get(name)
    }
}
