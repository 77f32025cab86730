//! Per-schema registry of generated types and mixed-in prototypes.
//!
//! A `Schema` owns its memo tables, so sessions built from different schema
//! documents never share generated prototypes.

use super::api::{Api, MethodFn, Prototype};
use super::definition::{MethodDef, SchemaDocument, TypeDef};
use super::mixin::{BoundMethod, Mixin};
use crate::error::{EnigmaError, Result};
use crate::intercept::Request;
use crate::lock;
use crate::session::SessionInner;
use futures::future::{self, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Schema document plus registered mixins.
pub struct Schema {
    document: SchemaDocument,
    mixins: Vec<Mixin>,
    types: Mutex<HashMap<String, Arc<TypeDef>>>,
    prototypes: Mutex<HashMap<(String, String), Prototype>>,
}

impl Schema {
    /// Build a registry, validating every mixin that targets a schema type.
    ///
    /// Mixins that only target generic types are validated the first time an
    /// object of that generic type is created.
    pub fn new(document: SchemaDocument, mixins: Vec<Mixin>) -> Result<Self> {
        let schema = Self {
            document,
            mixins,
            types: Mutex::new(HashMap::new()),
            prototypes: Mutex::new(HashMap::new()),
        };
        let targeted: Vec<String> = schema
            .mixins
            .iter()
            .flat_map(|m| m.types.iter())
            .filter(|t| schema.document.has_type(t))
            .cloned()
            .collect();
        for type_name in targeted {
            schema.prototype(&type_name, &type_name)?;
        }
        Ok(schema)
    }

    pub fn document(&self) -> &SchemaDocument {
        &self.document
    }

    pub fn mixins(&self) -> &[Mixin] {
        &self.mixins
    }

    /// Method table for `type_name`. Memoized.
    pub fn generate(&self, type_name: &str) -> Result<Arc<TypeDef>> {
        if let Some(def) = lock(&self.types).get(type_name) {
            return Ok(def.clone());
        }
        let methods = self.document.structs.get(type_name).ok_or_else(|| {
            EnigmaError::SchemaStructTypeNotFound {
                type_name: type_name.to_string(),
            }
        })?;
        let def = Arc::new(TypeDef::from_schema(type_name, methods));
        lock(&self.types).insert(type_name.to_string(), def.clone());
        Ok(def)
    }

    /// Prototype for objects of `type_name` carrying `generic_type`. Memoized.
    ///
    /// Schema methods come first, then mixins targeting `type_name`, then
    /// mixins targeting `generic_type` (when it differs), each group in
    /// registration order.
    pub fn prototype(&self, type_name: &str, generic_type: &str) -> Result<Prototype> {
        let key = (type_name.to_string(), generic_type.to_string());
        if let Some(prototype) = lock(&self.prototypes).get(&key) {
            return Ok(prototype.clone());
        }

        let def = self.generate(type_name)?;
        let mut methods: HashMap<String, MethodFn> = def
            .methods
            .values()
            .map(|method| (method.name.clone(), schema_method(Arc::new(method.clone()))))
            .collect();

        for mixin in self.mixins.iter().filter(|m| m.applies_to(type_name)) {
            apply_mixin(&mut methods, mixin, type_name)?;
        }
        if generic_type != type_name {
            for mixin in self
                .mixins
                .iter()
                .filter(|m| m.applies_to(generic_type) && !m.applies_to(type_name))
            {
                apply_mixin(&mut methods, mixin, generic_type)?;
            }
        }

        debug!(
            "Generated prototype for {}/{} ({} methods)",
            type_name,
            generic_type,
            methods.len()
        );
        let prototype: Prototype = Arc::new(methods);
        lock(&self.prototypes).insert(key, prototype.clone());
        Ok(prototype)
    }

    /// Instantiate an API object and run the matching mixins' init hooks.
    pub(crate) fn create(
        &self,
        session: Weak<SessionInner>,
        handle: i64,
        id: &str,
        type_name: &str,
        generic_type: Option<&str>,
    ) -> Result<Arc<Api>> {
        let generic_type = generic_type.unwrap_or(type_name);
        let prototype = self.prototype(type_name, generic_type)?;
        let api = Arc::new(Api::new(
            session,
            handle,
            id,
            type_name,
            generic_type,
            prototype,
        ));
        for mixin in &self.mixins {
            if mixin.applies_to(type_name) || mixin.applies_to(generic_type) {
                if let Some(init) = &mixin.init {
                    init(&api);
                }
            }
        }
        Ok(api)
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("types", &self.document.structs.keys().collect::<Vec<_>>())
            .field("mixins", &self.mixins.len())
            .finish()
    }
}

/// A schema method: expand named params and forward to the session.
fn schema_method(def: Arc<MethodDef>) -> MethodFn {
    Arc::new(move |api: Arc<Api>, args: Vec<Value>| {
        let params = def.expand_named(args);
        let request = Request::new(api.handle(), def.name.clone(), params)
            .with_out_key(def.out_key.clone());
        match api.session() {
            Some(session) => session.send(request).boxed(),
            None => future::ready(Err(EnigmaError::not_connected("Session dropped"))).boxed(),
        }
    })
}

fn apply_mixin(
    methods: &mut HashMap<String, MethodFn>,
    mixin: &Mixin,
    type_name: &str,
) -> Result<()> {
    for (name, wrapper) in &mixin.overrides {
        let original = methods.get(name).cloned().ok_or_else(|| {
            EnigmaError::SchemaMixinCantOverrideFunction {
                type_name: type_name.to_string(),
                method: name.clone(),
            }
        })?;
        let wrapper = wrapper.clone();
        let wrapped: MethodFn = Arc::new(move |api: Arc<Api>, args: Vec<Value>| {
            wrapper(BoundMethod::new(api, original.clone()), args)
        });
        methods.insert(name.clone(), wrapped);
    }
    for (name, method) in &mixin.extend {
        if methods.contains_key(name) {
            return Err(EnigmaError::SchemaMixinExtendNotAllowed {
                type_name: type_name.to_string(),
                method: name.clone(),
            });
        }
        methods.insert(name.clone(), method.clone());
    }
    Ok(())
}
