//! Schema-driven API factory.
//!
//! The engine publishes its object model as a schema (type → methods with
//! declared inputs and outputs). [`Schema`] turns each type into a method
//! table, layers caller mixins on top and instantiates [`Api`] objects.

mod api;
mod definition;
mod mixin;
mod registry;

pub use api::{Api, ApiEvent, MethodFn, MethodFuture, Prototype, Reply};
pub use definition::{
    MethodDef, MethodSchema, OutKey, OutParamSchema, ParamSchema, SchemaDocument, TypeDef,
};
pub use mixin::{BoundMethod, InitFn, Mixin, OverrideFn};
pub use registry::Schema;
