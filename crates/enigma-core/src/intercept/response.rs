use super::{Request, ResponseInterceptor};
use crate::error::{EnigmaError, Result};
use crate::patch::{apply, Patch};
use crate::schema::OutKey;
use crate::session::{ApiCache, Session};
use crate::transport::EngineErrorBody;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

/// Turns an `error` member into a rejected call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorResponse;

#[async_trait]
impl ResponseInterceptor for ErrorResponse {
    async fn on_fulfilled(
        &self,
        _session: &Session,
        _request: &Request,
        response: Value,
    ) -> Result<Value> {
        match response.get("error") {
            Some(error) => {
                let body: EngineErrorBody = serde_json::from_value(error.clone())?;
                Err(body.into())
            }
            None => Ok(response),
        }
    }
}

/// Rebuilds full values from delta responses.
///
/// Every member of a delta `result` is a patch list. The patched value is
/// cached per (handle, method, member) so the next delta applies on top of it.
///
/// Responses to calls sent through [`Session::send`] are rebuilt by the
/// session as their frames arrive, so deltas for one handle apply in wire
/// order. This step rebuilds whatever still carries the `delta` flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaResponse;

impl DeltaResponse {
    /// Split a delta `result` into per-member patch lists.
    pub fn parse_patches(result: &Value) -> Result<Vec<(String, Vec<Patch>)>> {
        let members = result.as_object().ok_or(EnigmaError::ExpectedArrayOfPatches)?;
        members
            .iter()
            .map(|(key, patches)| {
                if !patches.is_array() {
                    return Err(EnigmaError::ExpectedArrayOfPatches);
                }
                let patches: Vec<Patch> = serde_json::from_value(patches.clone())?;
                Ok((key.clone(), patches))
            })
            .collect()
    }

    /// Rebuild one member from its cached value and a patch list.
    ///
    /// A lone root patch carrying a primitive (including null) replaces the
    /// value outright. Otherwise patches apply to the cached container, or to
    /// an empty container shaped like the first patch's value.
    pub fn patch_value(cached: Option<Value>, patches: &[Patch]) -> Result<Value> {
        if let [only] = patches {
            if only.is_root() && !only.has_container_value() {
                return Ok(only.value.clone().unwrap_or(Value::Null));
            }
        }
        let mut target = match cached {
            Some(value) if value.is_object() || value.is_array() => value,
            _ => match patches.first().and_then(|p| p.value.as_ref()) {
                Some(Value::Array(_)) => Value::Array(Vec::new()),
                _ => Value::Object(Map::new()),
            },
        };
        apply(&mut target, patches)?;
        Ok(target)
    }

    /// Rebuild a delta envelope in place against the patchees of `handle`.
    ///
    /// Envelopes without the `delta` flag are left alone. Nothing is cached
    /// unless every member patches cleanly.
    pub fn rebuild(
        cache: &mut ApiCache,
        handle: i64,
        method: &str,
        response: &mut Value,
    ) -> Result<()> {
        if response.get("delta").and_then(Value::as_bool) != Some(true) {
            return Ok(());
        }
        let members = Self::parse_patches(response.get("result").unwrap_or(&Value::Null))?;

        let mut rebuilt = Map::new();
        for (key, patches) in members {
            let cached = cache.get_patchee(handle, &patchee_key(method, &key));
            rebuilt.insert(key, Self::patch_value(cached, &patches)?);
        }
        for (key, value) in &rebuilt {
            let cache_key = patchee_key(method, key);
            if !cache.set_patchee(handle, &cache_key, value.clone()) {
                debug!("No API for handle {}; delta for {} not cached", handle, cache_key);
            }
        }

        if let Some(envelope) = response.as_object_mut() {
            envelope.remove("delta");
            envelope.insert("result".to_string(), Value::Object(rebuilt));
        }
        Ok(())
    }
}

fn patchee_key(method: &str, member: &str) -> String {
    format!("{}-{}", method, member)
}

#[async_trait]
impl ResponseInterceptor for DeltaResponse {
    async fn on_fulfilled(
        &self,
        session: &Session,
        request: &Request,
        mut response: Value,
    ) -> Result<Value> {
        session.rebuild_delta(request.handle, &request.method, &mut response)?;
        Ok(response)
    }
}

/// Unwraps the `result` member.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultResponse;

#[async_trait]
impl ResponseInterceptor for ResultResponse {
    async fn on_fulfilled(
        &self,
        _session: &Session,
        _request: &Request,
        response: Value,
    ) -> Result<Value> {
        Ok(match response {
            Value::Object(mut envelope) => envelope.remove("result").unwrap_or(Value::Null),
            _ => Value::Null,
        })
    }
}

/// Selects the declared output out of the result object.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutParamResponse;

impl OutParamResponse {
    /// Pick `qReturn`, then the single declared output, then the whole result.
    ///
    /// Session-app creation backfills `qGenericId` from `qSessionAppId`, and
    /// `GetInteractUuid` never exposes its `qReturn`.
    pub fn unwrap_out_param(method: &str, out_key: &OutKey, mut result: Value) -> Value {
        match method {
            "CreateSessionApp" | "CreateSessionAppFromApp" => {
                let app_id = result.get("qSessionAppId").cloned();
                if let (Some(app_id), Some(Value::Object(ret))) =
                    (app_id, result.get_mut("qReturn"))
                {
                    ret.entry("qGenericId").or_insert(app_id);
                }
            }
            "GetInteractUuid" => {
                if let Some(map) = result.as_object_mut() {
                    map.remove("qReturn");
                }
            }
            _ => {}
        }

        if let Some(map) = result.as_object_mut() {
            if let Some(ret) = map.remove("qReturn") {
                return ret;
            }
            if let OutKey::Named(name) = out_key {
                return map.remove(name).unwrap_or(Value::Null);
            }
        }
        result
    }
}

#[async_trait]
impl ResponseInterceptor for OutParamResponse {
    async fn on_fulfilled(
        &self,
        _session: &Session,
        request: &Request,
        response: Value,
    ) -> Result<Value> {
        Ok(Self::unwrap_out_param(
            &request.method,
            &request.out_key,
            response,
        ))
    }
}
