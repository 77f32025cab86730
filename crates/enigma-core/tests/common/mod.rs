//! Scripted in-memory engine shared by the integration tests.

#![allow(dead_code)]

use enigma_core::{
    MemoryAcceptor, MemoryNetwork, MemoryPeer, SchemaDocument, Session, SessionBuilder,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const URL: &str = "memory://engine";

/// Load the engine schema fixture.
pub fn schema() -> SchemaDocument {
    let path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/engine-schema.json");
    SchemaDocument::from_file(path).expect("Failed to load schema fixture")
}

/// A builder wired to a fresh in-memory network.
pub fn builder() -> (SessionBuilder, MemoryAcceptor) {
    let (network, acceptor) = MemoryNetwork::new();
    let builder = Session::builder()
        .url(URL)
        .schema(schema())
        .socket_factory(network)
        .attach_timeout(Duration::from_millis(200));
    (builder, acceptor)
}

/// Send a successful response to `request`.
pub fn reply(peer: &MemoryPeer, request: &Value, result: Value) {
    assert!(peer.send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": result})));
}

enum Command {
    Push(Value),
    Drop,
}

#[derive(Clone)]
enum Target {
    Doc,
    Object(String),
}

struct StoredObject {
    generic_type: String,
    props: Value,
}

struct EngineState {
    attached: bool,
    announce: bool,
    drop_on: Option<String>,
    connections: usize,
    next_handle: i64,
    doc_name: Option<String>,
    objects: BTreeMap<String, StoredObject>,
    requests: Vec<Value>,
}

/// An engine that remembers documents and objects across connections.
///
/// Every connection hands out new handles. On reconnect the engine announces
/// `SESSION_ATTACHED` (documents and objects survive) or `SESSION_CREATED`
/// (objects are forgotten and no document is active).
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
    commands: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
    _task: JoinHandle<()>,
}

impl FakeEngine {
    pub fn start(acceptor: MemoryAcceptor) -> Self {
        let state = Arc::new(Mutex::new(EngineState {
            attached: true,
            announce: true,
            drop_on: None,
            connections: 0,
            next_handle: 1,
            doc_name: None,
            objects: BTreeMap::new(),
            requests: Vec::new(),
        }));
        let commands = Arc::new(Mutex::new(None));
        let task = tokio::spawn(serve(acceptor, state.clone(), commands.clone()));
        Self {
            state,
            commands,
            _task: task,
        }
    }

    /// Whether reconnects keep the server session.
    pub fn set_attached(&self, attached: bool) {
        self.state.lock().unwrap().attached = attached;
    }

    /// Whether connections are announced with `OnConnected`.
    pub fn set_announce(&self, announce: bool) {
        self.state.lock().unwrap().announce = announce;
    }

    /// Drop the connection instead of answering `method`.
    pub fn set_drop_on(&self, method: Option<&str>) {
        self.state.lock().unwrap().drop_on = method.map(str::to_string);
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Every request received for `method`, oldest first.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    /// Push a raw frame on the current connection.
    pub fn push(&self, message: Value) {
        self.command(Command::Push(message));
    }

    /// Drop the current connection without a close handshake.
    pub fn drop_connection(&self) {
        self.command(Command::Drop);
    }

    fn command(&self, command: Command) {
        if let Some(tx) = self.commands.lock().unwrap().as_ref() {
            let _ = tx.send(command);
        }
    }
}

async fn serve(
    mut acceptor: MemoryAcceptor,
    state: Arc<Mutex<EngineState>>,
    commands: Arc<Mutex<Option<mpsc::UnboundedSender<Command>>>>,
) {
    while let Some(peer) = acceptor.accept().await {
        let (tx, rx) = mpsc::unbounded_channel();
        *commands.lock().unwrap() = Some(tx);
        tokio::spawn(connection(peer, state.clone(), rx));
    }
}

async fn connection(
    mut peer: MemoryPeer,
    state: Arc<Mutex<EngineState>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let announcement = {
        let mut state = state.lock().unwrap();
        state.connections += 1;
        let reattached = state.connections > 1 && state.attached;
        if !reattached {
            state.objects.clear();
            if state.connections > 1 {
                state.doc_name = None;
            }
        }
        let session_state = if reattached { "SESSION_ATTACHED" } else { "SESSION_CREATED" };
        state.announce.then_some(session_state)
    };
    if let Some(session_state) = announcement {
        peer.notify("OnConnected", json!({"qSessionState": session_state}));
    }

    let mut handles: HashMap<i64, Target> = HashMap::new();
    loop {
        tokio::select! {
            request = peer.recv() => match request {
                Some(request) => {
                    let dropped = {
                        let state = state.lock().unwrap();
                        state.drop_on.is_some()
                            && request["method"].as_str() == state.drop_on.as_deref()
                    };
                    if dropped {
                        break;
                    }
                    let response = respond(&state, &mut handles, &request);
                    peer.send(&response);
                }
                None => break,
            },
            command = commands.recv() => match command {
                Some(Command::Push(message)) => {
                    peer.send(&message);
                }
                Some(Command::Drop) | None => break,
            },
        }
    }
}

fn respond(
    state: &Mutex<EngineState>,
    handles: &mut HashMap<i64, Target>,
    request: &Value,
) -> Value {
    let mut state = state.lock().unwrap();
    state.requests.push(request.clone());

    let method = request["method"].as_str().unwrap_or_default().to_string();
    let handle = request["handle"].as_i64().unwrap_or_default();
    let params = request["params"].as_array().cloned().unwrap_or_default();
    let target = handles.get(&handle).cloned();
    let mut extra = Map::new();

    let outcome: Result<Value, (i64, &str)> = match (handle, target, method.as_str()) {
        (-1, _, "EngineVersion") => Ok(json!({"qVersion": {"qComponentVersion": "12.1"}})),
        (-1, _, "OpenDoc") => {
            let name = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            state.doc_name = Some(name.clone());
            let doc = allocate(&mut state, handles, Target::Doc);
            Ok(json!({"qReturn": {"qHandle": doc, "qType": "Doc", "qGenericId": name}}))
        }
        (-1, _, "GetActiveDoc") => match state.doc_name.clone() {
            Some(name) => {
                let active = handles
                    .iter()
                    .find(|(_, t)| matches!(t, Target::Doc))
                    .map(|(doc, _)| *doc);
                let doc = match active {
                    Some(doc) => doc,
                    None => allocate(&mut state, handles, Target::Doc),
                };
                Ok(json!({"qReturn": {"qHandle": doc, "qType": "Doc", "qGenericId": name}}))
            }
            None => Err((1007, "App invalid")),
        },
        (-1, _, "CreateSessionApp") => {
            let doc = allocate(&mut state, handles, Target::Doc);
            Ok(json!({
                "qReturn": {"qHandle": doc, "qType": "Doc"},
                "qSessionAppId": "SessionApp_0001"
            }))
        }
        (_, Some(Target::Doc), "CreateObject") => {
            let props = params.first().cloned().unwrap_or_else(|| json!({}));
            let id = props["qInfo"]["qId"].as_str().unwrap_or_default().to_string();
            let generic_type = props["qInfo"]["qType"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            state.objects.insert(
                id.clone(),
                StoredObject {
                    generic_type: generic_type.clone(),
                    props,
                },
            );
            let object = allocate(&mut state, handles, Target::Object(id.clone()));
            Ok(json!({
                "qInfo": {"qId": id, "qType": generic_type},
                "qReturn": {
                    "qHandle": object,
                    "qType": "GenericObject",
                    "qGenericType": generic_type,
                    "qGenericId": id
                }
            }))
        }
        (_, Some(Target::Doc), "GetObject") => {
            let id = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match state.objects.get(&id).map(|o| o.generic_type.clone()) {
                Some(generic_type) => {
                    let object = allocate(&mut state, handles, Target::Object(id.clone()));
                    Ok(json!({"qReturn": {
                        "qHandle": object,
                        "qType": "GenericObject",
                        "qGenericType": generic_type,
                        "qGenericId": id
                    }}))
                }
                None => Ok(json!({"qReturn": {"qHandle": null, "qType": null}})),
            }
        }
        (_, Some(Target::Doc), "GetAppLayout") => {
            Ok(json!({"qLayout": {"qTitle": state.doc_name.clone().unwrap_or_default()}}))
        }
        (_, Some(Target::Object(id)), "GetProperties") => match state.objects.get(&id) {
            Some(object) => Ok(json!({"qProp": object.props})),
            None => Err((2, "Object not found")),
        },
        (_, Some(Target::Object(id)), "GetLayout") => match state.objects.get(&id) {
            Some(object) => Ok(json!({"qLayout": object.props})),
            None => Err((2, "Object not found")),
        },
        (_, Some(Target::Object(id)), "SetProperties") => match state.objects.get_mut(&id) {
            Some(object) => {
                object.props = params.first().cloned().unwrap_or_else(|| json!({}));
                extra.insert("change".to_string(), json!([handle]));
                Ok(json!({}))
            }
            None => Err((2, "Object not found")),
        },
        (_, _, "Resume") => Ok(json!({})),
        _ => Err((-32601, "Method not found")),
    };

    let mut response = json!({"jsonrpc": "2.0", "id": request["id"]});
    match outcome {
        Ok(result) if request["delta"] == true => {
            let patched: Map<String, Value> = result
                .as_object()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| {
                    (key, json!([{"op": "add", "path": "/", "value": value}]))
                })
                .collect();
            response["result"] = Value::Object(patched);
            response["delta"] = json!(true);
        }
        Ok(result) => response["result"] = result,
        Err((code, message)) => response["error"] = json!({"code": code, "message": message}),
    }
    if let Some(envelope) = response.as_object_mut() {
        envelope.extend(extra);
    }
    response
}

fn allocate(state: &mut EngineState, handles: &mut HashMap<i64, Target>, target: Target) -> i64 {
    let handle = state.next_handle;
    state.next_handle += 1;
    handles.insert(handle, target);
    handle
}
