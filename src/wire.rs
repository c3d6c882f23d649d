use serde_json::{Map, Value};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

/// Name of the server event that forces a re-pull of the picker state
pub const REFRESH_MAP_EVENT: &str = "refreshMap";

/// Event pushed by the server side of the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    RefreshMap,
    Other(String),
}

impl ServerEvent {
    pub fn from_name(name: &str) -> Self {
        match name {
            REFRESH_MAP_EVENT => ServerEvent::RefreshMap,
            other => ServerEvent::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServerEvent::RefreshMap => REFRESH_MAP_EVENT,
            ServerEvent::Other(name) => name,
        }
    }
}

/// Remote form state the picker reflects.
///
/// Paths are dot separated (`data.location.lat`). The picker never owns this
/// state, it reads through `get` and merges through `set`.
pub trait RemoteState {
    fn get(&self, path: &str) -> Option<Value>;
    fn set(&mut self, path: &str, value: Value, should_commit: bool);
    /// Ask the server to re-render from the current state
    fn refresh(&mut self);
    /// Register interest in a named server event
    fn subscribe(&mut self, event: &str);
    /// Server events received since the last call
    fn take_server_events(&mut self) -> Vec<ServerEvent>;
}

/// In-process wire keeping the state as a JSON tree.
///
/// Used by hosts without a server round trip, and by the tests.
#[derive(Debug, Default)]
pub struct MemoryWire {
    root: Value,
    subscribed: HashSet<String>,
    events: Vec<ServerEvent>,
    gets: Cell<usize>,
    pub sets: Vec<(String, Value, bool)>,
    pub refreshes: usize,
}

impl MemoryWire {
    pub fn new() -> Self {
        Self { root: Value::Object(Map::new()), ..Default::default() }
    }

    pub fn with_state(root: Value) -> Self {
        Self { root, ..Self::new() }
    }

    /// Number of `get` calls served so far
    pub fn reads(&self) -> usize {
        self.gets.get()
    }

    pub fn state(&self) -> &Value {
        &self.root
    }

    /// Queue a server event, dropped unless someone subscribed to it
    pub fn dispatch(&mut self, name: &str) -> bool {
        if !self.subscribed.contains(name) {
            return false;
        }
        self.events.push(ServerEvent::from_name(name));
        true
    }

    /// Write without recording, as the server side would
    pub fn put(&mut self, path: &str, value: Value) {
        write_path(&mut self.root, path, value);
    }
}

impl RemoteState for MemoryWire {
    fn get(&self, path: &str) -> Option<Value> {
        self.gets.set(self.gets.get() + 1);
        read_path(&self.root, path).filter(|v| !v.is_null()).cloned()
    }

    fn set(&mut self, path: &str, value: Value, should_commit: bool) {
        self.sets.push((path.to_string(), value.clone(), should_commit));
        write_path(&mut self.root, path, value);
    }

    fn refresh(&mut self) {
        self.refreshes += 1;
    }

    fn subscribe(&mut self, event: &str) {
        self.subscribed.insert(event.to_string());
    }

    fn take_server_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }
}

/// A wire shared between the picker and the rest of the host
impl<T: RemoteState> RemoteState for Rc<RefCell<T>> {
    fn get(&self, path: &str) -> Option<Value> {
        self.borrow().get(path)
    }

    fn set(&mut self, path: &str, value: Value, should_commit: bool) {
        self.borrow_mut().set(path, value, should_commit)
    }

    fn refresh(&mut self) {
        self.borrow_mut().refresh()
    }

    fn subscribe(&mut self, event: &str) {
        self.borrow_mut().subscribe(event)
    }

    fn take_server_events(&mut self) -> Vec<ServerEvent> {
        self.borrow_mut().take_server_events()
    }
}

pub fn read_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub fn write_path(root: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    let mut node = root;
    for key in path.split('.') {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map.entry(key.to_string()).or_insert(Value::Null),
            _ => return,
        };
    }
    *node = value;
}

/// Merge `fields` into the object found at `current`, keeping sibling keys
pub fn merge_object(current: Option<Value>, fields: Map<String, Value>) -> Value {
    let mut base = match current {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    base.extend(fields);
    Value::Object(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_and_writes_dotted_paths() {
        let mut wire = MemoryWire::new();
        wire.set("data.location", json!({"lat": 1, "lng": 2}), false);
        assert_eq!(wire.get("data.location.lat"), Some(json!(1)));
        assert_eq!(wire.get("data.missing"), None);
        assert_eq!(wire.sets.len(), 1);
        assert_eq!(wire.reads(), 2);
    }

    #[test]
    fn null_values_read_as_absent() {
        let wire = MemoryWire::with_state(json!({"data": {"location": null}}));
        assert_eq!(wire.get("data.location"), None);
    }

    #[test]
    fn array_segments_index_rows() {
        let wire = MemoryWire::with_state(json!({"rows": [{"distance": 5}, {"distance": 7}]}));
        assert_eq!(wire.get("rows.1.distance"), Some(json!(7)));
    }

    #[test]
    fn merge_keeps_siblings() {
        let mut fields = Map::new();
        fields.insert("lat".into(), json!(3.0));
        let merged = merge_object(Some(json!({"lat": 1.0, "geojson": {"type": "FeatureCollection"}})), fields);
        assert_eq!(merged, json!({"lat": 3.0, "geojson": {"type": "FeatureCollection"}}));
    }

    #[test]
    fn events_need_a_subscriber() {
        let mut wire = MemoryWire::new();
        assert!(!wire.dispatch(REFRESH_MAP_EVENT));
        wire.subscribe(REFRESH_MAP_EVENT);
        assert!(wire.dispatch(REFRESH_MAP_EVENT));
        assert_eq!(wire.take_server_events(), vec![ServerEvent::RefreshMap]);
        assert!(wire.take_server_events().is_empty());
    }
}
