use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// Table en mémoire indexée par hôte (handles agents, suivis hors-ligne)
pub type HostTable<V> = Shared<HashMap<String, V>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn new_host_table<V>() -> HostTable<V> {
    new_state(HashMap::new())
}
