use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// State of one published entity (`thermiq.indoor_t`,
/// `input_number.thermiq_curve`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Event fired on every entity write.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

/// Counters for the health endpoint.
pub struct Metrics {
    pub state_changes: AtomicU64,
    pub events_fired: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            state_changes: AtomicU64::new(0),
            events_fired: AtomicU64::new(0),
        }
    }
}

/// Entity registry: last state per entity id plus a broadcast bus of
/// changes that the automation rules subscribe to.
pub struct StateMachine {
    states: Arc<DashMap<String, EntityState>>,
    event_tx: broadcast::Sender<StateChangedEvent>,
    pub metrics: Metrics,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
            metrics: Metrics::new(),
        }
    }

    pub fn get_all(&self) -> Vec<EntityState> {
        self.states
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Current attributes of an entity, or empty if it doesn't exist.
    pub fn attributes(&self, entity_id: &str) -> serde_json::Map<String, Value> {
        self.get(entity_id)
            .map(|s| s.attributes)
            .unwrap_or_default()
    }

    /// Set entity state, firing a state_changed event. `last_changed`
    /// only advances when the state string actually differs.
    pub fn set(
        &self,
        entity_id: String,
        state: String,
        attributes: serde_json::Map<String, Value>,
    ) -> EntityState {
        let now = Utc::now();
        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state { now } else { prev.last_changed };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            context: Context::new(),
        };

        self.states.insert(entity_id.clone(), new_state.clone());

        // Ignore send errors: no subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: new_state.clone(),
        });

        self.metrics.state_changes.fetch_add(1, Ordering::Relaxed);
        self.metrics.events_fired.fetch_add(1, Ordering::Relaxed);

        new_state
    }

    /// Set state while keeping the entity's existing attributes.
    pub fn set_keep_attrs(&self, entity_id: &str, state: String) -> EntityState {
        let attrs = self.attributes(entity_id);
        self.set(entity_id.to_string(), state, attrs)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Last-seen raw register values, keyed by canonical hex key, plus the
/// running inbound message counter. Bounded by what the device actually
/// sends; entries are never removed.
pub struct DeviceState {
    regs: DashMap<String, Value>,
    msg_counter: AtomicU64,
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            regs: DashMap::new(),
            msg_counter: AtomicU64::new(0),
        }
    }

    pub fn get(&self, reg: &str) -> Option<Value> {
        self.regs.get(reg).map(|entry| entry.value().clone())
    }

    pub fn set(&self, reg: String, value: Value) {
        self.regs.insert(reg, value);
    }

    /// Number of telemetry messages processed since startup.
    pub fn msg_count(&self) -> u64 {
        self.msg_counter.load(Ordering::Relaxed)
    }

    pub fn count_message(&self) {
        self.msg_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}
