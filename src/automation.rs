//! Bidirectional sync rules.
//!
//! Four fixed automations keep the UI helpers and the device in step:
//!
//! 1. any numeric helper edit -> `write_id` with the new value
//! 2. the room-sensor setpoint helper -> `set_indr_t`
//! 3. the mode select helper -> `write_id` with the option's index
//! 4. the reported mode register -> the select helper's displayed option
//!
//! Each rule runs single-instance (a firing is skipped while the rule
//! is already executing) and keeps a bounded trace of recent firings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::api::AppState;
use crate::helpers::{MODE_SELECT_ENTITY, ROOM_SENSOR_ENTITY};
use crate::services::ServiceRegistry;
use crate::state::StateChangedEvent;

/// How many firings each rule remembers.
const STORED_TRACES: usize = 5;

/// Entity the inbound handler mirrors the mode register onto.
const MODE_STATE_ENTITY: &str = "thermiq.main_mode";

/// What a rule does when it fires.
#[derive(Debug, Clone, Copy)]
enum RuleAction {
    /// Generic numeric helper -> write_id(trigger entity, new value).
    WriteIdFromState,
    /// Room-sensor helper -> set_indr_t(new value).
    SetIndoorTarget,
    /// Mode select helper -> write_id(trigger entity, option index).
    WriteModeIndex,
    /// Reported mode -> select helper shows the matching option.
    SyncModeSelect,
}

/// One firing of a rule.
#[derive(Debug, Clone)]
pub struct RuleTrace {
    pub fired_at: DateTime<Utc>,
    pub entity_id: String,
    pub state: String,
}

struct SyncRule {
    id: &'static str,
    alias: &'static str,
    trigger_entities: Vec<String>,
    action: RuleAction,
    running: AtomicBool,
    traces: Mutex<VecDeque<RuleTrace>>,
}

impl SyncRule {
    fn new(
        id: &'static str,
        alias: &'static str,
        trigger_entities: Vec<String>,
        action: RuleAction,
    ) -> Self {
        Self {
            id,
            alias,
            trigger_entities,
            action,
            running: AtomicBool::new(false),
            traces: Mutex::new(VecDeque::with_capacity(STORED_TRACES)),
        }
    }

    fn record(&self, event: &StateChangedEvent) {
        let mut traces = self.traces.lock().unwrap();
        if traces.len() == STORED_TRACES {
            traces.pop_front();
        }
        traces.push_back(RuleTrace {
            fired_at: Utc::now(),
            entity_id: event.entity_id.clone(),
            state: event.new_state.state.clone(),
        });
    }
}

pub struct AutomationEngine {
    rules: Vec<SyncRule>,
    app: Arc<AppState>,
    registry: Arc<ServiceRegistry>,
}

impl AutomationEngine {
    /// `numeric_helpers` is the entity list from the bootstrap - every
    /// numeric helper except the room-sensor setpoint.
    pub fn new(
        app: Arc<AppState>,
        registry: Arc<ServiceRegistry>,
        numeric_helpers: Vec<String>,
    ) -> Self {
        let rules = vec![
            SyncRule::new(
                "input_numbers_to_mqtt",
                "ThermIQ input numbers to MQTT",
                numeric_helpers,
                RuleAction::WriteIdFromState,
            ),
            SyncRule::new(
                "room_sensor_to_mqtt",
                "ThermIQ room sensor to MQTT",
                vec![ROOM_SENSOR_ENTITY.to_string()],
                RuleAction::SetIndoorTarget,
            ),
            SyncRule::new(
                "mode_select_to_mqtt",
                "ThermIQ mode select to MQTT",
                vec![MODE_SELECT_ENTITY.to_string()],
                RuleAction::WriteModeIndex,
            ),
            SyncRule::new(
                "mode_to_select",
                "ThermIQ mode to select",
                vec![MODE_STATE_ENTITY.to_string()],
                RuleAction::SyncModeSelect,
            ),
        ];

        for rule in &rules {
            tracing::info!(
                "  [{}] {} - {} trigger(s)",
                rule.id,
                rule.alias,
                rule.trigger_entities.len()
            );
        }

        Self { rules, app, registry }
    }

    /// Consume the state-changed stream. Runs until the state machine
    /// goes away.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.app.state_machine.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.handle_event(&event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("automation engine lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Evaluate one event against the rules. Returns the ids that
    /// fired.
    pub fn handle_event(&self, event: &StateChangedEvent) -> Vec<&'static str> {
        let mut fired = Vec::new();

        for rule in &self.rules {
            if !rule.trigger_entities.contains(&event.entity_id) {
                continue;
            }
            if rule.running.swap(true, Ordering::AcqRel) {
                tracing::warn!("[{}] already running, firing skipped", rule.id);
                continue;
            }
            tracing::debug!("[{}] triggered by {}", rule.id, event.entity_id);
            self.execute(rule, event);
            rule.record(event);
            rule.running.store(false, Ordering::Release);
            fired.push(rule.id);
        }

        fired
    }

    fn execute(&self, rule: &SyncRule, event: &StateChangedEvent) {
        match rule.action {
            RuleAction::WriteIdFromState => {
                let value = match event.new_state.state.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::debug!("[{}] non-numeric state, ignoring", rule.id);
                        return;
                    }
                };
                let _ = self.registry.write_id(
                    &event.entity_id,
                    Some(&json!(value as i64)),
                    Some(0xffff),
                );
            }
            RuleAction::SetIndoorTarget => {
                let value = match event.new_state.state.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::debug!("[{}] non-numeric state, ignoring", rule.id);
                        return;
                    }
                };
                let _ = self.registry.set_indr_t(Some(&json!(value)));
            }
            RuleAction::WriteModeIndex => {
                let options = event
                    .new_state
                    .attributes
                    .get("options")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let index = options
                    .iter()
                    .position(|o| o.as_str() == Some(event.new_state.state.as_str()));
                match index {
                    Some(index) => {
                        let _ = self.registry.write_id(
                            &event.entity_id,
                            Some(&json!(index)),
                            Some(0xffff),
                        );
                    }
                    None => {
                        tracing::warn!(
                            "[{}] option {} not in select options",
                            rule.id,
                            event.new_state.state
                        );
                    }
                }
            }
            RuleAction::SyncModeSelect => {
                let index = match event.new_state.state.parse::<usize>() {
                    Ok(i) => i,
                    Err(_) => {
                        tracing::debug!("[{}] non-integer mode, ignoring", rule.id);
                        return;
                    }
                };
                let attrs = self.app.state_machine.attributes(MODE_SELECT_ENTITY);
                let option = attrs
                    .get("options")
                    .and_then(Value::as_array)
                    .and_then(|opts| opts.get(index))
                    .and_then(Value::as_str)
                    .map(String::from);
                match option {
                    Some(option) => {
                        let _ = self.registry.call(
                            "input_select",
                            "select_option",
                            &json!({ "entity_id": MODE_SELECT_ENTITY, "option": option }),
                        );
                    }
                    None => {
                        tracing::warn!("[{}] mode index {} out of range", rule.id, index);
                    }
                }
            }
        }
    }

    /// Recent firings of a rule, oldest first.
    pub fn traces(&self, rule_id: &str) -> Vec<RuleTrace> {
        self.rules
            .iter()
            .find(|r| r.id == rule_id)
            .map(|r| r.traces.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default()
    }
}
