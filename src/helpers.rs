//! Startup entity bootstrap.
//!
//! Creates one `thermiq.<id>` entity per table row (seeded to -1 until
//! the device reports), the `input_number` helpers for every editable
//! numeric register, the operating-mode `input_select`, and the
//! aggregate timestamp entity. Helper attributes (range, step, icon,
//! presentation mode) all derive from the register table.

use serde_json::json;

use crate::api::AppState;
use crate::regs::{friendly_name, RegisterTable, MODE_OPTIONS, REGISTERS};

/// Seed value for entities the device hasn't reported yet.
const UNREPORTED: &str = "-1";

pub const MODE_SELECT_ENTITY: &str = "input_select.thermiq_main_mode";
pub const ROOM_SENSOR_ENTITY: &str = "input_number.thermiq_room_sensor_set_t";

/// Create all entities and helpers. Returns the `input_number` entity
/// ids that the generic numbers-to-MQTT rule should watch - every
/// numeric helper except the room-sensor setpoint, which has its own
/// dedicated rule.
pub fn create_entities(app: &AppState, table: &RegisterTable) -> Vec<String> {
    app.state_machine.set(
        "thermiq.time_str".to_string(),
        format!("Waiting on {}", app.topics.data),
        Default::default(),
    );

    for def in REGISTERS {
        let mut attrs = serde_json::Map::new();
        if let Some(name) = friendly_name(def.id) {
            attrs.insert("friendly_name".to_string(), json!(name));
        }
        if !def.unit.is_empty() {
            attrs.insert("unit_of_measurement".to_string(), json!(def.unit));
        }
        app.state_machine.set(
            format!("thermiq.{}", def.id),
            UNREPORTED.to_string(),
            attrs,
        );
    }

    let mut entity_list = Vec::new();
    for def in table.numeric_inputs() {
        // The room sensor takes tenths of a degree; everything else is
        // integer-stepped.
        let step = if def.reg == "rf0" { 0.1 } else { 1.0 };

        let mut attrs = serde_json::Map::new();
        attrs.insert("min".to_string(), json!(def.min));
        attrs.insert("max".to_string(), json!(def.max));
        attrs.insert("step".to_string(), json!(step));
        attrs.insert("mode".to_string(), json!(def.kind.input_mode()));
        attrs.insert("icon".to_string(), json!(def.kind.icon()));
        attrs.insert("editable".to_string(), json!(true));
        if !def.unit.is_empty() {
            attrs.insert("unit_of_measurement".to_string(), json!(def.unit));
        }
        if let Some(name) = friendly_name(def.id) {
            attrs.insert("friendly_name".to_string(), json!(name));
        }

        let entity_id = format!("input_number.thermiq_{}", def.id);
        app.state_machine
            .set(entity_id.clone(), UNREPORTED.to_string(), attrs);
        entity_list.push(entity_id);
    }
    entity_list.retain(|e| e != ROOM_SENSOR_ENTITY);

    let mut attrs = serde_json::Map::new();
    attrs.insert("options".to_string(), json!(MODE_OPTIONS));
    attrs.insert("icon".to_string(), json!("mdi:power"));
    attrs.insert("editable".to_string(), json!(true));
    if let Some(name) = friendly_name("main_mode") {
        attrs.insert("friendly_name".to_string(), json!(name));
    }
    app.state_machine
        .set(MODE_SELECT_ENTITY.to_string(), "unknown".to_string(), attrs);

    tracing::info!(
        "Created {} entities, {} numeric helpers",
        app.state_machine.len(),
        entity_list.len() + 1
    );

    entity_list
}
