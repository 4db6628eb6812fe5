//! Inbound telemetry handling.
//!
//! One call per MQTT message on the data topic:
//! decode JSON -> check the sender -> store and mirror every register
//! field -> combine the composite temperature pairs -> bump the counter,
//! publish the timestamp, and fire the message-received event.
//!
//! Decode failures and foreign senders abort before any mutation; a
//! half-present composite pair is reported and skipped without
//! affecting the rest of the message.

use std::collections::HashSet;

use serde_json::{json, Value};
use thiserror::Error;

use crate::api::AppState;
use crate::keys::FieldKey;
use crate::regs::{RegisterTable, COMPOSITE_PAIRS};
use crate::services::ServiceRegistry;

/// Every ThermIQ interface announces itself with this prefix.
const CLIENT_PREFIX: &str = "ThermIQ_";

/// Event name observers can subscribe to for per-message notification.
pub const MSG_RECEIVED_EVENT: &str = "thermiq_msg_rec_event";

/// Why an inbound payload was discarded. All recoverable: the message
/// is dropped, nothing was mutated.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("payload could not be parsed as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload was not from a ThermIQ device")]
    WrongClient,
}

pub fn handle_message(
    app: &AppState,
    table: &RegisterTable,
    registry: &ServiceRegistry,
    payload: &[u8],
) -> Result<(), RecvError> {
    let decoded: Value = serde_json::from_slice(payload)?;
    let fields = decoded.as_object().ok_or(RecvError::NotAnObject)?;

    let client = fields
        .get("Client_Name")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !client.starts_with(CLIENT_PREFIX) {
        return Err(RecvError::WrongClient);
    }

    // Which canonical keys this particular message carried, for the
    // composite step below.
    let mut seen = HashSet::new();

    for (field, value) in fields {
        let key = FieldKey::parse(field);
        let canonical = key.canonical();
        tracing::trace!(key = %canonical, value = %value, "register field");

        app.device.set(canonical.clone(), value.clone());
        seen.insert(canonical.clone());

        let def = match table.by_reg(&canonical) {
            Some(def) => def,
            None => continue,
        };

        // Integer halves of composite pairs are only exposed in
        // combined form, after the field loop.
        if COMPOSITE_PAIRS.iter().any(|(int_reg, _)| *int_reg == canonical) {
            continue;
        }

        app.state_machine
            .set_keep_attrs(&format!("thermiq.{}", def.id), value_to_state(value));

        // Incoming messages always rule over UI settings.
        if def.kind.is_numeric_input() {
            let _ = registry.call(
                "input_number",
                "set_value",
                &json!({
                    "entity_id": format!("input_number.thermiq_{}", def.id),
                    "value": value,
                }),
            );
        }
    }

    for (int_reg, frac_reg) in COMPOSITE_PAIRS {
        match (seen.contains(*int_reg), seen.contains(*frac_reg)) {
            (true, true) => {
                let int_part = app.device.get(int_reg).and_then(|v| v.as_f64());
                let frac_part = app.device.get(frac_reg).and_then(|v| v.as_f64());
                if let (Some(i), Some(f)) = (int_part, frac_part) {
                    let combined = i + f / 10.0;
                    app.device.set(int_reg.to_string(), json!(combined));
                    if let Some(def) = table.by_reg(int_reg) {
                        app.state_machine
                            .set_keep_attrs(&format!("thermiq.{}", def.id), combined.to_string());
                    }
                } else {
                    tracing::warn!(
                        "composite pair {}/{} carried non-numeric values, skipping",
                        int_reg,
                        frac_reg
                    );
                }
            }
            (false, false) => {}
            _ => {
                // One half without the other; skip the combine rather
                // than failing the whole message.
                tracing::warn!(
                    "composite pair {}/{} incomplete in payload, skipping combine",
                    int_reg,
                    frac_reg
                );
            }
        }
    }

    app.device.count_message();

    match fields.get("time").and_then(|v| v.as_str()) {
        Some(time) => {
            app.state_machine
                .set_keep_attrs("thermiq.time_str", time.to_string());
        }
        None => tracing::warn!("payload carried no time field"),
    }

    app.fire_event(MSG_RECEIVED_EVENT);
    Ok(())
}

fn value_to_state(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::helpers;
    use crate::regs::RegisterTable;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn fixture() -> (
        Arc<AppState>,
        RegisterTable,
        ServiceRegistry,
        mpsc::UnboundedReceiver<crate::services::MqttPublish>,
    ) {
        let app = Arc::new(AppState::new(BridgeConfig::default().topics()));
        let table = RegisterTable::new();
        helpers::create_entities(&app, &table);
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = ServiceRegistry::new(app.clone(), Arc::new(RegisterTable::new()), tx);
        (app, table, registry, rx)
    }

    fn handle(
        app: &AppState,
        table: &RegisterTable,
        registry: &ServiceRegistry,
        payload: &str,
    ) -> Result<(), RecvError> {
        handle_message(app, table, registry, payload.as_bytes())
    }

    #[test]
    fn test_composite_combine_and_counter() {
        let (app, table, registry, _rx) = fixture();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","r01":20,"r02":5,"time":"12:00"}"#,
        )
        .unwrap();

        assert_eq!(app.state_machine.get("thermiq.indoor_t").unwrap().state, "20.5");
        assert_eq!(app.device.get("r01"), Some(json!(20.5)));
        assert_eq!(app.device.msg_count(), 1);
        assert_eq!(app.state_machine.get("thermiq.time_str").unwrap().state, "12:00");
    }

    #[test]
    fn test_composite_combine_exact_across_fractions() {
        for i in [-20i64, 0, 7, 35] {
            for f in 0..=9i64 {
                let (app, table, registry, _rx) = fixture();
                handle(
                    &app,
                    &table,
                    &registry,
                    &format!(
                        r#"{{"Client_Name":"ThermIQ_X","r03":{},"r04":{},"time":"12:00"}}"#,
                        i, f
                    ),
                )
                .unwrap();

                let expected = i as f64 + f as f64 / 10.0;
                assert_eq!(app.device.get("r03"), Some(json!(expected)));
                assert_eq!(
                    app.state_machine.get("thermiq.outdoor_t").unwrap().state,
                    expected.to_string()
                );
            }
        }
    }

    #[test]
    fn test_bad_json_mutates_nothing() {
        let (app, table, registry, _rx) = fixture();
        let before = app.device.msg_count();
        let err = handle(&app, &table, &registry, "{not json").unwrap_err();
        assert!(matches!(err, RecvError::Json(_)));
        assert_eq!(app.device.msg_count(), before);
        assert!(app.device.is_empty());
    }

    #[test]
    fn test_foreign_client_rejected() {
        let (app, table, registry, _rx) = fixture();
        let err = handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"SomeOtherBox","r05":45,"time":"12:00"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RecvError::WrongClient));
        assert!(app.device.is_empty());
        assert_eq!(app.device.msg_count(), 0);
    }

    #[test]
    fn test_editable_register_forwarded_to_helper() {
        let (app, table, registry, _rx) = fixture();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","d054":41,"time":"12:00"}"#,
        )
        .unwrap();

        // d054 == r36 == curve, an editable numeric register
        assert_eq!(app.state_machine.get("thermiq.curve").unwrap().state, "41");
        assert_eq!(
            app.state_machine
                .get("input_number.thermiq_curve")
                .unwrap()
                .state,
            "41"
        );
        // helper attributes survive the forwarded update
        assert_eq!(
            app.state_machine
                .get("input_number.thermiq_curve")
                .unwrap()
                .attributes["icon"],
            json!("mdi:speedometer")
        );
    }

    #[test]
    fn test_read_only_register_not_forwarded() {
        let (app, table, registry, _rx) = fixture();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","r05":45,"time":"12:00"}"#,
        )
        .unwrap();
        assert_eq!(app.state_machine.get("thermiq.tapwater_t").unwrap().state, "45");
        assert!(app.state_machine.get("input_number.thermiq_tapwater_t").is_none());
    }

    #[test]
    fn test_aliases_land_on_canonical_registers() {
        let (app, table, registry, _rx) = fixture();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","INDR_T":21.5,"timestamp":"2024-03-01","time":"12:00"}"#,
        )
        .unwrap();
        assert_eq!(app.device.get("rf0"), Some(json!(21.5)));
        assert_eq!(
            app.state_machine
                .get("thermiq.room_sensor_set_t")
                .unwrap()
                .state,
            "21.5"
        );
        assert_eq!(app.state_machine.get("thermiq.timestamp").unwrap().state, "2024-03-01");
    }

    #[test]
    fn test_half_composite_pair_skips_combine() {
        let (app, table, registry, _rx) = fixture();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","r01":20,"time":"12:00"}"#,
        )
        .unwrap();

        // raw value stored but never exposed in combined form
        assert_eq!(app.device.get("r01"), Some(json!(20)));
        assert_eq!(app.state_machine.get("thermiq.indoor_t").unwrap().state, "-1");
        // message still counted
        assert_eq!(app.device.msg_count(), 1);
    }

    #[test]
    fn test_msg_received_event_fired() {
        let (app, table, registry, _rx) = fixture();
        let mut events = app.subscribe_events();
        handle(
            &app,
            &table,
            &registry,
            r#"{"Client_Name":"ThermIQ_X","time":"12:00"}"#,
        )
        .unwrap();
        assert_eq!(events.try_recv().unwrap().event_type, MSG_RECEIVED_EVENT);
    }

    #[test]
    fn test_counter_accumulates_across_messages() {
        let (app, table, registry, _rx) = fixture();
        for n in 1..=5 {
            handle(
                &app,
                &table,
                &registry,
                &format!(r#"{{"Client_Name":"ThermIQ_X","r05":{},"time":"12:00"}}"#, 40 + n),
            )
            .unwrap();
            assert_eq!(app.device.msg_count(), n);
        }
    }
}
