//! Write services.
//!
//! The five ThermIQ operations (`write_msg`, `write_reg`, `write_id`,
//! `write_mode`, `set_indr_t`) plus the two input-helper services the
//! sync rules and inbound forwarding dispatch through. Validation
//! failures are logged and swallowed; nothing here can take the bridge
//! down. Outbound messages go onto an unbounded queue that the MQTT
//! publisher task drains - handlers never block on the wire.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::keys::FieldKey;
use crate::regs::RegisterTable;

pub const DOMAIN: &str = "thermiq";

/// Bits the mode register accepts; one bit per operating mode.
const MODE_BITMASK: i64 = 0x1f;

/// Decimal form of the room-sensor register, the only one routed to
/// the set topic.
const SET_TOPIC_REG: &str = "d240";

/// `write_id` holds off publishing until the device has reported this
/// many messages, so startup UI defaults can't race ahead of the
/// device's own state.
const MIN_MSGS_BEFORE_WRITE: u64 = 3;

/// An outbound publish request handed to the MQTT task.
#[derive(Debug, Clone)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Per-call validation failures. All recoverable: the call becomes a
/// no-op and the device never sees a message.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("missing or non-numeric value")]
    MissingValue,
    #[error("value out of range: {0}")]
    OutOfRange(f64),
    #[error("register is neither rXX nor dNNN form: {0}")]
    BadRegister(String),
    #[error("unknown register id: {0}")]
    UnknownId(String),
    #[error("no handler for {domain}.{service}")]
    UnknownService { domain: String, service: String },
}

pub struct ServiceRegistry {
    app: Arc<AppState>,
    table: Arc<RegisterTable>,
    mqtt_tx: mpsc::UnboundedSender<MqttPublish>,
}

impl ServiceRegistry {
    pub fn new(
        app: Arc<AppState>,
        table: Arc<RegisterTable>,
        mqtt_tx: mpsc::UnboundedSender<MqttPublish>,
    ) -> Self {
        Self { app, table, mqtt_tx }
    }

    /// Dispatch a service call by name. The entry point for the REST
    /// API and the automation rules.
    pub fn call(&self, domain: &str, service: &str, data: &Value) -> Result<(), WriteError> {
        match (domain, service) {
            (DOMAIN, "write_msg") => {
                let msg = data.get("msg").and_then(|v| v.as_str());
                self.write_msg(msg)
            }
            (DOMAIN, "write_reg") => {
                let reg = data.get("reg").and_then(|v| v.as_str()).unwrap_or_default();
                self.write_reg(reg, data.get("value"), bitmask_of(data))
            }
            (DOMAIN, "write_id") => {
                let id = data
                    .get("register_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.write_id(id, data.get("value"), bitmask_of(data))
            }
            (DOMAIN, "write_mode") => self.write_mode(data.get("value")),
            (DOMAIN, "set_indr_t") => self.set_indr_t(data.get("value")),
            ("input_number", "set_value") => {
                self.set_helper_state(data, |v| match v {
                    Value::Number(n) => Some(n.to_string()),
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
            }
            ("input_select", "select_option") => {
                let option = data.get("option").and_then(|v| v.as_str());
                self.set_helper_state(&json!({
                    "entity_id": data.get("entity_id").cloned().unwrap_or_default(),
                    "value": option,
                }), |v| v.as_str().map(String::from))
            }
            _ => {
                tracing::warn!("No handler for {}.{}", domain, service);
                Err(WriteError::UnknownService {
                    domain: domain.to_string(),
                    service: service.to_string(),
                })
            }
        }
    }

    // ── The five ThermIQ services ────────────────────────

    /// Publish a caller-supplied payload verbatim to the command topic.
    pub fn write_msg(&self, msg: Option<&str>) -> Result<(), WriteError> {
        let msg = msg.ok_or_else(|| {
            tracing::warn!("write_msg called without a msg");
            WriteError::MissingValue
        })?;
        self.publish(self.app.topics.cmd.clone(), msg.to_string());
        Ok(())
    }

    /// Write a raw register. `reg` must be in hex or decimal form; the
    /// optional bitmask (default 0xffff) is ANDed into the value.
    pub fn write_reg(
        &self,
        reg: &str,
        value: Option<&Value>,
        bitmask: Option<i64>,
    ) -> Result<(), WriteError> {
        let value = int_value(value).map_err(|e| {
            tracing::warn!("write_reg: no message sent, missing value");
            e
        })?;
        let masked = value & bitmask.unwrap_or(0xffff);

        let key = FieldKey::parse(reg);
        let dreg = match key.decimal() {
            Some(dreg) if key.is_known() => dreg,
            _ => {
                tracing::warn!("write_reg: no message sent, faulty reg [{}]", reg);
                return Err(WriteError::BadRegister(reg.to_string()));
            }
        };

        let payload = json!({ dreg.as_str(): masked }).to_string();
        self.publish(self.topic_for(&dreg), payload);
        Ok(())
    }

    /// Write a register by its named id. Accepts a bare id
    /// (`curve`), a helper entity id (`input_number.thermiq_curve`),
    /// or an instance-prefixed form; everything up to `thermiq_` is
    /// stripped. Redundant values are suppressed, and nothing is sent
    /// until the device itself has reported enough messages.
    pub fn write_id(
        &self,
        register_id: &str,
        value: Option<&Value>,
        bitmask: Option<i64>,
    ) -> Result<(), WriteError> {
        let value = num_value(value).map_err(|e| {
            tracing::warn!("write_id: no message sent, missing value");
            e
        })?;
        let masked = (value as i64) & bitmask.unwrap_or(0xffff);

        let id = strip_entity_namespace(register_id);
        let def = self.table.by_id(&id).ok_or_else(|| {
            tracing::warn!("write_id: no message sent, faulty reg [{}]", id);
            WriteError::UnknownId(id.clone())
        })?;

        let current = self.app.device.get(def.reg).and_then(|v| v.as_i64());
        if current == Some(masked) {
            tracing::debug!("write_id: {} unchanged, no need to write", id);
            return Ok(());
        }

        // Incoming telemetry always rules; the optimistic update keeps
        // the UI consistent until the device echoes the write back.
        self.app.device.set(def.reg.to_string(), json!(masked));
        self.app
            .state_machine
            .set_keep_attrs(&format!("thermiq.{}", def.id), masked.to_string());

        if self.app.device.msg_count() <= MIN_MSGS_BEFORE_WRITE {
            tracing::debug!(
                "write_id: holding off {} until the device has reported its state",
                id
            );
            return Ok(());
        }

        let dreg = FieldKey::parse(def.reg)
            .decimal()
            .ok_or_else(|| WriteError::BadRegister(def.reg.to_string()))?;
        let payload = json!({ dreg.as_str(): masked }).to_string();
        self.publish(self.topic_for(&dreg), payload);
        Ok(())
    }

    /// Set the operating mode by index 0-5. Encoded as a single bit at
    /// the index, masked into the mode bitfield, written to d051.
    pub fn write_mode(&self, value: Option<&Value>) -> Result<(), WriteError> {
        let value = int_value(value).map_err(|e| {
            tracing::warn!("write_mode: no message sent, missing value");
            e
        })?;
        if !(0..=5).contains(&value) {
            tracing::warn!("write_mode: mode value out of range [{}]", value);
            return Err(WriteError::OutOfRange(value as f64));
        }
        let encoded = (1i64 << value) & MODE_BITMASK;

        if self.app.device.get("r33").and_then(|v| v.as_i64()) == Some(encoded) {
            tracing::debug!("write_mode: unchanged, no need to write");
            return Ok(());
        }

        // Mirror onto the raw-register entity, not thermiq.main_mode:
        // the bit encoding is not an option index and must not feed the
        // mode-to-select sync rule.
        self.app
            .state_machine
            .set_keep_attrs("thermiq.r33", encoded.to_string());

        let payload = json!({ "d051": encoded }).to_string();
        self.publish(self.app.topics.cmd.clone(), payload);
        Ok(())
    }

    /// Set the room-sensor setpoint, range 10.0..=30.0 °C. Published
    /// with the symbolic key on the set topic.
    pub fn set_indr_t(&self, value: Option<&Value>) -> Result<(), WriteError> {
        let value = num_value(value).map_err(|e| {
            tracing::warn!("set_indr_t: no message sent, missing value");
            e
        })?;
        if !(10.0..=30.0).contains(&value) {
            tracing::warn!("set_indr_t: value out of range [{}]", value);
            return Err(WriteError::OutOfRange(value));
        }

        if self.app.device.get("rf0").and_then(|v| v.as_f64()) == Some(value) {
            tracing::debug!("set_indr_t: unchanged, no need to write");
            return Ok(());
        }

        self.app
            .state_machine
            .set_keep_attrs("thermiq.room_sensor_set_t", value.to_string());

        let payload = json!({ "INDR_T": value }).to_string();
        self.publish(self.app.topics.set.clone(), payload);
        Ok(())
    }

    // ── Helper services ──────────────────────────────────

    fn set_helper_state(
        &self,
        data: &Value,
        to_state: impl Fn(&Value) -> Option<String>,
    ) -> Result<(), WriteError> {
        let entity_id = data
            .get("entity_id")
            .and_then(|v| v.as_str())
            .ok_or(WriteError::MissingValue)?;
        let state = data
            .get("value")
            .and_then(|v| to_state(v))
            .ok_or(WriteError::MissingValue)?;
        self.app.state_machine.set_keep_attrs(entity_id, state);
        Ok(())
    }

    // ── Publishing ───────────────────────────────────────

    /// d240 (the room-sensor setpoint) goes to the set topic,
    /// everything else to the general command topic.
    fn topic_for(&self, dreg: &str) -> String {
        if dreg == SET_TOPIC_REG {
            self.app.topics.set.clone()
        } else {
            self.app.topics.cmd.clone()
        }
    }

    /// Fire-and-forget: enqueue for the publisher task. QoS and retain
    /// policy live in the MQTT task; a dropped queue just means we are
    /// shutting down.
    fn publish(&self, topic: String, payload: String) {
        tracing::debug!(topic = %topic, payload = %payload, "queueing publish");
        let _ = self.mqtt_tx.send(MqttPublish {
            topic,
            payload,
            retain: false,
        });
    }
}

fn bitmask_of(data: &Value) -> Option<i64> {
    data.get("bitmask").and_then(|v| v.as_i64())
}

/// Integer-only value extraction (write_reg, write_mode). Numeric
/// strings are accepted, since UI helpers report states as strings.
fn int_value(value: Option<&Value>) -> Result<i64, WriteError> {
    match value {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
            n.as_i64().ok_or(WriteError::MissingValue)
        }
        Some(Value::String(s)) => s.trim().parse().map_err(|_| WriteError::MissingValue),
        _ => Err(WriteError::MissingValue),
    }
}

/// Int-or-float value extraction (write_id, set_indr_t).
fn num_value(value: Option<&Value>) -> Result<f64, WriteError> {
    match value {
        Some(Value::Number(n)) => n.as_f64().ok_or(WriteError::MissingValue),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| WriteError::MissingValue),
        _ => Err(WriteError::MissingValue),
    }
}

/// Strip an entity namespace and the `thermiq_` prefix:
/// `input_number.thermiq_curve` -> `curve`. A bare id passes through.
fn strip_entity_namespace(register_id: &str) -> String {
    let id = register_id.to_lowercase();
    let search_from = id.find('.').map(|p| p + 1).unwrap_or(0);
    match id[search_from..].find("thermiq_") {
        Some(pos) => id[search_from + pos + "thermiq_".len()..].to_string(),
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn fixture() -> (
        Arc<AppState>,
        ServiceRegistry,
        mpsc::UnboundedReceiver<MqttPublish>,
    ) {
        let app = Arc::new(AppState::new(BridgeConfig::default().topics()));
        let table = Arc::new(RegisterTable::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = ServiceRegistry::new(app.clone(), table, tx);
        (app, registry, rx)
    }

    /// Pretend the device has reported enough telemetry for write_id.
    fn unlock_writes(app: &AppState) {
        for _ in 0..4 {
            app.device.count_message();
        }
    }

    #[test]
    fn test_strip_entity_namespace() {
        assert_eq!(strip_entity_namespace("input_number.thermiq_curve"), "curve");
        assert_eq!(
            strip_entity_namespace("input_select.thermiq_main_mode"),
            "main_mode"
        );
        assert_eq!(strip_entity_namespace("curve"), "curve");
        assert_eq!(
            strip_entity_namespace("home.input_number.thermiq_heatstop"),
            "heatstop"
        );
    }

    #[test]
    fn test_write_reg_decimal_form() {
        let (_app, registry, mut rx) = fixture();
        registry
            .write_reg("d051", Some(&json!(3)), Some(0x1f))
            .unwrap();

        let publish = rx.try_recv().unwrap();
        assert_eq!(publish.topic, "ThermIQ/ThermIQ-mqtt/write");
        assert_eq!(publish.payload, r#"{"d051":3}"#);
        assert!(!publish.retain);
    }

    #[test]
    fn test_write_reg_hex_form_uses_decimal_on_wire() {
        let (_app, registry, mut rx) = fixture();
        registry.write_reg("r33", Some(&json!(3)), None).unwrap();
        assert_eq!(rx.try_recv().unwrap().payload, r#"{"d051":3}"#);
    }

    #[test]
    fn test_write_reg_routes_setpoint_register_to_set_topic() {
        let (_app, registry, mut rx) = fixture();
        registry.write_reg("d240", Some(&json!(22)), None).unwrap();
        assert_eq!(rx.try_recv().unwrap().topic, "ThermIQ/ThermIQ-mqtt/set");
    }

    #[test]
    fn test_write_reg_rejects_bad_register() {
        let (_app, registry, mut rx) = fixture();
        let err = registry.write_reg("xyz", Some(&json!(1)), None).unwrap_err();
        assert!(matches!(err, WriteError::BadRegister(_)));
        assert!(rx.try_recv().is_err());

        // 3 chars with the hex prefix but not hex: flagged, not a panic
        let err = registry.write_reg("rzz", Some(&json!(1)), None).unwrap_err();
        assert!(matches!(err, WriteError::BadRegister(_)));
    }

    #[test]
    fn test_write_reg_rejects_missing_value() {
        let (_app, registry, mut rx) = fixture();
        assert!(matches!(
            registry.write_reg("d051", None, None),
            Err(WriteError::MissingValue)
        ));
        assert!(matches!(
            registry.write_reg("d051", Some(&json!("abc")), None),
            Err(WriteError::MissingValue)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_mode_encoding() {
        for mode in 0..=5i64 {
            let (_app, registry, mut rx) = fixture();
            registry.write_mode(Some(&json!(mode))).unwrap();
            let publish = rx.try_recv().unwrap();
            let body: Value = serde_json::from_str(&publish.payload).unwrap();
            assert_eq!(body["d051"].as_i64().unwrap(), (1 << mode) & 0x1f);
        }
    }

    #[test]
    fn test_write_mode_rejects_out_of_range() {
        let (_app, registry, mut rx) = fixture();
        assert!(matches!(
            registry.write_mode(Some(&json!(6))),
            Err(WriteError::OutOfRange(_))
        ));
        assert!(matches!(
            registry.write_mode(Some(&json!(-1))),
            Err(WriteError::OutOfRange(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_mode_suppresses_redundant_value() {
        let (app, registry, mut rx) = fixture();
        app.device.set("r33".to_string(), json!(2)); // mode 1 already active
        registry.write_mode(Some(&json!(1))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_indr_t_range_and_publish() {
        let (_app, registry, mut rx) = fixture();
        assert!(matches!(
            registry.set_indr_t(Some(&json!(9.9))),
            Err(WriteError::OutOfRange(_))
        ));
        assert!(matches!(
            registry.set_indr_t(Some(&json!(30.1))),
            Err(WriteError::OutOfRange(_))
        ));
        assert!(rx.try_recv().is_err());

        registry.set_indr_t(Some(&json!(22.5))).unwrap();
        let publish = rx.try_recv().unwrap();
        assert_eq!(publish.topic, "ThermIQ/ThermIQ-mqtt/set");
        assert_eq!(publish.payload, r#"{"INDR_T":22.5}"#);
    }

    #[test]
    fn test_set_indr_t_suppresses_unchanged_value() {
        let (app, registry, mut rx) = fixture();
        app.device.set("rf0".to_string(), json!(22.5));
        registry.set_indr_t(Some(&json!(22.5))).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_indr_t_has_no_message_count_gate() {
        let (app, registry, mut rx) = fixture();
        assert_eq!(app.device.msg_count(), 0);
        registry.set_indr_t(Some(&json!(21.0))).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_write_id_gated_until_device_reports() {
        let (app, registry, mut rx) = fixture();

        // 3 messages is not enough
        for _ in 0..3 {
            app.device.count_message();
        }
        registry
            .write_id("input_number.thermiq_curve", Some(&json!(40)), None)
            .unwrap();
        assert!(rx.try_recv().is_err());
        // but the snapshot and entity were updated optimistically
        assert_eq!(app.device.get("r36"), Some(json!(40)));
        assert_eq!(app.state_machine.get("thermiq.curve").unwrap().state, "40");

        // the 4th message unlocks publishing
        app.device.count_message();
        registry
            .write_id("input_number.thermiq_curve", Some(&json!(41)), None)
            .unwrap();
        let publish = rx.try_recv().unwrap();
        let body: Value = serde_json::from_str(&publish.payload).unwrap();
        assert_eq!(body["d054"].as_i64().unwrap(), 41);
    }

    #[test]
    fn test_write_id_suppresses_unchanged_value() {
        let (app, registry, mut rx) = fixture();
        unlock_writes(&app);
        app.device.set("r36".to_string(), json!(40));
        registry.write_id("curve", Some(&json!(40)), None).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_id_unknown_id() {
        let (app, registry, mut rx) = fixture();
        unlock_writes(&app);
        let err = registry
            .write_id("input_number.thermiq_nonsense", Some(&json!(1)), None)
            .unwrap_err();
        assert!(matches!(err, WriteError::UnknownId(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_id_setpoint_register_uses_set_topic() {
        let (app, registry, mut rx) = fixture();
        unlock_writes(&app);
        registry
            .write_id("room_sensor_set_t", Some(&json!(23)), None)
            .unwrap();
        let publish = rx.try_recv().unwrap();
        assert_eq!(publish.topic, "ThermIQ/ThermIQ-mqtt/set");
        assert_eq!(publish.payload, r#"{"d240":23}"#);
    }

    #[test]
    fn test_call_dispatch_and_unknown_service() {
        let (app, registry, mut rx) = fixture();
        registry
            .call(DOMAIN, "write_msg", &json!({ "msg": "{\"d051\": 1}" }))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().payload, "{\"d051\": 1}");

        assert!(matches!(
            registry.call("light", "turn_on", &json!({})),
            Err(WriteError::UnknownService { .. })
        ));

        registry
            .call(
                "input_number",
                "set_value",
                &json!({ "entity_id": "input_number.thermiq_curve", "value": 40 }),
            )
            .unwrap();
        assert_eq!(
            app.state_machine
                .get("input_number.thermiq_curve")
                .unwrap()
                .state,
            "40"
        );
    }
}
