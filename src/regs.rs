//! Static ThermIQ register table.
//!
//! Pure data: one row per documented Thermia register exposed by the
//! ThermIQ-MQTT interface, keyed by a stable id. The hex form (`rXX`)
//! is the canonical key used in the device snapshot; the decimal form
//! (`dNNN`) only appears on the wire in outbound writes.

use std::collections::HashMap;

/// Semantic kind of a register. Read-only kinds feed plain entities;
/// the `*Input` kinds additionally get a UI helper and are writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegKind {
    /// Measured temperature, read-only.
    Temperature,
    /// Generic read-only reading (runtimes, integrals, status words).
    Sensor,
    /// On/off style read-only flag.
    Binary,
    /// Editable temperature setting.
    TemperatureInput,
    /// Editable duration setting.
    TimeInput,
    /// Editable dimensionless setting.
    SensorInput,
    /// Operating-mode selector.
    SelectInput,
}

impl RegKind {
    /// Kinds that get an `input_number` helper and are forwarded into it
    /// when the device reports a new value.
    pub fn is_numeric_input(self) -> bool {
        matches!(
            self,
            RegKind::TemperatureInput | RegKind::TimeInput | RegKind::SensorInput
        )
    }

    pub fn icon(self) -> &'static str {
        match self {
            RegKind::TimeInput => "mdi:timer",
            RegKind::SensorInput => "mdi:speedometer",
            RegKind::SelectInput => "mdi:power",
            _ => "mdi:temperature-celsius",
        }
    }

    /// Presentation mode for the helper: durations get a slider,
    /// temperatures and factors a plain box.
    pub fn input_mode(self) -> &'static str {
        match self {
            RegKind::TimeInput => "slider",
            _ => "box",
        }
    }
}

/// One row of the register table.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    /// Stable id, also the entity object id (`thermiq.<id>`).
    pub id: &'static str,
    /// Canonical hex-form register key.
    pub reg: &'static str,
    pub kind: RegKind,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
}

/// Options of the operating-mode selector, in register-value order.
pub const MODE_OPTIONS: &[&str] = &[
    "Off",
    "Auto",
    "Heatpump only",
    "Electric only",
    "Hotwater only",
];

/// Composite pairs: (integer register, fractional register). The
/// exposed value is `int + frac / 10`.
pub const COMPOSITE_PAIRS: &[(&str, &str)] = &[("r01", "r02"), ("r03", "r04")];

pub const REGISTERS: &[RegisterDef] = &[
    // ── Measured values ──────────────────────────────────
    RegisterDef { id: "indoor_t", reg: "r01", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "indoor_t_frac", reg: "r02", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "outdoor_t", reg: "r03", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "outdoor_t_frac", reg: "r04", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "tapwater_t", reg: "r05", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "supplyline_t", reg: "r06", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "returnline_t", reg: "r07", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "brine_in_t", reg: "r08", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "brine_out_t", reg: "r09", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "pressurepipe_t", reg: "r0a", kind: RegKind::Temperature, unit: "°C", min: 0.0, max: 0.0 },
    RegisterDef { id: "integral", reg: "r0b", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "compressor_on", reg: "r2c", kind: RegKind::Binary, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "aux_heater_on", reg: "r2d", kind: RegKind::Binary, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "alarm_word", reg: "r2e", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
    RegisterDef { id: "status_word", reg: "r2f", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
    // ── Settings ─────────────────────────────────────────
    RegisterDef { id: "main_mode", reg: "r33", kind: RegKind::SelectInput, unit: "", min: 0.0, max: 4.0 },
    RegisterDef { id: "room_factor", reg: "r34", kind: RegKind::SensorInput, unit: "", min: 0.0, max: 4.0 },
    RegisterDef { id: "curve", reg: "r36", kind: RegKind::SensorInput, unit: "°C", min: 22.0, max: 62.0 },
    RegisterDef { id: "curve_min", reg: "r37", kind: RegKind::TemperatureInput, unit: "°C", min: 10.0, max: 30.0 },
    RegisterDef { id: "curve_max", reg: "r38", kind: RegKind::TemperatureInput, unit: "°C", min: 10.0, max: 55.0 },
    RegisterDef { id: "curve_p5", reg: "r39", kind: RegKind::SensorInput, unit: "°C", min: -5.0, max: 5.0 },
    RegisterDef { id: "curve_0", reg: "r3a", kind: RegKind::SensorInput, unit: "°C", min: -5.0, max: 5.0 },
    RegisterDef { id: "curve_n5", reg: "r3b", kind: RegKind::SensorInput, unit: "°C", min: -5.0, max: 5.0 },
    RegisterDef { id: "heatstop", reg: "r3c", kind: RegKind::TemperatureInput, unit: "°C", min: 0.0, max: 40.0 },
    RegisterDef { id: "hysteresis", reg: "r3d", kind: RegKind::SensorInput, unit: "°C", min: 2.0, max: 20.0 },
    RegisterDef { id: "tapwater_start_t", reg: "r3e", kind: RegKind::TemperatureInput, unit: "°C", min: 30.0, max: 55.0 },
    RegisterDef { id: "legionella_interval", reg: "r45", kind: RegKind::TimeInput, unit: "days", min: 0.0, max: 90.0 },
    RegisterDef { id: "tapwater_runtime_max", reg: "r46", kind: RegKind::TimeInput, unit: "min", min: 0.0, max: 60.0 },
    // ── Aliased registers ────────────────────────────────
    RegisterDef { id: "room_sensor_set_t", reg: "rf0", kind: RegKind::TemperatureInput, unit: "°C", min: 10.0, max: 30.0 },
    RegisterDef { id: "timestamp", reg: "rf1", kind: RegKind::Sensor, unit: "", min: 0.0, max: 0.0 },
];

/// Human-readable label for a register id, where one exists.
pub fn friendly_name(id: &str) -> Option<&'static str> {
    let name = match id {
        "indoor_t" => "Indoor temperature",
        "outdoor_t" => "Outdoor temperature",
        "tapwater_t" => "Tap water temperature",
        "supplyline_t" => "Supply line temperature",
        "returnline_t" => "Return line temperature",
        "brine_in_t" => "Brine in temperature",
        "brine_out_t" => "Brine out temperature",
        "pressurepipe_t" => "Pressure pipe temperature",
        "integral" => "Heating integral",
        "compressor_on" => "Compressor running",
        "aux_heater_on" => "Auxiliary heater running",
        "alarm_word" => "Alarm bits",
        "status_word" => "Status bits",
        "main_mode" => "Operating mode",
        "room_factor" => "Room sensor influence",
        "curve" => "Heat curve",
        "curve_min" => "Heat curve min",
        "curve_max" => "Heat curve max",
        "curve_p5" => "Curve adjustment at +5°C",
        "curve_0" => "Curve adjustment at 0°C",
        "curve_n5" => "Curve adjustment at -5°C",
        "heatstop" => "Heat stop",
        "hysteresis" => "Supply line hysteresis",
        "tapwater_start_t" => "Tap water start temperature",
        "legionella_interval" => "Legionella interval",
        "tapwater_runtime_max" => "Tap water max runtime",
        "room_sensor_set_t" => "Room sensor set temperature",
        "timestamp" => "Device timestamp",
        _ => return None,
    };
    Some(name)
}

/// Index over [`REGISTERS`] in both lookup directions. Built once at
/// startup and shared read-only.
pub struct RegisterTable {
    by_id: HashMap<&'static str, &'static RegisterDef>,
    by_reg: HashMap<&'static str, &'static RegisterDef>,
}

impl RegisterTable {
    pub fn new() -> Self {
        let mut by_id = HashMap::new();
        let mut by_reg = HashMap::new();
        for def in REGISTERS {
            by_id.insert(def.id, def);
            by_reg.insert(def.reg, def);
        }
        Self { by_id, by_reg }
    }

    pub fn by_id(&self, id: &str) -> Option<&'static RegisterDef> {
        self.by_id.get(id).copied()
    }

    /// Look up by canonical hex-form key.
    pub fn by_reg(&self, reg: &str) -> Option<&'static RegisterDef> {
        self.by_reg.get(reg).copied()
    }

    /// All registers that get an `input_number` helper, in table order.
    pub fn numeric_inputs(&self) -> impl Iterator<Item = &'static RegisterDef> + '_ {
        REGISTERS.iter().filter(|d| d.kind.is_numeric_input())
    }
}

impl Default for RegisterTable {
    fn default() -> Self {
        Self::new()
    }
}
