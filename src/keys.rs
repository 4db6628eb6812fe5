//! Register key normalization.
//!
//! The device addresses the same register three ways: hex form (`rXX`),
//! decimal form (`dNNN`), and two symbolic aliases (`INDR_T`,
//! `timestamp`). Inbound fields are parsed once into a tagged form;
//! everything downstream works on the canonical hex key, while outbound
//! writes use the decimal form for readability on the wire.

use std::fmt;

/// Symbolic register aliases used by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alias {
    /// `INDR_T` - the room-sensor setpoint, register rf0 / d240.
    IndoorTarget,
    /// `timestamp` - register rf1 / d241.
    Timestamp,
}

impl Alias {
    fn register(self) -> u8 {
        match self {
            Alias::IndoorTarget => 0xf0,
            Alias::Timestamp => 0xf1,
        }
    }
}

/// A parsed inbound field name.
///
/// `Unknown` keeps the (lowercased) original text: malformed keys pass
/// through unchanged rather than failing the whole message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKey {
    Hex(u8),
    Decimal(u8),
    Alias(Alias),
    Unknown(String),
}

impl FieldKey {
    /// Parse an arbitrary incoming key. Never fails; anything that is
    /// neither form comes back as `Unknown`.
    pub fn parse(key: &str) -> Self {
        let lower = key.to_lowercase();

        match lower.as_str() {
            "indr_t" => return FieldKey::Alias(Alias::IndoorTarget),
            "timestamp" => return FieldKey::Alias(Alias::Timestamp),
            _ => {}
        }

        if let Some(digits) = lower.strip_prefix('d') {
            // Decimal form allows leading zeroes; registers above 0xff
            // don't exist and fall through unchanged.
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(reg) = digits.parse::<u16>() {
                    if reg <= 0xff {
                        return FieldKey::Decimal(reg as u8);
                    }
                }
            }
        }

        if lower.len() == 3 {
            if let Some(digits) = lower.strip_prefix('r') {
                // Three characters starting with 'r' that don't parse as
                // hex are treated as already canonical, not as an error.
                if let Ok(reg) = u8::from_str_radix(digits, 16) {
                    return FieldKey::Hex(reg);
                }
            }
        }

        FieldKey::Unknown(lower)
    }

    /// Canonical hex-form key (`rXX`), the snapshot and table index.
    pub fn canonical(&self) -> String {
        match self {
            FieldKey::Hex(reg) | FieldKey::Decimal(reg) => format!("r{:02x}", reg),
            FieldKey::Alias(alias) => format!("r{:02x}", alias.register()),
            FieldKey::Unknown(original) => original.clone(),
        }
    }

    /// Decimal-form key (`dNNN`) for outbound messages, if this key
    /// names a real register.
    pub fn decimal(&self) -> Option<String> {
        match self {
            FieldKey::Hex(reg) | FieldKey::Decimal(reg) => Some(format!("d{:03}", reg)),
            FieldKey::Alias(alias) => Some(format!("d{:03}", alias.register())),
            FieldKey::Unknown(_) => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, FieldKey::Unknown(_))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}
