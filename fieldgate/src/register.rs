//! Register classes and their typed values.
//!
//! Every value read from or written to a device is keyed by its
//! [`RegisterClass`]. The class alone decides whether a value is a bit or a
//! 16-bit word, so values never need to be guessed from their text form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus register classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterClass {
    /// Discrete output coils (read/write, 1-bit)
    #[serde(rename = "coils", alias = "coil")]
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    #[serde(rename = "discrete_inputs", alias = "discrete_input")]
    DiscreteInput,
    /// Holding registers (read/write, 16-bit)
    #[serde(rename = "holding_registers", alias = "holding_register")]
    HoldingRegister,
    /// Input registers (read-only, 16-bit)
    #[serde(rename = "input_registers", alias = "input_register")]
    InputRegister,
}

/// Largest bit count a single read may request (coils, discrete inputs).
pub const MAX_READ_BITS: u16 = 2000;

/// Largest word count a single read may request (holding, input registers).
pub const MAX_READ_WORDS: u16 = 125;

impl RegisterClass {
    pub const ALL: [RegisterClass; 4] = [
        RegisterClass::Coil,
        RegisterClass::DiscreteInput,
        RegisterClass::HoldingRegister,
        RegisterClass::InputRegister,
    ];

    /// Name used in topics and time-series tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterClass::Coil => "coils",
            RegisterClass::DiscreteInput => "discrete_inputs",
            RegisterClass::HoldingRegister => "holding_registers",
            RegisterClass::InputRegister => "input_registers",
        }
    }

    /// Name used in write commands.
    pub fn command_name(&self) -> &'static str {
        match self {
            RegisterClass::Coil => "coil",
            RegisterClass::DiscreteInput => "discrete_input",
            RegisterClass::HoldingRegister => "holding_register",
            RegisterClass::InputRegister => "input_register",
        }
    }

    /// Resolve either the topic name or the command name of a class.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == name || class.command_name() == name)
    }

    /// Function code used to read this class.
    pub fn read_function_code(&self) -> u8 {
        match self {
            RegisterClass::Coil => 1,
            RegisterClass::DiscreteInput => 2,
            RegisterClass::HoldingRegister => 3,
            RegisterClass::InputRegister => 4,
        }
    }

    /// Function code used to write a single value, if the class is writable.
    pub fn write_function_code(&self) -> Option<u8> {
        match self {
            RegisterClass::Coil => Some(5),
            RegisterClass::HoldingRegister => Some(6),
            RegisterClass::DiscreteInput | RegisterClass::InputRegister => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.write_function_code().is_some()
    }

    /// Whether values of this class are single bits.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterClass::Coil | RegisterClass::DiscreteInput)
    }

    /// Maximum quantity a single read request may ask for.
    pub fn max_read_count(&self) -> u16 {
        if self.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_WORDS
        }
    }

    /// Decode a bus payload into this class's value domain.
    ///
    /// Bit classes accept only `true`/`false`; word classes accept only a
    /// decimal `u16`.
    pub fn decode_payload(&self, text: &str) -> Option<RegisterValue> {
        let text = text.trim();
        if self.is_bit() {
            match text {
                "true" => Some(RegisterValue::Bit(true)),
                "false" => Some(RegisterValue::Bit(false)),
                _ => None,
            }
        } else {
            text.parse::<u16>().ok().map(RegisterValue::Word)
        }
    }
}

impl fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held by a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    /// Coil or discrete input state.
    Bit(bool),
    /// Holding or input register contents.
    Word(u16),
}

impl RegisterValue {
    /// Whether this value belongs to the value domain of `class`.
    pub fn fits(&self, class: RegisterClass) -> bool {
        match self {
            RegisterValue::Bit(_) => class.is_bit(),
            RegisterValue::Word(_) => !class.is_bit(),
        }
    }
}

/// Renders the bus payload form: `true`/`false` or decimal.
impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Bit(v) => write!(f, "{}", v),
            RegisterValue::Word(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_codes() {
        assert_eq!(RegisterClass::Coil.read_function_code(), 1);
        assert_eq!(RegisterClass::DiscreteInput.read_function_code(), 2);
        assert_eq!(RegisterClass::HoldingRegister.read_function_code(), 3);
        assert_eq!(RegisterClass::InputRegister.read_function_code(), 4);

        assert_eq!(RegisterClass::Coil.write_function_code(), Some(5));
        assert_eq!(RegisterClass::HoldingRegister.write_function_code(), Some(6));
        assert!(!RegisterClass::DiscreteInput.is_writable());
        assert!(!RegisterClass::InputRegister.is_writable());
    }

    #[test]
    fn test_names() {
        assert_eq!(RegisterClass::HoldingRegister.as_str(), "holding_registers");
        assert_eq!(
            RegisterClass::from_name("holding_register"),
            Some(RegisterClass::HoldingRegister)
        );
        assert_eq!(
            RegisterClass::from_name("discrete_inputs"),
            Some(RegisterClass::DiscreteInput)
        );
        assert_eq!(RegisterClass::from_name("registers"), None);
    }

    #[test]
    fn test_serde_names() {
        let class: RegisterClass = serde_json::from_str("\"coil\"").unwrap();
        assert_eq!(class, RegisterClass::Coil);
        let class: RegisterClass = serde_json::from_str("\"input_registers\"").unwrap();
        assert_eq!(class, RegisterClass::InputRegister);
        assert_eq!(
            serde_json::to_string(&RegisterClass::DiscreteInput).unwrap(),
            "\"discrete_inputs\""
        );
    }

    #[test]
    fn test_decode_is_keyed_by_class() {
        assert_eq!(
            RegisterClass::Coil.decode_payload("true"),
            Some(RegisterValue::Bit(true))
        );
        assert_eq!(RegisterClass::Coil.decode_payload("1"), None);
        assert_eq!(
            RegisterClass::InputRegister.decode_payload("65535"),
            Some(RegisterValue::Word(65535))
        );
        assert_eq!(RegisterClass::InputRegister.decode_payload("true"), None);
        assert_eq!(RegisterClass::HoldingRegister.decode_payload("1.5"), None);
        assert_eq!(RegisterClass::HoldingRegister.decode_payload("-1"), None);
    }

    #[test]
    fn test_value_domain() {
        assert!(RegisterValue::Bit(true).fits(RegisterClass::Coil));
        assert!(!RegisterValue::Bit(true).fits(RegisterClass::HoldingRegister));
        assert!(RegisterValue::Word(7).fits(RegisterClass::InputRegister));
        assert!(!RegisterValue::Word(7).fits(RegisterClass::DiscreteInput));
    }

    #[test]
    fn test_payload_rendering() {
        assert_eq!(RegisterValue::Bit(false).to_string(), "false");
        assert_eq!(RegisterValue::Word(100).to_string(), "100");
    }
}
