//! Measure type catalog
//!
//! Every analog CoE slot carries a one-byte measure code next to its value.
//! The code names the physical quantity and fixes the decimal scale used to
//! move between the physical value and the fixed-point integer on the wire:
//!
//! - `wire = round(physical * scale)`
//! - `physical = wire / scale`
//!
//! Codes outside the catalog are kept as [`MeasureType::Unknown`] so they
//! survive a decode/encode cycle unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! measure_types {
    ($( $(#[$doc:meta])* $name:ident = $code:literal => ($scale:literal, $unit:literal), )*) => {
        /// Physical quantity tag of an analog channel
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "u8", into = "u8")]
        pub enum MeasureType {
            $( $(#[$doc])* $name, )*
            /// Code not present in the catalog
            Unknown(u8),
        }

        impl MeasureType {
            /// Look up a measure type by its wire code
            pub fn from_code(code: u8) -> Self {
                match code {
                    $( $code => Self::$name, )*
                    other => Self::Unknown(other),
                }
            }

            /// Wire code of this measure type
            pub fn code(&self) -> u8 {
                match self {
                    $( Self::$name => $code, )*
                    Self::Unknown(code) => *code,
                }
            }

            /// Decimal scale factor (1 for unknown codes)
            pub fn scale_factor(&self) -> i32 {
                match self {
                    $( Self::$name => $scale, )*
                    Self::Unknown(_) => 1,
                }
            }

            /// Display unit (empty for unknown codes)
            pub fn unit(&self) -> &'static str {
                match self {
                    $( Self::$name => $unit, )*
                    Self::Unknown(_) => "",
                }
            }

            /// Catalog name
            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                    Self::Unknown(_) => "Unknown",
                }
            }

            /// All catalogued measure types in code order
            pub fn all() -> &'static [MeasureType] {
                &[$( Self::$name, )*]
            }
        }
    };
}

measure_types! {
    /// No physical meaning; the slot is unused
    None = 0 => (1, ""),
    /// Temperature in degrees Celsius
    Temperature = 1 => (10, "°C"),
    SolarRadiation = 2 => (1, "W/m²"),
    LitersPerHour = 3 => (1, "l/h"),
    Seconds = 4 => (1, "sec"),
    Minutes = 5 => (1, "min"),
    LitersPerPulse = 6 => (1, "l/Imp"),
    Kelvin = 7 => (1, "K"),
    Percent = 8 => (10, "%"),
    Kilowatt = 10 => (100, "kW"),
    KilowattHours = 11 => (10, "kWh"),
    MegawattHours = 12 => (1, "MWh"),
    Voltage = 13 => (100, "V"),
    Milliampere = 14 => (10, "mA"),
    Hours = 15 => (1, "hr"),
    Days = 16 => (1, "d"),
    Pulses = 17 => (1, "Imp"),
    Kiloohm = 18 => (100, "kΩ"),
    Liters = 19 => (1, "l"),
    KilometersPerHour = 20 => (1, "km/h"),
    Hertz = 21 => (100, "Hz"),
    LitersPerMinute = 22 => (1, "l/min"),
    Bar = 23 => (100, "bar"),
    Meters = 26 => (10, "m"),
    Millimeters = 27 => (10, "mm"),
    CubicMeters = 28 => (1, "m³"),
    LitersPerDay = 35 => (1, "l/d"),
    MetersPerSecond = 36 => (1, "m/s"),
    CubicMetersPerMinute = 37 => (1, "m³/min"),
    CubicMetersPerHour = 38 => (1, "m³/h"),
    CubicMetersPerDay = 39 => (1, "m³/d"),
    MillimetersPerMinute = 40 => (1, "mm/min"),
    MillimetersPerHour = 41 => (1, "mm/h"),
    MillimetersPerDay = 42 => (1, "mm/d"),
    /// Boolean rendered as on/off
    OnOff = 43 => (1, ""),
    /// Boolean rendered as no/yes
    NoYes = 44 => (1, ""),
    /// Room sensor temperature
    RasTemperature = 46 => (10, "°C"),
    Euro = 50 => (100, "€"),
    Dollar = 51 => (100, "$"),
}

impl MeasureType {
    /// Whether this slot carries a physical value at all
    pub fn is_none(&self) -> bool {
        matches!(self, MeasureType::None)
    }

    /// Convert a physical value to its fixed-point wire integer
    ///
    /// Rounds half away from zero.
    pub fn to_wire(&self, value: f64) -> i64 {
        (value * f64::from(self.scale_factor())).round() as i64
    }

    /// Convert a fixed-point wire integer to its physical value
    pub fn from_wire(&self, raw: i64) -> f64 {
        raw as f64 / f64::from(self.scale_factor())
    }
}

impl Default for MeasureType {
    fn default() -> Self {
        MeasureType::None
    }
}

impl From<u8> for MeasureType {
    fn from(code: u8) -> Self {
        MeasureType::from_code(code)
    }
}

impl From<MeasureType> for u8 {
    fn from(measure: MeasureType) -> Self {
        measure.code()
    }
}

impl fmt::Display for MeasureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasureType::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{}", other.name()),
        }
    }
}
