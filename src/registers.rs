/// How the registers backing a field turn into a physical value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Encoding {
    Raw,
    Scaled { divisor: u16 },
    HighByte,
    LowByte,
    TemperatureHigh,
    TemperatureLow,
    SecondWord,
    Version,
    SerialNumber,
    BatteryType,
    ChargingState,
    LightStatus,
    LightBrightness,
}

impl Encoding {
    // Convenience aliases for the nicely tabulated `for_each_field` definition below.
    pub const RAW: Self = Self::Raw;
    pub const VOLTS: Self = Self::Scaled { divisor: 10 };
    pub const AMPS: Self = Self::Scaled { divisor: 100 };
    pub const HI_BYTE: Self = Self::HighByte;
    pub const LO_BYTE: Self = Self::LowByte;
    pub const TEMP_HI: Self = Self::TemperatureHigh;
    pub const TEMP_LO: Self = Self::TemperatureLow;
    pub const WORD2: Self = Self::SecondWord;
    pub const SERIAL: Self = Self::SerialNumber;
    pub const BAT_TYPE: Self = Self::BatteryType;
    pub const CHG_STATE: Self = Self::ChargingState;
    pub const LIGHT_ON: Self = Self::LightStatus;
    pub const LIGHT_PCT: Self = Self::LightBrightness;
    pub const VERSION: Self = Self::Version;

    /// The number of registers a read for this rule must request.
    pub const fn word_count(self) -> u8 {
        match self {
            Self::SecondWord | Self::Version | Self::SerialNumber => 2,
            _ => 1,
        }
    }

    /// Decodes the registers returned by the device into a physical value.
    ///
    /// `None` when the registers don't carry enough words, or for the derived
    /// street light rules which are computed from other fields instead.
    pub fn decode(self, registers: &[u16]) -> Option<Value> {
        let &first = registers.first()?;
        Some(match self {
            Self::Raw => Value::U16(first),
            Self::Scaled { divisor } => Value::F64(f64::from(first) / f64::from(divisor)),
            Self::HighByte => Value::U16(first >> 8),
            Self::LowByte => Value::U16(first & 0xFF),
            Self::TemperatureHigh => Value::I16(decode_temperature((first >> 8) as u8)),
            Self::TemperatureLow => Value::I16(decode_temperature((first & 0xFF) as u8)),
            // Only the low word of the four-byte counters is reported.
            Self::SecondWord => Value::U16(*registers.get(1)?),
            Self::Version => {
                let &second = registers.get(1)?;
                Value::Text(format!("V{}.{}.{}", first & 0xFF, second >> 8, second & 0xFF))
            }
            Self::SerialNumber => {
                let &second = registers.get(1)?;
                Value::Text(format!("{first}{second}"))
            }
            Self::BatteryType => Value::Label(BatteryType::from_register(first).label()),
            Self::ChargingState => {
                Value::Label(ChargingState::from_register(first & 0xFF).label())
            }
            Self::LightStatus | Self::LightBrightness => return None,
        })
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Raw => f.write_str("u16"),
            Self::Scaled { divisor } => f.write_fmt(format_args!("u16/{divisor}")),
            Self::HighByte => f.write_str("high byte"),
            Self::LowByte => f.write_str("low byte"),
            Self::TemperatureHigh => f.write_str("temperature (high byte)"),
            Self::TemperatureLow => f.write_str("temperature (low byte)"),
            Self::SecondWord => f.write_str("second word"),
            Self::Version => f.write_str("version string"),
            Self::SerialNumber => f.write_str("serial number"),
            Self::BatteryType => f.write_str("battery type"),
            Self::ChargingState => f.write_str("charging state"),
            Self::LightStatus | Self::LightBrightness => f.write_str("derived"),
        }
    }
}

impl serde::Serialize for Encoding {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Temperatures pack a sign bit into bit 7 with the magnitude in the low
/// seven bits.
pub fn decode_temperature(byte: u8) -> i16 {
    let magnitude = i16::from(byte & 0x7F);
    if byte & 0x80 == 0 { magnitude } else { -(magnitude - 128) }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    F64(f64),
    Bool(bool),
    Text(String),
    Label(&'static str),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::U16(n) => Some(f64::from(n)),
            Value::I16(n) => Some(f64::from(n)),
            Value::F64(n) => Some(n),
            Value::Bool(_) | Value::Text(_) | Value::Label(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::U16(n) => f.write_fmt(format_args!("{}", n)),
            Value::I16(n) => f.write_fmt(format_args!("{}", n)),
            Value::F64(n) => f.write_fmt(format_args!("{}", n)),
            Value::Bool(b) => f.write_fmt(format_args!("{}", b)),
            Value::Text(s) => f.write_str(s),
            Value::Label(s) => f.write_str(s),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::U16(n) => serializer.serialize_u16(*n),
            Value::I16(n) => serializer.serialize_i16(*n),
            Value::F64(n) => serializer.serialize_f64(*n),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Label(s) => serializer.serialize_str(s),
        }
    }
}

/// Whether a field's value can change while the controller operates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Persistence {
    /// Nameplate data; read once and remembered for the life of the process.
    Static,
    /// Telemetry; every read goes out to the device.
    Live,
}

impl std::fmt::Display for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Persistence::Static => "static",
            Persistence::Live => "live",
        })
    }
}

impl serde::Serialize for Persistence {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::IntoStaticStr,
    strum::VariantNames,
    num_derive::FromPrimitive,
)]
#[strum(serialize_all = "kebab-case")]
pub enum BatteryType {
    Unknown = 0,
    Open = 1,
    Sealed = 2,
    Gel = 3,
    Lithium = 4,
    SelfCustomized = 5,
}

impl BatteryType {
    /// Raw values the controller should never report fall back to [`Self::Unknown`].
    pub fn from_register(raw: u16) -> Self {
        num_traits::FromPrimitive::from_u16(raw).unwrap_or(Self::Unknown)
    }

    pub fn label(self) -> &'static str {
        self.into()
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::IntoStaticStr,
    strum::VariantNames,
    num_derive::FromPrimitive,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ChargingState {
    Deactivated = 0,
    Activated = 1,
    Mppt = 2,
    Equalizing = 3,
    Boost = 4,
    Floating = 5,
    #[strum(serialize = "current limiting")]
    CurrentLimiting = 6,
}

impl ChargingState {
    /// Raw values the controller should never report fall back to [`Self::Deactivated`].
    pub fn from_register(raw: u16) -> Self {
        num_traits::FromPrimitive::from_u16(raw).unwrap_or(Self::Deactivated)
    }

    pub fn label(self) -> &'static str {
        self.into()
    }
}

macro_rules! for_each_field {
    ($m:ident) => {
        $m! {
            SystemVoltageCurrent: 0x000A, HI_BYTE, Static, "system_voltage_current", "Rated system voltage recognized by the controller";
            SystemIntensityCurrent: 0x000A, LO_BYTE, Live, "system_intensity_current", "Rated charging current of the controller";
            Version: 0x0014, VERSION, Static, "version", "Software version";
            Hardware: 0x0016, VERSION, Static, "hardware", "Hardware version";
            SerialNumber: 0x0018, SERIAL, Static, "serial_number", "Product serial number";
            BatteryPercentage: 0x0100, RAW, Live, "battery_percentage", "Battery state of charge, percent";
            BatteryVoltage: 0x0101, VOLTS, Live, "battery_voltage", "Battery voltage";
            BatteryTemperature: 0x0103, TEMP_LO, Live, "battery_temperature", "Battery temperature";
            ControllerTemperature: 0x0103, TEMP_HI, Live, "controller_temperature", "Controller case temperature";
            LoadVoltage: 0x0104, VOLTS, Live, "load_voltage", "Load output voltage";
            LoadCurrent: 0x0105, AMPS, Live, "load_current", "Load output current";
            LoadPower: 0x0106, RAW, Live, "load_power", "Load output power, watts";
            SolarVoltage: 0x0107, VOLTS, Live, "solar_voltage", "Solar panel voltage";
            SolarCurrent: 0x0108, AMPS, Live, "solar_current", "Solar panel current";
            SolarPower: 0x0109, RAW, Live, "solar_power", "Solar charging power, watts";
            TodayBatteryMinVoltage: 0x010B, VOLTS, Live, "today_battery_min_voltage", "Minimum battery voltage today";
            TodayBatteryMaxVoltage: 0x010C, VOLTS, Live, "today_battery_max_voltage", "Maximum battery voltage today";
            TodayMaxChargingCurrent: 0x010D, AMPS, Live, "today_max_charging_current", "Maximum charging current today";
            TodayMaxChargingPower: 0x010D, RAW, Live, "today_max_charging_power", "Maximum charging power today, watts";
            TodayMaxDischargingCurrent: 0x010E, AMPS, Live, "today_max_discharging_current", "Maximum discharging current today";
            TodayMaxDischargingPower: 0x010E, RAW, Live, "today_max_discharging_power", "Maximum discharging power today, watts";
            TodayChargingAmpHours: 0x0111, RAW, Live, "today_charging_amp_hours", "Charging amp-hours today";
            TodayDischargingAmpHours: 0x0112, RAW, Live, "today_discharging_amp_hours", "Discharging amp-hours today";
            TodayPowerGeneration: 0x0113, RAW, Live, "today_power_generation", "Power generation today";
            TodayPowerConsumption: 0x0114, RAW, Live, "today_power_consumption", "Power consumption today";
            HistoricalTotalDaysOperating: 0x0115, RAW, Live, "historical_total_days_operating", "Total days in operation";
            HistoricalTotalNumberBatteryOverDischarges: 0x0116, RAW, Live, "historical_total_number_battery_over_discharges", "Total count of battery over-discharges";
            HistoricalTotalNumberBatteryFullCharges: 0x0117, RAW, Live, "historical_total_number_battery_full_charges", "Total count of battery full charges";
            HistoricalTotalChargingAmpHours: 0x0118, WORD2, Live, "historical_total_charging_amp_hours", "Total charging amp-hours";
            HistoricalTotalDischargingAmpHours: 0x011A, WORD2, Live, "historical_total_discharging_amp_hours", "Total discharging amp-hours";
            HistoricalCumulativePowerGeneration: 0x011C, WORD2, Live, "historical_cumulative_power_generation", "Cumulative power generation";
            HistoricalCumulativePowerConsumption: 0x011E, WORD2, Live, "historical_cumulative_power_consumption", "Cumulative power consumption";
            StreetLightStatus: 0x0120, LIGHT_ON, Live, "street_light_status", "Whether the street light is lit, derived from panel voltage";
            StreetLightBrightness: 0x0120, LIGHT_PCT, Live, "street_light_brightness", "Street light brightness percentage, derived from panel voltage";
            ChargingStatus: 0x0120, LO_BYTE, Live, "charging_status", "Charging state code";
            ChargingStatusLabel: 0x0120, CHG_STATE, Live, "charging_status_label", "Charging state";
            NominalBatteryCapacity: 0xE002, RAW, Static, "nominal_battery_capacity", "Nominal battery capacity, amp-hours";
            BatteryType: 0xE004, BAT_TYPE, Static, "battery_type", "Configured battery type";
        }
    };
}

macro_rules! make_lists {
    ($($variant:ident: $address:literal, $encoding:ident, $persistence:ident, $name:literal, $description:literal;)+) => {
        /// Every quantity readable out of the controller's register map.
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        #[repr(usize)]
        pub enum Field {
            $($variant),*
        }

        pub static FIELDS: &[Field] = &[$(Field::$variant),*];
        pub static ADDRESSES: &[u16] = &[$($address),*];
        pub static ENCODINGS: &[Encoding] = &[$(Encoding::$encoding),*];
        pub static PERSISTENCE: &[Persistence] = &[$(Persistence::$persistence),*];
        pub static NAMES: &[&str] = &[$($name),*];
        pub static DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_field!(make_lists);

const _ASSERT_TABLE_SORTED: () = const {
    let mut index = 1;
    while index < ADDRESSES.len() {
        if ADDRESSES[index] < ADDRESSES[index - 1] {
            panic!("the field table is not sorted by address!");
        }
        index += 1;
    }
};

impl Field {
    pub fn from_name(name: &str) -> Option<Field> {
        let index = NAMES.iter().position(|v| *v == name);
        index.map(|index| FIELDS[index])
    }

    fn index(self) -> usize {
        self as usize
    }

    pub fn address(self) -> u16 {
        ADDRESSES[self.index()]
    }

    pub fn encoding(self) -> Encoding {
        ENCODINGS[self.index()]
    }

    pub fn persistence(self) -> Persistence {
        PERSISTENCE[self.index()]
    }

    pub fn name(self) -> &'static str {
        NAMES[self.index()]
    }

    pub fn description(self) -> &'static str {
        DESCRIPTIONS[self.index()]
    }

    pub fn word_count(self) -> u8 {
        self.encoding().word_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_decoding() {
        assert_eq!(decode_temperature(0x19), 25);
        assert_eq!(decode_temperature(0x9C), 100);
        assert_eq!(decode_temperature(0x00), 0);
        assert_eq!(decode_temperature(0x7F), 127);
    }

    #[test]
    fn scaled_decoding() {
        assert_eq!(Encoding::VOLTS.decode(&[123]), Some(Value::F64(12.3)));
        assert_eq!(Encoding::AMPS.decode(&[50]), Some(Value::F64(0.5)));
    }

    #[test]
    fn byte_split_decoding() {
        assert_eq!(Encoding::HI_BYTE.decode(&[0x0C20]), Some(Value::U16(0x0C)));
        assert_eq!(Encoding::LO_BYTE.decode(&[0x0C20]), Some(Value::U16(0x20)));
    }

    #[test]
    fn temperature_fields_split_the_register() {
        assert_eq!(Encoding::TEMP_HI.decode(&[0x199C]), Some(Value::I16(25)));
        assert_eq!(Encoding::TEMP_LO.decode(&[0x199C]), Some(Value::I16(100)));
    }

    #[test]
    fn version_string_decoding() {
        assert_eq!(
            Encoding::VERSION.decode(&[0x0001, 0x0203]),
            Some(Value::Text("V1.2.3".to_string()))
        );
    }

    #[test]
    fn serial_number_decoding() {
        assert_eq!(
            Encoding::SERIAL.decode(&[1234, 5678]),
            Some(Value::Text("12345678".to_string()))
        );
    }

    #[test]
    fn second_word_decoding() {
        assert_eq!(Encoding::WORD2.decode(&[0xFFFF, 42]), Some(Value::U16(42)));
        assert_eq!(Encoding::WORD2.decode(&[0xFFFF]), None);
    }

    #[test]
    fn battery_type_lookup() {
        assert_eq!(BatteryType::from_register(4), BatteryType::Lithium);
        assert_eq!(BatteryType::from_register(4).label(), "lithium");
        assert_eq!(BatteryType::from_register(5).label(), "self-customized");
        assert_eq!(BatteryType::from_register(99), BatteryType::Unknown);
        assert_eq!(BatteryType::from_register(99).label(), "unknown");
    }

    #[test]
    fn charging_state_lookup() {
        assert_eq!(ChargingState::from_register(2).label(), "mppt");
        assert_eq!(ChargingState::from_register(6).label(), "current limiting");
        assert_eq!(ChargingState::from_register(77), ChargingState::Deactivated);
    }

    #[test]
    fn charging_state_masks_the_low_byte() {
        assert_eq!(Encoding::CHG_STATE.decode(&[0x0105]), Some(Value::Label("floating")));
        assert_eq!(Encoding::LO_BYTE.decode(&[0x0105]), Some(Value::U16(5)));
    }

    #[test]
    fn derived_fields_do_not_decode_from_registers() {
        assert_eq!(Encoding::LIGHT_ON.decode(&[1]), None);
        assert_eq!(Encoding::LIGHT_PCT.decode(&[1]), None);
    }

    #[test]
    fn field_lookup_by_name() {
        assert_eq!(Field::from_name("battery_voltage"), Some(Field::BatteryVoltage));
        assert_eq!(Field::from_name("no_such_field"), None);
        assert_eq!(Field::BatteryVoltage.address(), 0x0101);
        assert_eq!(Field::BatteryVoltage.encoding(), Encoding::VOLTS);
        assert_eq!(Field::BatteryVoltage.persistence(), Persistence::Live);
    }

    #[test]
    fn two_word_fields_request_two_registers() {
        assert_eq!(Field::Version.word_count(), 2);
        assert_eq!(Field::Hardware.word_count(), 2);
        assert_eq!(Field::HistoricalTotalChargingAmpHours.word_count(), 2);
        assert_eq!(Field::BatteryVoltage.word_count(), 1);
    }
}
