use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::Stream;

use crate::connection::{self, Connection};
use crate::registers::{Encoding, FIELDS, Field, Persistence, Value};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the registers backing `{1}`")]
    Transport(#[source] connection::Error, &'static str),
    #[error("the device returned too few registers for `{0}`")]
    MissingData(&'static str),
}

/// The transport quantum the decoding layer needs: one holding-register read.
pub trait ReadRegisters {
    fn read_holdings(
        &self,
        address: u16,
        count: u8,
    ) -> impl std::future::Future<Output = Result<Vec<u16>, connection::Error>> + Send;
}

impl ReadRegisters for Connection {
    fn read_holdings(
        &self,
        address: u16,
        count: u8,
    ) -> impl std::future::Future<Output = Result<Vec<u16>, connection::Error>> + Send {
        Connection::read_holdings(self, address, count)
    }
}

/// Nameplate values remembered after their first successful read.
struct StaticCache {
    values: Mutex<[Option<Value>; FIELDS.len()]>,
}

impl StaticCache {
    fn new() -> Self {
        Self { values: Mutex::new([const { None }; FIELDS.len()]) }
    }

    fn get(&self, field: Field) -> Option<Value> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())[field as usize].clone()
    }

    fn insert(&self, field: Field, value: &Value) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut values[field as usize];
        if slot.is_none() {
            *slot = Some(value.clone());
        }
    }
}

const BRIGHTNESS_FLOOR_VOLTS: f32 = 12.3;
const BRIGHTNESS_CEILING_VOLTS: f32 = 41.5;

/// Brightness follows the panel voltage linearly between the floor and the
/// ceiling, truncated to a whole percentage.
pub fn brightness_from_solar_voltage(volts: f64) -> u8 {
    let volts = volts as f32;
    if volts >= BRIGHTNESS_CEILING_VOLTS {
        100
    } else if volts < BRIGHTNESS_FLOOR_VOLTS {
        0
    } else {
        let range = BRIGHTNESS_CEILING_VOLTS - BRIGHTNESS_FLOOR_VOLTS;
        (100.0 * (volts - BRIGHTNESS_FLOOR_VOLTS) / range) as u8
    }
}

/// Field-level facade over the register transport.
///
/// Decodes raw holding registers into physical values, keeps the static
/// nameplate fields cached, and derives the street light readings which the
/// controller does not report directly.
pub struct RoverDevice<C> {
    connection: C,
    device_id: u8,
    cache: StaticCache,
}

impl<C: ReadRegisters> RoverDevice<C> {
    pub fn new(connection: C, device_id: u8) -> Self {
        Self { connection, device_id, cache: StaticCache::new() }
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn into_connection(self) -> C {
        self.connection
    }

    /// One best-effort pass over the nameplate fields so that later reads hit
    /// the cache. Fields that fail here are backfilled lazily.
    pub async fn prime_static_cache(&self) {
        for &field in FIELDS {
            if field.persistence() != Persistence::Static {
                continue;
            }
            if let Err(e) = self.read_field(field).await {
                tracing::debug!(
                    message = "could not prime a static field",
                    field = field.name(),
                    error = (&e as &dyn std::error::Error),
                );
            }
        }
    }

    pub async fn read_field(&self, field: Field) -> Result<Value, Error> {
        match field.encoding() {
            Encoding::LightStatus => {
                return Ok(Value::Bool(self.street_light_status().await?));
            }
            Encoding::LightBrightness => {
                return Ok(Value::U16(self.street_light_brightness().await?.into()));
            }
            _ => {}
        }
        if field.persistence() == Persistence::Static {
            if let Some(value) = self.cache.get(field) {
                return Ok(value);
            }
        }
        let value = self.fetch(field).await?;
        if field.persistence() == Persistence::Static {
            self.cache.insert(field, &value);
        }
        Ok(value)
    }

    async fn fetch(&self, field: Field) -> Result<Value, Error> {
        let registers = self
            .connection
            .read_holdings(field.address(), field.word_count())
            .await
            .map_err(|e| Error::Transport(e, field.name()))?;
        field.encoding().decode(&registers).ok_or(Error::MissingData(field.name()))
    }

    async fn f64_field(&self, field: Field) -> Result<f64, Error> {
        let value = self.read_field(field).await?;
        value.as_f64().ok_or(Error::MissingData(field.name()))
    }

    async fn u16_field(&self, field: Field) -> Result<u16, Error> {
        match self.read_field(field).await? {
            Value::U16(value) => Ok(value),
            _ => Err(Error::MissingData(field.name())),
        }
    }

    async fn i16_field(&self, field: Field) -> Result<i16, Error> {
        match self.read_field(field).await? {
            Value::I16(value) => Ok(value),
            _ => Err(Error::MissingData(field.name())),
        }
    }

    async fn text_field(&self, field: Field) -> Result<String, Error> {
        match self.read_field(field).await? {
            Value::Text(value) => Ok(value),
            _ => Err(Error::MissingData(field.name())),
        }
    }

    async fn label_field(&self, field: Field) -> Result<&'static str, Error> {
        match self.read_field(field).await? {
            Value::Label(value) => Ok(value),
            _ => Err(Error::MissingData(field.name())),
        }
    }

    pub async fn system_voltage_current(&self) -> Result<u16, Error> {
        self.u16_field(Field::SystemVoltageCurrent).await
    }

    pub async fn system_intensity_current(&self) -> Result<u16, Error> {
        self.u16_field(Field::SystemIntensityCurrent).await
    }

    pub async fn version(&self) -> Result<String, Error> {
        self.text_field(Field::Version).await
    }

    pub async fn hardware(&self) -> Result<String, Error> {
        self.text_field(Field::Hardware).await
    }

    pub async fn serial_number(&self) -> Result<String, Error> {
        self.text_field(Field::SerialNumber).await
    }

    pub async fn battery_percentage(&self) -> Result<u16, Error> {
        self.u16_field(Field::BatteryPercentage).await
    }

    pub async fn battery_voltage(&self) -> Result<f64, Error> {
        self.f64_field(Field::BatteryVoltage).await
    }

    pub async fn battery_temperature(&self) -> Result<i16, Error> {
        self.i16_field(Field::BatteryTemperature).await
    }

    pub async fn controller_temperature(&self) -> Result<i16, Error> {
        self.i16_field(Field::ControllerTemperature).await
    }

    pub async fn load_voltage(&self) -> Result<f64, Error> {
        self.f64_field(Field::LoadVoltage).await
    }

    pub async fn load_current(&self) -> Result<f64, Error> {
        self.f64_field(Field::LoadCurrent).await
    }

    pub async fn load_power(&self) -> Result<u16, Error> {
        self.u16_field(Field::LoadPower).await
    }

    pub async fn solar_voltage(&self) -> Result<f64, Error> {
        self.f64_field(Field::SolarVoltage).await
    }

    pub async fn solar_current(&self) -> Result<f64, Error> {
        self.f64_field(Field::SolarCurrent).await
    }

    pub async fn solar_power(&self) -> Result<u16, Error> {
        self.u16_field(Field::SolarPower).await
    }

    pub async fn charging_status(&self) -> Result<u16, Error> {
        self.u16_field(Field::ChargingStatus).await
    }

    pub async fn charging_status_label(&self) -> Result<&'static str, Error> {
        self.label_field(Field::ChargingStatusLabel).await
    }

    pub async fn nominal_battery_capacity(&self) -> Result<u16, Error> {
        self.u16_field(Field::NominalBatteryCapacity).await
    }

    pub async fn battery_type(&self) -> Result<&'static str, Error> {
        self.label_field(Field::BatteryType).await
    }

    /// The controller has no readable register for the light itself, so the
    /// brightness is inferred from the panel voltage.
    ///
    /// Must not route through [`Self::read_field`], whose derived-field arms
    /// call back into this method.
    pub async fn street_light_brightness(&self) -> Result<u8, Error> {
        let field = Field::SolarVoltage;
        let value = self.fetch(field).await?;
        let volts = value.as_f64().ok_or(Error::MissingData(field.name()))?;
        Ok(brightness_from_solar_voltage(volts))
    }

    pub async fn street_light_status(&self) -> Result<bool, Error> {
        let brightness = self.street_light_brightness().await?;
        Ok(f64::from(brightness) > f64::from(BRIGHTNESS_FLOOR_VOLTS))
    }

    /// Reads every field of the view, leaving out the ones that fail.
    pub async fn view(&self, view: View) -> BTreeMap<&'static str, Value> {
        let mut values = self.collect(view.fields()).await;
        if matches!(view, View::Controller | View::All) {
            values.insert("device_id", Value::U16(self.device_id.into()));
        }
        values
    }

    async fn collect(&self, fields: &[Field]) -> BTreeMap<&'static str, Value> {
        let mut values = BTreeMap::new();
        for &field in fields {
            match self.read_field(field).await {
                Ok(value) => {
                    values.insert(field.name(), value);
                }
                Err(e) => {
                    tracing::debug!(
                        message = "leaving out a field that could not be read",
                        field = field.name(),
                        error = (&e as &dyn std::error::Error),
                    );
                }
            }
        }
        values
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
    Controller,
    Solar,
    Battery,
    Load,
    Today,
    Historical,
    All,
}

impl View {
    /// The fields batched by this view.
    pub fn fields(self) -> &'static [Field] {
        use Field::*;
        match self {
            View::Controller => &[
                SystemVoltageCurrent,
                SystemIntensityCurrent,
                Version,
                Hardware,
                SerialNumber,
                BatteryType,
                NominalBatteryCapacity,
            ],
            View::Solar => &[SolarVoltage, SolarCurrent, SolarPower],
            View::Battery => &[
                BatteryPercentage,
                BatteryVoltage,
                BatteryTemperature,
                ChargingStatus,
                ChargingStatusLabel,
            ],
            View::Load => &[LoadVoltage, LoadCurrent, LoadPower],
            View::Today => &[
                TodayBatteryMaxVoltage,
                TodayBatteryMinVoltage,
                TodayMaxChargingCurrent,
                TodayMaxDischargingCurrent,
                TodayMaxChargingPower,
                TodayChargingAmpHours,
                TodayDischargingAmpHours,
                TodayPowerGeneration,
                TodayPowerConsumption,
            ],
            View::Historical => &[
                HistoricalTotalDaysOperating,
                HistoricalTotalNumberBatteryOverDischarges,
                HistoricalTotalNumberBatteryFullCharges,
                HistoricalTotalChargingAmpHours,
                HistoricalTotalDischargingAmpHours,
                HistoricalCumulativePowerGeneration,
                HistoricalCumulativePowerConsumption,
            ],
            View::All => &[
                SystemVoltageCurrent,
                SystemIntensityCurrent,
                Version,
                Hardware,
                SerialNumber,
                BatteryType,
                NominalBatteryCapacity,
                SolarVoltage,
                SolarCurrent,
                SolarPower,
                BatteryPercentage,
                BatteryVoltage,
                BatteryTemperature,
                ChargingStatus,
                ChargingStatusLabel,
                LoadVoltage,
                LoadCurrent,
                LoadPower,
                TodayBatteryMaxVoltage,
                TodayBatteryMinVoltage,
                TodayMaxChargingCurrent,
                TodayMaxDischargingCurrent,
                TodayMaxChargingPower,
                TodayChargingAmpHours,
                TodayDischargingAmpHours,
                TodayPowerGeneration,
                TodayPowerConsumption,
                HistoricalTotalDaysOperating,
                HistoricalTotalNumberBatteryOverDischarges,
                HistoricalTotalNumberBatteryFullCharges,
                HistoricalTotalChargingAmpHours,
                HistoricalTotalDischargingAmpHours,
                HistoricalCumulativePowerGeneration,
                HistoricalCumulativePowerConsumption,
                ControllerTemperature,
                StreetLightStatus,
                StreetLightBrightness,
            ],
        }
    }
}

/// Periodic samples of a view, the first one immediate.
pub fn cycles<C: ReadRegisters>(
    device: &RoverDevice<C>,
    period: Duration,
    view: View,
) -> impl Stream<Item = BTreeMap<&'static str, Value>> + '_ {
    async_stream::stream! {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            yield device.view(view).await;
        }
    }
}
