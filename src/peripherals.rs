//! Helpers for the non-motion devices on the bus: the O2 gas sensor, the
//! temperature input module and the relay/valve IO module.
//!
//! Each helper owns its [`ModbusLink`] and speaks plain register or coil
//! requests through it. Replies are validated with
//! [`Request::check_response`] and values are taken from the decoded
//! register list.

use log::debug;

use crate::transport::{ModbusLink, Transport};
use crate::{ModbusError, Request, ResponseResult};

/// Holding registers of the O2 gas sensor.
pub mod o2_register {
    pub const STATUS: u16 = 0;
    pub const CONCENTRATION: u16 = 1;
    pub const DECIMAL_PLACES: u16 = 2;
    pub const UNIT: u16 = 3;
    pub const GAS_TYPE: u16 = 4;
}

/// First input register of the temperature module, in tenths of a degree.
pub const TEMPERATURE_REGISTER: u16 = 0x0190;

/// Valve channels on the IO module.
pub const VALVE_COUNT: u16 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum O2Status {
    Normal,
    LowAlarm,
    HighAlarm,
    CommFault,
    Unknown(u16),
}

impl From<u16> for O2Status {
    fn from(code: u16) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::LowAlarm,
            2 => Self::HighAlarm,
            16 => Self::CommFault,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasUnit {
    Ppm,
    Ppb,
    Unknown(u16),
}

impl From<u16> for GasUnit {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::Ppm,
            2 => Self::Ppb,
            other => Self::Unknown(other),
        }
    }
}

/// All five sensor registers read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct O2Reading {
    pub status: O2Status,
    /// Raw value; see [`O2Reading::concentration`].
    pub raw_concentration: u16,
    pub decimal_places: u16,
    pub unit: GasUnit,
    pub gas_type: u16,
}

impl O2Reading {
    /// Concentration scaled by the configured decimal places.
    pub fn concentration(&self) -> f64 {
        let places = self.decimal_places.min(9) as i32;
        self.raw_concentration as f64 / 10f64.powi(places)
    }
}

/// Reads `quantity` registers and requires exactly that many values back.
fn read_words<T: Transport>(
    link: &mut ModbusLink<T>,
    request: Request,
) -> Result<Vec<u16>, ModbusError> {
    match link.execute(&request)? {
        ResponseResult::ReadRegisters { values, .. } => Ok(values),
        received => Err(ModbusError::UnmatchedEcho {
            expected: request.expected_echo(link.slave()),
            received,
        }),
    }
}

/// O2 gas sensor on an RTU line (9600 8N1).
#[derive(Debug)]
pub struct O2Sensor<T> {
    link: ModbusLink<T>,
}

impl<T: Transport> O2Sensor<T> {
    pub fn new(link: ModbusLink<T>) -> Self {
        Self { link }
    }

    pub fn into_link(self) -> ModbusLink<T> {
        self.link
    }

    fn read_register(&mut self, register: u16) -> Result<u16, ModbusError> {
        let request = Request::ReadHoldingRegisters {
            register,
            quantity: 1,
        };
        let values = read_words(&mut self.link, request)?;
        // check_response guarantees one value per requested register
        Ok(values.first().copied().unwrap_or_default())
    }

    pub fn status(&mut self) -> Result<O2Status, ModbusError> {
        self.read_register(o2_register::STATUS).map(O2Status::from)
    }

    pub fn raw_concentration(&mut self) -> Result<u16, ModbusError> {
        self.read_register(o2_register::CONCENTRATION)
    }

    pub fn decimal_places(&mut self) -> Result<u16, ModbusError> {
        self.read_register(o2_register::DECIMAL_PLACES)
    }

    pub fn unit(&mut self) -> Result<GasUnit, ModbusError> {
        self.read_register(o2_register::UNIT).map(GasUnit::from)
    }

    /// Numeric gas type code as reported by the sensor.
    pub fn gas_type(&mut self) -> Result<u16, ModbusError> {
        self.read_register(o2_register::GAS_TYPE)
    }

    pub fn read_all(&mut self) -> Result<O2Reading, ModbusError> {
        let request = Request::ReadHoldingRegisters {
            register: o2_register::STATUS,
            quantity: 5,
        };
        let slave = self.link.slave();
        let values = read_words(&mut self.link, request.clone())?;
        let [status, concentration, decimals, unit, gas_type] = <[u16; 5]>::try_from(values)
            .map_err(|values| ModbusError::UnmatchedEcho {
                expected: request.expected_echo(slave),
                received: ResponseResult::ReadRegisters {
                    slave,
                    function: request.function(),
                    values,
                },
            })?;
        let reading = O2Reading {
            status: status.into(),
            raw_concentration: concentration,
            decimal_places: decimals,
            unit: unit.into(),
            gas_type,
        };
        debug!("O2 reading: {reading:?}");
        Ok(reading)
    }
}

/// Temperature input module, usually reached over Modbus TCP.
#[derive(Debug)]
pub struct TemperatureModule<T> {
    link: ModbusLink<T>,
}

impl<T: Transport> TemperatureModule<T> {
    pub fn new(link: ModbusLink<T>) -> Self {
        Self { link }
    }

    pub fn into_link(self) -> ModbusLink<T> {
        self.link
    }

    /// Raw signed reading of `channel` in tenths of a degree.
    pub fn read_raw(&mut self, channel: u16) -> Result<i16, ModbusError> {
        let request = Request::ReadInputRegisters {
            register: TEMPERATURE_REGISTER.saturating_add(channel),
            quantity: 1,
        };
        let values = read_words(&mut self.link, request)?;
        Ok(values.first().copied().unwrap_or_default() as i16)
    }

    /// Degrees Celsius on `channel`.
    pub fn read_celsius(&mut self, channel: u16) -> Result<f64, ModbusError> {
        let raw = self.read_raw(channel)?;
        Ok(raw as f64 / 10.0)
    }
}

/// Relay outputs and valve coils on the IO module.
#[derive(Debug)]
pub struct IoModule<T> {
    link: ModbusLink<T>,
}

impl<T: Transport> IoModule<T> {
    pub fn new(link: ModbusLink<T>) -> Self {
        Self { link }
    }

    pub fn into_link(self) -> ModbusLink<T> {
        self.link
    }

    /// Switches one output with function 0x05.
    pub fn set_coil(&mut self, coil: u16, on: bool) -> Result<(), ModbusError> {
        self.link.execute(&Request::WriteSingleCoil { coil, on })?;
        Ok(())
    }

    /// Opens or closes valve `valve` (0..8) with a one-coil 0x0F write.
    pub fn set_valve(&mut self, valve: u16, open: bool) -> Result<(), ModbusError> {
        if valve >= VALVE_COUNT {
            return Err(ModbusError::OutOfRange {
                what: "valve",
                value: valve as i64,
                min: 0,
                max: VALVE_COUNT as i64 - 1,
            });
        }
        self.link.execute(&Request::WriteMultipleCoils {
            coil: valve,
            states: vec![open],
        })?;
        Ok(())
    }

    /// Sets consecutive valves starting at 0 in one request.
    pub fn set_valves(&mut self, states: &[bool]) -> Result<(), ModbusError> {
        if states.len() > VALVE_COUNT as usize {
            return Err(ModbusError::OutOfRange {
                what: "valve count",
                value: states.len() as i64,
                min: 1,
                max: VALVE_COUNT as i64,
            });
        }
        self.link.execute(&Request::WriteMultipleCoils {
            coil: 0,
            states: states.to_vec(),
        })?;
        Ok(())
    }
}
