//! Per-model register tables and value encoding.
//!
//! Every register address used by the sequencer comes from here. Segment
//! tables are addressed as `base + (segment - 1) * stride`, never through
//! per-call literals.

use serde::{Deserialize, Serialize};

use crate::{ModbusError, Request};

/// Highest segment index on segment-table devices.
pub const MAX_SEGMENT: u8 = 35;

/// Divisor of the decimal high/low split used for 32-bit positions.
pub const DECIMAL_SPLIT: i64 = 10_000;

/// Device families with a built-in register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceModel {
    /// DS5L2 servo drive, driven through its segment (multi-position) table.
    Ds5l2,
    /// ZS pulse-train stepper controller with direct run registers.
    Zs,
}

impl DeviceModel {
    /// Registers between consecutive motion segments, if the model has a segment table.
    pub const fn segment_stride(self) -> Option<u16> {
        match self {
            Self::Ds5l2 => Some(7),
            Self::Zs => None,
        }
    }

    /// Parameter whose write starts, selects or stops motion.
    pub const fn run_parameter(self) -> Parameter {
        match self {
            Self::Ds5l2 => Parameter::CommSegment,
            Self::Zs => Parameter::RunControl,
        }
    }

    /// Value of [`Self::run_parameter`] that stops motion.
    pub const fn stop_value(self) -> i64 {
        0
    }
}

/// Logical parameters across all supported models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    // DS5L2
    ValidSegments,
    StartSegment,
    SegmentPosition,
    SegmentSpeed,
    SegmentAccelTime,
    SegmentDecelTime,
    SegmentAdjustTime,
    /// Communication segment number; writing a segment runs it, 0 stops.
    CommSegment,
    ClearAlarm,
    Enable,

    // ZS
    WorkMode,
    AccelCoefficient,
    PulseFrequency,
    PulseCount,
    /// 0 stop, 1 forward, 2 reverse.
    RunControl,

    /// Non-zero while the device is moving.
    RunStatus,
}

/// How many registers a value occupies and how it is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One register.
    Single,
    /// Two registers, low = `v mod 10000` first, high = `v div 10000` second.
    DecimalSplit,
    /// Two registers, high 16 bits first.
    BinarySplit,
}

impl Width {
    pub const fn registers(self) -> u16 {
        match self {
            Self::Single => 1,
            Self::DecimalSplit | Self::BinarySplit => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Unsigned,
    /// Negative halves are stored as `65536 + v`.
    TwosComplement,
}

/// Encoding rule plus the logical range accepted for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub width: Width,
    pub signedness: Signedness,
    pub min: i64,
    pub max: i64,
}

impl Encoding {
    pub const fn unsigned(min: i64, max: i64) -> Self {
        Self {
            width: Width::Single,
            signedness: Signedness::Unsigned,
            min,
            max,
        }
    }

    /// Fails with `OutOfRange` instead of clamping.
    pub fn check(&self, what: &'static str, value: i64) -> Result<(), ModbusError> {
        if value < self.min || value > self.max {
            return Err(ModbusError::OutOfRange {
                what,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Register words in address order. The range is not checked here; see
    /// [`Encoding::check`].
    pub fn encode(&self, value: i64) -> Result<Vec<u16>, ModbusError> {
        match (self.width, self.signedness) {
            (Width::Single, Signedness::Unsigned) => Ok(vec![to_unsigned_word(value)?]),
            (Width::Single, Signedness::TwosComplement) => Ok(vec![to_twos_complement(value)?]),
            (Width::DecimalSplit, signedness) => {
                // floor division keeps low in 0..10000 for negative values
                let high = value.div_euclid(DECIMAL_SPLIT);
                let low = value.rem_euclid(DECIMAL_SPLIT);
                let word: fn(i64) -> Result<u16, ModbusError> = match signedness {
                    Signedness::Unsigned => to_unsigned_word,
                    Signedness::TwosComplement => to_twos_complement,
                };
                Ok(vec![word(low)?, word(high)?])
            }
            (Width::BinarySplit, Signedness::Unsigned) => {
                let raw = u32::try_from(value).map_err(|_| out_of_word_range(value, 0, u32::MAX as i64))?;
                Ok(vec![(raw >> 16) as u16, raw as u16])
            }
            (Width::BinarySplit, Signedness::TwosComplement) => {
                let raw = i32::try_from(value)
                    .map_err(|_| out_of_word_range(value, i32::MIN as i64, i32::MAX as i64))?
                    as u32;
                Ok(vec![(raw >> 16) as u16, raw as u16])
            }
        }
    }

    /// Inverse of [`Encoding::encode`]. Returns `None` if `words` has the wrong length.
    pub fn decode(&self, words: &[u16]) -> Option<i64> {
        if words.len() != self.width.registers() as usize {
            return None;
        }
        let half = |word: u16| match self.signedness {
            Signedness::Unsigned => word as i64,
            Signedness::TwosComplement => word as i16 as i64,
        };
        let value = match self.width {
            Width::Single => half(words[0]),
            Width::DecimalSplit => half(words[1]) * DECIMAL_SPLIT + half(words[0]),
            Width::BinarySplit => {
                let raw = (words[0] as u32) << 16 | words[1] as u32;
                match self.signedness {
                    Signedness::Unsigned => raw as i64,
                    Signedness::TwosComplement => raw as i32 as i64,
                }
            }
        };
        Some(value)
    }
}

fn out_of_word_range(value: i64, min: i64, max: i64) -> ModbusError {
    ModbusError::OutOfRange {
        what: "register word",
        value,
        min,
        max,
    }
}

fn to_unsigned_word(value: i64) -> Result<u16, ModbusError> {
    u16::try_from(value).map_err(|_| out_of_word_range(value, 0, u16::MAX as i64))
}

/// `65536 + v` for negative `v`; `v` itself must lie in [-32768, 65535].
pub fn to_twos_complement(value: i64) -> Result<u16, ModbusError> {
    if !(-32768..=65535).contains(&value) {
        return Err(out_of_word_range(value, -32768, 65535));
    }
    if value < 0 {
        Ok((65536 + value) as u16)
    } else {
        Ok(value as u16)
    }
}

/// 1-based index into a segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment(u8);

impl Segment {
    pub const FIRST: Segment = Segment(1);

    pub fn new(index: u8) -> Result<Self, ModbusError> {
        if index == 0 || index > MAX_SEGMENT {
            return Err(ModbusError::OutOfRange {
                what: "segment",
                value: index as i64,
                min: 1,
                max: MAX_SEGMENT as i64,
            });
        }
        Ok(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// Register offset of this segment from segment 1.
    pub fn offset(self, stride: u16) -> u16 {
        (self.0 as u16 - 1) * stride
    }
}

/// One row of a model's register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterEntry {
    pub parameter: Parameter,
    /// Address for segment 1, or the fixed address of a global parameter.
    pub base: u16,
    pub per_segment: bool,
    pub encoding: Encoding,
}

const fn global(parameter: Parameter, base: u16, encoding: Encoding) -> RegisterEntry {
    RegisterEntry {
        parameter,
        base,
        per_segment: false,
        encoding,
    }
}

const fn segmented(parameter: Parameter, base: u16, encoding: Encoding) -> RegisterEntry {
    RegisterEntry {
        parameter,
        base,
        per_segment: true,
        encoding,
    }
}

const WORD: Encoding = Encoding::unsigned(0, 65535);
const FLAG: Encoding = Encoding::unsigned(0, 1);
const SEGMENT_NUMBER: Encoding = Encoding::unsigned(0, MAX_SEGMENT as i64);

/// Each half must fit a signed 16-bit word: high in [-32768, 32767].
const DS5L2_POSITION: Encoding = Encoding {
    width: Width::DecimalSplit,
    signedness: Signedness::TwosComplement,
    min: -327_680_000,
    max: 327_679_999,
};

const DS5L2_REGISTERS: &[RegisterEntry] = &[
    global(Parameter::ValidSegments, 0x0404, SEGMENT_NUMBER),
    global(Parameter::StartSegment, 0x0408, SEGMENT_NUMBER),
    segmented(Parameter::SegmentPosition, 0x040A, DS5L2_POSITION),
    // 0.1 rpm units
    segmented(Parameter::SegmentSpeed, 0x040C, WORD),
    segmented(Parameter::SegmentAccelTime, 0x040D, WORD),
    segmented(Parameter::SegmentDecelTime, 0x040E, WORD),
    segmented(Parameter::SegmentAdjustTime, 0x0410, WORD),
    global(Parameter::CommSegment, 0x2209, SEGMENT_NUMBER),
    global(Parameter::ClearAlarm, 0x2000, FLAG),
    global(Parameter::Enable, 0x2105, FLAG),
    // F2-09 read back, same register as CommSegment
    global(Parameter::RunStatus, 0x2209, WORD),
];

const ZS_REGISTERS: &[RegisterEntry] = &[
    global(Parameter::AccelCoefficient, 149, Encoding::unsigned(1, 100)),
    global(Parameter::PulseFrequency, 150, Encoding::unsigned(1, 30000)),
    global(Parameter::WorkMode, 151, WORD),
    global(Parameter::RunControl, 155, Encoding::unsigned(0, 2)),
    global(
        Parameter::PulseCount,
        156,
        Encoding {
            width: Width::BinarySplit,
            signedness: Signedness::Unsigned,
            min: 0,
            max: u32::MAX as i64,
        },
    ),
    global(Parameter::RunStatus, 0, WORD),
];

/// Words to write at `address`, already range-checked and encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub parameter: Parameter,
    pub address: u16,
    pub words: Vec<u16>,
}

impl RegisterWrite {
    /// 0x06 for one word, 0x10 otherwise.
    pub fn to_request(&self) -> Request {
        match self.words.as_slice() {
            [value] => Request::WriteSingleRegister {
                register: self.address,
                value: *value,
            },
            values => Request::WriteMultipleRegisters {
                register: self.address,
                values: values.to_vec(),
            },
        }
    }
}

/// A logical value bound to its encoding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    pub value: i64,
    pub encoding: Encoding,
}

impl RegisterValue {
    pub fn encode(&self) -> Result<Vec<u16>, ModbusError> {
        self.encoding.encode(self.value)
    }
}

/// Read-only register table for one device model.
///
/// On the DS5L2, [`Parameter::RunStatus`] reads back the communication
/// segment register that [`Parameter::CommSegment`] writes. A stop writes 0
/// there, so the poll that follows it reads 0 whether or not the axis has
/// physically stopped. Whether the drive clears the register itself when a
/// segment finishes is unconfirmed on hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    model: DeviceModel,
    entries: &'static [RegisterEntry],
}

impl RegisterMap {
    pub fn for_model(model: DeviceModel) -> Self {
        let entries = match model {
            DeviceModel::Ds5l2 => DS5L2_REGISTERS,
            DeviceModel::Zs => ZS_REGISTERS,
        };
        Self { model, entries }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn entries(&self) -> &'static [RegisterEntry] {
        self.entries
    }

    /// Address and encoding of `parameter`. Per-segment parameters need a segment;
    /// global ones ignore it.
    pub fn resolve(
        &self,
        parameter: Parameter,
        segment: Option<Segment>,
    ) -> Result<(u16, Encoding), ModbusError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.parameter == parameter)
            .ok_or(ModbusError::UnknownParameter {
                model: self.model,
                parameter,
            })?;

        if !entry.per_segment {
            return Ok((entry.base, entry.encoding));
        }

        let segment = segment.ok_or(ModbusError::SegmentRequired(parameter))?;
        let stride = self
            .model
            .segment_stride()
            .ok_or(ModbusError::UnknownParameter {
                model: self.model,
                parameter,
            })?;
        Ok((entry.base + segment.offset(stride), entry.encoding))
    }

    /// Resolves, range-checks and encodes `value` for writing.
    pub fn encode(
        &self,
        parameter: Parameter,
        segment: Option<Segment>,
        value: i64,
    ) -> Result<RegisterWrite, ModbusError> {
        let (address, encoding) = self.resolve(parameter, segment)?;
        encoding.check(parameter_name(parameter), value)?;
        let words = RegisterValue { value, encoding }.encode()?;
        Ok(RegisterWrite {
            parameter,
            address,
            words,
        })
    }

    /// Read request covering every register of `parameter`.
    pub fn read_request(
        &self,
        parameter: Parameter,
        segment: Option<Segment>,
    ) -> Result<Request, ModbusError> {
        let (address, encoding) = self.resolve(parameter, segment)?;
        Ok(Request::ReadHoldingRegisters {
            register: address,
            quantity: encoding.width.registers(),
        })
    }
}

/// Address and encoding of `parameter` on `model`.
pub fn resolve(
    model: DeviceModel,
    parameter: Parameter,
    segment: Option<Segment>,
) -> Result<(u16, Encoding), ModbusError> {
    RegisterMap::for_model(model).resolve(parameter, segment)
}

pub(crate) fn parameter_name(parameter: Parameter) -> &'static str {
    match parameter {
        Parameter::ValidSegments => "valid segments",
        Parameter::StartSegment => "start segment",
        Parameter::SegmentPosition => "segment position",
        Parameter::SegmentSpeed => "segment speed",
        Parameter::SegmentAccelTime => "segment acceleration time",
        Parameter::SegmentDecelTime => "segment deceleration time",
        Parameter::SegmentAdjustTime => "segment adjustment time",
        Parameter::CommSegment => "communication segment",
        Parameter::ClearAlarm => "clear alarm",
        Parameter::Enable => "enable",
        Parameter::WorkMode => "work mode",
        Parameter::AccelCoefficient => "acceleration coefficient",
        Parameter::PulseFrequency => "pulse frequency",
        Parameter::PulseCount => "pulse count",
        Parameter::RunControl => "run control",
        Parameter::RunStatus => "run status",
    }
}
