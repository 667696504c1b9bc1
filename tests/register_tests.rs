use a3ot_modbus_motion::registers::{self, Encoding, Signedness, Width};
use a3ot_modbus_motion::{DeviceModel, ModbusError, Parameter, RegisterMap, Request, Segment};

#[cfg(test)]
mod resolve_tests {
    use super::*;

    #[test]
    fn test_segment_stride_of_seven() {
        let map = RegisterMap::for_model(DeviceModel::Ds5l2);

        let (first, _) = map
            .resolve(Parameter::SegmentPosition, Some(Segment::FIRST))
            .unwrap();
        let (third, _) = map
            .resolve(Parameter::SegmentPosition, Some(Segment::new(3).unwrap()))
            .unwrap();
        let (speed, _) = map
            .resolve(Parameter::SegmentSpeed, Some(Segment::new(2).unwrap()))
            .unwrap();

        assert_eq!(first, 0x040A);
        assert_eq!(third, 0x040A + 14);
        assert_eq!(speed, 0x040C + 7);
    }

    #[test]
    fn test_global_ignores_segment() {
        let with = registers::resolve(
            DeviceModel::Ds5l2,
            Parameter::CommSegment,
            Some(Segment::new(5).unwrap()),
        )
        .unwrap();
        let without = registers::resolve(DeviceModel::Ds5l2, Parameter::CommSegment, None).unwrap();

        assert_eq!(with.0, 0x2209);
        assert_eq!(with, without);
    }

    #[test]
    fn test_segment_required() {
        let result = registers::resolve(DeviceModel::Ds5l2, Parameter::SegmentSpeed, None);
        assert!(matches!(
            result,
            Err(ModbusError::SegmentRequired(Parameter::SegmentSpeed))
        ));
    }

    #[test]
    fn test_unknown_parameter() {
        let result = registers::resolve(DeviceModel::Zs, Parameter::SegmentPosition, None);
        assert!(matches!(
            result,
            Err(ModbusError::UnknownParameter {
                model: DeviceModel::Zs,
                parameter: Parameter::SegmentPosition
            })
        ));

        let result = registers::resolve(DeviceModel::Ds5l2, Parameter::PulseFrequency, None);
        assert!(matches!(result, Err(ModbusError::UnknownParameter { .. })));
    }

    #[test]
    fn test_zs_addresses() {
        let map = RegisterMap::for_model(DeviceModel::Zs);
        let address = |parameter| map.resolve(parameter, None).unwrap().0;

        assert_eq!(address(Parameter::AccelCoefficient), 149);
        assert_eq!(address(Parameter::PulseFrequency), 150);
        assert_eq!(address(Parameter::WorkMode), 151);
        assert_eq!(address(Parameter::RunControl), 155);
        assert_eq!(address(Parameter::PulseCount), 156);
    }

    #[test]
    fn test_status_read_request() {
        let map = RegisterMap::for_model(DeviceModel::Zs);
        assert_eq!(
            map.read_request(Parameter::RunStatus, None).unwrap(),
            Request::ReadHoldingRegisters {
                register: 0,
                quantity: 1
            }
        );
    }
}

#[cfg(test)]
mod range_tests {
    use super::*;

    #[test]
    fn test_accel_coefficient_range() {
        let map = RegisterMap::for_model(DeviceModel::Zs);

        let result = map.encode(Parameter::AccelCoefficient, None, 150);
        assert!(matches!(
            result,
            Err(ModbusError::OutOfRange {
                value: 150,
                min: 1,
                max: 100,
                ..
            })
        ));

        let write = map.encode(Parameter::AccelCoefficient, None, 100).unwrap();
        assert_eq!(write.address, 149);
        assert_eq!(write.words, vec![100]);
    }

    #[test]
    fn test_frequency_range() {
        let map = RegisterMap::for_model(DeviceModel::Zs);

        assert!(map.encode(Parameter::PulseFrequency, None, 0).is_err());
        assert!(map.encode(Parameter::PulseFrequency, None, 30001).is_err());
        assert!(map.encode(Parameter::PulseFrequency, None, 30000).is_ok());
    }

    #[test]
    fn test_segment_count_range() {
        let map = RegisterMap::for_model(DeviceModel::Ds5l2);

        assert!(map.encode(Parameter::ValidSegments, None, 0).is_ok());
        assert!(map.encode(Parameter::ValidSegments, None, 35).is_ok());
        assert!(matches!(
            map.encode(Parameter::ValidSegments, None, 36),
            Err(ModbusError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_position_range() {
        let map = RegisterMap::for_model(DeviceModel::Ds5l2);
        let segment = Some(Segment::FIRST);

        assert!(map.encode(Parameter::SegmentPosition, segment, 327_679_999).is_ok());
        assert!(map.encode(Parameter::SegmentPosition, segment, -327_680_000).is_ok());
        assert!(map.encode(Parameter::SegmentPosition, segment, 327_680_000).is_err());
    }
}

#[cfg(test)]
mod encoding_tests {
    use super::*;

    const POSITION: Encoding = Encoding {
        width: Width::DecimalSplit,
        signedness: Signedness::TwosComplement,
        min: -327_680_000,
        max: 327_679_999,
    };

    #[test]
    fn test_negative_decimal_split() {
        // high = -5 -> 65531, low = 0
        let words = POSITION.encode(-50000).unwrap();
        assert_eq!(words, vec![0, 65531]);
        assert_eq!(POSITION.decode(&words), Some(-50000));
    }

    #[test]
    fn test_positive_decimal_split() {
        let words = POSITION.encode(123_456).unwrap();
        assert_eq!(words, vec![3456, 12]);
        assert_eq!(POSITION.decode(&words), Some(123_456));
    }

    #[test]
    fn test_negative_with_remainder_round_trips() {
        // floor split keeps the low word non-negative
        let words = POSITION.encode(-1).unwrap();
        assert_eq!(words, vec![9999, 65535]);
        assert_eq!(POSITION.decode(&words), Some(-1));
    }

    #[test]
    fn test_position_write_is_one_multiple_write() {
        let map = RegisterMap::for_model(DeviceModel::Ds5l2);
        let write = map
            .encode(Parameter::SegmentPosition, Some(Segment::FIRST), 1000)
            .unwrap();

        assert_eq!(
            write.to_request(),
            Request::WriteMultipleRegisters {
                register: 0x040A,
                values: vec![1000, 0],
            }
        );
    }

    #[test]
    fn test_pulse_count_high_word_first() {
        let map = RegisterMap::for_model(DeviceModel::Zs);
        let write = map.encode(Parameter::PulseCount, None, 100_000).unwrap();

        assert_eq!(write.words, vec![0x0001, 0x86A0]);
        assert!(matches!(
            write.to_request(),
            Request::WriteMultipleRegisters { register: 156, .. }
        ));
    }

    #[test]
    fn test_single_word_is_single_write() {
        let map = RegisterMap::for_model(DeviceModel::Ds5l2);
        let write = map.encode(Parameter::Enable, None, 1).unwrap();

        assert_eq!(
            write.to_request(),
            Request::WriteSingleRegister {
                register: 0x2105,
                value: 1
            }
        );
    }
}
