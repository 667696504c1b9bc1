/// Modbus CRC-16 (polynomial 0x8005, reflected as 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the checksum of everything already in `frame`, low byte first.
pub(crate) fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push(crc as u8);
    frame.push((crc >> 8) as u8);
}

/// Splits a checksummed frame into body and checks the trailing CRC.
/// On mismatch returns `(expected, received)`.
pub(crate) fn verify_crc(frame: &[u8]) -> Result<&[u8], (u16, u16)> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = (tail[1] as u16) << 8 | tail[0] as u16;
    let expected = crc16(body);
    if expected != received {
        return Err((expected, received));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_append_low_byte_first() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
        assert!(verify_crc(&frame).is_ok());
    }

    #[test]
    fn test_verify_reports_both_values() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00];
        assert_eq!(verify_crc(&frame), Err((0x0BC4, 0x0000)));
    }
}
