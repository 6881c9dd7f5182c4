use tokio_util::bytes::{Buf as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Function code 3 caps at 125 registers per read.
pub const MAX_READ_COUNT: u8 = 125;

const READ_HOLDINGS: u8 = 3;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Operation {
    ReadHoldings { address: u16, count: u8 },
}

#[derive(Debug, PartialEq, Clone)]
pub struct Response {
    pub device_id: u8,
    pub kind: ResponseKind,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseKind {
    /// The device answered with a modbus exception code.
    Exception(u8),
    /// Registers decoded from a holding register read, in request order.
    Holdings { registers: Vec<u16> },
}

impl ResponseKind {
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            ResponseKind::Exception(code) => Some(*code),
            ResponseKind::Holdings { .. } => None,
        }
    }
}

/// A frame that arrived whole but did not validate.
///
/// These are recoverable: the bytes are consumed, the caller retries. Only
/// transport-level IO failures terminate the stream.
#[derive(thiserror::Error, Debug, PartialEq, Clone, Copy)]
pub enum FrameError {
    #[error("frame CRC mismatch (computed {computed:#06x}, received {received:#06x})")]
    CrcMismatch { computed: u16, received: u16 },
    #[error("frame carries unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
    #[error("holding register data length {0} is not a whole number of registers")]
    OddByteCount(u8),
}

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF.
///
/// Appended to the wire least-significant byte first, which makes the CRC
/// of a full frame including its own trailer come out as zero.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn verify_crc(frame: &[u8]) -> Result<(), FrameError> {
    let (payload, trailer) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16(payload);
    if computed != received {
        return Err(FrameError::CrcMismatch { computed, received });
    }
    Ok(())
}

fn decode_holdings(frame: &[u8]) -> Result<Response, FrameError> {
    verify_crc(frame)?;
    let byte_count = frame[2];
    if byte_count % 2 != 0 {
        return Err(FrameError::OddByteCount(byte_count));
    }
    let data = &frame[3..frame.len() - 2];
    let registers = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(Response {
        device_id: frame[0],
        kind: ResponseKind::Holdings { registers },
    })
}

pub struct ModbusRTUCodec {}

impl Encoder<&Request> for ModbusRTUCodec {
    type Error = std::io::Error;
    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_start = dst.len();
        match request.operation {
            Operation::ReadHoldings { address, count } => {
                dst.extend([request.device_id, READ_HOLDINGS]);
                dst.extend(address.to_be_bytes());
                dst.extend(u16::from(count).to_be_bytes());
            }
        }
        let crc = crc16(&dst[frame_start..]);
        dst.extend(crc.to_le_bytes());
        trace!(message = "sending encoded buffer", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusRTUCodec {
    type Item = Result<Response, FrameError>;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message = "attempting to decode the buffer", buffer = ?src);
        let &[device_id, function_code, ..] = &src[..] else {
            return Ok(None);
        };
        if function_code == READ_HOLDINGS | EXCEPTION_FLAG {
            // device id, function code, exception code, two CRC bytes.
            let Some(frame) = src.get(..5) else {
                return Ok(None);
            };
            let validation = verify_crc(frame);
            let code = frame[2];
            src.advance(5);
            return Ok(Some(validation.map(|()| Response {
                device_id,
                kind: ResponseKind::Exception(code),
            })));
        }
        if function_code == READ_HOLDINGS {
            let Some(&byte_count) = src.get(2) else {
                return Ok(None);
            };
            let frame_length = 3 + usize::from(byte_count) + 2;
            let Some(frame) = src.get(..frame_length) else {
                return Ok(None);
            };
            let decoded = decode_holdings(frame);
            src.advance(frame_length);
            return Ok(Some(decoded));
        }
        // Not a response to anything we could have asked. There is no
        // reliable way to find the next frame boundary in RTU, so drop
        // everything buffered and let the retry start clean.
        src.clear();
        Ok(Some(Err(FrameError::UnsupportedFunction(function_code))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Option<Result<Response, FrameError>>> {
        let mut codec = ModbusRTUCodec {};
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match codec.decode(&mut buffer).unwrap() {
                None => {
                    out.push(None);
                    return out;
                }
                item => out.push(item),
            }
        }
    }

    #[test]
    fn crc_matches_reference_vector() {
        assert_eq!(crc16(&[0x01, 0x03, 0x01, 0x00, 0x00, 0x02]), 0xF7C5);
    }

    #[test]
    fn crc_over_frame_with_trailer_is_zero() {
        let mut frame = vec![0x01, 0x03, 0x01, 0x00, 0x00, 0x02];
        frame.extend(crc16(&frame).to_le_bytes());
        assert_eq!(crc16(&frame), 0);
    }

    #[test]
    fn encodes_read_request() {
        let mut codec = ModbusRTUCodec {};
        let mut buffer = BytesMut::new();
        let request = Request {
            device_id: 1,
            transaction_id: 42,
            operation: Operation::ReadHoldings { address: 0x0100, count: 2 },
        };
        codec.encode(&request, &mut buffer).unwrap();
        assert_eq!(&buffer[..], [0x01, 0x03, 0x01, 0x00, 0x00, 0x02, 0xC5, 0xF7]);
    }

    #[test]
    fn decodes_holdings_response() {
        let frames = decode_all(&[0x01, 0x03, 0x02, 0x00, 0x7B, 0xF8, 0x67]);
        assert_eq!(
            frames,
            vec![
                Some(Ok(Response {
                    device_id: 1,
                    kind: ResponseKind::Holdings { registers: vec![0x007B] },
                })),
                None,
            ]
        );
    }

    #[test]
    fn decodes_multiple_registers() {
        let frames = decode_all(&[0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78, 0x81, 0x07]);
        assert_eq!(
            frames,
            vec![
                Some(Ok(Response {
                    device_id: 1,
                    kind: ResponseKind::Holdings { registers: vec![0x1234, 0x5678] },
                })),
                None,
            ]
        );
    }

    #[test]
    fn withholds_incomplete_frames() {
        let mut codec = ModbusRTUCodec {};
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0x01, 0x03, 0x02, 0x00]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(buffer.len(), 4);
        buffer.extend([0x7B, 0xF8, 0x67]);
        let decoded = codec.decode(&mut buffer).unwrap();
        assert!(matches!(decoded, Some(Ok(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_corrupted_crc() {
        let frames = decode_all(&[0x01, 0x03, 0x02, 0x00, 0x7B, 0xF8, 0x68]);
        assert_eq!(
            frames,
            vec![
                Some(Err(FrameError::CrcMismatch { computed: 0x67F8, received: 0x68F8 })),
                None,
            ]
        );
    }

    #[test]
    fn decodes_exception_frames() {
        let frames = decode_all(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);
        assert_eq!(
            frames,
            vec![
                Some(Ok(Response { device_id: 1, kind: ResponseKind::Exception(2) })),
                None,
            ]
        );
        assert_eq!(ResponseKind::Exception(2).exception_code(), Some(2));
    }

    #[test]
    fn rejects_unsupported_function_codes() {
        let mut codec = ModbusRTUCodec {};
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0x01, 0x06, 0x00, 0x0A, 0x01, 0x02]);
        let decoded = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded, Some(Err(FrameError::UnsupportedFunction(0x06))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejects_odd_byte_counts() {
        let frames = decode_all(&[0x01, 0x03, 0x03, 0xAA, 0xBB, 0xCC, 0x17, 0x0B]);
        assert_eq!(frames, vec![Some(Err(FrameError::OddByteCount(3))), None]);
    }

    #[test]
    fn decodes_consecutive_frames() {
        let frames = decode_all(&[
            0x01, 0x03, 0x02, 0x00, 0x7B, 0xF8, 0x67, //
            0x01, 0x03, 0x02, 0x19, 0x9C, 0xB3, 0xBD,
        ]);
        assert_eq!(
            frames,
            vec![
                Some(Ok(Response {
                    device_id: 1,
                    kind: ResponseKind::Holdings { registers: vec![0x007B] },
                })),
                Some(Ok(Response {
                    device_id: 1,
                    kind: ResponseKind::Holdings { registers: vec![0x199C] },
                })),
                None,
            ]
        );
    }
}
