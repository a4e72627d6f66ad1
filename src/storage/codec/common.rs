use crate::error::{PetraError, PetraResult};
use crate::storage::codec::DecodedData;

pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        vec![data]
    }

    pub fn decode_u8(bytes: &[u8]) -> PetraResult<DecodedData<u8>> {
        if bytes.is_empty() {
            return Err(PetraError::Internal(
                "cannot decode u8 from empty input".to_string(),
            ));
        }
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> PetraResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(PetraError::Internal(format!(
                "cannot decode u32 from {} bytes",
                bytes.len()
            )));
        }
        let data = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((data, 4))
    }

    pub fn encode_i32(data: i32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i32(bytes: &[u8]) -> PetraResult<DecodedData<i32>> {
        if bytes.len() < 4 {
            return Err(PetraError::Internal(format!(
                "cannot decode i32 from {} bytes",
                bytes.len()
            )));
        }
        let data = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((data, 4))
    }

    /// Length-prefixed byte string (u32 length).
    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(CommonCodec::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> PetraResult<DecodedData<Vec<u8>>> {
        let (length, offset) = CommonCodec::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(PetraError::Internal(format!(
                "input length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        let data = bytes[offset..offset + length].to_vec();
        Ok((data, offset + length))
    }
}
