use crate::buffer::PAGE_SIZE;
use crate::error::{PetraError, PetraResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::HeaderPage;

/// The header page is a contiguous, zero-terminated sequence of
/// `(name_len: u32, name bytes, root_page_id: i32)` records. A zero name
/// length marks the end, which makes a freshly zeroed page an empty catalog.
pub struct HeaderPageCodec;

impl HeaderPageCodec {
    pub fn encode(page: &HeaderPage) -> Vec<u8> {
        let mut bytes = vec![];
        for (name, root_page_id) in page.records.iter() {
            debug_assert!(!name.is_empty());
            bytes.extend(CommonCodec::encode_bytes(name.as_bytes()));
            bytes.extend(CommonCodec::encode_i32(*root_page_id));
        }
        assert!(bytes.len() <= PAGE_SIZE, "header page image overflows page");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> PetraResult<DecodedData<HeaderPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(PetraError::Storage(format!(
                "header page image is {} bytes instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;
        let mut records = vec![];
        loop {
            let (name_len, _) = CommonCodec::decode_u32(left_bytes)?;
            if name_len == 0 {
                break;
            }
            let (name_bytes, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let name = String::from_utf8(name_bytes).map_err(|e| {
                PetraError::Storage(format!("header page record name is not utf8: {}", e))
            })?;
            let (root_page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            records.push((name, root_page_id));
        }
        Ok((HeaderPage { records }, PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;

    #[test]
    fn header_page_round_trip() {
        let mut page = HeaderPage::default();
        page.insert_record("orders_pk", 12);
        page.insert_record("users_email", INVALID_PAGE_ID);

        let encoded = HeaderPageCodec::encode(&page);
        assert_eq!(encoded.len(), PAGE_SIZE);
        let (decoded, _) = HeaderPageCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn zeroed_page_decodes_to_empty_catalog() {
        let bytes = vec![0u8; PAGE_SIZE];
        let (decoded, _) = HeaderPageCodec::decode(&bytes).unwrap();
        assert!(decoded.records.is_empty());
    }
}
