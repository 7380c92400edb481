//! Wire protocol for the full-duplex page mode.
//!
//! Fixed-size binary records, all multi-byte fields in network byte order:
//!
//! ```text
//! request:  { request_id: u32, page_number: u32 }
//! response: { request_id: u32, status: u32, page_number: u32 } + page_size payload
//! ```
//!
//! An invalid page number is answered in-band with [`STATUS_INVALID_PAGE`]
//! and a filler payload of the same length as a success payload, so the
//! client's fixed-length parse never depends on the status.

use bytes::{Buf, BufMut};

use crate::pages::PageStore;

/// Size of an encoded request on the wire.
pub const REQUEST_LEN: usize = 8;
/// Size of an encoded response header on the wire.
pub const RESPONSE_HEADER_LEN: usize = 12;

/// The requested page exists and its content follows the header.
pub const STATUS_OK: u32 = 200;
/// The requested page number is out of range; a filler payload follows.
pub const STATUS_INVALID_PAGE: u32 = 400;

/// Byte used to fill the payload of an error response.
pub const FILLER_BYTE: u8 = 0xFA;

/// A client page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub request_id: u32,
    pub page_number: u32,
}

impl PageRequest {
    /// Decode from the start of `buf`; `None` if fewer than
    /// [`REQUEST_LEN`] bytes are available.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < REQUEST_LEN {
            return None;
        }
        Some(Self {
            request_id: buf.get_u32(),
            page_number: buf.get_u32(),
        })
    }

    /// Encode into the start of `out`.
    ///
    /// # Panics
    /// Panics if `out` is shorter than [`REQUEST_LEN`].
    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32(self.request_id);
        out.put_u32(self.page_number);
    }
}

/// Header of a server response, echoing the request identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub request_id: u32,
    pub status: u32,
    pub page_number: u32,
}

impl ResponseHeader {
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < RESPONSE_HEADER_LEN {
            return None;
        }
        Some(Self {
            request_id: buf.get_u32(),
            status: buf.get_u32(),
            page_number: buf.get_u32(),
        })
    }

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32(self.request_id);
        out.put_u32(self.status);
        out.put_u32(self.page_number);
    }
}

/// Total length of an encoded response for a given page size.
#[inline]
pub fn response_len(page_size: usize) -> usize {
    RESPONSE_HEADER_LEN + page_size
}

/// Encode the full response for `request` into `out`.
///
/// Success and error responses have identical total length. Returns the
/// number of bytes written.
///
/// # Panics
/// Panics if `out` is shorter than `response_len(pages.page_size())`.
pub fn encode_response(request: &PageRequest, pages: &PageStore, out: &mut [u8]) -> usize {
    let total = response_len(pages.page_size());
    let (header_buf, payload) = out[..total].split_at_mut(RESPONSE_HEADER_LEN);

    match pages.page(request.page_number as usize) {
        Some(content) => {
            ResponseHeader {
                request_id: request.request_id,
                status: STATUS_OK,
                page_number: request.page_number,
            }
            .encode(header_buf);
            payload.copy_from_slice(content);
        }
        None => {
            ResponseHeader {
                request_id: request.request_id,
                status: STATUS_INVALID_PAGE,
                page_number: request.page_number,
            }
            .encode(header_buf);
            payload.fill(FILLER_BYTE);
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::FillPattern;

    #[test]
    fn test_request_round_trip() {
        let request = PageRequest {
            request_id: 0xDEAD_BEEF,
            page_number: 42,
        };
        let mut wire = [0u8; REQUEST_LEN];
        request.encode(&mut wire);

        // Network byte order on the wire.
        assert_eq!(&wire[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&wire[4..], &[0, 0, 0, 42]);

        assert_eq!(PageRequest::decode(&wire), Some(request));
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(PageRequest::decode(&[0u8; 7]).is_none());
        assert!(ResponseHeader::decode(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_success_response_carries_page_content() {
        let pages = PageStore::new(16, 256, FillPattern::Alphabet);
        let request = PageRequest {
            request_id: 7,
            page_number: 3,
        };
        let mut out = vec![0u8; response_len(256)];
        let written = encode_response(&request, &pages, &mut out);

        assert_eq!(written, RESPONSE_HEADER_LEN + 256);
        let header = ResponseHeader::decode(&out).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.status, STATUS_OK);
        assert_eq!(header.page_number, 3);
        assert_eq!(&out[RESPONSE_HEADER_LEN..], pages.page(3).unwrap());
    }

    #[test]
    fn test_error_response_same_length_with_filler() {
        let pages = PageStore::new(16, 256, FillPattern::Alphabet);
        let request = PageRequest {
            request_id: 9,
            page_number: 2000,
        };
        let mut out = vec![0u8; response_len(256)];
        let written = encode_response(&request, &pages, &mut out);

        // An out-of-range page still produces a full-length response.
        assert_eq!(written, RESPONSE_HEADER_LEN + 256);
        let header = ResponseHeader::decode(&out).unwrap();
        assert_eq!(header.status, STATUS_INVALID_PAGE);
        assert_eq!(header.page_number, 2000);
        assert!(out[RESPONSE_HEADER_LEN..].iter().all(|&b| b == FILLER_BYTE));
    }
}
