//! Request packing.

use crate::auth::{CHAP_SHA1, SCRAMBLE_SIZE};
use crate::error::ProtocolError;
use crate::frame::{LENGTH_MARKER, PACKET_LENGTH_BYTES};
use serde::Serialize;
use std::collections::BTreeMap;

/// Operation codes understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestCode {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Call = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Ping = 64,
}

/// Search mode for select requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IteratorKind {
    /// Equality match.
    #[default]
    Eq = 0,
    /// Equality match, reverse order.
    Req = 1,
    /// Every row in index order.
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

/// Integer keys of the header and body maps.
pub mod field {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    pub const FUNCTION_NAME: u8 = 0x22;
    pub const USER_NAME: u8 = 0x23;
    pub const EXPRESSION: u8 = 0x27;
    pub const OPS: u8 = 0x28;
    pub const DATA: u8 = 0x30;
    pub const ERROR: u8 = 0x31;
}

/// One outbound request: an operation code, a correlation id, and a body
/// mapping field keys to already-encoded msgpack values.
#[derive(Debug, Clone)]
pub struct Request {
    code: RequestCode,
    sync: u32,
    body: BTreeMap<u8, Vec<u8>>,
}

impl Request {
    pub fn new(code: RequestCode, sync: u32) -> Self {
        Self {
            code,
            sync,
            body: BTreeMap::new(),
        }
    }

    pub fn code(&self) -> RequestCode {
        self.code
    }

    /// Correlation id assigned at creation.
    pub fn sync(&self) -> u32 {
        self.sync
    }

    /// Sets a body field to the msgpack encoding of `value`.
    pub fn set<T>(&mut self, field: u8, value: &T) -> Result<(), ProtocolError>
    where
        T: Serialize + ?Sized,
    {
        self.body.insert(field, rmp_serde::to_vec(value)?);
        Ok(())
    }

    /// Fills the space/index/key triple shared by lookup-style requests.
    pub fn fill_search<K>(
        &mut self,
        space_id: u32,
        index_id: u32,
        key: &K,
    ) -> Result<(), ProtocolError>
    where
        K: Serialize + ?Sized,
    {
        self.set(field::SPACE_ID, &space_id)?;
        self.set(field::INDEX_ID, &index_id)?;
        self.set(field::KEY, key)
    }

    /// Fills the iterator/offset/limit triple for select requests.
    pub fn fill_iterator(
        &mut self,
        iterator: IteratorKind,
        offset: u32,
        limit: u32,
    ) -> Result<(), ProtocolError> {
        self.set(field::ITERATOR, &(iterator as u8))?;
        self.set(field::OFFSET, &offset)?;
        self.set(field::LIMIT, &limit)
    }

    /// Builds an authentication request: username plus a
    /// `("chap-sha1", scramble)` tuple.
    ///
    /// The scramble is raw hash output, so its msgpack str is written by
    /// hand instead of going through serde.
    pub fn auth(
        user: &str,
        sync: u32,
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> Result<Self, ProtocolError> {
        let mut request = Self::new(RequestCode::Auth, sync);
        request.set(field::USER_NAME, user)?;

        let mut tuple = Vec::with_capacity(3 + CHAP_SHA1.len() + SCRAMBLE_SIZE);
        tuple.push(0x92); // two-element array
        tuple.push(0xa0 | CHAP_SHA1.len() as u8);
        tuple.extend_from_slice(CHAP_SHA1.as_bytes());
        tuple.push(0xa0 | SCRAMBLE_SIZE as u8);
        tuple.extend_from_slice(scramble);
        request.body.insert(field::TUPLE, tuple);
        Ok(request)
    }

    /// Serializes the request into one framed packet.
    pub fn pack(&self) -> Vec<u8> {
        debug_assert!(self.body.len() < 16);

        let body_len: usize = self.body.values().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(PACKET_LENGTH_BYTES + 11 + 1 + 2 * self.body.len() + body_len);
        buf.extend_from_slice(&[LENGTH_MARKER, 0, 0, 0, 0]);

        // Header: fixmap { REQUEST_TYPE: code, SYNC: sync }. The sync id is
        // always written fixed-width.
        buf.push(0x82);
        buf.push(field::REQUEST_TYPE);
        buf.push(self.code as u8);
        buf.push(field::SYNC);
        buf.push(0xce);
        buf.extend_from_slice(&self.sync.to_be_bytes());

        buf.push(0x80 | self.body.len() as u8);
        for (field, value) in &self.body {
            buf.push(*field);
            buf.extend_from_slice(value);
        }

        let length = (buf.len() - PACKET_LENGTH_BYTES) as u32;
        buf[1..PACKET_LENGTH_BYTES].copy_from_slice(&length.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scramble;
    use crate::response::Response;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use bytes::Bytes;
    use rmpv::Value;
    use std::io::Cursor;

    fn body_map(packet: &[u8]) -> Vec<(Value, Value)> {
        let mut cursor = Cursor::new(&packet[PACKET_LENGTH_BYTES..]);
        let _header = rmpv::decode::read_value(&mut cursor).unwrap();
        let body = rmpv::decode::read_value(&mut cursor).unwrap();
        match body {
            Value::Map(entries) => entries,
            other => panic!("body is not a map: {other:?}"),
        }
    }

    fn body_field(packet: &[u8], key: u8) -> Value {
        body_map(packet)
            .into_iter()
            .find(|(k, _)| k.as_u64() == Some(key as u64))
            .map(|(_, v)| v)
            .unwrap_or_else(|| panic!("field {key:#04x} missing"))
    }

    #[test]
    fn test_pack_prefix_and_length() {
        let request = Request::new(RequestCode::Ping, 3);
        let packet = request.pack();
        assert_eq!(packet[0], LENGTH_MARKER);
        let length = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
        assert_eq!(length as usize, packet.len() - PACKET_LENGTH_BYTES);
    }

    #[test]
    fn test_pack_header_roundtrip() {
        let mut request = Request::new(RequestCode::Select, 0xdead_beef);
        request.fill_search(512, 0, &(5u32,)).unwrap();
        request.fill_iterator(IteratorKind::Eq, 0, 1).unwrap();

        let packet = request.pack();
        let response = Response::parse(Bytes::from(packet[PACKET_LENGTH_BYTES..].to_vec())).unwrap();
        assert_eq!(response.sync, 0xdead_beef);
        assert_eq!(response.code, RequestCode::Select as u32);
    }

    #[test]
    fn test_pack_select_body() {
        let mut request = Request::new(RequestCode::Select, 7);
        request.fill_search(512, 0, &(5u32,)).unwrap();
        request.fill_iterator(IteratorKind::Eq, 0, 1).unwrap();

        let packet = request.pack();
        assert_eq!(body_field(&packet, field::SPACE_ID).as_u64(), Some(512));
        assert_eq!(body_field(&packet, field::INDEX_ID).as_u64(), Some(0));
        assert_eq!(body_field(&packet, field::LIMIT).as_u64(), Some(1));
        assert_eq!(body_field(&packet, field::ITERATOR).as_u64(), Some(0));
        let key = body_field(&packet, field::KEY);
        assert_eq!(key, Value::Array(vec![Value::from(5)]));
    }

    #[test]
    fn test_pack_sync_fixed_width() {
        // Even a tiny sync id keeps its 5-byte encoding.
        let packet = Request::new(RequestCode::Ping, 1).pack();
        assert_eq!(packet[8], field::SYNC);
        assert_eq!(packet[9], 0xce);
        assert_eq!(&packet[10..14], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_auth_body() {
        let salt = BASE64.encode([9u8; 32]);
        let scr = scramble(&salt, "hunter2").unwrap();
        let request = Request::auth("operator", 2, &scr).unwrap();
        assert_eq!(request.code(), RequestCode::Auth);

        let packet = request.pack();
        assert_eq!(
            body_field(&packet, field::USER_NAME).as_str(),
            Some("operator")
        );
        let tuple = body_field(&packet, field::TUPLE);
        let parts = tuple.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].as_str(), Some(CHAP_SHA1));
        assert_eq!(parts[1].as_slice().map(|s| s.len()), Some(SCRAMBLE_SIZE));
    }

    #[test]
    fn test_struct_tuples_encode_as_arrays() {
        #[derive(serde::Serialize)]
        struct Row {
            id: u32,
            name: String,
        }

        let mut request = Request::new(RequestCode::Insert, 4);
        request.set(field::SPACE_ID, &512u32).unwrap();
        request
            .set(
                field::TUPLE,
                &Row {
                    id: 5,
                    name: "borsch".into(),
                },
            )
            .unwrap();

        let tuple = body_field(&request.pack(), field::TUPLE);
        assert_eq!(
            tuple,
            Value::Array(vec![Value::from(5), Value::from("borsch")])
        );
    }
}
