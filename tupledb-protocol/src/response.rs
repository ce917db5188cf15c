//! Response decoding.

use crate::error::{ProtocolError, ServerError};
use crate::request::field;
use crate::OK_CODE;
use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;
use std::io::Cursor;

const SYNC_KEY: u64 = field::SYNC as u64;
const CODE_KEY: u64 = field::REQUEST_TYPE as u64;
const DATA_KEY: u64 = field::DATA as u64;
const ERROR_KEY: u64 = field::ERROR as u64;

/// One decoded reply.
///
/// The header (sync id + result code) is decoded eagerly so the reader loop
/// can correlate the frame on id alone; the body stays raw until a caller
/// asks for it.
#[derive(Debug)]
pub struct Response {
    pub sync: u32,
    pub code: u32,
    pub error: String,
    pub data: Option<Vec<Value>>,
    buf: Bytes,
    body_start: usize,
    decoded: bool,
}

impl Response {
    /// Decodes the header of a frame body. Unknown header keys are skipped;
    /// missing ones default to zero.
    pub fn parse(buf: Bytes) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(&buf[..]);
        let header = rmpv::decode::read_value(&mut cursor)?;
        let body_start = cursor.position() as usize;

        let entries = match header {
            Value::Map(entries) => entries,
            _ => return Err(ProtocolError::HeaderShape),
        };
        let mut sync = 0u32;
        let mut code = 0u32;
        for (key, value) in &entries {
            match key.as_u64() {
                Some(SYNC_KEY) => sync = value.as_u64().unwrap_or(0) as u32,
                Some(CODE_KEY) => code = value.as_u64().unwrap_or(0) as u32,
                _ => {}
            }
        }

        Ok(Self {
            sync,
            code,
            error: String::new(),
            data: None,
            buf,
            body_start,
            decoded: false,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == OK_CODE
    }

    /// Lazily decodes the body, populating `data` and `error`.
    ///
    /// Idempotent: the first call does the work, later calls are no-ops.
    pub fn decode_body(&mut self) -> Result<(), ProtocolError> {
        if self.decoded {
            return Ok(());
        }
        self.decoded = true;
        if self.body_start >= self.buf.len() {
            return Ok(());
        }

        let mut cursor = Cursor::new(&self.buf[self.body_start..]);
        let body = rmpv::decode::read_value(&mut cursor)?;
        let entries = match body {
            Value::Map(entries) => entries,
            _ => return Err(ProtocolError::BodyShape),
        };
        for (key, value) in entries {
            match key.as_u64() {
                Some(DATA_KEY) => match value {
                    Value::Array(rows) => self.data = Some(rows),
                    _ => return Err(ProtocolError::DataShape),
                },
                Some(ERROR_KEY) => {
                    if let Value::String(message) = value {
                        self.error = message.into_str().unwrap_or_default();
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Decodes the data rows directly into a caller type.
    ///
    /// Returns `Ok(None)` when the response carries no data field.
    pub fn decode_body_typed<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        self.decode_body()?;
        match self.data.take() {
            Some(rows) => {
                let typed = rmpv::ext::from_value(Value::Array(rows))
                    .map_err(|err| ProtocolError::Typed(err.to_string()))?;
                Ok(Some(typed))
            }
            None => Ok(None),
        }
    }

    /// Turns a non-success result code into the server's typed error.
    pub fn check(&self) -> Result<(), ServerError> {
        if self.code == OK_CODE {
            return Ok(());
        }
        Err(ServerError {
            code: self.code,
            message: self.error.clone(),
        })
    }

    /// Data rows normalized to tuples; a scalar row wraps into a
    /// one-element tuple.
    pub fn tuples(&self) -> Vec<Vec<Value>> {
        self.data
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|row| match row {
                Value::Array(fields) => fields.clone(),
                other => vec![other.clone()],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn encode_frame(header: Value, body: Option<Value>) -> Bytes {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &header).unwrap();
        if let Some(body) = body {
            rmpv::encode::write_value(&mut buf, &body).unwrap();
        }
        Bytes::from(buf)
    }

    fn header(sync: u32, code: u32) -> Value {
        Value::Map(vec![
            (Value::from(CODE_KEY), Value::from(code)),
            (Value::from(SYNC_KEY), Value::from(sync)),
        ])
    }

    #[test]
    fn test_parse_header() {
        let frame = encode_frame(header(99, 0), None);
        let response = Response::parse(frame).unwrap();
        assert_eq!(response.sync, 99);
        assert_eq!(response.code, 0);
        assert!(response.is_ok());
    }

    #[test]
    fn test_parse_skips_unknown_header_keys() {
        let frame = encode_frame(
            Value::Map(vec![
                (Value::from(0x05), Value::from("schema version")),
                (Value::from(SYNC_KEY), Value::from(12)),
                (Value::from(CODE_KEY), Value::from(0)),
            ]),
            None,
        );
        let response = Response::parse(frame).unwrap();
        assert_eq!(response.sync, 12);
    }

    #[test]
    fn test_parse_rejects_non_map_header() {
        let frame = encode_frame(Value::from("nope"), None);
        assert!(matches!(
            Response::parse(frame),
            Err(ProtocolError::HeaderShape)
        ));
    }

    #[test]
    fn test_decode_body_data() {
        let rows = Value::Array(vec![Value::Array(vec![
            Value::from(5),
            Value::from("borsch"),
        ])]);
        let frame = encode_frame(
            header(1, 0),
            Some(Value::Map(vec![(Value::from(DATA_KEY), rows)])),
        );
        let mut response = Response::parse(frame).unwrap();
        response.decode_body().unwrap();
        assert_eq!(response.data.as_ref().map(Vec::len), Some(1));
        assert_eq!(response.tuples()[0][1].as_str(), Some("borsch"));
    }

    #[test]
    fn test_decode_body_error() {
        let frame = encode_frame(
            header(1, 0x8012),
            Some(Value::Map(vec![(
                Value::from(ERROR_KEY),
                Value::from("no such space"),
            )])),
        );
        let mut response = Response::parse(frame).unwrap();
        response.decode_body().unwrap();
        let err = response.check().unwrap_err();
        assert_eq!(err.code, 0x8012);
        assert_eq!(err.message, "no such space");
    }

    #[test]
    fn test_decode_body_typed() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Row {
            id: u32,
            name: String,
        }

        let rows = Value::Array(vec![Value::Array(vec![
            Value::from(5),
            Value::from("borsch"),
        ])]);
        let frame = encode_frame(
            header(1, 0),
            Some(Value::Map(vec![(Value::from(DATA_KEY), rows)])),
        );
        let mut response = Response::parse(frame).unwrap();
        let typed: Vec<Row> = response.decode_body_typed().unwrap().unwrap();
        assert_eq!(
            typed,
            vec![Row {
                id: 5,
                name: "borsch".into()
            }]
        );
    }

    #[test]
    fn test_decode_body_typed_without_data() {
        let frame = encode_frame(header(1, 0), None);
        let mut response = Response::parse(frame).unwrap();
        let typed: Option<Vec<u32>> = response.decode_body_typed().unwrap();
        assert!(typed.is_none());
    }

    #[test]
    fn test_decode_body_rejects_non_array_data() {
        let frame = encode_frame(
            header(1, 0),
            Some(Value::Map(vec![(
                Value::from(DATA_KEY),
                Value::from("scalar"),
            )])),
        );
        let mut response = Response::parse(frame).unwrap();
        assert!(matches!(
            response.decode_body(),
            Err(ProtocolError::DataShape)
        ));
    }

    #[test]
    fn test_empty_body_is_ok() {
        let frame = encode_frame(header(64, 0), None);
        let mut response = Response::parse(frame).unwrap();
        response.decode_body().unwrap();
        assert!(response.data.is_none());
        assert!(response.error.is_empty());
    }

    #[test]
    fn test_scalar_rows_wrap_into_tuples() {
        let rows = Value::Array(vec![Value::from(7), Value::Array(vec![Value::from(8)])]);
        let frame = encode_frame(
            header(1, 0),
            Some(Value::Map(vec![(Value::from(DATA_KEY), rows)])),
        );
        let mut response = Response::parse(frame).unwrap();
        response.decode_body().unwrap();
        let tuples = response.tuples();
        assert_eq!(tuples[0], vec![Value::from(7)]);
        assert_eq!(tuples[1], vec![Value::from(8)]);
    }
}
