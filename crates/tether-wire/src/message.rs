//! The wire message: one request or response on a session.
//!
//! Layout: `u8 kind | i64 uid | u8 status | u8 code | varint-length payload`.
//! A decoded message exposes its payload through [`Message::reader`]; a
//! message being built writes through [`Message::writer`]. `respond` and
//! `error` consume a decoded request and hand back its response, keeping the
//! `uid` that correlates the two.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tether_types::codec::{
    get_blob, get_i64, get_str, get_u8, put_blob, put_str, CodecError, Read, Write,
};

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
}

/// Outcome carried by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct Message {
    kind: Kind,
    uid: i64,
    status: Status,
    code: u8,
    input: Bytes,
    output: BytesMut,
}

impl Message {
    /// A fresh request with a random uid and an empty payload.
    pub fn request(code: u8) -> Self {
        Self {
            kind: Kind::Request,
            uid: rand::random(),
            status: Status::Ok,
            code,
            input: Bytes::new(),
            output: BytesMut::new(),
        }
    }

    /// Turns this request into its response. The readable payload is dropped.
    pub fn respond(self, code: u8) -> Self {
        Self {
            kind: Kind::Response,
            uid: self.uid,
            status: Status::Ok,
            code,
            input: Bytes::new(),
            output: BytesMut::new(),
        }
    }

    /// Turns this request into an error response carrying `text`.
    pub fn error(self, text: &str) -> Self {
        Self::error_for(self.uid, text)
    }

    pub(crate) fn error_for(uid: i64, text: &str) -> Self {
        let mut output = BytesMut::new();
        put_str(&mut output, text);
        Self {
            kind: Kind::Response,
            uid,
            status: Status::Error,
            code: 0,
            input: Bytes::new(),
            output,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn is_request(&self) -> bool {
        self.kind == Kind::Request
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// The text of a decoded error response.
    pub fn error_text(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        let mut input = self.input.clone();
        get_str(&mut input).ok()
    }

    /// Readable payload of a decoded message.
    pub fn reader(&mut self) -> &mut Bytes {
        &mut self.input
    }

    /// Writable payload of a message being built.
    pub fn writer(&mut self) -> &mut BytesMut {
        &mut self.output
    }

    /// Appends `value` to the payload.
    pub fn put<T: Write>(&mut self, value: &T) -> &mut Self {
        value.write(&mut self.output);
        self
    }

    /// Reads the next value from the payload.
    pub fn get<T: Read>(&mut self) -> Result<T, CodecError> {
        T::read(&mut self.input)
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(match self.kind {
            Kind::Request => 0,
            Kind::Response => 1,
        });
        buf.put_i64(self.uid);
        buf.put_u8(match self.status {
            Status::Ok => 0,
            Status::Error => 1,
        });
        buf.put_u8(self.code);
        put_blob(buf, &self.output);
    }
}

impl Read for Message {
    fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let kind = match get_u8(buf)? {
            0 => Kind::Request,
            1 => Kind::Response,
            value => {
                return Err(CodecError::InvalidOrdinal {
                    kind: "message kind",
                    value,
                })
            }
        };
        let uid = get_i64(buf)?;
        let status = match get_u8(buf)? {
            0 => Status::Ok,
            1 => Status::Error,
            value => {
                return Err(CodecError::InvalidOrdinal {
                    kind: "message status",
                    value,
                })
            }
        };
        Ok(Self {
            kind,
            uid,
            status,
            code: get_u8(buf)?,
            input: get_blob(buf)?,
            output: BytesMut::new(),
        })
    }
}
