//! Message payloads.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// JSON content type.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// MessagePack content type.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// Character encodings a payload can be read and written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Charset {
    Utf8,
    UsAscii,
    Iso8859_1,
    Utf16Be,
    Utf16Le,
}

impl Charset {
    /// Get the IANA name of the charset.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::UsAscii => "US-ASCII",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Utf16Le => "UTF-16LE",
        }
    }

    fn decode(self, data: &[u8]) -> Result<String, ProtocolError> {
        match self {
            Charset::Utf8 => std::str::from_utf8(data)
                .map(str::to_owned)
                .map_err(|_| ProtocolError::Charset(self.name())),
            Charset::UsAscii => {
                if data.is_ascii() {
                    Ok(data.iter().map(|&b| b as char).collect())
                } else {
                    Err(ProtocolError::Charset(self.name()))
                }
            }
            Charset::Iso8859_1 => Ok(data.iter().map(|&b| b as char).collect()),
            Charset::Utf16Be | Charset::Utf16Le => {
                if data.len() % 2 != 0 {
                    return Err(ProtocolError::Charset(self.name()));
                }
                let units = data.chunks_exact(2).map(|pair| {
                    if self == Charset::Utf16Be {
                        u16::from_be_bytes([pair[0], pair[1]])
                    } else {
                        u16::from_le_bytes([pair[0], pair[1]])
                    }
                });
                char::decode_utf16(units)
                    .collect::<Result<String, _>>()
                    .map_err(|_| ProtocolError::Charset(self.name()))
            }
        }
    }

    fn encode(self, text: &str) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::UsAscii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(ProtocolError::Charset(self.name()))
                }
            }
            Charset::Iso8859_1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| ProtocolError::Charset(self.name())))
                .collect(),
            Charset::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Charset::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        }
    }
}

/// A message payload.
///
/// The buffer is shared, so cloning a payload for fan-out is cheap.
/// Replacing the content swaps the whole buffer at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    data: Bytes,
    read_only: bool,
}

impl Payload {
    /// Create a payload from raw bytes.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            read_only: false,
        }
    }

    /// Create a payload from text in the given charset.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be represented in the charset.
    pub fn from_text(text: &str, charset: Charset) -> Result<Self, ProtocolError> {
        Ok(Self::new(charset.encode(text)?))
    }

    /// Create a JSON payload from a serializable value.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read the payload as text in the given charset.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid in the charset.
    pub fn as_string(&self, charset: Charset) -> Result<String, ProtocolError> {
        charset.decode(&self.data)
    }

    /// Read the payload as a typed value, decoded according to `content_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the content type has no decoder or decoding fails.
    pub fn typed<T: DeserializeOwned>(&self, content_type: &str) -> Result<T, ProtocolError> {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match media_type {
            CONTENT_TYPE_JSON => Ok(serde_json::from_slice(&self.data)?),
            CONTENT_TYPE_MSGPACK => Ok(rmp_serde::from_slice(&self.data)?),
            other => Err(ProtocolError::UnsupportedContentType(other.to_string())),
        }
    }

    /// Replace the payload content.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ReadOnly`] if the owning message is sealed.
    pub fn set(&mut self, data: impl Into<Bytes>) -> Result<(), ProtocolError> {
        if self.read_only {
            return Err(ProtocolError::ReadOnly);
        }
        self.data = data.into();
        Ok(())
    }

    /// Check if this payload is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn freeze(&mut self) {
        self.read_only = true;
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Self::new(Bytes::from_static(text.as_bytes()))
    }
}
