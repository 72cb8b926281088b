//! SNI (Server Name Indication) extraction from a TLS ClientHello record.
//!
//! Only records framed as a TLS 1.0 handshake (`16 03 01`) are accepted. That
//! is the framing clients use for the initial ClientHello whatever version
//! they go on to negotiate.
//!
//! Record layout walked by [`parse_sni`]:
//! - bytes 0-4: record header (type, major, minor, length)
//! - 4 bytes: handshake header (type + 24-bit length)
//! - 2 bytes: client version
//! - 32 bytes: random
//! - 1 byte + variable: session ID
//! - 2 bytes + variable: cipher suites
//! - 1 byte + variable: compression methods
//! - 2 bytes + variable: extensions
//!
//! Every length field is checked against what is actually buffered; a field
//! that points past the end is reported as [`SniError::Truncated`].

use thiserror::Error;

/// Size of the TLS record header.
pub const RECORD_HEADER_LEN: usize = 5;

/// Record content type: handshake.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Record content type: alert.
pub const CONTENT_TYPE_ALERT: u8 = 0x15;

/// Fatal `handshake_failure` alert sent to clients that do not open with a
/// TLS 1.0 framed handshake record.
pub const HANDSHAKE_FAILURE_ALERT: [u8; 7] = [
    CONTENT_TYPE_ALERT, // Alert
    0x03, 0x01, // TLS 1.0
    0x00, 0x02, // Length: 2
    0x02, // Level: fatal
    0x28, // Description: handshake_failure
];

/// Extension type of `server_name`.
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Handshake header (4) + client version (2) + random (32).
const HANDSHAKE_FIXED_PREFIX_LEN: usize = 4 + 2 + 32;

/// server_name_list length (2) + name_type (1).
const SERVER_NAME_LIST_PREFIX_LEN: usize = 2 + 1;

/// Errors produced while inspecting a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SniError {
    /// The record header is not a TLS 1.0 handshake record.
    #[error(
        "not a TLS 1.0 handshake record (content_type={content_type:#04x}, version={major}.{minor})"
    )]
    NotClientHello { content_type: u8, major: u8, minor: u8 },

    /// A length field points past the end of the buffered data.
    #[error("truncated {field}: need {needed} bytes, {available} available")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// The host_name entry is not valid UTF-8.
    #[error("server_name host_name is not valid UTF-8")]
    InvalidHostname,
}

/// The 5-byte TLS record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version_major: u8,
    pub version_minor: u8,
    /// Length of the record body that follows the header.
    pub length: u16,
}

impl RecordHeader {
    /// Decode a record header from its wire form.
    pub fn from_bytes(bytes: [u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            content_type: bytes[0],
            version_major: bytes[1],
            version_minor: bytes[2],
            length: u16::from_be_bytes([bytes[3], bytes[4]]),
        }
    }

    /// Encode the header back into its wire form.
    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_LEN] {
        let [len_hi, len_lo] = self.length.to_be_bytes();
        [
            self.content_type,
            self.version_major,
            self.version_minor,
            len_hi,
            len_lo,
        ]
    }

    /// Whether this header opens a TLS 1.0 framed handshake record.
    pub fn is_tls10_handshake(&self) -> bool {
        self.content_type == CONTENT_TYPE_HANDSHAKE
            && self.version_major == 3
            && self.version_minor == 1
    }

    /// Reject anything that is not a TLS 1.0 framed handshake record.
    pub fn validate(&self) -> Result<(), SniError> {
        if self.is_tls10_handshake() {
            Ok(())
        } else {
            Err(SniError::NotClientHello {
                content_type: self.content_type,
                major: self.version_major,
                minor: self.version_minor,
            })
        }
    }

    /// Number of body bytes announced by the header.
    pub fn body_len(&self) -> usize {
        self.length as usize
    }
}

/// A ClientHello record exactly as it was read from the client.
///
/// Holds the header and body in one contiguous buffer so the same bytes can
/// be forwarded upstream untouched after the hostname has been extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    record: Vec<u8>,
}

impl ClientHello {
    /// Wrap a buffered record (header followed by body).
    pub fn from_record(record: Vec<u8>) -> Result<Self, SniError> {
        if record.len() < RECORD_HEADER_LEN {
            return Err(SniError::Truncated {
                field: "record header",
                needed: RECORD_HEADER_LEN,
                available: record.len(),
            });
        }
        Ok(Self { record })
    }

    /// The decoded record header.
    pub fn header(&self) -> RecordHeader {
        let mut bytes = [0u8; RECORD_HEADER_LEN];
        bytes.copy_from_slice(&self.record[..RECORD_HEADER_LEN]);
        RecordHeader::from_bytes(bytes)
    }

    /// The record body (handshake message).
    pub fn body(&self) -> &[u8] {
        &self.record[RECORD_HEADER_LEN..]
    }

    /// The full record, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.record
    }

    /// Total size of the record in bytes.
    pub fn len(&self) -> usize {
        self.record.len()
    }

    /// Whether the record carries no body.
    pub fn is_empty(&self) -> bool {
        self.record.len() == RECORD_HEADER_LEN
    }

    /// Extract the SNI hostname, if the client sent one.
    pub fn server_name(&self) -> Result<Option<String>, SniError> {
        parse_sni(&self.header(), self.body())
    }
}

/// Parse the SNI hostname out of a ClientHello record body.
///
/// Returns `Ok(None)` when the ClientHello carries no extensions, no
/// `server_name` extension, or an empty host_name. The first `server_name`
/// extension wins and its hostname is returned unchanged.
pub fn parse_sni(header: &RecordHeader, body: &[u8]) -> Result<Option<String>, SniError> {
    header.validate()?;

    let declared = header.body_len();
    if body.len() < declared {
        return Err(SniError::Truncated {
            field: "record body",
            needed: declared,
            available: body.len(),
        });
    }

    let mut cursor = Cursor::new(&body[..declared]);
    cursor.skip(HANDSHAKE_FIXED_PREFIX_LEN, "handshake header")?;

    let session_id_len = cursor.read_u8("session id length")?;
    cursor.skip(session_id_len as usize, "session id")?;

    let cipher_suites_len = cursor.read_u16("cipher suites length")?;
    cursor.skip(cipher_suites_len as usize, "cipher suites")?;

    let compression_len = cursor.read_u8("compression methods length")?;
    cursor.skip(compression_len as usize, "compression methods")?;

    // A ClientHello may legally end right after the compression methods.
    if cursor.is_empty() {
        return Ok(None);
    }

    let extensions_len = cursor.read_u16("extensions length")? as usize;
    if extensions_len == 0 {
        return Ok(None);
    }

    let mut extensions = Cursor::new(cursor.take(extensions_len, "extensions")?);
    while !extensions.is_empty() {
        let ext_type = extensions.read_u16("extension type")?;
        let ext_len = extensions.read_u16("extension length")? as usize;
        let data = extensions.take(ext_len, "extension data")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }

    Ok(None)
}

/// Decode the first entry of a `server_name` extension.
///
/// Extension layout:
/// - 2 bytes: server_name_list length
/// - 1 byte: name type (0 = host_name)
/// - 2 bytes: name length
/// - variable: name
fn parse_server_name(data: &[u8]) -> Result<Option<String>, SniError> {
    let mut cursor = Cursor::new(data);
    cursor.skip(SERVER_NAME_LIST_PREFIX_LEN, "server_name list header")?;

    let name_len = cursor.read_u16("host_name length")? as usize;
    let name = cursor.take(name_len, "host_name")?;
    if name.is_empty() {
        return Ok(None);
    }

    match std::str::from_utf8(name) {
        Ok(hostname) => Ok(Some(hostname.to_string())),
        Err(_) => Err(SniError::InvalidHostname),
    }
}

/// Bounds-checked forward reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], SniError> {
        if len > self.remaining() {
            return Err(SniError::Truncated {
                field,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize, field: &'static str) -> Result<(), SniError> {
        self.take(len, field).map(|_| ())
    }

    fn read_u8(&mut self, field: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, field)?[0])
    }

    fn read_u16(&mut self, field: &'static str) -> Result<u16, SniError> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
