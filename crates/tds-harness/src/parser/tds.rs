//! TDS (Tabular Data Stream) codec for the subset of MS-TDS the harness speaks.
//!
//! Every TDS message travels in one or more packets, each with an 8-byte
//! header. This module only deals with message payloads; packetization lives
//! in `engine::wire`.
//!
//! ## Handshake
//! ```text
//! client                         server
//!   | -- PRELOGIN (0x12) ------------> |
//!   | <------ PRELOGIN reply (0x04) -- |
//!   | -- LOGIN7 (0x10) --------------> |
//!   | <-- LOGINACK/ENVCHANGE/DONE ---- |
//!   | -- SQL_BATCH (0x01) -----------> |
//!   | <-- COLMETADATA/ROW/DONE ------- |
//! ```
//!
//! TLS is never negotiated: the harness always advertises `NotSupported`.
//! Multi-byte integers are little-endian except the packet header length,
//! PRELOGIN option offsets and the LOGINACK TDS version.

use std::fmt;
use thiserror::Error;

/// Packet types
pub mod packet_type {
    pub const SQL_BATCH: u8 = 0x01;
    /// Server responses, including the PRELOGIN reply
    pub const TABULAR_RESULT: u8 = 0x04;
    pub const LOGIN7: u8 = 0x10;
    pub const PRELOGIN: u8 = 0x12;
}

/// Packet status flags
pub mod status {
    pub const NORMAL: u8 = 0x00;
    /// Last packet of a message
    pub const EOM: u8 = 0x01;
}

pub mod prelogin_token {
    pub const VERSION: u8 = 0x00;
    pub const ENCRYPTION: u8 = 0x01;
    pub const INSTOPT: u8 = 0x02;
    pub const THREADID: u8 = 0x03;
    pub const MARS: u8 = 0x04;
    pub const TERMINATOR: u8 = 0xFF;
}

/// Token stream types
pub mod token {
    pub const COLMETADATA: u8 = 0x81;
    pub const ERROR: u8 = 0xAA;
    pub const INFO: u8 = 0xAB;
    pub const LOGINACK: u8 = 0xAD;
    pub const ROW: u8 = 0xD1;
    pub const ENVCHANGE: u8 = 0xE3;
    pub const DONE: u8 = 0xFD;
    pub const DONEPROC: u8 = 0xFE;
    pub const DONEINPROC: u8 = 0xFF;
}

pub mod done_status {
    pub const FINAL: u16 = 0x0000;
    pub const ERROR: u16 = 0x0002;
    pub const COUNT: u16 = 0x0010;
}

pub const TDS_HEADER_SIZE: usize = 8;
pub const LOGIN7_HEADER_SIZE: usize = 94;
pub const DEFAULT_PACKET_SIZE: usize = 4096;
pub const TDS_7_4: u32 = 0x7400_0004;

/// LOGIN7 type flag carrying ApplicationIntent=ReadOnly
pub const READ_ONLY_INTENT: u8 = 0x20;
/// LOGIN7 option flag 3 bit announcing a feature extension block
const EXTENSION_USED: u8 = 0x10;

const TYPE_INTN: u8 = 0x26;
const TYPE_INT4: u8 = 0x38;
const TYPE_NVARCHAR: u8 = 0xE7;
const NULL_USHORT: u16 = 0xFFFF;
const DEFAULT_COLLATION: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TdsParseError {
    #[error("packet too short")]
    TooShort,
    #[error("offset out of bounds")]
    OffsetOutOfBounds,
    #[error("invalid UTF-16 string")]
    InvalidString,
    #[error("invalid length field")]
    InvalidLength,
    #[error("unsupported token 0x{0:02X}")]
    UnsupportedToken(u8),
    #[error("unsupported column type 0x{0:02X}")]
    UnsupportedType(u8),
    #[error("row received before column metadata")]
    MissingMetadata,
    #[error("packet type changed mid-message: 0x{0:02X} then 0x{1:02X}")]
    MixedPacketTypes(u8, u8),
    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),
    #[error("LOGIN7 field `{field}` exceeds {max} characters")]
    FieldTooLong { field: &'static str, max: usize },
}

pub type Result<T> = std::result::Result<T, TdsParseError>;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(TdsParseError::InvalidLength)?;
        let bytes = self
            .data
            .get(self.pos..end)
            .ok_or(TdsParseError::TooShort)?;
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32_be(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32_le(&mut self) -> Result<i32> {
        Ok(self.u32_le()? as i32)
    }

    fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Length-prefixed (u8 characters) UTF-16LE string.
    fn b_varchar(&mut self) -> Result<String> {
        let chars = self.u8()? as usize;
        utf16le_to_string(self.take(chars * 2)?)
    }

    /// Length-prefixed (u16 characters) UTF-16LE string.
    fn us_varchar(&mut self) -> Result<String> {
        let chars = self.u16_le()? as usize;
        utf16le_to_string(self.take(chars * 2)?)
    }
}

pub fn string_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

pub fn utf16le_to_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(TdsParseError::InvalidString);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| TdsParseError::InvalidString)
}

fn push_b_varchar(out: &mut Vec<u8>, s: &str) {
    let units = s.encode_utf16().count().min(u8::MAX as usize);
    out.push(units as u8);
    out.extend(s.encode_utf16().take(units).flat_map(|c| c.to_le_bytes()));
}

fn push_us_varchar(out: &mut Vec<u8>, s: &str) {
    let units = s.encode_utf16().count().min(u16::MAX as usize);
    out.extend_from_slice(&(units as u16).to_le_bytes());
    out.extend(s.encode_utf16().take(units).flat_map(|c| c.to_le_bytes()));
}

// ============================================================================
// Packet header
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdsHeader {
    pub packet_type: u8,
    pub status: u8,
    /// Total packet length including the header (big-endian on the wire)
    pub length: u16,
    pub spid: u16,
    pub packet_id: u8,
    pub window: u8,
}

impl TdsHeader {
    pub fn new(packet_type: u8, status: u8, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 1,
            window: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TDS_HEADER_SIZE {
            return None;
        }
        Some(Self {
            packet_type: data[0],
            status: data[1],
            length: u16::from_be_bytes([data[2], data[3]]),
            spid: u16::from_be_bytes([data[4], data[5]]),
            packet_id: data[6],
            window: data[7],
        })
    }

    pub fn serialize(&self) -> [u8; TDS_HEADER_SIZE] {
        let length = self.length.to_be_bytes();
        let spid = self.spid.to_be_bytes();
        [
            self.packet_type,
            self.status,
            length[0],
            length[1],
            spid[0],
            spid[1],
            self.packet_id,
            self.window,
        ]
    }

    pub fn is_end_of_message(&self) -> bool {
        self.status & status::EOM != 0
    }

    pub fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(TDS_HEADER_SIZE)
    }
}

// ============================================================================
// PRELOGIN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionMode {
    Off = 0x00,
    On = 0x01,
    #[default]
    NotSupported = 0x02,
    Required = 0x03,
}

impl EncryptionMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Off),
            0x01 => Some(Self::On),
            0x02 => Some(Self::NotSupported),
            0x03 => Some(Self::Required),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// True when the peer insists on a TLS handshake after PRELOGIN.
    pub fn requires_tls(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prelogin {
    /// major, minor, build (BE u16), sub-build (BE u16)
    pub version: [u8; 6],
    pub encryption: EncryptionMode,
    pub instance: Option<String>,
    pub thread_id: Option<u32>,
    pub mars: Option<bool>,
}

impl Default for Prelogin {
    fn default() -> Self {
        Self {
            // 15.0.2000 (SQL Server 2019)
            version: [0x0F, 0x00, 0x07, 0xD0, 0x00, 0x00],
            encryption: EncryptionMode::NotSupported,
            instance: None,
            thread_id: None,
            mars: Some(false),
        }
    }
}

pub fn encode_prelogin(prelogin: &Prelogin) -> Vec<u8> {
    let mut instance = prelogin.instance.clone().unwrap_or_default().into_bytes();
    instance.push(0);

    let mut options: Vec<(u8, Vec<u8>)> = vec![
        (prelogin_token::VERSION, prelogin.version.to_vec()),
        (
            prelogin_token::ENCRYPTION,
            vec![prelogin.encryption.to_byte()],
        ),
        (prelogin_token::INSTOPT, instance),
    ];
    if let Some(thread_id) = prelogin.thread_id {
        options.push((prelogin_token::THREADID, thread_id.to_be_bytes().to_vec()));
    }
    if let Some(mars) = prelogin.mars {
        options.push((prelogin_token::MARS, vec![mars as u8]));
    }

    let mut offset = options.len() * 5 + 1;
    let mut payload = Vec::with_capacity(offset + 16);
    let mut data = Vec::new();
    for (option, value) in &options {
        payload.push(*option);
        payload.extend_from_slice(&(offset as u16).to_be_bytes());
        payload.extend_from_slice(&(value.len() as u16).to_be_bytes());
        data.extend_from_slice(value);
        offset += value.len();
    }
    payload.push(prelogin_token::TERMINATOR);
    payload.extend_from_slice(&data);
    payload
}

pub fn parse_prelogin(data: &[u8]) -> Result<Prelogin> {
    let mut prelogin = Prelogin {
        mars: None,
        ..Prelogin::default()
    };
    let mut pos = 0;

    loop {
        let option = *data.get(pos).ok_or(TdsParseError::TooShort)?;
        if option == prelogin_token::TERMINATOR {
            break;
        }
        let header = data.get(pos + 1..pos + 5).ok_or(TdsParseError::TooShort)?;
        let start = u16::from_be_bytes([header[0], header[1]]) as usize;
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let value = data
            .get(start..start + len)
            .ok_or(TdsParseError::OffsetOutOfBounds)?;

        match option {
            prelogin_token::VERSION if value.len() >= 6 => {
                prelogin.version.copy_from_slice(&value[..6]);
            }
            prelogin_token::ENCRYPTION if !value.is_empty() => {
                prelogin.encryption =
                    EncryptionMode::from_byte(value[0]).ok_or(TdsParseError::InvalidLength)?;
            }
            prelogin_token::INSTOPT => {
                let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                prelogin.instance = (end > 0)
                    .then(|| String::from_utf8_lossy(&value[..end]).into_owned());
            }
            prelogin_token::THREADID if value.len() >= 4 => {
                prelogin.thread_id =
                    Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
            }
            prelogin_token::MARS if !value.is_empty() => {
                prelogin.mars = Some(value[0] != 0);
            }
            _ => {}
        }
        pos += 5;
    }

    Ok(prelogin)
}

// ============================================================================
// LOGIN7
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct Login7 {
    pub tds_version: u32,
    pub packet_size: u32,
    pub client_prog_ver: u32,
    pub client_pid: u32,
    pub connection_id: u32,
    pub option_flags1: u8,
    pub option_flags2: u8,
    pub type_flags: u8,
    pub option_flags3: u8,
    pub client_timezone: i32,
    pub client_lcid: u32,
    pub hostname: String,
    pub username: String,
    /// Plaintext; obfuscated only on the wire.
    pub password: String,
    pub app_name: String,
    pub server_name: String,
    pub library_name: String,
    pub language: String,
    pub database: String,
    pub client_id: [u8; 6],
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TDS_7_4,
            packet_size: DEFAULT_PACKET_SIZE as u32,
            client_prog_ver: 0x0700_0000,
            client_pid: 0,
            connection_id: 0,
            option_flags1: 0xE0,
            option_flags2: 0x03,
            type_flags: 0x00,
            option_flags3: 0x00,
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: "tds-harness".to_string(),
            language: String::new(),
            database: String::new(),
            client_id: [0u8; 6],
        }
    }
}

impl Login7 {
    pub fn read_only(&self) -> bool {
        self.type_flags & READ_ONLY_INTENT != 0
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        if read_only {
            self.type_flags |= READ_ONLY_INTENT;
        } else {
            self.type_flags &= !READ_ONLY_INTENT;
        }
    }
}

impl fmt::Debug for Login7 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login7")
            .field("tds_version", &format_args!("0x{:08X}", self.tds_version))
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("app_name", &self.app_name)
            .field("server_name", &self.server_name)
            .field("database", &self.database)
            .field("read_only", &self.read_only())
            .finish()
    }
}

/// TDS password obfuscation: UTF-16LE, swap nibbles, XOR 0xA5.
pub fn encode_password(password: &str) -> Vec<u8> {
    string_to_utf16le(password)
        .into_iter()
        .map(|b| b.rotate_left(4) ^ 0xA5)
        .collect()
}

pub fn decode_password(encoded: &[u8]) -> Result<String> {
    let raw: Vec<u8> = encoded.iter().map(|b| (b ^ 0xA5).rotate_left(4)).collect();
    utf16le_to_string(&raw)
}

/// Longest value, in UTF-16 code units, any LOGIN7 string field may carry.
pub const LOGIN7_MAX_FIELD_CHARS: usize = 128;

/// Appends one variable-length field and returns its (offset, length) header bytes.
fn push_field(
    var_data: &mut Vec<u8>,
    name: &'static str,
    bytes: &[u8],
    units: usize,
) -> Result<[u8; 4]> {
    if units > LOGIN7_MAX_FIELD_CHARS {
        return Err(TdsParseError::FieldTooLong {
            field: name,
            max: LOGIN7_MAX_FIELD_CHARS,
        });
    }
    let offset = u16::try_from(LOGIN7_HEADER_SIZE + var_data.len())
        .map_err(|_| TdsParseError::InvalidLength)?;
    var_data.extend_from_slice(bytes);
    let o = offset.to_le_bytes();
    let l = (units as u16).to_le_bytes();
    Ok([o[0], o[1], l[0], l[1]])
}

fn push_string_field(var_data: &mut Vec<u8>, name: &'static str, s: &str) -> Result<[u8; 4]> {
    push_field(var_data, name, &string_to_utf16le(s), s.encode_utf16().count())
}

/// Encodes a LOGIN7 payload. Feature extensions, SSPI and password change
/// blocks are never emitted. Fails if a string field is longer than
/// [`LOGIN7_MAX_FIELD_CHARS`].
pub fn encode_login7(login: &Login7) -> Result<Vec<u8>> {
    let mut var_data = Vec::new();
    let hostname = push_string_field(&mut var_data, "hostname", &login.hostname)?;
    let username = push_string_field(&mut var_data, "username", &login.username)?;
    let password = push_field(
        &mut var_data,
        "password",
        &encode_password(&login.password),
        login.password.encode_utf16().count(),
    )?;
    let app_name = push_string_field(&mut var_data, "app_name", &login.app_name)?;
    let server_name = push_string_field(&mut var_data, "server_name", &login.server_name)?;
    let extension = push_field(&mut var_data, "extension", &[], 0)?;
    let library_name = push_string_field(&mut var_data, "library_name", &login.library_name)?;
    let language = push_string_field(&mut var_data, "language", &login.language)?;
    let database = push_string_field(&mut var_data, "database", &login.database)?;
    let sspi = push_field(&mut var_data, "sspi", &[], 0)?;
    let attach_db = push_field(&mut var_data, "attach_db", &[], 0)?;
    let change_password = push_field(&mut var_data, "change_password", &[], 0)?;

    let total = LOGIN7_HEADER_SIZE + var_data.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&login.tds_version.to_le_bytes());
    out.extend_from_slice(&login.packet_size.to_le_bytes());
    out.extend_from_slice(&login.client_prog_ver.to_le_bytes());
    out.extend_from_slice(&login.client_pid.to_le_bytes());
    out.extend_from_slice(&login.connection_id.to_le_bytes());
    out.push(login.option_flags1);
    out.push(login.option_flags2);
    out.push(login.type_flags);
    out.push(login.option_flags3 & !EXTENSION_USED);
    out.extend_from_slice(&login.client_timezone.to_le_bytes());
    out.extend_from_slice(&login.client_lcid.to_le_bytes());
    for field in [
        hostname,
        username,
        password,
        app_name,
        server_name,
        extension,
        library_name,
        language,
        database,
    ] {
        out.extend_from_slice(&field);
    }
    out.extend_from_slice(&login.client_id);
    for field in [sspi, attach_db, change_password] {
        out.extend_from_slice(&field);
    }
    // cbSSPILong
    out.extend_from_slice(&0u32.to_le_bytes());
    debug_assert_eq!(out.len(), LOGIN7_HEADER_SIZE);
    out.extend_from_slice(&var_data);
    Ok(out)
}

fn field_bytes(data: &[u8], header_pos: usize, bytes_per_unit: usize) -> Result<&[u8]> {
    let offset = u16::from_le_bytes([data[header_pos], data[header_pos + 1]]) as usize;
    let units = u16::from_le_bytes([data[header_pos + 2], data[header_pos + 3]]) as usize;
    if units == 0 {
        return Ok(&[]);
    }
    data.get(offset..offset + units * bytes_per_unit)
        .ok_or(TdsParseError::OffsetOutOfBounds)
}

fn string_field(data: &[u8], header_pos: usize) -> Result<String> {
    utf16le_to_string(field_bytes(data, header_pos, 2)?)
}

pub fn parse_login7(data: &[u8]) -> Result<Login7> {
    if data.len() < LOGIN7_HEADER_SIZE {
        return Err(TdsParseError::TooShort);
    }
    let mut r = Reader::new(data);
    let declared = r.u32_le()? as usize;
    if declared > data.len() {
        return Err(TdsParseError::InvalidLength);
    }

    let mut client_id = [0u8; 6];
    client_id.copy_from_slice(&data[72..78]);

    Ok(Login7 {
        tds_version: r.u32_le()?,
        packet_size: r.u32_le()?,
        client_prog_ver: r.u32_le()?,
        client_pid: r.u32_le()?,
        connection_id: r.u32_le()?,
        option_flags1: r.u8()?,
        option_flags2: r.u8()?,
        type_flags: r.u8()?,
        option_flags3: r.u8()?,
        client_timezone: r.i32_le()?,
        client_lcid: r.u32_le()?,
        hostname: string_field(data, 36)?,
        username: string_field(data, 40)?,
        password: decode_password(field_bytes(data, 44, 2)?)?,
        app_name: string_field(data, 48)?,
        server_name: string_field(data, 52)?,
        library_name: string_field(data, 60)?,
        language: string_field(data, 64)?,
        database: string_field(data, 68)?,
        client_id,
    })
}

// ============================================================================
// Token stream
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    pub interface: u8,
    pub tds_version: u32,
    pub prog_name: String,
    pub prog_version: [u8; 4],
}

impl Default for LoginAck {
    fn default() -> Self {
        Self {
            interface: 1,
            tds_version: TDS_7_4,
            prog_name: "Microsoft SQL Server".to_string(),
            prog_version: [15, 0, 0x07, 0xD0],
        }
    }
}

/// ERROR / INFO token body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub number: i32,
    pub state: u8,
    pub class: u8,
    pub message: String,
    pub server_name: String,
    pub proc_name: String,
    pub line_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Nullable integer of the given byte width (1, 2, 4 or 8)
    IntN(u8),
    Int4,
    /// Max length in bytes
    NVarChar(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    LoginAck(LoginAck),
    EnvChange { env_type: u8 },
    Info(Message),
    Error(Message),
    ColMetadata(Vec<Column>),
    Row(Vec<Value>),
    Done { status: u16, row_count: u64 },
}

fn parse_message(body: &[u8]) -> Result<Message> {
    let mut r = Reader::new(body);
    Ok(Message {
        number: r.i32_le()?,
        state: r.u8()?,
        class: r.u8()?,
        message: r.us_varchar()?,
        server_name: r.b_varchar()?,
        proc_name: r.b_varchar()?,
        line_number: r.u32_le()?,
    })
}

fn parse_column(r: &mut Reader<'_>) -> Result<Column> {
    let _user_type = r.u32_le()?;
    let _flags = r.u16_le()?;
    let ty = match r.u8()? {
        TYPE_INTN => ColumnType::IntN(r.u8()?),
        TYPE_INT4 => ColumnType::Int4,
        TYPE_NVARCHAR => {
            let max_len = r.u16_le()?;
            r.take(DEFAULT_COLLATION.len())?;
            ColumnType::NVarChar(max_len)
        }
        other => return Err(TdsParseError::UnsupportedType(other)),
    };
    Ok(Column {
        name: r.b_varchar()?,
        ty,
    })
}

fn parse_value(r: &mut Reader<'_>, ty: ColumnType) -> Result<Value> {
    match ty {
        ColumnType::Int4 => Ok(Value::Int(r.i32_le()? as i64)),
        ColumnType::IntN(_) => {
            let len = r.u8()? as usize;
            let b = r.take(len)?;
            match len {
                0 => Ok(Value::Null),
                1 => Ok(Value::Int(b[0] as i64)),
                2 => Ok(Value::Int(i16::from_le_bytes([b[0], b[1]]) as i64)),
                4 => Ok(Value::Int(
                    i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
                )),
                8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    Ok(Value::Int(i64::from_le_bytes(raw)))
                }
                _ => Err(TdsParseError::InvalidLength),
            }
        }
        ColumnType::NVarChar(_) => {
            let len = r.u16_le()?;
            if len == NULL_USHORT {
                return Ok(Value::Null);
            }
            Ok(Value::Text(utf16le_to_string(r.take(len as usize)?)?))
        }
    }
}

pub fn parse_tokens(data: &[u8]) -> Result<Vec<Token>> {
    let mut r = Reader::new(data);
    let mut columns: Option<Vec<Column>> = None;
    let mut tokens = Vec::new();

    while !r.is_empty() {
        match r.u8()? {
            token::LOGINACK => {
                let len = r.u16_le()? as usize;
                let mut body = Reader::new(r.take(len)?);
                let interface = body.u8()?;
                let tds_version = body.u32_be()?;
                let prog_name = body.b_varchar()?;
                let v = body.take(4)?;
                tokens.push(Token::LoginAck(LoginAck {
                    interface,
                    tds_version,
                    prog_name,
                    prog_version: [v[0], v[1], v[2], v[3]],
                }));
            }
            token::ENVCHANGE => {
                let len = r.u16_le()? as usize;
                let body = r.take(len)?;
                let env_type = *body.first().ok_or(TdsParseError::TooShort)?;
                tokens.push(Token::EnvChange { env_type });
            }
            t @ (token::INFO | token::ERROR) => {
                let len = r.u16_le()? as usize;
                let message = parse_message(r.take(len)?)?;
                tokens.push(if t == token::ERROR {
                    Token::Error(message)
                } else {
                    Token::Info(message)
                });
            }
            token::COLMETADATA => {
                let count = r.u16_le()?;
                let mut cols = Vec::new();
                if count != NULL_USHORT {
                    for _ in 0..count {
                        cols.push(parse_column(&mut r)?);
                    }
                }
                columns = Some(cols.clone());
                tokens.push(Token::ColMetadata(cols));
            }
            token::ROW => {
                let cols = columns.as_ref().ok_or(TdsParseError::MissingMetadata)?;
                let mut values = Vec::with_capacity(cols.len());
                for col in cols {
                    values.push(parse_value(&mut r, col.ty)?);
                }
                tokens.push(Token::Row(values));
            }
            token::DONE | token::DONEPROC | token::DONEINPROC => {
                let status = r.u16_le()?;
                let _cur_cmd = r.u16_le()?;
                let row_count = r.u64_le()?;
                tokens.push(Token::Done { status, row_count });
            }
            other => return Err(TdsParseError::UnsupportedToken(other)),
        }
    }

    Ok(tokens)
}

fn with_u16_length(token_type: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 3);
    out.push(token_type);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn encode_login_ack(ack: &LoginAck) -> Vec<u8> {
    let mut body = vec![ack.interface];
    body.extend_from_slice(&ack.tds_version.to_be_bytes());
    push_b_varchar(&mut body, &ack.prog_name);
    body.extend_from_slice(&ack.prog_version);
    with_u16_length(token::LOGINACK, body)
}

/// Database change notification, as sent after a successful login.
pub fn encode_env_database(new_db: &str, old_db: &str) -> Vec<u8> {
    let mut body = vec![0x01];
    push_b_varchar(&mut body, new_db);
    push_b_varchar(&mut body, old_db);
    with_u16_length(token::ENVCHANGE, body)
}

/// Encodes an ERROR or INFO token depending on `token_type`.
pub fn encode_message(token_type: u8, message: &Message) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&message.number.to_le_bytes());
    body.push(message.state);
    body.push(message.class);
    push_us_varchar(&mut body, &message.message);
    push_b_varchar(&mut body, &message.server_name);
    push_b_varchar(&mut body, &message.proc_name);
    body.extend_from_slice(&message.line_number.to_le_bytes());
    with_u16_length(token_type, body)
}

pub fn encode_done(status: u16, row_count: u64) -> Vec<u8> {
    let mut out = vec![token::DONE];
    out.extend_from_slice(&status.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&row_count.to_le_bytes());
    out
}

pub fn encode_column_metadata(columns: &[Column]) -> Vec<u8> {
    let mut out = vec![token::COLMETADATA];
    out.extend_from_slice(&(columns.len() as u16).to_le_bytes());
    for col in columns {
        out.extend_from_slice(&0u32.to_le_bytes());
        // nullable
        out.extend_from_slice(&0x0001u16.to_le_bytes());
        match col.ty {
            ColumnType::IntN(width) => {
                out.push(TYPE_INTN);
                out.push(width);
            }
            ColumnType::Int4 => out.push(TYPE_INT4),
            ColumnType::NVarChar(max_len) => {
                out.push(TYPE_NVARCHAR);
                out.extend_from_slice(&max_len.to_le_bytes());
                out.extend_from_slice(&DEFAULT_COLLATION);
            }
        }
        push_b_varchar(&mut out, &col.name);
    }
    out
}

/// Encodes one ROW token. A value that does not fit its column is sent as NULL.
pub fn encode_row(columns: &[Column], values: &[Value]) -> Vec<u8> {
    let mut out = vec![token::ROW];
    for (col, value) in columns.iter().zip(values.iter().chain(std::iter::repeat(&Value::Null))) {
        match (col.ty, value) {
            (ColumnType::Int4, Value::Int(v)) => out.extend_from_slice(&(*v as i32).to_le_bytes()),
            (ColumnType::Int4, _) => out.extend_from_slice(&0i32.to_le_bytes()),
            (ColumnType::IntN(width), Value::Int(v)) => {
                let width = width.min(8) as usize;
                out.push(width as u8);
                out.extend_from_slice(&v.to_le_bytes()[..width]);
            }
            (ColumnType::IntN(_), _) => out.push(0),
            (ColumnType::NVarChar(_), Value::Text(s)) => {
                let bytes = string_to_utf16le(s);
                out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            (ColumnType::NVarChar(_), _) => out.extend_from_slice(&NULL_USHORT.to_le_bytes()),
        }
    }
    out
}

/// COLMETADATA, one ROW per entry and a final DONE with the row count.
pub fn encode_result_set(columns: &[Column], rows: &[Vec<Value>]) -> Vec<u8> {
    let mut out = encode_column_metadata(columns);
    for row in rows {
        out.extend_from_slice(&encode_row(columns, row));
    }
    out.extend_from_slice(&encode_done(done_status::COUNT, rows.len() as u64));
    out
}

// ============================================================================
// SQL batch
// ============================================================================

const ALL_HEADERS_LEN: u32 = 22;
const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// SQL_BATCH payload: ALL_HEADERS with an auto-commit transaction descriptor,
/// followed by the UTF-16LE query text.
pub fn encode_sql_batch(query: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(ALL_HEADERS_LEN as usize + query.len() * 2);
    out.extend_from_slice(&ALL_HEADERS_LEN.to_le_bytes());
    out.extend_from_slice(&(ALL_HEADERS_LEN - 4).to_le_bytes());
    out.extend_from_slice(&TRANSACTION_DESCRIPTOR_HEADER.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    // outstanding request count
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&string_to_utf16le(query));
    out
}

pub fn parse_sql_batch(data: &[u8]) -> Result<String> {
    let mut r = Reader::new(data);
    let headers_len = r.u32_le()? as usize;
    let text = data
        .get(headers_len..)
        .ok_or(TdsParseError::OffsetOutOfBounds)?;
    utf16le_to_string(text)
}
