//! BACnet/IP 报文编解码（无状态）
//!
//! ## 报文分层
//!
//! ```text
//! +------+------+--------+ +---------+---------+---------------------+ +-----------
//! | 0x81 | func | len(2) | | version | control | [DNET..][SNET..][hop]| | APDU ...
//! +------+------+--------+ +---------+---------+---------------------+ +-----------
//!         BVLC (4 字节)              NPDU（最小形式 2 字节）
//! ```
//!
//! - BVLC 功能码：`0x0a` 单播、`0x0b` 广播、`0x04` 转发（附带 6 字节原始源地址）
//! - NPDU control `0x04` 表示期待应答，`0x20` / `0x08` 表示带 DNET / SNET 路由字段，
//!   `0x80` 表示网络层消息（不携带 APDU）
//! - APDU 首字节高 4 位为 PDU 类型，见 [`pdu`]
//!
//! 所有函数都是纯函数，可在任意任务中并发调用。

use crate::error::DriverError;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// BACnet/IP 标准端口
pub const BACNET_PORT: u16 = 47808;

pub const BVLC_TYPE_BIP: u8 = 0x81;
pub const BVLC_RESULT: u8 = 0x00;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0a;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0b;

pub const NPDU_VERSION: u8 = 0x01;
pub const NPDU_EXPECTING_REPLY: u8 = 0x04;
const NPDU_NETWORK_MESSAGE: u8 = 0x80;
const NPDU_DNET_PRESENT: u8 = 0x20;
const NPDU_SNET_PRESENT: u8 = 0x08;

/// 请求中声明的最大 APDU（1476 字节，不接受分段）
const MAX_APDU_ACCEPTED: u8 = 0x05;

pub const MAX_INSTANCE: u32 = 0x003F_FFFF;
pub const MAX_OBJECT_TYPE: u16 = 0x03FF;

/// APDU PDU 类型（首字节高 4 位）
pub mod pdu {
    pub const CONFIRMED_REQUEST: u8 = 0x0;
    pub const UNCONFIRMED_REQUEST: u8 = 0x1;
    pub const SIMPLE_ACK: u8 = 0x2;
    pub const COMPLEX_ACK: u8 = 0x3;
    pub const SEGMENT_ACK: u8 = 0x4;
    /// 只按类型号分类：个别非标准设备用 0x5 回 Reject，这类报文按 Error 解析，
    /// 缺少 error class / code 时解码失败，请求最终以超时结束
    pub const ERROR: u8 = 0x5;
    pub const REJECT: u8 = 0x6;
    pub const ABORT: u8 = 0x7;
}

/// 服务选择
pub mod service {
    pub const I_AM: u8 = 0x00;
    pub const WHO_IS: u8 = 0x08;
    pub const READ_PROPERTY: u8 = 0x0c;
    pub const WRITE_PROPERTY: u8 = 0x0f;
}

/// 常用属性标识
pub mod property {
    pub const APPLICATION_SOFTWARE_VERSION: u32 = 12;
    pub const DESCRIPTION: u32 = 28;
    pub const FIRMWARE_REVISION: u32 = 44;
    pub const MAX_APDU_LENGTH_ACCEPTED: u32 = 62;
    pub const MODEL_NAME: u32 = 70;
    pub const OBJECT_IDENTIFIER: u32 = 75;
    pub const OBJECT_LIST: u32 = 76;
    pub const OBJECT_NAME: u32 = 77;
    pub const OBJECT_TYPE: u32 = 79;
    pub const OUT_OF_SERVICE: u32 = 81;
    pub const PRESENT_VALUE: u32 = 85;
    pub const PRIORITY_ARRAY: u32 = 87;
    pub const RELIABILITY: u32 = 103;
    pub const RELINQUISH_DEFAULT: u32 = 104;
    pub const SEGMENTATION_SUPPORTED: u32 = 107;
    pub const STATUS_FLAGS: u32 = 111;
    pub const SYSTEM_STATUS: u32 = 112;
    pub const UNITS: u32 = 117;
    pub const VENDOR_IDENTIFIER: u32 = 120;
    pub const VENDOR_NAME: u32 = 121;
}

pub const OBJECT_TYPE_DEVICE: u16 = 8;

const OBJECT_TYPE_NAMES: &[&str] = &[
    "analog-input",
    "analog-output",
    "analog-value",
    "binary-input",
    "binary-output",
    "binary-value",
    "calendar",
    "command",
    "device",
    "event-enrollment",
    "file",
    "group",
    "loop",
    "multi-state-input",
    "multi-state-output",
    "notification-class",
    "program",
    "schedule",
    "averaging",
    "multi-state-value",
    "trend-log",
    "life-safety-point",
    "life-safety-zone",
    "accumulator",
    "pulse-converter",
    "event-log",
    "global-group",
    "trend-log-multiple",
    "load-control",
    "structured-view",
    "access-door",
];

const OBJECT_TYPE_ABBREVIATIONS: &[(&str, u16)] = &[
    ("ai", 0),
    ("ao", 1),
    ("av", 2),
    ("bi", 3),
    ("bo", 4),
    ("bv", 5),
    ("dev", 8),
    ("msi", 13),
    ("mso", 14),
    ("msv", 19),
];

const PROPERTY_NAMES: &[(&str, u32)] = &[
    ("application-software-version", property::APPLICATION_SOFTWARE_VERSION),
    ("description", property::DESCRIPTION),
    ("firmware-revision", property::FIRMWARE_REVISION),
    ("max-apdu-length-accepted", property::MAX_APDU_LENGTH_ACCEPTED),
    ("model-name", property::MODEL_NAME),
    ("object-identifier", property::OBJECT_IDENTIFIER),
    ("object-list", property::OBJECT_LIST),
    ("object-name", property::OBJECT_NAME),
    ("object-type", property::OBJECT_TYPE),
    ("out-of-service", property::OUT_OF_SERVICE),
    ("present-value", property::PRESENT_VALUE),
    ("priority-array", property::PRIORITY_ARRAY),
    ("reliability", property::RELIABILITY),
    ("relinquish-default", property::RELINQUISH_DEFAULT),
    ("segmentation-supported", property::SEGMENTATION_SUPPORTED),
    ("status-flags", property::STATUS_FLAGS),
    ("system-status", property::SYSTEM_STATUS),
    ("units", property::UNITS),
    ("vendor-identifier", property::VENDOR_IDENTIFIER),
    ("vendor-name", property::VENDOR_NAME),
];

/// 编解码错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("not a BACnet/IP frame (type 0x{0:02X})")]
    InvalidBvlcType(u8),
    #[error("unsupported BVLC function 0x{0:02X}")]
    UnsupportedBvlcFunction(u8),
    #[error("unsupported NPDU version {0}")]
    InvalidNpduVersion(u8),
    #[error("network layer message 0x{0:02X}")]
    NetworkMessage(u8),
    #[error("unknown PDU type 0x{0:X}")]
    UnknownPdu(u8),
    #[error("expected {expected}, found tag {found}")]
    UnexpectedTag { expected: &'static str, found: u8 },
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

impl From<CodecError> for DriverError {
    fn from(err: CodecError) -> Self {
        DriverError::DataParse(err.to_string())
    }
}

// ============================================================================
// Object Identifier
// ============================================================================

/// 打包的对象标识：10 位对象类型 + 22 位实例号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: u16, instance: u32) -> Result<Self, CodecError> {
        if object_type > MAX_OBJECT_TYPE {
            return Err(CodecError::OutOfRange(format!("object type {object_type}")));
        }
        if instance > MAX_INSTANCE {
            return Err(CodecError::OutOfRange(format!("instance {instance}")));
        }
        Ok(Self {
            object_type,
            instance,
        })
    }

    pub fn device(instance: u32) -> Result<Self, CodecError> {
        Self::new(OBJECT_TYPE_DEVICE, instance)
    }

    /// `type << 22 | instance`
    pub fn encode(&self) -> u32 {
        (u32::from(self.object_type & MAX_OBJECT_TYPE) << 22) | (self.instance & MAX_INSTANCE)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            object_type: (raw >> 22) as u16,
            instance: raw & MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", object_type_name(self.object_type), self.instance)
    }
}

/// 对象类型名称（非标准类型返回数字）
pub fn object_type_name(object_type: u16) -> String {
    OBJECT_TYPE_NAMES
        .get(object_type as usize)
        .map(|name| name.to_string())
        .unwrap_or_else(|| object_type.to_string())
}

fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// 解析对象类型：数字、`analog-input`、`AnalogInput`、`ai` 均可
pub fn parse_object_type(s: &str) -> Option<u16> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u16>() {
        return (n <= MAX_OBJECT_TYPE).then_some(n);
    }
    let wanted = normalize_name(s);
    OBJECT_TYPE_NAMES
        .iter()
        .position(|name| normalize_name(name) == wanted)
        .map(|i| i as u16)
        .or_else(|| {
            OBJECT_TYPE_ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == wanted)
                .map(|(_, t)| *t)
        })
}

/// 解析属性标识：数字、`present-value`、`PresentValue` 均可
pub fn parse_property(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u32>() {
        return Some(n);
    }
    let wanted = normalize_name(s);
    PROPERTY_NAMES
        .iter()
        .find(|(name, _)| normalize_name(name) == wanted)
        .map(|(_, id)| *id)
}

// ============================================================================
// 标签（Tag）
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// 原始值长度；应用标签 Boolean 时为值本身
    Length(u32),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub class: TagClass,
    pub kind: TagKind,
}

impl Tag {
    fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context && self.number == number
    }

    fn is_opening(&self, number: u8) -> bool {
        self.is_context(number) && self.kind == TagKind::Opening
    }

    fn is_closing(&self, number: u8) -> bool {
        self.is_context(number) && self.kind == TagKind::Closing
    }

    fn len(&self) -> usize {
        match self.kind {
            TagKind::Length(len) => len as usize,
            _ => 0,
        }
    }
}

/// 解析标签头，返回标签与头部字节数
pub fn decode_tag(buf: &[u8]) -> Result<(Tag, usize), CodecError> {
    let first = *buf.first().ok_or(CodecError::Truncated("tag"))?;
    let mut pos = 1;
    let mut number = first >> 4;
    if number == 0x0F {
        number = *buf.get(pos).ok_or(CodecError::Truncated("extended tag number"))?;
        pos += 1;
    }
    let class = if first & 0x08 != 0 {
        TagClass::Context
    } else {
        TagClass::Application
    };
    let lvt = first & 0x07;
    let kind = match (class, lvt) {
        (TagClass::Context, 6) => TagKind::Opening,
        (TagClass::Context, 7) => TagKind::Closing,
        (_, 5) => {
            let ext = *buf.get(pos).ok_or(CodecError::Truncated("extended length"))?;
            pos += 1;
            match ext {
                254 => {
                    let b = buf.get(pos..pos + 2).ok_or(CodecError::Truncated("length"))?;
                    pos += 2;
                    TagKind::Length(u32::from(u16::from_be_bytes([b[0], b[1]])))
                }
                255 => {
                    let b = buf.get(pos..pos + 4).ok_or(CodecError::Truncated("length"))?;
                    pos += 4;
                    TagKind::Length(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                }
                n => TagKind::Length(u32::from(n)),
            }
        }
        (_, n) => TagKind::Length(u32::from(n)),
    };
    Ok((Tag { number, class, kind }, pos))
}

fn put_tag(buf: &mut BytesMut, number: u8, class: TagClass, len: usize) {
    let mut first = if number <= 14 { number << 4 } else { 0xF0 };
    if class == TagClass::Context {
        first |= 0x08;
    }
    first |= if len <= 4 { len as u8 } else { 5 };
    buf.put_u8(first);
    if number > 14 {
        buf.put_u8(number);
    }
    if len > 4 {
        if len <= 253 {
            buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            buf.put_u8(254);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(255);
            buf.put_u32(len as u32);
        }
    }
}

fn put_opening(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0E);
}

fn put_closing(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0F);
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let significant = (64 - value.leading_zeros() as usize).div_ceil(8).max(1);
    value.to_be_bytes()[8 - significant..].to_vec()
}

fn signed_bytes(value: i64) -> Vec<u8> {
    let wide = i128::from(value);
    let n = (1..=8usize)
        .find(|n| {
            let bound = 1i128 << (8 * n - 1);
            wide >= -bound && wide < bound
        })
        .unwrap_or(8);
    value.to_be_bytes()[8 - n..].to_vec()
}

fn read_unsigned(bytes: &[u8]) -> Result<u64, CodecError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(CodecError::OutOfRange(format!(
            "unsigned of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn read_signed(bytes: &[u8]) -> Result<i64, CodecError> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(CodecError::OutOfRange(format!("signed of {} bytes", bytes.len())));
    }
    let init: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(bytes.iter().fold(init, |acc, b| (acc << 8) | i64::from(*b)))
}

fn put_context_unsigned(buf: &mut BytesMut, number: u8, value: u64) {
    let bytes = unsigned_bytes(value);
    put_tag(buf, number, TagClass::Context, bytes.len());
    buf.put_slice(&bytes);
}

fn put_context_object_id(buf: &mut BytesMut, number: u8, object: ObjectId) {
    put_tag(buf, number, TagClass::Context, 4);
    buf.put_u32(object.encode());
}

/// 读取指定编号的上下文无符号值，返回值与消耗字节数
fn take_context_unsigned(buf: &[u8], number: u8) -> Result<(u64, usize), CodecError> {
    let (tag, head) = decode_tag(buf)?;
    if !tag.is_context(number) || !matches!(tag.kind, TagKind::Length(_)) {
        return Err(CodecError::UnexpectedTag {
            expected: "context unsigned",
            found: tag.number,
        });
    }
    let body = buf
        .get(head..head + tag.len())
        .ok_or(CodecError::Truncated("context value"))?;
    Ok((read_unsigned(body)?, head + tag.len()))
}

fn take_context_object_id(buf: &[u8], number: u8) -> Result<(ObjectId, usize), CodecError> {
    let (tag, head) = decode_tag(buf)?;
    if !tag.is_context(number) || tag.len() != 4 {
        return Err(CodecError::UnexpectedTag {
            expected: "context object identifier",
            found: tag.number,
        });
    }
    let b = buf
        .get(head..head + 4)
        .ok_or(CodecError::Truncated("object identifier"))?;
    Ok((
        ObjectId::decode(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        head + 4,
    ))
}

fn peek_is_context(buf: &[u8], number: u8) -> bool {
    matches!(decode_tag(buf), Ok((tag, _)) if tag.is_context(number) && matches!(tag.kind, TagKind::Length(_)))
}

// ============================================================================
// 应用标签值
// ============================================================================

/// 应用标签原始值
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString { unused_bits: u8, bytes: Vec<u8> },
    Enumerated(u32),
    Date([u8; 4]),
    Time([u8; 4]),
    ObjectId(ObjectId),
}

impl BacnetValue {
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Self::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Unsigned(v) => Some(*v),
            Self::Enumerated(v) => Some(u64::from(*v)),
            Self::Signed(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::CharacterString(s) => Some(s),
            _ => None,
        }
    }
}

/// 编码一个应用标签值
pub fn encode_application_value(buf: &mut BytesMut, value: &BacnetValue) {
    match value {
        BacnetValue::Null => buf.put_u8(0x00),
        BacnetValue::Boolean(b) => buf.put_u8(0x10 | u8::from(*b)),
        BacnetValue::Unsigned(v) => {
            let bytes = unsigned_bytes(*v);
            put_tag(buf, 2, TagClass::Application, bytes.len());
            buf.put_slice(&bytes);
        }
        BacnetValue::Signed(v) => {
            let bytes = signed_bytes(*v);
            put_tag(buf, 3, TagClass::Application, bytes.len());
            buf.put_slice(&bytes);
        }
        BacnetValue::Real(v) => {
            buf.put_u8(0x44);
            buf.put_f32(*v);
        }
        BacnetValue::Double(v) => {
            put_tag(buf, 5, TagClass::Application, 8);
            buf.put_f64(*v);
        }
        BacnetValue::OctetString(bytes) => {
            put_tag(buf, 6, TagClass::Application, bytes.len());
            buf.put_slice(bytes);
        }
        BacnetValue::CharacterString(s) => {
            put_tag(buf, 7, TagClass::Application, s.len() + 1);
            // 字符集 0：UTF-8
            buf.put_u8(0);
            buf.put_slice(s.as_bytes());
        }
        BacnetValue::BitString { unused_bits, bytes } => {
            put_tag(buf, 8, TagClass::Application, bytes.len() + 1);
            buf.put_u8(*unused_bits);
            buf.put_slice(bytes);
        }
        BacnetValue::Enumerated(v) => {
            let bytes = unsigned_bytes(u64::from(*v));
            put_tag(buf, 9, TagClass::Application, bytes.len());
            buf.put_slice(&bytes);
        }
        BacnetValue::Date(d) => {
            put_tag(buf, 10, TagClass::Application, 4);
            buf.put_slice(d);
        }
        BacnetValue::Time(t) => {
            put_tag(buf, 11, TagClass::Application, 4);
            buf.put_slice(t);
        }
        BacnetValue::ObjectId(id) => {
            buf.put_u8(0xC4);
            buf.put_u32(id.encode());
        }
    }
}

fn decode_char_string(body: &[u8]) -> Result<String, CodecError> {
    let (charset, text) = body
        .split_first()
        .ok_or(CodecError::Truncated("character string"))?;
    let s = match charset {
        // UCS-2 大端
        4 => {
            let units: Vec<u16> = text
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        // ISO 8859-1
        5 => text.iter().map(|b| char::from(*b)).collect(),
        _ => String::from_utf8_lossy(text).into_owned(),
    };
    Ok(s)
}

/// 解码一个应用标签值，返回值与消耗字节数
pub fn decode_application_value(buf: &[u8]) -> Result<(BacnetValue, usize), CodecError> {
    let (tag, head) = decode_tag(buf)?;
    if tag.class != TagClass::Application {
        return Err(CodecError::UnexpectedTag {
            expected: "application tag",
            found: tag.number,
        });
    }
    let len = tag.len();
    if tag.number == 1 {
        return Ok((BacnetValue::Boolean(len != 0), head));
    }
    let body = buf
        .get(head..head + len)
        .ok_or(CodecError::Truncated("application value"))?;
    let value = match tag.number {
        0 => BacnetValue::Null,
        2 => BacnetValue::Unsigned(read_unsigned(body)?),
        3 => BacnetValue::Signed(read_signed(body)?),
        4 => {
            let b: [u8; 4] = body
                .try_into()
                .map_err(|_| CodecError::OutOfRange("real length".to_string()))?;
            BacnetValue::Real(f32::from_be_bytes(b))
        }
        5 => {
            let b: [u8; 8] = body
                .try_into()
                .map_err(|_| CodecError::OutOfRange("double length".to_string()))?;
            BacnetValue::Double(f64::from_be_bytes(b))
        }
        6 => BacnetValue::OctetString(body.to_vec()),
        7 => BacnetValue::CharacterString(decode_char_string(body)?),
        8 => {
            let (unused_bits, bytes) = body
                .split_first()
                .ok_or(CodecError::Truncated("bit string"))?;
            BacnetValue::BitString {
                unused_bits: *unused_bits,
                bytes: bytes.to_vec(),
            }
        }
        9 => {
            let v = read_unsigned(body)?;
            BacnetValue::Enumerated(
                u32::try_from(v).map_err(|_| CodecError::OutOfRange(format!("enumerated {v}")))?,
            )
        }
        10 | 11 | 12 => {
            let b: [u8; 4] = body
                .try_into()
                .map_err(|_| CodecError::OutOfRange("4-byte primitive length".to_string()))?;
            match tag.number {
                10 => BacnetValue::Date(b),
                11 => BacnetValue::Time(b),
                _ => BacnetValue::ObjectId(ObjectId::decode(u32::from_be_bytes(b))),
            }
        }
        other => {
            return Err(CodecError::UnexpectedTag {
                expected: "known application tag",
                found: other,
            })
        }
    };
    Ok((value, head + len))
}

// ============================================================================
// 帧封装
// ============================================================================

fn frame(function: u8, control: u8, apdu: &[u8]) -> Vec<u8> {
    let total = 4 + 2 + apdu.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(BVLC_TYPE_BIP);
    buf.put_u8(function);
    buf.put_u16(total as u16);
    buf.put_u8(NPDU_VERSION);
    buf.put_u8(control);
    buf.put_slice(apdu);
    buf.to_vec()
}

fn confirmed_header(buf: &mut BytesMut, invoke_id: u8, service: u8) {
    buf.put_u8(pdu::CONFIRMED_REQUEST << 4);
    buf.put_u8(MAX_APDU_ACCEPTED);
    buf.put_u8(invoke_id);
    buf.put_u8(service);
}

/// Who-Is（可选实例范围）；`broadcast` 决定 BVLC 功能码
pub fn encode_who_is(range: Option<(u32, u32)>, broadcast: bool) -> Vec<u8> {
    let mut apdu = BytesMut::with_capacity(12);
    apdu.put_u8(pdu::UNCONFIRMED_REQUEST << 4);
    apdu.put_u8(service::WHO_IS);
    if let Some((low, high)) = range {
        put_context_unsigned(&mut apdu, 0, u64::from(low.min(MAX_INSTANCE)));
        put_context_unsigned(&mut apdu, 1, u64::from(high.min(MAX_INSTANCE)));
    }
    let function = if broadcast {
        BVLC_ORIGINAL_BROADCAST
    } else {
        BVLC_ORIGINAL_UNICAST
    };
    frame(function, 0x00, &apdu)
}

/// I-Am（设备侧应答，测试桩与网关自报使用）
pub fn encode_i_am(device: ObjectId, max_apdu: u32, segmentation: u32, vendor_id: u32) -> Vec<u8> {
    let mut apdu = BytesMut::with_capacity(16);
    apdu.put_u8(pdu::UNCONFIRMED_REQUEST << 4);
    apdu.put_u8(service::I_AM);
    encode_application_value(&mut apdu, &BacnetValue::ObjectId(device));
    encode_application_value(&mut apdu, &BacnetValue::Unsigned(u64::from(max_apdu)));
    encode_application_value(&mut apdu, &BacnetValue::Enumerated(segmentation));
    encode_application_value(&mut apdu, &BacnetValue::Unsigned(u64::from(vendor_id)));
    frame(BVLC_ORIGINAL_UNICAST, 0x00, &apdu)
}

/// ReadProperty 请求
pub fn encode_read_property(
    invoke_id: u8,
    object: ObjectId,
    property: u32,
    array_index: Option<u32>,
) -> Vec<u8> {
    let mut apdu = BytesMut::with_capacity(16);
    confirmed_header(&mut apdu, invoke_id, service::READ_PROPERTY);
    put_context_object_id(&mut apdu, 0, object);
    put_context_unsigned(&mut apdu, 1, u64::from(property));
    if let Some(index) = array_index {
        put_context_unsigned(&mut apdu, 2, u64::from(index));
    }
    frame(BVLC_ORIGINAL_UNICAST, NPDU_EXPECTING_REPLY, &apdu)
}

/// WriteProperty 请求；`priority` 为 1..=16，`None` 时不携带 Tag 4
pub fn encode_write_property(
    invoke_id: u8,
    object: ObjectId,
    property: u32,
    array_index: Option<u32>,
    value: &BacnetValue,
    priority: Option<u8>,
) -> Result<Vec<u8>, CodecError> {
    if let Some(p) = priority {
        if !(1..=16).contains(&p) {
            return Err(CodecError::OutOfRange(format!("priority {p}")));
        }
    }
    let mut apdu = BytesMut::with_capacity(24);
    confirmed_header(&mut apdu, invoke_id, service::WRITE_PROPERTY);
    put_context_object_id(&mut apdu, 0, object);
    put_context_unsigned(&mut apdu, 1, u64::from(property));
    if let Some(index) = array_index {
        put_context_unsigned(&mut apdu, 2, u64::from(index));
    }
    put_opening(&mut apdu, 3);
    encode_application_value(&mut apdu, value);
    put_closing(&mut apdu, 3);
    if let Some(p) = priority {
        put_context_unsigned(&mut apdu, 4, u64::from(p));
    }
    Ok(frame(BVLC_ORIGINAL_UNICAST, NPDU_EXPECTING_REPLY, &apdu))
}

/// SimpleACK（设备侧）
pub fn encode_simple_ack(invoke_id: u8, service: u8) -> Vec<u8> {
    frame(
        BVLC_ORIGINAL_UNICAST,
        0x00,
        &[pdu::SIMPLE_ACK << 4, invoke_id, service],
    )
}

/// ReadProperty 的 ComplexACK（设备侧）
pub fn encode_read_property_ack(
    invoke_id: u8,
    object: ObjectId,
    property: u32,
    array_index: Option<u32>,
    values: &[BacnetValue],
) -> Vec<u8> {
    let mut apdu = BytesMut::with_capacity(32);
    apdu.put_u8(pdu::COMPLEX_ACK << 4);
    apdu.put_u8(invoke_id);
    apdu.put_u8(service::READ_PROPERTY);
    put_context_object_id(&mut apdu, 0, object);
    put_context_unsigned(&mut apdu, 1, u64::from(property));
    if let Some(index) = array_index {
        put_context_unsigned(&mut apdu, 2, u64::from(index));
    }
    put_opening(&mut apdu, 3);
    for value in values {
        encode_application_value(&mut apdu, value);
    }
    put_closing(&mut apdu, 3);
    frame(BVLC_ORIGINAL_UNICAST, 0x00, &apdu)
}

/// Error PDU（设备侧）
pub fn encode_error(invoke_id: u8, service: u8, class: u32, code: u32) -> Vec<u8> {
    let mut apdu = BytesMut::with_capacity(8);
    apdu.put_u8(pdu::ERROR << 4);
    apdu.put_u8(invoke_id);
    apdu.put_u8(service);
    encode_application_value(&mut apdu, &BacnetValue::Enumerated(class));
    encode_application_value(&mut apdu, &BacnetValue::Enumerated(code));
    frame(BVLC_ORIGINAL_UNICAST, 0x00, &apdu)
}

/// Reject PDU（设备侧）
pub fn encode_reject(invoke_id: u8, reason: u8) -> Vec<u8> {
    frame(
        BVLC_ORIGINAL_UNICAST,
        0x00,
        &[pdu::REJECT << 4, invoke_id, reason],
    )
}

// ============================================================================
// 帧解析
// ============================================================================

/// 远程网络地址（路由 NPDU 中的 DNET/SNET）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub control: u8,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    pub hop_count: Option<u8>,
}

impl Npdu {
    pub fn expecting_reply(&self) -> bool {
        self.control & NPDU_EXPECTING_REPLY != 0
    }
}

/// 解析后的 BACnet/IP 帧
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<'a> {
    pub bvlc_function: u8,
    /// 转发帧（0x04）携带的原始源地址
    pub forwarded_from: Option<SocketAddrV4>,
    pub npdu: Npdu,
    pub apdu: &'a [u8],
}

fn take_network_address(buf: &[u8], pos: &mut usize) -> Result<NetworkAddress, CodecError> {
    let head = buf
        .get(*pos..*pos + 3)
        .ok_or(CodecError::Truncated("network address"))?;
    let network = u16::from_be_bytes([head[0], head[1]]);
    let len = head[2] as usize;
    *pos += 3;
    let mac = buf
        .get(*pos..*pos + len)
        .ok_or(CodecError::Truncated("network mac"))?
        .to_vec();
    *pos += len;
    Ok(NetworkAddress { network, mac })
}

/// 解析 NPDU，返回头部与 APDU 起始偏移
pub fn decode_npdu(buf: &[u8]) -> Result<(Npdu, usize), CodecError> {
    let head = buf.get(..2).ok_or(CodecError::Truncated("npdu"))?;
    if head[0] != NPDU_VERSION {
        return Err(CodecError::InvalidNpduVersion(head[0]));
    }
    let control = head[1];
    let mut pos = 2;
    let destination = if control & NPDU_DNET_PRESENT != 0 {
        Some(take_network_address(buf, &mut pos)?)
    } else {
        None
    };
    let source = if control & NPDU_SNET_PRESENT != 0 {
        Some(take_network_address(buf, &mut pos)?)
    } else {
        None
    };
    let hop_count = if destination.is_some() {
        let hop = *buf.get(pos).ok_or(CodecError::Truncated("hop count"))?;
        pos += 1;
        Some(hop)
    } else {
        None
    };
    if control & NPDU_NETWORK_MESSAGE != 0 {
        let message = *buf.get(pos).ok_or(CodecError::Truncated("network message"))?;
        return Err(CodecError::NetworkMessage(message));
    }
    Ok((
        Npdu {
            control,
            destination,
            source,
            hop_count,
        },
        pos,
    ))
}

/// 解析完整的 BACnet/IP 帧
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, CodecError> {
    let header = buf.get(..4).ok_or(CodecError::Truncated("bvlc"))?;
    if header[0] != BVLC_TYPE_BIP {
        return Err(CodecError::InvalidBvlcType(header[0]));
    }
    let function = header[1];
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length < 4 || length > buf.len() {
        return Err(CodecError::Truncated("bvlc length"));
    }
    let body = &buf[4..length];
    let (forwarded_from, npdu_bytes) = match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => (None, body),
        BVLC_FORWARDED_NPDU => {
            let addr = body.get(..6).ok_or(CodecError::Truncated("forwarded address"))?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[4], addr[5]]);
            (Some(SocketAddrV4::new(ip, port)), &body[6..])
        }
        other => return Err(CodecError::UnsupportedBvlcFunction(other)),
    };
    let (npdu, offset) = decode_npdu(npdu_bytes)?;
    Ok(Frame {
        bvlc_function: function,
        forwarded_from,
        npdu,
        apdu: &npdu_bytes[offset..],
    })
}

/// 分类后的 APDU
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu<'a> {
    ConfirmedRequest {
        invoke_id: u8,
        service: u8,
        segmented: bool,
        payload: &'a [u8],
    },
    UnconfirmedRequest {
        service: u8,
        payload: &'a [u8],
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    ComplexAck {
        invoke_id: u8,
        service: u8,
        segmented: bool,
        payload: &'a [u8],
    },
    SegmentAck {
        invoke_id: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        reason: u8,
        from_server: bool,
    },
}

impl Apdu<'_> {
    /// 应答类 PDU 的 invoke ID
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Self::UnconfirmedRequest { .. } => None,
            Self::ConfirmedRequest { invoke_id, .. }
            | Self::SimpleAck { invoke_id, .. }
            | Self::ComplexAck { invoke_id, .. }
            | Self::SegmentAck { invoke_id }
            | Self::Error { invoke_id, .. }
            | Self::Reject { invoke_id, .. }
            | Self::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }
}

fn byte_at(buf: &[u8], pos: usize, what: &'static str) -> Result<u8, CodecError> {
    buf.get(pos).copied().ok_or(CodecError::Truncated(what))
}

fn take_enumerated(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    let (value, used) = decode_application_value(buf)?;
    match value {
        BacnetValue::Enumerated(v) => Ok((v, used)),
        BacnetValue::Unsigned(v) => Ok((v as u32, used)),
        _ => Err(CodecError::UnexpectedTag {
            expected: "enumerated",
            found: buf[0] >> 4,
        }),
    }
}

/// 按 PDU 类型分类 APDU（仅看首字节高 4 位，尾随字节不影响分类）
pub fn decode_apdu(apdu: &[u8]) -> Result<Apdu<'_>, CodecError> {
    let first = byte_at(apdu, 0, "apdu")?;
    match first >> 4 {
        pdu::CONFIRMED_REQUEST => {
            let segmented = first & 0x08 != 0;
            let invoke_id = byte_at(apdu, 2, "invoke id")?;
            let service_pos = if segmented { 5 } else { 3 };
            let service = byte_at(apdu, service_pos, "service choice")?;
            Ok(Apdu::ConfirmedRequest {
                invoke_id,
                service,
                segmented,
                payload: &apdu[service_pos + 1..],
            })
        }
        pdu::UNCONFIRMED_REQUEST => Ok(Apdu::UnconfirmedRequest {
            service: byte_at(apdu, 1, "service choice")?,
            payload: &apdu[2..],
        }),
        pdu::SIMPLE_ACK => Ok(Apdu::SimpleAck {
            invoke_id: byte_at(apdu, 1, "invoke id")?,
            service: apdu.get(2).copied().unwrap_or_default(),
        }),
        pdu::COMPLEX_ACK => {
            let segmented = first & 0x08 != 0;
            let invoke_id = byte_at(apdu, 1, "invoke id")?;
            let service_pos = if segmented { 4 } else { 2 };
            let service = byte_at(apdu, service_pos, "service choice")?;
            Ok(Apdu::ComplexAck {
                invoke_id,
                service,
                segmented,
                payload: &apdu[service_pos + 1..],
            })
        }
        pdu::SEGMENT_ACK => Ok(Apdu::SegmentAck {
            invoke_id: byte_at(apdu, 1, "invoke id")?,
        }),
        pdu::ERROR => {
            let invoke_id = byte_at(apdu, 1, "invoke id")?;
            let service = byte_at(apdu, 2, "service choice")?;
            let (class, used) = take_enumerated(&apdu[3..])?;
            let (code, _) = take_enumerated(&apdu[3 + used..])?;
            Ok(Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            })
        }
        pdu::REJECT => Ok(Apdu::Reject {
            invoke_id: byte_at(apdu, 1, "invoke id")?,
            reason: byte_at(apdu, 2, "reject reason")?,
        }),
        pdu::ABORT => Ok(Apdu::Abort {
            invoke_id: byte_at(apdu, 1, "invoke id")?,
            reason: byte_at(apdu, 2, "abort reason")?,
            from_server: first & 0x01 != 0,
        }),
        other => Err(CodecError::UnknownPdu(other)),
    }
}

// ============================================================================
// 服务参数
// ============================================================================

/// I-Am 内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

pub fn decode_i_am(payload: &[u8]) -> Result<IAm, CodecError> {
    let (device, mut pos) = decode_application_value(payload)?;
    let device = device.as_object_id().ok_or(CodecError::UnexpectedTag {
        expected: "object identifier",
        found: payload[0] >> 4,
    })?;
    let mut next_u32 = |what: &'static str| -> Result<u32, CodecError> {
        let (value, used) = decode_application_value(
            payload.get(pos..).ok_or(CodecError::Truncated(what))?,
        )?;
        pos += used;
        value
            .as_u64()
            .map(|v| v as u32)
            .ok_or(CodecError::Truncated(what))
    };
    let max_apdu = next_u32("max apdu")?;
    let segmentation = next_u32("segmentation")?;
    let vendor_id = next_u32("vendor id")?;
    Ok(IAm {
        device,
        max_apdu,
        segmentation,
        vendor_id,
    })
}

/// Who-Is 的实例范围（无范围时返回 None）
pub fn decode_who_is(payload: &[u8]) -> Result<Option<(u32, u32)>, CodecError> {
    if payload.is_empty() {
        return Ok(None);
    }
    let (low, used) = take_context_unsigned(payload, 0)?;
    let (high, _) = take_context_unsigned(&payload[used..], 1)?;
    Ok(Some((low as u32, high as u32)))
}

/// ReadProperty 请求参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRef {
    pub object: ObjectId,
    pub property: u32,
    pub array_index: Option<u32>,
}

fn take_property_ref(payload: &[u8]) -> Result<(PropertyRef, usize), CodecError> {
    let (object, mut pos) = take_context_object_id(payload, 0)?;
    let (property, used) = take_context_unsigned(&payload[pos..], 1)?;
    pos += used;
    let array_index = if peek_is_context(&payload[pos..], 2) {
        let (index, used) = take_context_unsigned(&payload[pos..], 2)?;
        pos += used;
        Some(index as u32)
    } else {
        None
    };
    Ok((
        PropertyRef {
            object,
            property: property as u32,
            array_index,
        },
        pos,
    ))
}

pub fn decode_read_property_request(payload: &[u8]) -> Result<PropertyRef, CodecError> {
    take_property_ref(payload).map(|(r, _)| r)
}

/// 读取 Tag 3 包裹的值列表，跳过嵌套的构造值；返回值列表与消耗字节数
fn take_property_values(buf: &[u8]) -> Result<(Vec<BacnetValue>, usize), CodecError> {
    let (open, mut pos) = decode_tag(buf)?;
    if !open.is_opening(3) {
        return Err(CodecError::UnexpectedTag {
            expected: "opening tag 3",
            found: open.number,
        });
    }
    let mut values = Vec::new();
    let mut depth = 0usize;
    loop {
        let rest = buf.get(pos..).ok_or(CodecError::Truncated("property value"))?;
        let (tag, head) = decode_tag(rest)?;
        match (tag.class, tag.kind) {
            (TagClass::Context, TagKind::Closing) if depth == 0 && tag.number == 3 => {
                pos += head;
                return Ok((values, pos));
            }
            (TagClass::Context, TagKind::Opening) => {
                depth += 1;
                pos += head;
            }
            (TagClass::Context, TagKind::Closing) => {
                depth = depth.saturating_sub(1);
                pos += head;
            }
            (TagClass::Context, TagKind::Length(len)) => {
                pos += head + len as usize;
            }
            (TagClass::Application, _) => {
                let (value, used) = decode_application_value(rest)?;
                values.push(value);
                pos += used;
            }
        }
    }
}

/// ReadProperty 的 ComplexACK 内容
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object: ObjectId,
    pub property: u32,
    pub array_index: Option<u32>,
    pub values: Vec<BacnetValue>,
}

pub fn decode_read_property_ack(payload: &[u8]) -> Result<ReadPropertyAck, CodecError> {
    let (reference, pos) = take_property_ref(payload)?;
    let (values, _) = take_property_values(&payload[pos..])?;
    Ok(ReadPropertyAck {
        object: reference.object,
        property: reference.property,
        array_index: reference.array_index,
        values,
    })
}

/// WriteProperty 请求内容
#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest {
    pub reference: PropertyRef,
    pub values: Vec<BacnetValue>,
    pub priority: Option<u8>,
}

pub fn decode_write_property_request(payload: &[u8]) -> Result<WritePropertyRequest, CodecError> {
    let (reference, mut pos) = take_property_ref(payload)?;
    let (values, used) = take_property_values(&payload[pos..])?;
    pos += used;
    let priority = if peek_is_context(&payload[pos..], 4) {
        Some(take_context_unsigned(&payload[pos..], 4)?.0 as u8)
    } else {
        None
    };
    Ok(WritePropertyRequest {
        reference,
        values,
        priority,
    })
}
