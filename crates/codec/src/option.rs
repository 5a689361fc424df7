use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The option registry this endpoint understands.
///
/// Options outside this registry are skipped on decode when elective and
/// rejected when critical, as decided by the bit pattern of the number
/// itself (RFC 7252, section 5.4.6).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum OptionNumber {
    IfMatch = 1,
    UriHost = 3,
    ETag = 4,
    IfNoneMatch = 5,
    Observe = 6,
    UriPort = 7,
    LocationPath = 8,
    UriPath = 11,
    ContentFormat = 12,
    MaxAge = 14,
    UriQuery = 15,
    Accept = 17,
    LocationQuery = 20,
    Block2 = 23,
    Block1 = 27,
    ProxyUri = 35,
    ProxyScheme = 39,
    Size1 = 60,
    NoResponse = 258,
}

/// Value format of a registered option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Uint,
    String,
    Opaque,
}

impl OptionNumber {
    pub fn format(self) -> OptionFormat {
        match self {
            OptionNumber::IfMatch | OptionNumber::ETag | OptionNumber::IfNoneMatch => {
                OptionFormat::Opaque
            }
            OptionNumber::UriHost
            | OptionNumber::LocationPath
            | OptionNumber::UriPath
            | OptionNumber::UriQuery
            | OptionNumber::LocationQuery
            | OptionNumber::ProxyUri
            | OptionNumber::ProxyScheme => OptionFormat::String,
            _ => OptionFormat::Uint,
        }
    }

    pub fn repeatable(self) -> bool {
        matches!(
            self,
            OptionNumber::IfMatch
                | OptionNumber::UriHost
                | OptionNumber::ETag
                | OptionNumber::LocationPath
                | OptionNumber::UriPath
                | OptionNumber::UriQuery
                | OptionNumber::LocationQuery
        )
    }
}

/// Critical/UnSafe/NoCacheKey flags from the option number bit pattern
/// (RFC 7252, section 5.4.6).
///
/// # Test
///
/// ```
/// use coap_endpoint_codec::option::{is_critical, is_no_cache_key, is_unsafe};
///
/// // If-Match (1) is critical, Observe (6) is elective.
/// assert!(is_critical(1));
/// assert!(!is_critical(6));
///
/// // Uri-Path (11) is unsafe to forward.
/// assert!(is_unsafe(11));
///
/// // Size1 (60) is safe and excluded from the cache key.
/// assert!(is_no_cache_key(60));
/// ```
#[inline]
pub fn is_critical(number: u16) -> bool {
    number & 0x01 != 0
}

#[inline]
pub fn is_unsafe(number: u16) -> bool {
    number & 0x02 != 0
}

#[inline]
pub fn is_no_cache_key(number: u16) -> bool {
    number & 0x1e == 0x1c
}

/// Supported Content-Format identifiers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ContentFormat {
    TextPlain = 0,
    LinkFormat = 40,
    Xml = 41,
    OctetStream = 42,
    Exi = 47,
    Json = 50,
    Cbor = 60,
    SenmlJson = 110,
    SenmlCbor = 112,
    Lwm2mTlv = 11542,
    Lwm2mJson = 11543,
}

/// A single option instance: the raw number plus the raw value bytes.
///
/// The number stays raw so that options outside [`OptionNumber`] can still
/// be carried around once accepted; the typed accessors on `Message`
/// interpret the value by the registry format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

impl CoapOption {
    pub fn new(number: OptionNumber, value: Vec<u8>) -> Self {
        Self {
            number: number.into(),
            value,
        }
    }

    pub fn uint(number: OptionNumber, value: u32) -> Self {
        Self::new(number, encode_uint(value))
    }

    pub fn string(number: OptionNumber, value: &str) -> Self {
        Self::new(number, value.as_bytes().to_vec())
    }

    pub fn uint_value(&self) -> u32 {
        decode_uint(&self.value)
    }

    pub fn string_value(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Encode an unsigned option value into its minimal big-endian form; zero
/// encodes to the empty string (RFC 7252, section 3.2).
///
/// # Test
///
/// ```
/// use coap_endpoint_codec::option::{decode_uint, encode_uint};
///
/// assert_eq!(encode_uint(0), Vec::<u8>::new());
/// assert_eq!(encode_uint(60), vec![60]);
/// assert_eq!(encode_uint(1024), vec![0x04, 0x00]);
/// assert_eq!(decode_uint(&encode_uint(11542)), 11542);
/// ```
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8) as usize;
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

/// Notification reordering detection (RFC 7641, section 3.4).
///
/// `incoming` is fresher than `current` when `(incoming - current)` modulo
/// 2^24 lies in the first half of the sequence number space.
///
/// # Test
///
/// ```
/// use coap_endpoint_codec::option::observe_newer;
///
/// assert!(observe_newer(2, 3));
/// assert!(!observe_newer(3, 2));
///
/// // Wrap around the 24-bit boundary.
/// assert!(observe_newer((1 << 24) - 1, 2));
/// ```
pub fn observe_newer(current: u32, incoming: u32) -> bool {
    let delta = incoming.wrapping_sub(current) & 0x00FF_FFFF;
    delta != 0 && delta < (1 << 23)
}
