use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Registered CoAP Content-Format number, parsed from a media type string such as
/// `application/json`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContentFormat(pub u16);

/// Media types from the
/// [CoAP Content-Formats registry](https://www.iana.org/assignments/core-parameters/core-parameters.xhtml#content-formats).
const MEDIA_TYPES: &[(&str, u16)] = &[
    ("text/plain;charset=utf-8", 0),
    ("application/cose;cose-type=\"cose-encrypt0\"", 16),
    ("application/cose;cose-type=\"cose-mac0\"", 17),
    ("application/cose;cose-type=\"cose-sign1\"", 18),
    ("application/link-format", 40),
    ("application/xml", 41),
    ("application/octet-stream", 42),
    ("application/exi", 47),
    ("application/json", 50),
    ("application/json-patch+json", 51),
    ("application/merge-patch+json", 52),
    ("application/cbor", 60),
    ("application/cwt", 61),
    ("application/cose-key", 101),
    ("application/cose-key-set", 102),
    ("application/senml+json", 110),
    ("application/sensml+json", 111),
    ("application/senml+cbor", 112),
    ("application/sensml+cbor", 113),
    ("application/senml-exi", 114),
    ("application/sensml-exi", 115),
    ("application/coap-group+json", 256),
    ("application/senml+xml", 310),
    ("application/sensml+xml", 311),
    ("application/vnd.ocf+cbor", 10000),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown content format {0:?}")]
pub struct UnknownContentFormat(pub String);

impl ContentFormat {
    pub const TEXT_PLAIN: ContentFormat = ContentFormat(0);
    pub const APPLICATION_OCTET_STREAM: ContentFormat = ContentFormat(42);
    pub const APPLICATION_JSON: ContentFormat = ContentFormat(50);
    pub const APPLICATION_CBOR: ContentFormat = ContentFormat(60);

    pub fn media_type(&self) -> Option<&'static str> {
        MEDIA_TYPES
            .iter()
            .find(|(_, number)| *number == self.0)
            .map(|(media_type, _)| *media_type)
    }
}

impl FromStr for ContentFormat {
    type Err = UnknownContentFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        if normalized == "text/plain" {
            return Ok(Self::TEXT_PLAIN);
        }
        if let Some((_, number)) = MEDIA_TYPES.iter().find(|(m, _)| *m == normalized) {
            return Ok(ContentFormat(*number));
        }
        normalized
            .parse::<u16>()
            .map(ContentFormat)
            .map_err(|_| UnknownContentFormat(s.to_string()))
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.media_type() {
            Some(media_type) => f.write_str(media_type),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_media_types() {
        assert_eq!("application/json".parse(), Ok(ContentFormat::APPLICATION_JSON));
        assert_eq!("text/plain".parse(), Ok(ContentFormat::TEXT_PLAIN));
        assert_eq!(
            "text/plain; charset=utf-8".parse(),
            Ok(ContentFormat::TEXT_PLAIN)
        );
        assert_eq!("Application/CBOR".parse(), Ok(ContentFormat::APPLICATION_CBOR));
        assert_eq!("112".parse(), Ok(ContentFormat(112)));
    }

    #[test]
    fn test_unknown_media_type() {
        assert_eq!(
            "application/x-nope".parse::<ContentFormat>(),
            Err(UnknownContentFormat("application/x-nope".to_string()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ContentFormat(50).to_string(), "application/json");
        assert_eq!(ContentFormat(9999).to_string(), "9999");
    }
}
