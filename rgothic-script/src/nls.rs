use encoding_rs::{Encoding as RsEncoding, UTF_8, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::str::FromStr;

pub trait TextDecoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str>;

    /// Decode C-style string: stop at the first NUL (0x00).
    fn decode_cstr<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        self.decode(&bytes[..end])
    }
}

/// Code pages used by the localized releases of the game.
///
/// Script files and zStrings carry raw bytes, so the code page has to be picked
/// per installation: western releases use 1252, the Polish and Czech ones 1250,
/// the Russian one 1251.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    Windows1252,
    Windows1250,
    Windows1251,
    Utf8,
}

impl Encoding {
    #[inline]
    pub fn as_encoding_rs(self) -> &'static RsEncoding {
        match self {
            Encoding::Windows1252 => WINDOWS_1252,
            Encoding::Windows1250 => WINDOWS_1250,
            Encoding::Windows1251 => WINDOWS_1251,
            Encoding::Utf8 => UTF_8,
        }
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1252" | "cp1252" | "windows-1252" => Ok(Encoding::Windows1252),
            "1250" | "cp1250" | "windows-1250" => Ok(Encoding::Windows1250),
            "1251" | "cp1251" | "windows-1251" => Ok(Encoding::Windows1251),
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            _ => Err(anyhow::anyhow!("unknown encoding: {}", s)),
        }
    }
}

/// A simple codec bound to one encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    enc: Encoding,
}

impl Decoder {
    #[inline]
    pub fn new(enc: Encoding) -> Self {
        Self { enc }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.enc
    }

    /// Encode a Rust string to bytes using the selected encoding.
    /// Unrepresentable chars are replaced.
    pub fn encode<'a>(&self, s: &'a str) -> Cow<'a, [u8]> {
        let (cow, _enc, _had_errors) = self.enc.as_encoding_rs().encode(s);
        cow
    }

    pub fn encode_owned(&self, s: &str) -> Vec<u8> {
        self.encode(s).into_owned()
    }
}

impl TextDecoder for Decoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self.enc {
            Encoding::Utf8 => String::from_utf8_lossy(bytes),
            _ => {
                let (cow, _had_errors) = self.enc.as_encoding_rs().decode_without_bom_handling(bytes);
                cow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_cstr_stops_at_nul() {
        let d = Decoder::default();
        assert_eq!(d.decode_cstr(b"hello\0world"), "hello");
    }

    #[test]
    fn umlauts_use_single_bytes_in_1252() {
        let d = Decoder::new(Encoding::Windows1252);
        let b = d.encode_owned("Grün");
        assert_eq!(b, vec![b'G', b'r', 0xFC, b'n']);
        assert_eq!(d.decode(&b), "Grün");
    }

    #[test]
    fn cyrillic_roundtrip_1251() {
        let d = Decoder::new(Encoding::Windows1251);
        let b = d.encode_owned("Мир");
        assert_eq!(b.len(), 3);
        assert_eq!(d.decode(&b), "Мир");
    }

    #[test]
    fn code_page_names_parse() {
        assert_eq!("CP1250".parse::<Encoding>().unwrap(), Encoding::Windows1250);
        assert_eq!("utf-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert!("sjis".parse::<Encoding>().is_err());
    }
}
