use crate::instrumentation::Register;
use serde::de::{self, Deserializer, Visitor};
use std::fmt;

/// Parse hex number strings to u64 values, with or without `0x` prefix
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let cleaned = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(cleaned, 16)
        .map_err(|e| format!("'{}' is not a valid hex number: {}", s, e))
}

struct HexNumberVisitor;

impl<'de> Visitor<'de> for HexNumberVisitor {
    type Value = Option<u64>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a hex string like \"0x27\" or a number")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
        Ok(Some(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u64::try_from(value)
            .map(Some)
            .map_err(|_| de::Error::custom(format!("negative number {value}")))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        // json5 reports all numbers as floating point
        if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
            Ok(Some(value as u64))
        } else {
            Err(de::Error::custom(format!("{value} is not an unsigned integer")))
        }
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse_hex(value).map(Some).map_err(de::Error::custom)
    }
}

/// Custom deserializer for optional numbers given as hex strings or numbers
pub fn deserialize_hex_option<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_option(HexNumberVisitor)
}

/// Custom deserializer for an optional register name, validated on load
pub fn deserialize_register_option<'de, D>(deserializer: D) -> Result<Option<Register>, D::Error>
where
    D: Deserializer<'de>,
{
    let name: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    name.map(|name| name.parse::<Register>().map_err(de::Error::custom))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "deserialize_hex_option")]
        number: Option<u64>,
        #[serde(default, deserialize_with = "deserialize_register_option")]
        register: Option<Register>,
    }

    #[test]
    fn parse_hex_numbers() {
        assert_eq!(parse_hex("0x1a"), Ok(0x1a));
        assert_eq!(parse_hex("ff"), Ok(0xff));
        assert!(parse_hex("0xzz").is_err());
        assert!(parse_hex("").is_err());
    }

    #[test]
    fn hex_string_or_number() {
        let sample: Sample = json5::from_str("{ number: \"0x27\", register: \"xmm1\" }").unwrap();
        assert_eq!(sample.number, Some(0x27));
        assert_eq!(sample.register, Some(Register::Xmm(1)));

        let sample: Sample = json5::from_str("{ number: 39 }").unwrap();
        assert_eq!(sample.number, Some(39));
        assert_eq!(sample.register, None);

        assert!(json5::from_str::<Sample>("{ register: \"zmm40\" }").is_err());
    }
}
