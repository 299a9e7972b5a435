//! Substitution-cipher decoding of upstream series
//!
//! The upstream ships numeric series as strings run through a per-request
//! character substitution. The key for a response is fetched separately; its
//! first half lists cipher characters and its second half the plain characters
//! they stand for.

use crate::crawler::capability::{DecodedPayload, DecodedSeries, RawPayload};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while decoding a series
#[derive(Debug, Error, PartialEq)]
pub enum DecryptError {
    #[error("No decryption key available for an encrypted series")]
    MissingKey,

    #[error("Decoded series contains a non-numeric value: '{0}'")]
    InvalidValue(String),
}

/// Decodes `cipher` with `key`
///
/// Characters without a mapping pass through unchanged, so an empty key leaves
/// the input as it is. An empty cipher decodes to an empty string.
pub fn decode(key: &str, cipher: &str) -> String {
    if cipher.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = key.chars().collect();
    let half = chars.len() / 2;
    let mapping: HashMap<char, char> = (0..half).map(|i| (chars[i], chars[half + i])).collect();

    cipher
        .chars()
        .map(|c| mapping.get(&c).copied().unwrap_or(c))
        .collect()
}

/// Decodes a comma-separated numeric series aligned to `expected_len` points
///
/// Blank entries count as zero. A short series is zero-padded and a long one
/// truncated so every row of the output grid gets exactly one value.
pub fn decode_series(
    key: Option<&str>,
    cipher: &str,
    expected_len: usize,
) -> Result<Vec<i64>, DecryptError> {
    if cipher.is_empty() {
        return Ok(vec![0; expected_len]);
    }

    let key = match key {
        Some(key) if !key.is_empty() => key,
        _ => return Err(DecryptError::MissingKey),
    };

    let mut values = decode(key, cipher)
        .split(',')
        .map(parse_point)
        .collect::<Result<Vec<_>, _>>()?;

    values.resize(expected_len, 0);
    Ok(values)
}

fn parse_point(text: &str) -> Result<i64, DecryptError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    if let Ok(value) = text.parse::<i64>() {
        return Ok(value);
    }
    // Some endpoints report averaged points with a fractional part
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.round() as i64)
        .ok_or_else(|| DecryptError::InvalidValue(text.to_string()))
}

/// Decodes every encrypted series of a fetched payload
pub fn decrypt_payload(
    raw: RawPayload,
    expected_len: usize,
) -> Result<DecodedPayload, DecryptError> {
    let key = raw.cipher_key.as_deref();

    let series = raw
        .encrypted
        .into_iter()
        .map(|encrypted| {
            Ok(DecodedSeries {
                values: decode_series(key, &encrypted.cipher, expected_len)?,
                keyword: encrypted.keyword,
                label: encrypted.label,
            })
        })
        .collect::<Result<Vec<_>, DecryptError>>()?;

    Ok(DecodedPayload {
        data: raw.data,
        series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::capability::EncryptedSeries;

    const KEY: &str = "abcdefghij0123456789";

    fn swap(key: &str) -> String {
        let half = key.chars().count() / 2;
        let chars: Vec<char> = key.chars().collect();
        chars[half..].iter().chain(chars[..half].iter()).collect()
    }

    #[test]
    fn test_decode_maps_first_half_to_second() {
        assert_eq!(decode(KEY, "bc,a"), "12,0");
        assert_eq!(decode(KEY, "j,,x"), "9,,x");
    }

    #[test]
    fn test_decode_empty_inputs() {
        assert_eq!(decode(KEY, ""), "");
        assert_eq!(decode("", "abc,def"), "abc,def");
    }

    #[test]
    fn test_decode_odd_length_key_ignores_last_char() {
        assert_eq!(decode("abXYz", "abz"), "XYz");
    }

    #[test]
    fn test_decode_is_inverted_by_swapped_key() {
        let plain = "abc,ija,hh";
        let cipher = decode(KEY, plain);
        assert_eq!(decode(&swap(KEY), &cipher), plain);
    }

    #[test]
    fn test_decode_series_pads_and_truncates() {
        assert_eq!(decode_series(Some(KEY), "b,c", 4).unwrap(), vec![1, 2, 0, 0]);
        assert_eq!(decode_series(Some(KEY), "b,c,d", 2).unwrap(), vec![1, 2]);
        assert_eq!(decode_series(Some(KEY), "b,,d", 3).unwrap(), vec![1, 0, 3]);
    }

    #[test]
    fn test_decode_series_empty_cipher_is_zeros() {
        assert_eq!(decode_series(None, "", 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_decode_series_errors() {
        assert_eq!(decode_series(None, "b,c", 2), Err(DecryptError::MissingKey));
        assert_eq!(
            decode_series(Some(""), "b,c", 2),
            Err(DecryptError::MissingKey)
        );
        assert!(matches!(
            decode_series(Some(KEY), "b,x", 2),
            Err(DecryptError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_decrypt_payload() {
        let raw = RawPayload {
            data: serde_json::json!({"uniqid": "u1"}),
            cipher_key: Some(KEY.to_string()),
            encrypted: vec![EncryptedSeries {
                keyword: "phone".to_string(),
                label: "all".to_string(),
                cipher: "bcd,e".to_string(),
            }],
        };

        let decoded = decrypt_payload(raw, 3).unwrap();
        assert_eq!(decoded.series.len(), 1);
        assert_eq!(decoded.series[0].keyword, "phone");
        assert_eq!(decoded.series[0].values, vec![123, 4, 0]);
        assert_eq!(decoded.data["uniqid"], "u1");
    }
}
