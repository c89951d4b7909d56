//! Encodes/decodes broker payload bytes per a component's configured
//! [`config::PayloadEncoding`]/[`config::PayloadFormat`], shared by broker
//! input and broker output.

use config::{PayloadEncoding, PayloadFormat};
use message::PayloadValue;

/// Decodes raw broker bytes into a [`PayloadValue`], first undoing the wire
/// encoding (`base64`/`none`/`utf-8`) and then parsing the resulting bytes
/// per `format`.
pub fn decode(bytes: &[u8], encoding: PayloadEncoding, format: PayloadFormat) -> Result<PayloadValue, String> {
    let decoded = match encoding {
        PayloadEncoding::Base64 => base64::Engine::decode(&base64::engine::general_purpose::STANDARD, bytes)
            .map_err(|err| format!("invalid base64 payload: {err}"))?,
        PayloadEncoding::Utf8 | PayloadEncoding::None => bytes.to_vec(),
    };

    match format {
        PayloadFormat::Text => Ok(PayloadValue::Text(String::from_utf8_lossy(&decoded).into_owned())),
        PayloadFormat::Json => {
            let value: serde_json::Value = serde_json::from_slice(&decoded).map_err(|err| format!("invalid JSON payload: {err}"))?;
            Ok(PayloadValue::from_json(value))
        }
        PayloadFormat::Yaml => {
            let value: serde_yaml::Value = serde_yaml::from_slice(&decoded).map_err(|err| format!("invalid YAML payload: {err}"))?;
            Ok(PayloadValue::Structured(value))
        }
    }
}

/// Encodes a [`PayloadValue`] into wire bytes per `format` (the structural
/// rendering) then `encoding` (the wire transformation).
pub fn encode(value: &PayloadValue, encoding: PayloadEncoding, format: PayloadFormat) -> Vec<u8> {
    let rendered = match format {
        PayloadFormat::Text => value.as_text().into_bytes(),
        PayloadFormat::Json => serde_json::to_vec(&value.to_json()).unwrap_or_default(),
        PayloadFormat::Yaml => serde_yaml::to_vec(&value.to_yaml()).unwrap_or_default(),
    };

    match encoding {
        PayloadEncoding::Base64 => base64::Engine::encode(&base64::engine::general_purpose::STANDARD, rendered).into_bytes(),
        PayloadEncoding::Utf8 | PayloadEncoding::None => rendered,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_round_trips() {
        let original = PayloadValue::from_json(serde_json::json!({"a": 1, "b": "two"}));
        let bytes = encode(&original, PayloadEncoding::Utf8, PayloadFormat::Json);
        let decoded = decode(&bytes, PayloadEncoding::Utf8, PayloadFormat::Json).unwrap();
        assert_eq!(decoded.to_json(), original.to_json());
    }

    #[test]
    fn base64_round_trips_text() {
        let original = PayloadValue::Text("hello".to_string());
        let bytes = encode(&original, PayloadEncoding::Base64, PayloadFormat::Text);
        let decoded = decode(&bytes, PayloadEncoding::Base64, PayloadFormat::Text).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn invalid_json_reports_error() {
        let result = decode(b"{not json", PayloadEncoding::Utf8, PayloadFormat::Json);
        assert!(result.is_err());
    }
}
