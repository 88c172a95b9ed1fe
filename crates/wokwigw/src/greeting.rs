//! The one-shot "aloha" message sent right after the WebSocket upgrade.

use serde::Serialize;

pub const PROTOCOL_NAME: &str = "wokwigw";
pub const PROTOCOL_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aloha {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub protocol: &'static str,
    pub version: i32,
    pub gateway_version: String,
}

impl Aloha {
    pub fn new(gateway_version: impl Into<String>) -> Self {
        Self {
            kind: "aloha",
            protocol: PROTOCOL_NAME,
            version: PROTOCOL_VERSION,
            gateway_version: gateway_version.into(),
        }
    }

    /// Text payload as sent on the wire: compact JSON terminated by a newline.
    pub fn to_text(&self) -> serde_json::Result<String> {
        let mut text = serde_json::to_string(self)?;
        text.push('\n');
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let text = Aloha::new("1.2.3").to_text().unwrap();
        assert!(text.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "aloha",
                "protocol": "wokwigw",
                "version": 1,
                "gatewayVersion": "1.2.3",
            })
        );
    }
}
