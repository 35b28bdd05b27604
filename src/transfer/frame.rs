use crate::error::ProtocolError;
use crate::peer::types::Frame;
use crate::transfer::FileMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Управляющие сообщения в текстовых кадрах:
/// `{"type":"meta","name":..,"size":..,"mime":..}` и `{"type":"end"}`.
/// Бинарные кадры несут байты файла без заголовка.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Meta(FileMeta),
    End,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::Text)
            .map_err(|e| ProtocolError::MalformedControl(e.to_string()))
    }

    /// Неизвестный `type` отличается от битого сообщения известного вида
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedControl(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedControl("missing \"type\" field".into()))?;

        match kind {
            "meta" | "end" => serde_json::from_value(value)
                .map_err(|e| ProtocolError::MalformedControl(e.to_string())),
            other => Err(ProtocolError::UnknownControl(other.to_string())),
        }
    }
}
