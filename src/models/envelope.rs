use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::job::Identifier;
use super::label::LabelToIds;

/// Result of a finished training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainResult {
    pub model_path: String,
    pub version: String,
    /// Last metrics object the trainer reported, if any
    #[serde(default)]
    pub metrics: serde_json::Value,
}

/// Structured failure sent back to callers, over HTTP and over the response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub timestamp: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            correlation_id: None,
            details: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        self.details = details;
        self
    }
}

/// Exactly one of these is published per inbound job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Failed {
        error: ErrorBody,
    },
    #[serde(rename_all = "camelCase")]
    Classified {
        requester_id: Option<Identifier>,
        workspace_id: Identifier,
        labels_and_ids: LabelToIds,
    },
    #[serde(rename_all = "camelCase")]
    Trained {
        requester_id: Identifier,
        workspace_id: Identifier,
        train_result: TrainResult,
    },
    #[serde(rename_all = "camelCase")]
    Exported {
        requester_id: Identifier,
        workspace_id: Identifier,
        exported_path: String,
        format: String,
    },
}

impl ResponseEnvelope {
    pub fn is_error(&self) -> bool {
        matches!(self, ResponseEnvelope::Failed { .. })
    }

    /// Metric/log label for the envelope kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseEnvelope::Failed { .. } => "error",
            ResponseEnvelope::Classified { .. } => "classified",
            ResponseEnvelope::Trained { .. } => "trained",
            ResponseEnvelope::Exported { .. } => "exported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classified_wire_shape() {
        let mut labels = LabelToIds::new();
        labels.insert("cat", 1.into());
        let envelope = ResponseEnvelope::Classified {
            requester_id: Some(9.into()),
            workspace_id: "w".into(),
            labels_and_ids: labels,
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({"requesterId": 9, "workspaceId": "w", "labelsAndIds": [{"label": "cat", "ids": [1]}]})
        );
    }

    #[test]
    fn test_error_wire_shape() {
        let body = ErrorBody::new("JSON_DECODE_ERROR", "bad body")
            .with_correlation_id(Some("c-1".into()));
        let envelope = ResponseEnvelope::Failed { error: body };
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["error"]["code"], "JSON_DECODE_ERROR");
        assert_eq!(value["error"]["correlationId"], "c-1");
        assert!(value["error"]["timestamp"].is_string());
        assert!(value["error"].get("details").is_none());
    }

    #[test]
    fn test_envelopes_decode_back_to_the_right_variant() {
        let exported: ResponseEnvelope = serde_json::from_value(json!({
            "requesterId": 1, "workspaceId": 2, "exportedPath": "/m.onnx", "format": "onnx"
        }))
        .unwrap();
        assert_eq!(exported.kind(), "exported");

        let failed: ResponseEnvelope = serde_json::from_value(json!({
            "error": {"code": "X", "message": "m", "timestamp": "t", "correlationId": null}
        }))
        .unwrap();
        assert!(failed.is_error());
    }
}
