use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Caller-supplied id that may arrive as a JSON number or string.
///
/// The form it arrived in is kept so responses echo exactly what was sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Num(i64),
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Num(n) => write!(f, "{n}"),
            Identifier::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Num(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Text(value.to_string())
    }
}

/// Kind of work a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Classify,
    /// Classification without persisting the labeled images
    Test,
    Train,
    Export,
}

impl Operation {
    pub fn persists_images(self) -> bool {
        matches!(self, Operation::Classify)
    }
}

/// One image to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    #[garde(skip)]
    pub id: Identifier,

    #[garde(length(min = 1))]
    pub url: String,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ImageRef {
    /// File stem used when persisting; the id stands in when no name was given.
    pub fn file_stem(&self) -> String {
        match &self.file_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.id.to_string(),
        }
    }
}

/// A classify (or test-classify) request, shared by the HTTP and broker paths.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyJob {
    #[garde(skip)]
    #[serde(default)]
    pub requester_id: Option<Identifier>,

    #[garde(skip)]
    pub workspace_id: Identifier,

    #[garde(length(min = 1), inner(length(min = 1)))]
    #[serde(rename = "testClass", alias = "categories")]
    pub categories: Vec<String>,

    #[garde(dive)]
    #[serde(rename = "testImages", alias = "images", default)]
    pub images: Vec<ImageRef>,
}

/// Wire form of a train request. Required fields are checked by [`TrainJob::from_payload`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainPayload {
    pub workspace_id: Option<Identifier>,
    pub requester_id: Option<Identifier>,
    pub epochs: Option<u32>,
    pub imgsz: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainJob {
    pub workspace_id: Identifier,
    pub requester_id: Identifier,
    pub epochs: u32,
    pub imgsz: u32,
}

impl TrainJob {
    /// Validate a wire payload, filling unset knobs from the given defaults.
    pub fn from_payload(
        payload: TrainPayload,
        default_epochs: u32,
        default_imgsz: u32,
    ) -> Result<Self, MissingIds> {
        match (payload.workspace_id, payload.requester_id) {
            (Some(workspace_id), Some(requester_id)) => Ok(Self {
                workspace_id,
                requester_id,
                epochs: payload.epochs.unwrap_or(default_epochs),
                imgsz: payload.imgsz.unwrap_or(default_imgsz),
            }),
            _ => Err(MissingIds),
        }
    }
}

/// Wire form of an export request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub workspace_id: Option<Identifier>,
    pub requester_id: Option<Identifier>,
    pub version: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub workspace_id: Identifier,
    pub requester_id: Identifier,
    pub version: Option<String>,
    pub format: String,
}

impl ExportJob {
    pub fn from_payload(payload: ExportPayload, default_format: &str) -> Result<Self, MissingIds> {
        match (payload.workspace_id, payload.requester_id) {
            (Some(workspace_id), Some(requester_id)) => Ok(Self {
                workspace_id,
                requester_id,
                version: payload.version.filter(|v| !v.is_empty()),
                format: payload
                    .format
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| default_format.to_string()),
            }),
            _ => Err(MissingIds),
        }
    }
}

/// `workspaceId` or `requesterId` absent from a train/export request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("workspaceId or requesterId was not provided.")]
pub struct MissingIds;

/// Everything the consumer and the HTTP handlers can be asked to do.
#[derive(Debug, Clone)]
pub enum Job {
    Classify(ClassifyJob),
    Train(TrainJob),
    Export(ExportJob),
}

impl Job {
    pub fn operation(&self) -> Operation {
        match self {
            Job::Classify(_) => Operation::Classify,
            Job::Train(_) => Operation::Train,
            Job::Export(_) => Operation::Export,
        }
    }
}
