use std::{
    collections::{btree_map, BTreeMap},
    fmt,
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use filesd::{dedup_targets, Mutation, Outcome, RegistryHandle, TargetGroup, ValidationError};
use serde::{
    de::{self, DeserializeOwned, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    /// How long a request waits for the registry before giving up.
    pub request_timeout: Duration,
}

/// Body of `PUT /api/v1/configure`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    #[serde(default)]
    pub target_id: Option<String>,
    pub targets: Vec<String>,
    #[serde(deserialize_with = "unique_labels")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub target_id: Uuid,
}

/// Body of `DELETE /api/v1/configure`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnregisterRequest {
    pub target_id: String,
}

/// Body of `PATCH /api/v1/configure`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplaceTargetsRequest {
    pub target_id: String,
    pub targets: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid target_id: {0}")]
    TargetId(#[from] uuid::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("failed to {action} target: {source}")]
    Registry {
        action: &'static str,
        source: filesd::Error,
    },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Json(_) | Self::TargetId(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Registry { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, format!("{self}\n")).into_response()
    }
}

pub async fn register(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, ApiError> {
    let req: RegisterRequest = decode(&body)?;
    let group = TargetGroup::new(req.targets, req.labels)?;
    let id = match req.target_id {
        Some(id) => Uuid::parse_str(&id)?,
        None => Uuid::new_v4(),
    };

    match submit(&state, Mutation::Register { id, group }, "register").await? {
        Outcome::Accepted => Ok(Json(RegisterResponse { target_id: id })),
        Outcome::IdInUse => Err(ApiError::Conflict("target_id already in use")),
        _ => Err(ApiError::Conflict("attempted to register duplicate target")),
    }
}

pub async fn unregister(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let req: UnregisterRequest = decode(&body)?;
    let id = Uuid::parse_str(&req.target_id)?;

    match submit(&state, Mutation::Unregister { id }, "unregister").await? {
        Outcome::Accepted => Ok(StatusCode::NO_CONTENT),
        _ => Err(ApiError::Conflict("target did not exist")),
    }
}

pub async fn replace_targets(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let req: ReplaceTargetsRequest = decode(&body)?;
    let id = Uuid::parse_str(&req.target_id)?;
    let targets = dedup_targets(req.targets)?;

    let mutation = Mutation::ReplaceTargets { id, targets };
    match submit(&state, mutation, "update").await? {
        Outcome::Accepted => Ok(StatusCode::NO_CONTENT),
        Outcome::Invalid => Err(ValidationError::EmptyTargets.into()),
        _ => Err(ApiError::Conflict("target did not exist")),
    }
}

// Bodies are decoded regardless of Content-Type.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

async fn submit(
    state: &AppState,
    mutation: Mutation,
    action: &'static str,
) -> Result<Outcome, ApiError> {
    state
        .registry
        .submit(mutation, state.request_timeout)
        .await
        .map_err(|source| ApiError::Registry { action, source })
}

/// Deserializes a label map, rejecting a label name that appears twice in
/// the same JSON object instead of keeping the last value.
fn unique_labels<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct LabelsVisitor;

    impl<'de> Visitor<'de> for LabelsVisitor {
        type Value = BTreeMap<String, String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of label names to label values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut labels = BTreeMap::new();
            while let Some((name, value)) = access.next_entry::<String, String>()? {
                match labels.entry(name) {
                    btree_map::Entry::Occupied(entry) => {
                        return Err(de::Error::custom(format_args!(
                            "duplicate label: '{}'",
                            entry.key()
                        )));
                    }
                    btree_map::Entry::Vacant(entry) => {
                        entry.insert(value);
                    }
                }
            }
            Ok(labels)
        }
    }

    deserializer.deserialize_map(LabelsVisitor)
}
