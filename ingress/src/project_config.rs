//! Per-project access and quota policy, written by the control plane.

use crate::diagnostics::Diagnostics;
use crate::keys::{KeyKind, project_key};
use crate::store::{Store, StoreError};
use serde::{Deserialize, Deserializer};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Origins allowed to push. Empty means no restriction.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub origins: Vec<String>,
    /// Maximum messages per UTC day
    #[serde(default)]
    daily_limit: Option<u64>,
}

impl ProjectConfig {
    pub fn new(origins: Vec<String>, daily_limit: Option<u64>) -> Self {
        ProjectConfig {
            origins,
            daily_limit,
        }
    }

    /// The daily limit, with `0` treated the same as absent.
    pub fn daily_limit(&self) -> Option<u64> {
        self.daily_limit.filter(|limit| *limit > 0)
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.origins.is_empty() || self.origins.iter().any(|allowed| allowed == origin)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigLookupError {
    #[error("project configuration not found")]
    NotFound,
    #[error("invalid project configuration: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("could not read project configuration: {0}")]
    Store(#[from] StoreError),
}

/// Fetches the configuration of `project_id`.
///
/// Fails closed: a missing key, malformed JSON or store failure all yield
/// `None`. The cause is logged and reported to diagnostics, never returned.
pub async fn get_project_config(
    store: &dyn Store,
    diagnostics: &dyn Diagnostics,
    project_id: &str,
) -> Option<ProjectConfig> {
    let config_key = project_key(project_id, KeyKind::Config);
    match fetch(store, &config_key).await {
        Ok(config) => Some(config),
        Err(error) => {
            tracing::warn!(
                project_id,
                config_key = %config_key,
                error = %error,
                "Project configuration unavailable"
            );
            diagnostics.report(
                &error,
                &[
                    ("project_id", project_id.to_owned()),
                    ("config_key", config_key.clone()),
                ],
            );
            None
        }
    }
}

async fn fetch(store: &dyn Store, config_key: &str) -> Result<ProjectConfig, ConfigLookupError> {
    let json = store
        .get(config_key)
        .await?
        .ok_or(ConfigLookupError::NotFound)?;
    Ok(serde_json::from_str(&json)?)
}
