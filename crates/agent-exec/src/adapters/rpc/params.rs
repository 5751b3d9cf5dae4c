use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;

use crate::domain::ControlKind;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Seconds; absent means "predict".
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub session: Option<String>,
}

fn default_stop_on_failure() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchParams {
    pub commands: Vec<ExecuteParams>,
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionParams {
    #[serde(default)]
    pub session: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictParams {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookRunParams {
    pub phase: String,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub session: Option<String>,
}
