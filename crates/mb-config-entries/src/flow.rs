//! Config flow types
//!
//! A flow collects setup inputs step by step. Each step either shows a
//! form (optionally with per-field errors), creates an entry, or aborts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entry::ConfigEntry;

/// User input for a flow step
pub type FlowInput = HashMap<String, serde_json::Value>;

/// Error key for form-wide errors
pub const BASE_ERROR: &str = "base";

/// Outcome of a flow step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        /// field name (or `base`) -> error key
        errors: HashMap<String, String>,
    },
    CreateEntry {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        unique_id: Option<String>,
        data: FlowInput,
    },
    Abort {
        reason: String,
    },
}

impl FlowResult {
    pub fn form(step_id: impl Into<String>, data_schema: Vec<FormField>) -> Self {
        Self::Form {
            step_id: step_id.into(),
            data_schema,
            errors: HashMap::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    pub fn is_form(&self) -> bool {
        matches!(self, Self::Form { .. })
    }

    /// Error key shown for `field`, if this is a form
    pub fn error(&self, field: &str) -> Option<&str> {
        match self {
            Self::Form { errors, .. } => errors.get(field).map(String::as_str),
            _ => None,
        }
    }

    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            Self::Abort { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    String,
    Password,
    Integer { min: i64, max: i64 },
    Select { options: Vec<String> },
}

impl FormField {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Flow that creates new config entries
#[async_trait]
pub trait ConfigFlow: Send + Sync {
    /// Interactive setup form; `None` shows the empty form
    async fn step_user(&self, user_input: Option<FlowInput>) -> FlowResult;

    /// Entry imported from the YAML configuration
    async fn step_import(&self, import_data: FlowInput) -> FlowResult;
}

/// Flow that edits an existing entry's options
#[async_trait]
pub trait OptionsFlow: Send + Sync {
    async fn step_init(&self, entry: &ConfigEntry, user_input: Option<FlowInput>) -> FlowResult;
}
