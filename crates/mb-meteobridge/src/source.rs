//! Remote data source seam
//!
//! The integration never talks to a bridge directly. Everything it needs
//! comes through [`DataSource`]; the server binary provides an HTTP-backed
//! implementation and tests provide scripted ones.

use std::sync::Arc;

use async_trait::async_trait;
use mb_core::Readings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::BridgeSettings;
use crate::units::UnitDescriptions;

/// Failure reported by a data source
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Credentials rejected by the bridge
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Connection error, timeout or malformed response
    #[error("request failed: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Hardware description of a bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    /// Key issued by the bridge API when no MAC is reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Hardware platform, e.g. "NanoSD"
    pub model: String,

    pub firmware: String,

    /// Network address the bridge answers on
    pub address: String,
}

/// A connection to one bridge
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_device_info(&self) -> SourceResult<DeviceInfo>;

    /// Fetch one complete snapshot of current readings
    async fn fetch_snapshot(&self) -> SourceResult<Readings>;

    /// Units the source reports in, per unit category
    fn unit_descriptions(&self) -> UnitDescriptions;
}

/// Builds data sources from bridge settings
pub trait SourceFactory: Send + Sync {
    fn create(&self, settings: &BridgeSettings) -> Arc<dyn DataSource>;
}

impl<F> SourceFactory for F
where
    F: Fn(&BridgeSettings) -> Arc<dyn DataSource> + Send + Sync,
{
    fn create(&self, settings: &BridgeSettings) -> Arc<dyn DataSource> {
        self(settings)
    }
}
