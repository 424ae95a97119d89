//! Config Entries
//!
//! Each configured bridge is a config entry: persisted setup inputs plus
//! a runtime lifecycle state driven by the integration's [`EntrySetup`]
//! handler.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - One bridge's configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Manager for all config entries
//! - [`FlowResult`] - Outcome of a config or options flow step
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/meteobridge.config_entries`.

pub mod entry;
pub mod flow;
pub mod manager;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate,
};

pub use flow::{ConfigFlow, FieldType, FlowInput, FlowResult, FormField, OptionsFlow, BASE_ERROR};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, EntrySetup,
    SetupFailure, STORAGE_KEY, STORAGE_MINOR_VERSION, STORAGE_VERSION,
};

pub use state_machine::{calculate_retry_delay, InvalidTransition};
