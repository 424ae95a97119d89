//! Constants shared across the integration

/// Integration domain; also the device identifier namespace
pub const DOMAIN: &str = "meteobridge";

pub const DEFAULT_ATTRIBUTION: &str = "Data delivered by a Meteobridge powered Weather Station";
pub const DEFAULT_BRAND: &str = "Meteobridge";

pub const DEFAULT_USERNAME: &str = "meteobridge";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const SUPPORTED_LANGUAGES: &[&str] = &["da", "de", "en", "es", "fr", "it", "nb", "nl", "sv"];

pub const DEFAULT_EXTRA_SENSORS: u8 = 0;
pub const MAX_EXTRA_SENSORS: u8 = 2;

/// Poll interval bounds, in seconds
pub const DEFAULT_SCAN_INTERVAL: u64 = 10;
pub const MIN_SCAN_INTERVAL: u64 = 5;
pub const MAX_SCAN_INTERVAL: u64 = 60;

pub const CONF_HOST: &str = "host";
pub const CONF_USERNAME: &str = "username";
pub const CONF_PASSWORD: &str = "password";
pub const CONF_UNIT_SYSTEM: &str = "unit_system";
pub const CONF_LANGUAGE: &str = "language";
pub const CONF_EXTRA_SENSORS: &str = "extra_sensors";
pub const CONF_SCAN_INTERVAL: &str = "scan_interval";

/// Keys that live in options once an entry has been set up
pub const OPTION_KEYS: &[&str] = &[
    CONF_UNIT_SYSTEM,
    CONF_LANGUAGE,
    CONF_EXTRA_SENSORS,
    CONF_SCAN_INTERVAL,
];

/// Config flow error keys
pub const ERROR_INVALID_CREDENTIALS: &str = "invalid_credentials";
pub const ERROR_HOST_NOT_FOUND: &str = "host_not_found";
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";
