use std::time::Duration;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_WHATSAPP_API_BASE: &str = "https://graph.facebook.com/v18.0";
pub const DEFAULT_WHATSAPP_TIMEOUT_SECS: u64 = 30;

/// Process-level settings read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_filter: String,
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl WhatsAppConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_token, &self.phone_number_id) {
            (Some(token), Some(id)) => Some((token.as_str(), id.as_str())),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            whatsapp: WhatsAppConfig {
                access_token: None,
                phone_number_id: None,
                api_base: DEFAULT_WHATSAPP_API_BASE.to_string(),
                timeout: Duration::from_secs(DEFAULT_WHATSAPP_TIMEOUT_SECS),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();
        let timeout_secs = var("WHATSAPP_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_WHATSAPP_TIMEOUT_SECS);
        Self {
            log_filter: var("TUITIOND_LOG").unwrap_or(defaults.log_filter),
            whatsapp: WhatsAppConfig {
                access_token: var("WHATSAPP_ACCESS_TOKEN"),
                phone_number_id: var("WHATSAPP_PHONE_NUMBER_ID"),
                api_base: var("WHATSAPP_API_BASE")
                    .map(|v| v.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.whatsapp.api_base),
                timeout: Duration::from_secs(timeout_secs),
            },
        }
    }
}
