use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com";

/// Words that short-circuit the filter chain before any model call.
const DEFAULT_BLOCKED_WORDS: &[&str] = &[
    "笨蛋", "白痴", "白癡", "智障", "廢物", "去死", "幹你", "操你", "垃圾機器人",
];

/// Typed configuration, read once at process start.
///
/// Components receive the sub-config they need by reference; nothing inside the
/// core reads the environment on its own.
#[derive(Clone, Debug)]
pub struct Config {
    pub model: ModelConfig,
    pub rate_limit: RateLimitConfig,
    pub filter: FilterConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    /// Messages that ask for the remaining quota instead of a model answer.
    pub quota_keywords: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub free_api_key: Option<String>,
    pub paid_api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub classifier_model: String,
    pub temperature: f32,
    pub classifier_max_tokens: u32,
    pub request_timeout: Duration,
    /// Retrieval store reference (e.g. `fileSearchStores/abc`). `None` disables retrieval and sync.
    pub file_search_store: Option<String>,
    /// Replaces the built-in gateway instruction when set.
    pub system_instruction: Option<String>,
    pub retrieval_enabled: bool,
}

impl ModelConfig {
    /// Key used for document-store management calls (paid first: uploads are not free-tier work).
    pub fn store_api_key(&self) -> Option<&str> {
        self.paid_api_key
            .as_deref()
            .or(self.free_api_key.as_deref())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            free_api_key: None,
            paid_api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: "gemini-2.5-flash".to_string(),
            classifier_model: "gemini-2.5-flash-lite".to_string(),
            temperature: 0.3,
            classifier_max_tokens: 10,
            request_timeout: Duration::from_secs(60),
            file_search_store: None,
            system_instruction: None,
            retrieval_enabled: true,
        }
    }
}

/// Quota of one tier: `limit` requests per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TierLimit {
    pub limit: u32,
    pub window: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Allow the request when the window cache itself fails.
    pub fail_open: bool,
    pub vip_senders: Vec<String>,
    pub normal: TierLimit,
    pub vip: TierLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let window = Duration::from_secs(120 * 60);
        Self {
            enabled: true,
            fail_open: true,
            vip_senders: Vec::new(),
            normal: TierLimit { limit: 5, window },
            vip: TierLimit { limit: 50, window },
        }
    }
}

#[derive(Clone, Debug)]
pub struct FilterConfig {
    pub blocked_words: Vec<String>,
    pub classifier_enabled: bool,
    /// Classifier errors count as `Safe` when set; otherwise they count as `Spam`.
    pub fail_open: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_words: DEFAULT_BLOCKED_WORDS.iter().map(|s| s.to_string()).collect(),
            classifier_enabled: true,
            fail_open: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub source_folder_id: Option<String>,
    pub drive_access_token: Option<String>,
    pub drive_api_base: String,
    /// Pause after every document that required remote work.
    pub document_delay: Duration,
    /// Rename attempt `n` waits `n * rename_base_delay` first.
    pub rename_base_delay: Duration,
    pub rename_attempts: u32,
    /// Upper bound of list-and-delete passes in a bulk clear.
    pub clear_passes: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_folder_id: None,
            drive_access_token: None,
            drive_api_base: DEFAULT_DRIVE_API_BASE.to_string(),
            document_delay: Duration::from_millis(1000),
            rename_base_delay: Duration::from_millis(2000),
            rename_attempts: 3,
            clear_passes: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Correspondence map. Written only by store administration.
    pub property_store_path: PathBuf,
    /// Rate windows, kept apart so chat traffic never rewrites the map file.
    pub rate_window_store_path: PathBuf,
    pub profile_store_path: Option<PathBuf>,
    pub conversation_log_path: Option<PathBuf>,
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.rate_window_store_path == self.property_store_path {
            return Err(Error::Config(
                "RATE_WINDOW_STORE_PATH must differ from PROPERTY_STORE_PATH".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Model
        let defaults = ModelConfig::default();
        let system_instruction = match env_path("SYSTEM_INSTRUCTION_FILE") {
            Some(p) => Some(fs::read_to_string(&p).map_err(|e| {
                Error::Config(format!(
                    "SYSTEM_INSTRUCTION_FILE {} unreadable: {e}",
                    p.display()
                ))
            })?),
            None => None,
        };
        let model = ModelConfig {
            free_api_key: env_str("GEMINI_FREE_API_KEY").and_then(non_empty),
            paid_api_key: env_str("GEMINI_API_KEY").and_then(non_empty),
            api_base: env_str("GEMINI_API_BASE")
                .and_then(non_empty)
                .unwrap_or(defaults.api_base),
            model: env_str("GEMINI_MODEL")
                .and_then(non_empty)
                .unwrap_or(defaults.model),
            classifier_model: env_str("CLASSIFIER_MODEL")
                .and_then(non_empty)
                .unwrap_or(defaults.classifier_model),
            temperature: env_f32("MODEL_TEMPERATURE").unwrap_or(defaults.temperature),
            classifier_max_tokens: env_u32("CLASSIFIER_MAX_TOKENS")
                .unwrap_or(defaults.classifier_max_tokens),
            request_timeout: env_u64("MODEL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            file_search_store: env_str("FILE_SEARCH_STORE").and_then(non_empty),
            system_instruction,
            retrieval_enabled: env_bool("RETRIEVAL_ENABLED").unwrap_or(true),
        };

        // Rate limiting
        let rl_defaults = RateLimitConfig::default();
        let window = env_u64("RATE_LIMIT_WINDOW_MINUTES")
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(rl_defaults.normal.window);
        let rate_limit = RateLimitConfig {
            enabled: env_bool("RATE_LIMIT_ENABLED").unwrap_or(true),
            fail_open: env_bool("RATE_LIMIT_FAIL_OPEN").unwrap_or(true),
            vip_senders: parse_csv(env_str("VIP_SENDERS")),
            normal: TierLimit {
                limit: env_u32("RATE_LIMIT_NORMAL").unwrap_or(rl_defaults.normal.limit),
                window,
            },
            vip: TierLimit {
                limit: env_u32("RATE_LIMIT_VIP").unwrap_or(rl_defaults.vip.limit),
                window,
            },
        };
        if rate_limit.normal.limit == 0 || rate_limit.vip.limit == 0 {
            return Err(Error::Config(
                "RATE_LIMIT_NORMAL and RATE_LIMIT_VIP must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(Error::Config(
                "RATE_LIMIT_WINDOW_MINUTES must be at least 1".to_string(),
            ));
        }

        // Content filter (BLOCKED_WORDS overrides defaults)
        let filter_defaults = FilterConfig::default();
        let blocked = parse_csv(env_str("BLOCKED_WORDS"));
        let filter = FilterConfig {
            blocked_words: if blocked.is_empty() {
                filter_defaults.blocked_words
            } else {
                blocked
            },
            classifier_enabled: env_bool("CLASSIFIER_ENABLED").unwrap_or(true),
            fail_open: env_bool("CLASSIFIER_FAIL_OPEN").unwrap_or(true),
        };

        // Sync
        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            source_folder_id: env_str("DRIVE_FOLDER_ID").and_then(non_empty),
            drive_access_token: env_str("DRIVE_ACCESS_TOKEN").and_then(non_empty),
            drive_api_base: env_str("DRIVE_API_BASE")
                .and_then(non_empty)
                .unwrap_or(sync_defaults.drive_api_base),
            document_delay: env_u64("SYNC_DOCUMENT_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(sync_defaults.document_delay),
            rename_base_delay: env_u64("RENAME_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(sync_defaults.rename_base_delay),
            rename_attempts: sync_defaults.rename_attempts,
            clear_passes: env_u32("CLEAR_PASSES")
                .unwrap_or(sync_defaults.clear_passes)
                .max(1),
        };

        let storage = StorageConfig {
            property_store_path: env_path("PROPERTY_STORE_PATH")
                .unwrap_or_else(|| PathBuf::from("rrb-properties.json")),
            rate_window_store_path: env_path("RATE_WINDOW_STORE_PATH")
                .unwrap_or_else(|| PathBuf::from("rrb-rate-windows.json")),
            profile_store_path: env_path("PROFILE_STORE_PATH"),
            conversation_log_path: env_path("CONVERSATION_LOG_PATH"),
        };
        storage.validate()?;

        let mut quota_keywords = parse_csv(env_str("QUOTA_KEYWORDS"));
        if quota_keywords.is_empty() {
            quota_keywords = vec!["/quota".to_string(), "剩餘次數".to_string()];
        }

        Ok(Self {
            model,
            rate_limit,
            filter,
            sync,
            storage,
            quota_keywords,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_f32(key: &str) -> Option<f32> {
    env_str(key).and_then(|s| s.trim().parse::<f32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_trims_and_drops_empty() {
        let v = parse_csv(Some(" U1, ,U2,".to_string()));
        assert_eq!(v, vec!["U1".to_string(), "U2".to_string()]);
        assert!(parse_csv(None).is_empty());
    }

    #[test]
    fn rate_windows_need_their_own_file() {
        let mut storage = StorageConfig {
            property_store_path: PathBuf::from("props.json"),
            rate_window_store_path: PathBuf::from("windows.json"),
            profile_store_path: None,
            conversation_log_path: None,
        };
        assert!(storage.validate().is_ok());
        storage.rate_window_store_path = PathBuf::from("props.json");
        assert!(matches!(storage.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn store_key_prefers_paid() {
        let mut m = ModelConfig {
            free_api_key: Some("free".to_string()),
            ..ModelConfig::default()
        };
        assert_eq!(m.store_api_key(), Some("free"));
        m.paid_api_key = Some("paid".to_string());
        assert_eq!(m.store_api_key(), Some("paid"));
    }

    #[test]
    fn defaults_match_documented_tiers() {
        let rl = RateLimitConfig::default();
        assert_eq!(rl.normal.limit, 5);
        assert_eq!(rl.vip.limit, 50);
        assert_eq!(rl.normal.window, Duration::from_secs(7200));
        assert!(rl.fail_open);

        let f = FilterConfig::default();
        assert!(f.blocked_words.iter().any(|w| w == "笨蛋"));
        assert!(f.fail_open);
    }
}
