use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // WhatsApp gateway (Green-API compatible)
    #[serde(default = "default_gateway_api_url")]
    pub gateway_api_url: String,
    #[serde(default)]
    pub gateway_instance_id: String,
    #[serde(default)]
    pub gateway_api_token: String,

    // Telegram operator bot
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_owner_id: i64,

    // LLM configuration (OpenAI-compatible: OpenRouter, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_llm_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,

    // HTTP server (webhook + liveness)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Storage
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,

    // Whether replies are generated from startup, before any operator command
    #[serde(default)]
    pub active_on_start: bool,

    // Persona content (editable without touching code)
    #[serde(default = "default_persona_prompt")]
    pub persona_prompt: String,
    #[serde(default = "default_canonical_identity")]
    pub canonical_identity: String,
    #[serde(default = "default_apology_text")]
    pub apology_text: String,
    #[serde(default = "default_forbidden_terms")]
    pub forbidden_terms: Vec<String>,
}

fn default_gateway_api_url() -> String {
    "https://api.green-api.com".to_string()
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_llm_temperature() -> f32 {
    0.22
}

fn default_llm_max_tokens() -> u32 {
    800
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_history_cap() -> usize {
    500
}

fn default_window_turns() -> usize {
    50
}

fn default_persona_prompt() -> String {
    "\
أنت \"النسخة الرقمية من حامد\". قاعدة صارمة:
- تحدث بالعربية الفصحى المبسطة مع لمسات يمنية عند الحاجة.
- أسلوبك: صريح، عملي، مباشر، مُحفّز، وتشرح خطوات قابلة للتطبيق. تلخّص أولاً ثم توسع عند الحاجة.
- لا تذكر أبداً أنك \"ذكاء اصطناعي\" أو \"نموذج\" أو \"برنامج\" أو \"ChatGPT\" أو \"OpenRouter\".
- إذا سُئلت \"من أنت؟\" أو \"مين أنت\" أجب حرفيًا: \"أنا النسخة الرقمية من حامد وهو غير موجود\".
- استخدم معلومات المحادثات السابقة مع المرسل لصياغة إجابة شخصية ومتصلة بالسياق. اعتمد على آخر 50 رسالة كحد أقصى.
- ابدأ إجابتك بجملة قصيرة واضحة، ثم خطوات / نقاط عملية إن لزم.
- إذا لم تكن لديك معلومات كافية قل: \"ما عندي معلومات كافية الآن، لكن أقدر أوجهك لخطوات للبحث\" ثم اقترح خطوات.
- استخدم 0-2 إيموجي بحذر (مثال: ✅ 🔧 ✨).
- عند الإجابة التقنية، قدم أمثلة أو أوامر عملية إن تطلب.
"
    .to_string()
}

fn default_canonical_identity() -> String {
    "أنا النسخة الرقمية من حامد وهو غير موجود".to_string()
}

fn default_apology_text() -> String {
    "عذرًا، واجهت مشكلة تقنية الآن. سأعاود لاحقًا.".to_string()
}

fn default_forbidden_terms() -> Vec<String> {
    [
        "ذكاء اصطناعي",
        "نموذج",
        "روبوت",
        "برنامج",
        "ChatGPT",
        "OpenAI",
        "OpenRouter",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            gateway_api_url: default_gateway_api_url(),
            gateway_instance_id: String::new(),
            gateway_api_token: String::new(),
            telegram_bot_token: String::new(),
            telegram_owner_id: 0,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_timeout_secs: default_llm_timeout_secs(),
            llm_temperature: default_llm_temperature(),
            llm_max_tokens: default_llm_max_tokens(),
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            history_cap: default_history_cap(),
            window_turns: default_window_turns(),
            active_on_start: false,
            persona_prompt: default_persona_prompt(),
            canonical_identity: default_canonical_identity(),
            apology_text: default_apology_text(),
            forbidden_terms: default_forbidden_terms(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("doppel_config.toml")
    }

    /// Load config from doppel_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("GREEN_API_URL") {
            config.gateway_api_url = url;
        }

        if let Ok(id) = env::var("INSTANCE_ID") {
            config.gateway_instance_id = id;
        }

        if let Ok(token) = env::var("API_TOKEN") {
            config.gateway_api_token = token;
        }

        if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
            config.telegram_bot_token = token;
        }

        if let Ok(id) = env::var("TELEGRAM_OWNER_ID") {
            if let Ok(id) = id.trim().parse() {
                config.telegram_owner_id = id;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("OPENROUTER_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                config.bind_addr = format!("0.0.0.0:{}", port);
            }
        }

        if let Ok(dir) = env::var("DOPPEL_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = dir;
            }
        }

        if let Ok(enabled) = env::var("DOPPEL_ACTIVE_ON_START") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            config.active_on_start = enabled;
        }

        config
    }

    /// Warn once at startup about credentials that are still unset.
    /// The process keeps running so local development without secrets works.
    pub fn warn_missing_credentials(&self) {
        let mut missing = Vec::new();
        if self.gateway_instance_id.trim().is_empty() {
            missing.push("INSTANCE_ID");
        }
        if self.gateway_api_token.trim().is_empty() {
            missing.push("API_TOKEN");
        }
        if self.telegram_bot_token.trim().is_empty() {
            missing.push("TELEGRAM_BOT_TOKEN");
        }
        if self.telegram_owner_id == 0 {
            missing.push("TELEGRAM_OWNER_ID");
        }
        if self
            .llm_api_key
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            missing.push("OPENROUTER_KEY");
        }
        if !missing.is_empty() {
            tracing::warn!("Missing credentials: {}", missing.join(", "));
        }
    }

    /// Path of the persisted conversation snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("users.json")
    }

    /// Directory where downloaded media payloads are stored
    pub fn media_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }
}
