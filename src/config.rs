//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STEPWISE__*` 覆盖（双下划线表示嵌套，如 `STEPWISE__EXECUTOR__MAX_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub oracle: OracleSection,
    pub executor: ExecutorSection,
    pub coordination: CoordinationSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 Oracle 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [oracle] 段：采样参数与上下文预览长度
#[derive(Debug, Clone, Deserialize)]
pub struct OracleSection {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 前序结果写入 prompt 时的最大字符数
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_preview_chars() -> usize {
    500
}

/// [executor] 段：重试上限、线性退避、adapt 后是否重新协调
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// 单步最多调用次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 第 n 次重试前等待 n × backoff_base_ms
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_recoordinate_on_adapt")]
    pub recoordinate_on_adapt: bool,
    /// 单次工具调用超时（秒）；未设置时引擎不施加超时，由工具边界自行负责
    pub tool_timeout_secs: Option<u64>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            recoordinate_on_adapt: default_recoordinate_on_adapt(),
            tool_timeout_secs: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_recoordinate_on_adapt() -> bool {
    true
}

/// [coordination] 段：外部标识符格式与占位符模式
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationSection {
    /// 外部注册表的标识符格式（默认 24 位十六进制）
    #[serde(default = "default_id_pattern")]
    pub id_pattern: String,
    /// 标识符标准长度；不匹配格式但不短于此长度的值视为非标准但可能有效
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    #[serde(default = "default_placeholder_patterns")]
    pub placeholder_patterns: Vec<String>,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            id_pattern: default_id_pattern(),
            id_length: default_id_length(),
            placeholder_patterns: default_placeholder_patterns(),
        }
    }
}

fn default_id_pattern() -> String {
    "^[0-9a-fA-F]{24}$".to_string()
}

fn default_id_length() -> usize {
    24
}

fn default_placeholder_patterns() -> Vec<String> {
    vec![
        r"(?i)extracted_from_step_?\d*".into(),
        r"(?i)from_step_?\d+".into(),
        r"(?i)step_?\d+_(result|output|id)".into(),
        r"(?i)result_of_step".into(),
        r"\{\{.*\}\}".into(),
        r"\$\{.*\}".into(),
        r"^<[^>]+>$".into(),
        r"^(?i)(placeholder|tbd|todo|unknown|to_be_determined)$".into(),
    ]
}

/// 从 config 目录加载配置，环境变量 STEPWISE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STEPWISE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STEPWISE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
