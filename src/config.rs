//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FORAGER__*` 覆盖（双下划线表示嵌套，如 `FORAGER__CAMPAIGN__DELAY_MS=5000`）。
//! 所有节奏控制（翻页间隔、补全间隔、发送间隔）都是这里的可配置时长；密钥只从环境变量读取。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::browser::{Locator, LocatorChain};
use crate::llm::{PERPLEXITY_CHAT_URL, SONAR};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub browser: BrowserConfig,
    pub scraper: ScraperConfig,
    pub enrichment: EnrichmentSection,
    pub llm: LlmSection,
    pub campaign: CampaignConfig,
    pub smtp: SmtpConfig,
}

/// [app] 段：数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 数据集保存目录，默认 ./data
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [browser] 段：Chrome 启动参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub sandbox: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: Option<String>,
    /// 浏览器空闲多久后由 headless_chrome 关闭
    pub idle_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: false,
            window_width: 1920,
            window_height: 1080,
            user_agent: None,
            idle_timeout_secs: 600,
        }
    }
}

/// 详情页各字段的定位器链
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldLocators {
    pub title: LocatorChain,
    pub rating_block: LocatorChain,
    /// 在评分块内部查找
    pub rating_value: LocatorChain,
    /// 在评分块内部查找
    pub review_count: LocatorChain,
    pub address: LocatorChain,
    pub website: LocatorChain,
    pub phone: LocatorChain,
}

impl Default for FieldLocators {
    fn default() -> Self {
        Self {
            title: LocatorChain::from_strs(&["h1.DUwDvf.lfPIob", "h1.DUwDvf"]),
            rating_block: LocatorChain::from_strs(&["div.F7nice"]),
            rating_value: LocatorChain::from_strs(&[r#"span[aria-hidden="true"]"#]),
            review_count: LocatorChain::from_strs(&[r#"span[aria-label*="reviews"]"#]),
            address: LocatorChain::from_strs(&[
                "div.Io6YTe.fontBodyMedium.kR99db.fdkmkc",
                r#"button[data-item-id="address"] .Io6YTe"#,
            ]),
            website: LocatorChain::from_strs(&[
                "div.rogA2c.ITvuef",
                r#"a[data-item-id="authority"] .Io6YTe"#,
            ]),
            phone: LocatorChain::from_strs(&[r#"button[data-item-id^="phone"] .Io6YTe"#]),
        }
    }
}

/// [scraper] 段：列表翻页与详情抽取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub search_base: String,
    /// 列表容器；`{query}` 会被替换为搜索词
    pub container_locators: LocatorChain,
    pub item_locators: LocatorChain,
    /// 条目内用于激活与身份识别的链接
    pub anchor_locator: Locator,
    pub end_marker: String,
    pub max_scroll_attempts: usize,
    pub scroll_pause_ms: u64,
    pub container_timeout_ms: u64,
    /// 列表结束后、开始抽取前的等待
    pub list_settle_ms: u64,
    pub max_click_attempts: usize,
    /// 滚动到可见后、点击前的等待
    pub click_pause_ms: u64,
    /// 点击成功后等待详情渲染
    pub after_click_ms: u64,
    pub retry_pause_ms: u64,
    pub detail_timeout_ms: u64,
    /// 每条记录抽取后的间隔
    pub item_pause_ms: u64,
    pub fields: FieldLocators,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            search_base: "https://www.google.com/maps/search".to_string(),
            container_locators: LocatorChain::from_strs(&[
                "div[aria-label='Results for {query}']",
                "div[role='feed']",
            ]),
            item_locators: LocatorChain::from_strs(&["div.Nv2PK"]),
            anchor_locator: Locator::css("a"),
            end_marker: "You've reached the end of the list.".to_string(),
            max_scroll_attempts: 50,
            scroll_pause_ms: 1000,
            container_timeout_ms: 10_000,
            list_settle_ms: 3000,
            max_click_attempts: 3,
            click_pause_ms: 500,
            after_click_ms: 2000,
            retry_pause_ms: 1000,
            detail_timeout_ms: 5000,
            item_pause_ms: 1000,
            fields: FieldLocators::default(),
        }
    }
}

impl ScraperConfig {
    /// 清零所有等待（测试与演练用）
    pub fn without_pauses(mut self) -> Self {
        self.scroll_pause_ms = 0;
        self.container_timeout_ms = 0;
        self.list_settle_ms = 0;
        self.click_pause_ms = 0;
        self.after_click_ms = 0;
        self.retry_pause_ms = 0;
        self.detail_timeout_ms = 0;
        self.item_pause_ms = 0;
        self
    }

    /// `{search_base}/{query}`，空格替换为 `+`
    pub fn search_url(&self, query: &str) -> String {
        format!(
            "{}/{}",
            self.search_base.trim_end_matches('/'),
            query.trim().replace(' ', "+")
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnrichmentSection {
    pub strict: StrictConfig,
    pub assisted: AssistedConfig,
}

/// [enrichment.strict] 段：结构化补全 API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrictConfig {
    pub endpoint: String,
    pub model: String,
    /// 存放 API Key 的环境变量名
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// 相邻两次调用的间隔（最后一次之后不等）
    pub delay_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// 构建时是否做连通性探测
    pub probe: bool,
}

impl Default for StrictConfig {
    fn default() -> Self {
        Self {
            endpoint: PERPLEXITY_CHAT_URL.to_string(),
            model: SONAR.to_string(),
            api_key_env: "PERPLEXITY_API_KEY".to_string(),
            timeout_secs: 60,
            delay_ms: 2000,
            max_tokens: 500,
            temperature: 0.1,
            probe: true,
        }
    }
}

impl StrictConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// [enrichment.assisted] 段：对话式页面自动化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistedConfig {
    pub surface_url: String,
    /// 导航后等待页面稳定
    pub settle_ms: u64,
    pub input_locators: LocatorChain,
    pub submit_locators: LocatorChain,
    /// 最后兜底的固定位置发送按钮
    pub fallback_submit: Locator,
    pub fallback_wait_ms: u64,
    pub clear_pause_ms: u64,
    pub type_settle_ms: u64,
    pub submit_scroll_pause_ms: u64,
    pub submit_settle_ms: u64,
    pub enter_focus_pause_ms: u64,
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// 至少一条用户消息加一条回复
    pub min_messages: usize,
    pub message_locators: LocatorChain,
    pub content_locators: LocatorChain,
    /// 相邻两条记录的间隔
    pub record_delay_ms: u64,
}

impl Default for AssistedConfig {
    fn default() -> Self {
        Self {
            surface_url: "https://copilot.microsoft.com".to_string(),
            settle_ms: 5000,
            input_locators: LocatorChain::from_strs(&[
                "#userInput",
                "textarea#userInput",
                r#"textarea[id="userInput"]"#,
                r#"textarea[aria-label="Message Copilot"]"#,
                r#"textarea[placeholder*="Ask me anything"]"#,
                r#"textarea[data-testid="chat-input"]"#,
                r#"textarea[class*="chat-input"]"#,
                r#"div[contenteditable="true"][role="textbox"]"#,
                r#"textarea[placeholder*="Message"]"#,
                "#chat-input",
                ".chat-input textarea",
            ]),
            submit_locators: LocatorChain::from_strs(&[
                "button.rounded-submitButton",
                r#"button[class*="rounded-submitButton"]"#,
                "button.size-10.rounded-xl",
                r#"button[class*="bg-stone-800"]"#,
                r#"button[class*="dark:bg-slate-600"]"#,
                r#"button[aria-label="Send message"]"#,
                r#"button[data-testid="send-button"]"#,
                r#"button[title*="Send"]"#,
                ".send-button",
                r#"[role="button"][aria-label*="Send"]"#,
            ]),
            fallback_submit: Locator::xpath(
                "/html/body/div[1]/div[2]/main/div/div[2]/div[2]/div/div[1]/div[2]/div/div/div/div[2]/div[2]/button",
            ),
            fallback_wait_ms: 5000,
            clear_pause_ms: 1000,
            type_settle_ms: 2000,
            submit_scroll_pause_ms: 1000,
            submit_settle_ms: 2000,
            enter_focus_pause_ms: 500,
            response_timeout_ms: 45_000,
            poll_interval_ms: 2000,
            min_messages: 2,
            message_locators: LocatorChain::from_strs(&[
                r#"[data-testid="chat-message"]"#,
                ".chat-message",
                r#"[role="group"]"#,
                ".response-message",
                r#"[class*="message"]"#,
                r#"[class*="response"]"#,
            ]),
            content_locators: LocatorChain::from_strs(&[
                r#"[data-testid="chat-message"]:last-child"#,
                ".chat-message:last-child",
                r#"[role="group"]:last-child"#,
                ".response-message:last-child",
                r#"[class*="message"]:last-child div"#,
                r#"[class*="response"]:last-child"#,
            ]),
            record_delay_ms: 15_000,
        }
    }
}

impl AssistedConfig {
    /// 清零所有等待（测试与演练用）；响应超时保留
    pub fn without_pauses(mut self) -> Self {
        self.settle_ms = 0;
        self.fallback_wait_ms = 0;
        self.clear_pause_ms = 0;
        self.type_settle_ms = 0;
        self.submit_scroll_pause_ms = 0;
        self.submit_settle_ms = 0;
        self.enter_focus_pause_ms = 0;
        self.poll_interval_ms = 0;
        self.record_delay_ms = 0;
        self
    }
}

/// [llm] 段：内容生成所用的 OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key_env: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            model: "gpt-3.5-turbo".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// [campaign] 段：内容生成与发送节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub message_type: String,
    /// 相邻两次发送的间隔（最后一封之后不等）
    pub delay_ms: u64,
    pub word_limit: usize,
    pub subject_max_tokens: u32,
    pub body_max_tokens: u32,
    pub temperature: f32,
    /// 预览时生成的记录数
    pub preview_count: usize,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            message_type: "partnership".to_string(),
            delay_ms: 30_000,
            word_limit: 300,
            subject_max_tokens: 50,
            body_max_tokens: 500,
            temperature: 0.7,
            preview_count: 5,
        }
    }
}

impl CampaignConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// [smtp] 段：发件服务器；密码从环境变量读取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub starttls: bool,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    /// 登录名，未设置时使用 sender_email
    pub username: Option<String>,
    pub password_env: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: "smtp.gmail.com".to_string(),
            port: 587,
            starttls: true,
            sender_email: None,
            sender_name: None,
            username: None,
            password_env: "SMTP_PASSWORD".to_string(),
        }
    }
}

impl SmtpConfig {
    pub fn password(&self) -> Option<String> {
        std::env::var(&self.password_env).ok().filter(|p| !p.is_empty())
    }
}

/// 从 config 目录加载配置，环境变量 FORAGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FORAGER__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("FORAGER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
