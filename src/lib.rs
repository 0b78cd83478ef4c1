//! Forager - 商户线索采集与外联
//!
//! 模块划分：
//! - **browser**: 浏览器自动化会话抽象、定位器链、headless_chrome 实现与脚本化会话
//! - **campaign**: 外联内容生成、SMTP 外发、活动引擎
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、状态快照、作业监管、优雅关闭
//! - **dataset**: 记录模型与数据集存储（CSV / JSON）
//! - **enrich**: 联系方式补全（严格 API 通道 / AI 辅助通道）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / 直连 HTTP / Mock）
//! - **observability**: 日志订阅器
//! - **scraper**: 地图结果列表翻页、详情抽取与抓取作业

pub mod browser;
pub mod campaign;
pub mod config;
pub mod core;
pub mod dataset;
pub mod enrich;
pub mod llm;
pub mod observability;
pub mod scraper;
