//! Forager - 商户线索采集与外联
//!
//! 入口：解析命令行、初始化日志与配置，把抓取 / 外联作业交给作业监管器运行，
//! 并在前台跟随状态快照直到作业结束。Ctrl+C / SIGTERM 会向运行中的作业发出停止请求。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;

use forager::browser::SessionLauncher;
use forager::campaign::{
    CampaignEngine, CampaignSettings, ContentGenerator, ContentOverride, MailTransport,
    RecordingMailer, SenderIdentity, SmtpCredentials, SmtpMailer,
};
use forager::config::{load_config, AppConfig};
use forager::core::{CampaignState, JobSupervisor, ScrapeStatus, ShutdownManager, StatusCell};
use forager::dataset::{DatasetFormat, DatasetStore};
use forager::llm::{LlmClient, OpenAiClient};
use forager::observability;
use forager::scraper::{EnrichmentMode, ScrapeJob, ScrapeRequest};

#[derive(Parser)]
#[command(name = "forager")]
#[command(about = "Map listing scraper with contact enrichment and email outreach")]
#[command(version)]
struct Cli {
    /// 额外的配置文件（叠加在 config/default.toml 之上）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape map listings for a search query
    Scrape {
        /// Search query, e.g. "cafes in austin"
        query: String,

        /// Maximum number of records to extract
        #[arg(short = 'n', long, default_value_t = 20)]
        max_results: usize,

        #[arg(long, value_enum, default_value_t = FormatArg::Csv)]
        format: FormatArg,

        /// Contact enrichment after scraping
        #[arg(long, value_enum, default_value_t = EnrichArg::Skip)]
        enrich: EnrichArg,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },

    /// Enrich a saved dataset in place
    Enrich {
        /// Dataset file (relative names resolve inside the data directory)
        dataset: PathBuf,

        #[arg(long, value_enum, default_value_t = EnrichArg::Free)]
        method: EnrichArg,

        #[arg(long)]
        headed: bool,
    },

    /// Send an outreach campaign to every record with an email address
    Campaign {
        dataset: PathBuf,

        /// Message type, e.g. partnership, service, collaboration
        #[arg(long)]
        message_type: Option<String>,

        /// Seconds between two sends
        #[arg(long)]
        delay_secs: Option<u64>,

        /// JSON list of edited {index, subject, body} entries
        #[arg(long)]
        overrides: Option<PathBuf>,

        #[arg(long, env = "FORAGER_SENDER_EMAIL")]
        sender_email: Option<String>,

        #[arg(long, env = "FORAGER_SENDER_NAME")]
        sender_name: Option<String>,

        /// Generate and record mails without connecting to SMTP
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate content for the first records without sending
    Preview {
        dataset: PathBuf,

        #[arg(long)]
        message_type: Option<String>,

        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Write the previews as an editable overrides file
        #[arg(long)]
        save_overrides: Option<PathBuf>,
    },

    /// Synthesize background text for records missing it
    Backfill { dataset: PathBuf },

    /// List saved datasets
    Datasets,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for DatasetFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Csv => DatasetFormat::Csv,
            FormatArg::Json => DatasetFormat::Json,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EnrichArg {
    Skip,
    Api,
    Free,
}

impl From<EnrichArg> for EnrichmentMode {
    fn from(value: EnrichArg) -> Self {
        match value {
            EnrichArg::Skip => EnrichmentMode::Skip,
            EnrichArg::Api => EnrichmentMode::Api,
            EnrichArg::Free => EnrichmentMode::Free,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config).context("Failed to load configuration")?;
    let store = DatasetStore::new(&config.app.data_dir);

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let supervisor = JobSupervisor::new();
    shutdown.forward_to(supervisor.clone());

    match cli.command {
        Commands::Scrape {
            query,
            max_results,
            format,
            enrich,
            headed,
        } => {
            if headed {
                config.browser.headless = false;
            }
            let request = ScrapeRequest {
                query,
                max_results,
                format: format.into(),
                enrichment: enrich.into(),
            };
            let job = Arc::new(ScrapeJob::new(config.clone(), launcher(&config)));
            let handle = supervisor
                .scrape
                .spawn(ScrapeStatus::default(), move |token, status| async move {
                    if let Err(e) = job.run(request, &token, &status).await {
                        tracing::error!(error = %e, "scrape job failed");
                    }
                    status.snapshot()
                })?;
            follow(supervisor.scrape.status(), handle, |s: &ScrapeStatus| {
                format!("[{:>3}%] {}", s.progress, s.message)
            })
            .await;

            let last = supervisor.scrape.snapshot();
            if !last.errors.is_empty() {
                bail!("{}", last.message);
            }
        }

        Commands::Enrich {
            dataset,
            method,
            headed,
        } => {
            if headed {
                config.browser.headless = false;
            }
            let path = store.resolve(&dataset);
            let job = ScrapeJob::new(config.clone(), launcher(&config));
            let token = shutdown.token();
            let outcome = job
                .enrich_saved(&path, method.into(), &token, &mut |done, total| {
                    println!("Enriched {}/{}", done, total);
                })
                .await
                .with_context(|| format!("Failed to enrich {}", path.display()))?;
            match outcome {
                Some(o) => println!(
                    "Email extraction completed: {} successful, {} failed, {} skipped -> {}",
                    o.successful,
                    o.failed,
                    o.skipped,
                    path.display()
                ),
                None => println!("Enrichment skipped"),
            }
        }

        Commands::Campaign {
            dataset,
            message_type,
            delay_secs,
            overrides,
            sender_email,
            sender_name,
            dry_run,
        } => {
            let path = store.resolve(&dataset);
            let data = store
                .load(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;

            let (sender, credentials) = sender_identity(&config, sender_email, sender_name, dry_run)?;
            let mut settings = CampaignSettings::from_config(&config.campaign, sender, credentials);
            if let Some(t) = message_type {
                settings.message_type = t;
            }
            if let Some(secs) = delay_secs {
                settings.delay = std::time::Duration::from_secs(secs);
            }
            if let Some(file) = overrides {
                settings = settings.with_overrides(load_overrides(&file)?);
            }

            let transport: Arc<dyn MailTransport> = if dry_run {
                Arc::new(RecordingMailer::new())
            } else {
                Arc::new(SmtpMailer::new(&config.smtp))
            };
            let engine = Arc::new(CampaignEngine::new(
                ContentGenerator::new(content_client(&config), config.campaign.clone()),
                transport,
            ));
            let handle = supervisor
                .campaign
                .spawn(CampaignState::starting(), move |token, status| async move {
                    engine.run(&data, &settings, &token, &status).await
                })?;
            follow(supervisor.campaign.status(), handle, |s: &CampaignState| {
                format!("[{:>3}%] {}", s.progress_percent, s.message)
            })
            .await;

            let last = supervisor.campaign.snapshot();
            for e in &last.errors {
                eprintln!("  {}", e);
            }
        }

        Commands::Preview {
            dataset,
            message_type,
            count,
            save_overrides,
        } => {
            let path = store.resolve(&dataset);
            let data = store
                .load(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let generator = ContentGenerator::new(content_client(&config), config.campaign.clone());
            let message_type = message_type.unwrap_or_else(|| config.campaign.message_type.clone());
            let count = count.unwrap_or(config.campaign.preview_count);

            let previews = generator.preview(&data.eligible(), &message_type, count).await;
            println!("{}", serde_json::to_string_pretty(&previews)?);

            if let Some(out) = save_overrides {
                let edits: Vec<ContentOverride> = previews
                    .iter()
                    .map(|p| ContentOverride {
                        index: p.index,
                        subject: p.content.subject.clone(),
                        body: p.content.body.clone(),
                    })
                    .collect();
                std::fs::write(&out, serde_json::to_string_pretty(&edits)?)
                    .with_context(|| format!("Failed to write {}", out.display()))?;
                println!("Overrides written to {}", out.display());
            }
        }

        Commands::Backfill { dataset } => {
            let path = store.resolve(&dataset);
            let changed = store
                .backfill_backgrounds(&path)
                .with_context(|| format!("Failed to backfill {}", path.display()))?;
            println!("Backfilled {} records in {}", changed, path.display());
        }

        Commands::Datasets => {
            let files = store.list_datasets();
            if files.is_empty() {
                println!("No datasets in {}", store.dir().display());
            }
            for f in files {
                println!("{}", f.display());
            }
        }
    }

    Ok(())
}

fn launcher(config: &AppConfig) -> Arc<dyn SessionLauncher> {
    #[cfg(feature = "browser")]
    {
        Arc::new(forager::browser::ChromeLauncher::new(config.browser.clone()))
    }
    #[cfg(not(feature = "browser"))]
    {
        let _ = config;
        Arc::new(forager::browser::UnavailableLauncher)
    }
}

fn content_client(config: &AppConfig) -> Arc<dyn LlmClient> {
    let llm = &config.llm;
    Arc::new(OpenAiClient::new(
        llm.base_url.as_deref(),
        &llm.model,
        llm.api_key().as_deref(),
    ))
}

/// 发件人：命令行优先，其次 [smtp] 段；密码只从环境变量读取
fn sender_identity(
    config: &AppConfig,
    email: Option<String>,
    name: Option<String>,
    dry_run: bool,
) -> anyhow::Result<(SenderIdentity, SmtpCredentials)> {
    let smtp = &config.smtp;
    let Some(email) = email.or_else(|| smtp.sender_email.clone()) else {
        bail!("Sender email is required (--sender-email or smtp.sender_email)");
    };
    let name = name
        .or_else(|| smtp.sender_name.clone())
        .unwrap_or_else(|| email.clone());
    let password = match smtp.password() {
        Some(p) => p,
        None if dry_run => String::new(),
        None => bail!("SMTP password missing; set {}", smtp.password_env),
    };
    let username = smtp.username.clone().unwrap_or_else(|| email.clone());
    Ok((
        SenderIdentity { email, name },
        SmtpCredentials { username, password },
    ))
}

fn load_overrides(path: &Path) -> anyhow::Result<Vec<ContentOverride>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Invalid overrides file {}", path.display()))
}

/// 跟随状态快照打印进度，直到作业任务结束
async fn follow<S, F>(status: &StatusCell<S>, mut handle: JoinHandle<()>, render: F)
where
    S: Clone + Send + Sync + 'static,
    F: Fn(&S) -> String,
{
    let mut rx = status.subscribe();
    let mut last = String::new();
    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                let line = render(&snapshot);
                if line != last {
                    println!("{}", line);
                    last = line;
                }
            }
            joined = &mut handle => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "job supervisor task failed");
                }
                break;
            }
        }
    }
    let line = render(&status.snapshot());
    if line != last {
        println!("{}", line);
    }
}
