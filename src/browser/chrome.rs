//! Headless Chrome 会话
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 是阻塞 API，所有调用都放进 spawn_blocking；
//! 元素按路径在页面内用 JS 重新解析，读写结果以 JSON 字符串带回。

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::{json, Value};

use super::session::{Action, AutomationSession, ElementRef, Locator, SessionError};
use super::SessionLauncher;
use crate::config::BrowserConfig;

/// 按错误文本归类 CDP 错误
fn classify(message: String) -> SessionError {
    let lower = message.to_lowercase();
    if lower.contains("stale") || lower.contains("no node with given id") || lower.contains("detached") {
        SessionError::Stale(message)
    } else if lower.contains("intercept") {
        SessionError::Intercepted(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        SessionError::Timeout(message)
    } else {
        SessionError::Other(message)
    }
}

#[derive(Debug, Deserialize)]
struct JsReply {
    #[serde(default)]
    ok: Value,
    err: Option<String>,
    detail: Option<String>,
}

fn steps_json(steps: &[(Locator, usize)]) -> String {
    let steps: Vec<Value> = steps
        .iter()
        .map(|(loc, idx)| {
            let kind = match loc {
                Locator::Css(_) => "css",
                Locator::XPath(_) => "xpath",
            };
            json!({ "kind": kind, "sel": loc.as_str(), "idx": idx })
        })
        .collect();
    Value::Array(steps).to_string()
}

/// 生成一段 JS：解析路径得到 `el`，再执行 body（body 需 `return` 一个对象）
fn script(steps: &[(Locator, usize)], body: &str) -> String {
    format!(
        r#"
        (function() {{
            const __all = (root, s) => {{
                if (s.kind === 'css') {{
                    return Array.from(root.querySelectorAll(s.sel));
                }}
                const r = document.evaluate(s.sel, root, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                const out = [];
                for (let i = 0; i < r.snapshotLength; i++) out.push(r.snapshotItem(i));
                return out;
            }};
            let el = document;
            for (const s of {steps}) {{
                const found = __all(el, s);
                if (s.idx >= found.length) {{
                    return JSON.stringify({{ err: 'not_found', detail: s.sel }});
                }}
                el = found[s.idx];
            }}
            try {{
                const res = (() => {{ {body} }})();
                return JSON.stringify(res);
            }} catch (e) {{
                return JSON.stringify({{ err: 'script', detail: String(e) }});
            }}
        }})()
        "#,
        steps = steps_json(steps),
        body = body,
    )
}

fn evaluate(tab: &Tab, js: &str, target: &str) -> Result<Value, SessionError> {
    let remote = tab
        .evaluate(js, false)
        .map_err(|e| classify(e.to_string()))?;
    let raw = remote
        .value
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| SessionError::Other("Empty script result".to_string()))?;
    let reply: JsReply =
        serde_json::from_str(&raw).map_err(|e| SessionError::Other(e.to_string()))?;
    match reply.err.as_deref() {
        None => Ok(reply.ok),
        Some("not_found") => Err(SessionError::NotFound(target.to_string())),
        Some("intercepted") => Err(SessionError::Intercepted(
            reply.detail.unwrap_or_else(|| target.to_string()),
        )),
        Some(_) => Err(classify(reply.detail.unwrap_or_default())),
    }
}

const POINTER_CLICK: &str = r#"
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) return { err: 'intercepted', detail: 'element not visible' };
    const hit = document.elementFromPoint(r.left + r.width / 2, r.top + r.height / 2);
    if (hit && hit !== el && !el.contains(hit)) {
        return { err: 'intercepted', detail: 'obscured by ' + hit.tagName };
    }
    el.click();
    return { ok: true };
"#;

const INTERACTABLE: &str = r#"
    const r = el.getBoundingClientRect();
    const st = window.getComputedStyle(el);
    const visible = r.width > 0 && r.height > 0 && st.visibility !== 'hidden' && st.display !== 'none';
    return { ok: visible && !el.disabled };
"#;

const FOCUS: &str = r#"
    if (el.tabIndex < 0 && !el.isContentEditable) el.setAttribute('tabindex', '-1');
    el.focus();
    return { ok: true };
"#;

/// 基于 headless_chrome 的会话，持有一个浏览器进程和一个标签页
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    pub fn launch(config: &BrowserConfig) -> Result<Self, SessionError> {
        let mut args: Vec<String> = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-dev-shm-usage".to_string(),
        ];
        if let Some(ua) = &config.user_agent {
            args.push(format!("--user-agent={}", ua));
        }
        let arg_refs: Vec<&OsStr> = args.iter().map(OsStr::new).collect();

        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(config.sandbox)
            .window_size(Some((config.window_width, config.window_height)))
            .idle_browser_timeout(Duration::from_secs(config.idle_timeout_secs))
            .args(arg_refs)
            .build()
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let browser = Browser::new(options).map_err(|e| SessionError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| SessionError::Launch(format!("Browser tab failed: {}", e)))?;
        tracing::info!(headless = config.headless, "chrome session started");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(&Tab) -> Result<T, SessionError> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| SessionError::Other(format!("Task join: {}", e)))?
    }

    async fn run(&self, target: &ElementRef, body: &'static str) -> Result<Value, SessionError> {
        let js = script(target.steps(), body);
        let label = target.to_string();
        self.blocking(move |tab| evaluate(tab, &js, &label)).await
    }

    async fn count(&self, steps: Vec<(Locator, usize)>, locator: &Locator) -> Result<usize, SessionError> {
        let body = format!(
            "return {{ ok: __all(el, {}).length }};",
            json!({ "kind": match locator { Locator::Css(_) => "css", Locator::XPath(_) => "xpath" }, "sel": locator.as_str() })
        );
        let js = script(&steps, &body);
        let label = locator.to_string();
        let value = self.blocking(move |tab| evaluate(tab, &js, &label)).await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }
}

#[async_trait]
impl AutomationSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        let url = url.to_string();
        tracing::debug!(url = %url, "navigate");
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(|t| t.wait_until_navigated())
                .map(|_| ())
                .map_err(|e| classify(format!("Navigate failed: {}", e)))
        })
        .await
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, SessionError> {
        let n = self.count(Vec::new(), locator).await?;
        Ok((0..n).map(|i| ElementRef::root(locator.clone(), i)).collect())
    }

    async fn find_within(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> Result<Vec<ElementRef>, SessionError> {
        let n = self.count(parent.steps().to_vec(), locator).await?;
        Ok((0..n).map(|i| parent.child(locator.clone(), i)).collect())
    }

    async fn interact(&self, target: &ElementRef, action: Action) -> Result<(), SessionError> {
        match action {
            Action::Click => self.run(target, POINTER_CLICK).await.map(|_| ()),
            Action::ScriptClick => self
                .run(target, "el.click(); return { ok: true };")
                .await
                .map(|_| ()),
            Action::ScrollIntoView => self
                .run(
                    target,
                    "el.scrollIntoView({ block: 'center', inline: 'nearest' }); return { ok: true };",
                )
                .await
                .map(|_| ()),
            Action::Focus => self.run(target, FOCUS).await.map(|_| ()),
            Action::Clear => self
                .run(
                    target,
                    r#"
                    if ('value' in el) { el.value = ''; } else { el.textContent = ''; }
                    el.dispatchEvent(new Event('input', { bubbles: true }));
                    return { ok: true };
                    "#,
                )
                .await
                .map(|_| ()),
            Action::Type(text) => {
                self.run(target, FOCUS).await?;
                self.blocking(move |tab| {
                    tab.type_str(&text)
                        .map(|_| ())
                        .map_err(|e| classify(e.to_string()))
                })
                .await
            }
            Action::PressEnter => self.key(target, "Enter").await,
            Action::PageDown => self.key(target, "PageDown").await,
        }
    }

    async fn read_text(&self, target: &ElementRef) -> Result<String, SessionError> {
        let v = self
            .run(target, "return { ok: el.innerText || el.textContent || '' };")
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    async fn read_attribute(
        &self,
        target: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let body = format!(
            "const n = {}; const v = (n === 'href' && el.href) ? el.href : el.getAttribute(n); return {{ ok: v }};",
            Value::String(name.to_string())
        );
        let js = script(target.steps(), &body);
        let label = target.to_string();
        let v = self.blocking(move |tab| evaluate(tab, &js, &label)).await?;
        Ok(v.as_str().map(str::to_string))
    }

    async fn is_interactable(&self, target: &ElementRef) -> Result<bool, SessionError> {
        Ok(self.run(target, INTERACTABLE).await?.as_bool().unwrap_or(false))
    }

    async fn page_source(&self) -> Result<String, SessionError> {
        self.blocking(|tab| tab.get_content().map_err(|e| classify(e.to_string())))
            .await
    }

    async fn page_text(&self) -> Result<String, SessionError> {
        let v = self
            .run(
                &ElementRef::root(Locator::css("body"), 0),
                "return { ok: el.innerText || '' };",
            )
            .await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }
}

impl ChromeSession {
    async fn key(&self, target: &ElementRef, key: &'static str) -> Result<(), SessionError> {
        self.run(target, FOCUS).await?;
        self.blocking(move |tab| {
            tab.press_key(key)
                .map(|_| ())
                .map_err(|e| classify(e.to_string()))
        })
        .await
    }
}

/// 启动 Chrome 会话
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn AutomationSession>, SessionError> {
        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(&config))
            .await
            .map_err(|e| SessionError::Launch(format!("Task join: {}", e)))??;
        Ok(Arc::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(classify("Stale element reference".into()).is_transient());
        assert!(matches!(
            classify("Element click intercepted".into()),
            SessionError::Intercepted(_)
        ));
        assert!(matches!(
            classify("Timed out waiting".into()),
            SessionError::Timeout(_)
        ));
    }

    #[test]
    fn test_script_embeds_escaped_steps() {
        let js = script(
            &[(Locator::css("div[aria-label='Results for \"x\"']"), 0)],
            "return { ok: true };",
        );
        assert!(js.contains(r#"\"x\""#));
    }
}
