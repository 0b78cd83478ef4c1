//! 脚本化的内存会话，用于测试与离线演练
//!
//! 页面是一棵由（定位器, 元素）组成的树，定位器按字面量精确匹配（另支持 `:last-child` 后缀）。
//! 元素可以附带激活效果（点击 / 回车时安装新元素、追加对话回复），
//! 也可以设置前 N 次点击抛出 Stale，用来演练重试路径。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::session::{Action, AutomationSession, ElementRef, Locator, SessionError};

/// 元素被激活（点击 / 回车）时对页面的改动
#[derive(Debug, Clone)]
pub enum Effect {
    /// 用给定元素替换页面根部该定位器下的全部元素
    Install {
        locator: Locator,
        elements: Vec<FakeElement>,
    },
    /// 在该定位器下追加「用户消息 + 下一条排队回复」；没有排队回复时什么也不发生
    Reply { locator: Locator },
}

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub text: String,
    pub attrs: Vec<(String, String)>,
    pub hidden: bool,
    pub disabled: bool,
    pub children: Vec<(Locator, FakeElement)>,
    pub effects: Vec<Effect>,
    /// 还会以 Stale 失败的点击次数
    pub flaky_clicks: usize,
    /// 指针点击一律被遮挡（脚本点击不受影响）
    pub obscured: bool,
}

impl FakeElement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn child(mut self, locator: impl Into<Locator>, element: FakeElement) -> Self {
        self.children.push((locator.into(), element));
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn obscured(mut self) -> Self {
        self.obscured = true;
        self
    }

    pub fn flaky(mut self, failures: usize) -> Self {
        self.flaky_clicks = failures;
        self
    }

    pub fn on_activate(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    fn value(&self) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == "value")
            .map(|(_, v)| v.as_str())
    }

    fn set_value(&mut self, value: String) {
        self.attrs.retain(|(k, _)| k != "value");
        self.attrs.push(("value".to_string(), value));
    }
}

#[derive(Default)]
struct PageState {
    roots: Vec<(Locator, FakeElement)>,
    body_text: String,
    urls: Vec<String>,
    fail_navigation: Option<String>,
    broken_locators: Vec<(Locator, String)>,
    page_downs: usize,
    end_marker: Option<(usize, String)>,
    replies: VecDeque<String>,
    last_typed: String,
    actions: Vec<String>,
}

/// 内存会话
#[derive(Default)]
pub struct ScriptedSession {
    state: Mutex<PageState>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(self, locator: impl Into<Locator>, element: FakeElement) -> Self {
        self.mutate(|s| s.roots.push((locator.into(), element)));
        self
    }

    pub fn with_elements(self, locator: impl Into<Locator>, elements: Vec<FakeElement>) -> Self {
        let locator = locator.into();
        self.mutate(|s| {
            for el in elements {
                s.roots.push((locator.clone(), el));
            }
        });
        self
    }

    /// 页面可见文本中的额外内容（不属于任何元素）
    pub fn with_body_text(self, text: &str) -> Self {
        self.mutate(|s| s.body_text = text.to_string());
        self
    }

    /// 收到 `after` 次 PageDown 之后页面源码中出现结束标记
    pub fn with_end_marker_after(self, after: usize, marker: &str) -> Self {
        self.mutate(|s| s.end_marker = Some((after, marker.to_string())));
        self
    }

    pub fn with_replies<I, T>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.mutate(|s| s.replies.extend(replies.into_iter().map(Into::into)));
        self
    }

    pub fn failing_navigation(self, reason: &str) -> Self {
        self.mutate(|s| s.fail_navigation = Some(reason.to_string()));
        self
    }

    /// 对该定位器的查找返回错误（例如非法选择器）
    pub fn with_broken_locator(self, locator: impl Into<Locator>, reason: &str) -> Self {
        self.mutate(|s| s.broken_locators.push((locator.into(), reason.to_string())));
        self
    }

    pub fn page_downs(&self) -> usize {
        self.read(|s| s.page_downs)
    }

    pub fn visited(&self) -> Vec<String> {
        self.read(|s| s.urls.clone())
    }

    /// 动作日志，形如 `click css=a[0]`
    pub fn actions(&self) -> Vec<String> {
        self.read(|s| s.actions.clone())
    }

    pub fn last_typed(&self) -> String {
        self.read(|s| s.last_typed.clone())
    }

    fn mutate(&self, f: impl FnOnce(&mut PageState)) {
        if let Ok(mut guard) = self.state.lock() {
            f(&mut guard);
        }
    }

    fn read<T: Default>(&self, f: impl FnOnce(&PageState) -> T) -> T {
        self.state.lock().map(|g| f(&g)).unwrap_or_default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut PageState) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| SessionError::Other(e.to_string()))?;
        f(&mut guard)
    }
}

/// 匹配位置：定位器字面量相等；没有字面量匹配且以 `:last-child` 结尾时取基础定位器的最后一个
fn positions(nodes: &[(Locator, FakeElement)], loc: &Locator) -> Vec<usize> {
    let exact: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, (l, _))| l == loc)
        .map(|(i, _)| i)
        .collect();
    if !exact.is_empty() {
        return exact;
    }
    match loc {
        Locator::Css(sel) => match sel.strip_suffix(":last-child") {
            Some(base) => {
                let base = Locator::css(base);
                nodes
                    .iter()
                    .rposition(|(l, _)| l == &base)
                    .into_iter()
                    .collect()
            }
            None => Vec::new(),
        },
        Locator::XPath(_) => Vec::new(),
    }
}

fn nth<'a>(nodes: &'a [(Locator, FakeElement)], loc: &Locator, idx: usize) -> Option<&'a FakeElement> {
    let pos = *positions(nodes, loc).get(idx)?;
    nodes.get(pos).map(|(_, e)| e)
}

fn nth_mut<'a>(
    nodes: &'a mut [(Locator, FakeElement)],
    loc: &Locator,
    idx: usize,
) -> Option<&'a mut FakeElement> {
    let pos = *positions(nodes, loc).get(idx)?;
    nodes.get_mut(pos).map(|(_, e)| e)
}

fn resolve<'a>(
    roots: &'a [(Locator, FakeElement)],
    target: &ElementRef,
) -> Result<&'a FakeElement, SessionError> {
    let missing = || SessionError::NotFound(target.to_string());
    let mut steps = target.steps().iter();
    let (loc, idx) = steps.next().ok_or_else(missing)?;
    let mut current = nth(roots, loc, *idx).ok_or_else(missing)?;
    for (loc, idx) in steps {
        current = nth(&current.children, loc, *idx).ok_or_else(missing)?;
    }
    Ok(current)
}

fn resolve_mut<'a>(
    roots: &'a mut [(Locator, FakeElement)],
    target: &ElementRef,
) -> Result<&'a mut FakeElement, SessionError> {
    let missing = || SessionError::NotFound(target.to_string());
    let mut steps = target.steps().iter();
    let (loc, idx) = steps.next().ok_or_else(missing)?;
    let mut current = nth_mut(roots, loc, *idx).ok_or_else(missing)?;
    for (loc, idx) in steps {
        current = nth_mut(&mut current.children, loc, *idx).ok_or_else(missing)?;
    }
    Ok(current)
}

fn apply(state: &mut PageState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Install { locator, elements } => {
                state.roots.retain(|(l, _)| l != &locator);
                for el in elements {
                    state.roots.push((locator.clone(), el));
                }
            }
            Effect::Reply { locator } => {
                if let Some(reply) = state.replies.pop_front() {
                    let prompt = FakeElement::new(state.last_typed.clone());
                    state.roots.push((locator.clone(), prompt));
                    state.roots.push((locator, FakeElement::new(reply)));
                }
            }
        }
    }
}

#[async_trait]
impl AutomationSession for ScriptedSession {
    async fn navigate(&self, url: &str) -> Result<(), SessionError> {
        self.with_state(|s| {
            if let Some(reason) = &s.fail_navigation {
                return Err(SessionError::Other(reason.clone()));
            }
            s.urls.push(url.to_string());
            Ok(())
        })
    }

    async fn find_all(&self, locator: &Locator) -> Result<Vec<ElementRef>, SessionError> {
        self.with_state(|s| {
            if let Some((_, reason)) = s.broken_locators.iter().find(|(l, _)| l == locator) {
                return Err(SessionError::Other(reason.clone()));
            }
            let count = positions(&s.roots, locator).len();
            Ok((0..count)
                .map(|i| ElementRef::root(locator.clone(), i))
                .collect())
        })
    }

    async fn find_within(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> Result<Vec<ElementRef>, SessionError> {
        self.with_state(|s| {
            let el = resolve(&s.roots, parent)?;
            let count = positions(&el.children, locator).len();
            Ok((0..count)
                .map(|i| parent.child(locator.clone(), i))
                .collect())
        })
    }

    async fn interact(&self, target: &ElementRef, action: Action) -> Result<(), SessionError> {
        self.with_state(|s| {
            let label = match &action {
                Action::Click => "click",
                Action::ScriptClick => "script_click",
                Action::ScrollIntoView => "scroll_into_view",
                Action::Focus => "focus",
                Action::Clear => "clear",
                Action::Type(_) => "type",
                Action::PressEnter => "enter",
                Action::PageDown => "page_down",
            };
            s.actions.push(format!("{} {}", label, target));

            let el = resolve_mut(&mut s.roots, target)?;
            let effects = match action {
                Action::Click | Action::ScriptClick => {
                    if el.flaky_clicks > 0 {
                        el.flaky_clicks -= 1;
                        return Err(SessionError::Stale(target.to_string()));
                    }
                    if action == Action::Click && (el.obscured || el.hidden) {
                        return Err(SessionError::Intercepted(target.to_string()));
                    }
                    el.effects.clone()
                }
                Action::PressEnter => el.effects.clone(),
                Action::Clear => {
                    el.set_value(String::new());
                    Vec::new()
                }
                Action::Type(text) => {
                    let next = format!("{}{}", el.value().unwrap_or(""), text);
                    el.set_value(next.clone());
                    s.last_typed = next;
                    Vec::new()
                }
                Action::PageDown => {
                    s.page_downs += 1;
                    Vec::new()
                }
                Action::ScrollIntoView | Action::Focus => Vec::new(),
            };
            apply(s, effects);
            Ok(())
        })
    }

    async fn read_text(&self, target: &ElementRef) -> Result<String, SessionError> {
        self.with_state(|s| Ok(resolve(&s.roots, target)?.text.clone()))
    }

    async fn read_attribute(
        &self,
        target: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.with_state(|s| {
            let el = resolve(&s.roots, target)?;
            Ok(el
                .attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()))
        })
    }

    async fn is_interactable(&self, target: &ElementRef) -> Result<bool, SessionError> {
        self.with_state(|s| {
            let el = resolve(&s.roots, target)?;
            Ok(!el.hidden && !el.disabled)
        })
    }

    async fn page_source(&self) -> Result<String, SessionError> {
        self.with_state(|s| {
            let mut html = String::from("<html><body>");
            for (_, el) in &s.roots {
                html.push_str(&el.text);
            }
            if let Some((after, marker)) = &s.end_marker {
                if s.page_downs >= *after {
                    html.push_str(marker);
                }
            }
            html.push_str("</body></html>");
            Ok(html)
        })
    }

    async fn page_text(&self) -> Result<String, SessionError> {
        self.with_state(|s| {
            let mut lines: Vec<&str> = s
                .roots
                .iter()
                .filter(|(_, el)| !el.hidden && !el.text.is_empty())
                .map(|(_, el)| el.text.as_str())
                .collect();
            if !s.body_text.is_empty() {
                lines.push(&s.body_text);
            }
            Ok(lines.join("\n"))
        })
    }
}
