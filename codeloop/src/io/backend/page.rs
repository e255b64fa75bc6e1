//! Browser backend: a headless Chromium page whose bridge object runs code
//! in an in-page Node.js runtime.
//!
//! The page must expose `window.appReady` and a bridge object (default
//! `window._electrons`) with `boot()`, `runCode(code, packages)`,
//! `writeFile(path, base64)`, `listFiles()` and `readFile(path)`.

use std::collections::BTreeSet;
use std::fs;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{BackendError, BackendHandle, ExecutionBackend, ExecutionResult};
use crate::cancel::{CancelToken, Interrupted, POLL_INTERVAL};
use crate::io::config::PageConfig;

const READY_POLL: Duration = Duration::from_millis(250);
/// Bound for file transfers and boot.
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Chromium refuses to start as root or inside most containers without these.
const LAUNCH_ARGS: [&str; 2] = ["--no-sandbox", "--disable-setuid-sandbox"];

struct PageSession {
    id: String,
    browser: Browser,
    page: Page,
    events: JoinHandle<()>,
}

/// Runs generated code through a control page in headless Chromium.
pub struct SandboxedPage {
    cfg: PageConfig,
    runtime: Runtime,
    session: Option<PageSession>,
}

#[derive(Debug, Default, Deserialize)]
struct RunReply {
    #[serde(default)]
    output: String,
    #[serde(default, rename = "exitCode")]
    exit_code: Option<i32>,
}

impl SandboxedPage {
    pub fn new(cfg: PageConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("build page backend runtime")?;
        Ok(Self {
            cfg,
            runtime,
            session: None,
        })
    }

    fn session(&self, handle: &BackendHandle) -> Result<&PageSession> {
        match &self.session {
            Some(session) if session.id == handle.id() => Ok(session),
            _ => Err(BackendError::NotAcquired.into()),
        }
    }

    /// Drive `fut` to completion, giving up on timeout or cancellation.
    fn drive<T, F>(&self, fut: F, timeout: Duration, cancel: &CancelToken) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        cancel.check()?;
        self.runtime.block_on(async {
            tokio::select! {
                res = tokio::time::timeout(timeout, fut) => match res {
                    Ok(value) => value.map(Some),
                    Err(_) => Ok(None),
                },
                () = cancelled(cancel) => Err(Interrupted.into()),
            }
        })
    }

    fn call_bridge<T: DeserializeOwned>(
        &self,
        session: &PageSession,
        expression: String,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<T> {
        let what = expression.chars().take(40).collect::<String>();
        self.drive(evaluate(&session.page, expression), timeout, cancel)?
            .ok_or_else(|| anyhow!("page call timed out after {}s: {what}", timeout.as_secs()))
    }

    async fn open(cfg: &PageConfig, browser: &Browser) -> Result<Page> {
        let page = browser
            .new_page(cfg.url.as_str())
            .await
            .with_context(|| format!("open control page {}", cfg.url))?;

        let ready_timeout = Duration::from_secs(cfg.ready_timeout_secs);
        tokio::time::timeout(ready_timeout, async {
            loop {
                let ready: bool = evaluate(&page, "window.appReady === true".to_string())
                    .await
                    .unwrap_or(false);
                if ready {
                    return;
                }
                tokio::time::sleep(READY_POLL).await;
            }
        })
        .await
        .map_err(|_| {
            anyhow!(
                "control page did not set window.appReady within {}s",
                cfg.ready_timeout_secs
            )
        })?;

        let booted: bool = tokio::time::timeout(
            BRIDGE_TIMEOUT,
            evaluate(
                &page,
                format!(
                    "(async () => {{ await window.{}.boot(); return true; }})()",
                    cfg.bridge
                ),
            ),
        )
        .await
        .map_err(|_| anyhow!("bridge boot timed out"))??;
        if !booted {
            return Err(anyhow!("bridge boot did not complete"));
        }
        Ok(page)
    }
}

impl ExecutionBackend for SandboxedPage {
    fn name(&self) -> &'static str {
        "page"
    }

    #[instrument(skip_all, fields(url = %self.cfg.url))]
    fn acquire(&mut self, cancel: &CancelToken) -> Result<BackendHandle> {
        let config = BrowserConfig::builder()
            .args(LAUNCH_ARGS)
            .build()
            .map_err(|e| anyhow!("browser config: {e}"))?;
        let (mut browser, mut handler) = self
            .drive(
                async { Browser::launch(config).await.context("launch browser") },
                BRIDGE_TIMEOUT,
                cancel,
            )?
            .ok_or_else(|| anyhow!("browser launch timed out"))?;
        let events = self.runtime.spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let cfg = self.cfg.clone();
        let opened = self.drive(
            async { Self::open(&cfg, &browser).await },
            Duration::from_secs(cfg.ready_timeout_secs) + BRIDGE_TIMEOUT,
            cancel,
        );
        let page = match opened {
            Ok(Some(page)) => page,
            failed => {
                // Nothing may outlive a failed acquisition.
                let _ = self.runtime.block_on(browser.close());
                events.abort();
                return Err(match failed {
                    Err(err) => err,
                    _ => anyhow!("control page did not become ready"),
                });
            }
        };

        let id = AsRef::<str>::as_ref(page.target_id()).to_string();
        info!(target = %id, "control page ready");
        self.session = Some(PageSession {
            id: id.clone(),
            browser,
            page,
            events,
        });
        Ok(BackendHandle::new(id))
    }

    #[instrument(skip_all, fields(source = %source.display()))]
    fn import_dataset(&mut self, handle: &BackendHandle, source: &Path, cancel: &CancelToken) -> Result<()> {
        let session = self.session(handle)?;
        let mut imported = 0usize;
        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry.with_context(|| format!("walk {}", source.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(source)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let bytes =
                fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
            let expression = format!(
                "(async () => {{ await window.{}.writeFile({}, {}); return true; }})()",
                self.cfg.bridge,
                js_string(&bridge_path(rel))?,
                js_string(&STANDARD.encode(bytes))?,
            );
            let _: bool = self.call_bridge(session, expression, BRIDGE_TIMEOUT, cancel)?;
            imported += 1;
        }
        info!(files = imported, "dataset imported");
        Ok(())
    }

    #[instrument(skip_all, fields(packages = packages.len()))]
    fn execute(
        &mut self,
        handle: &BackendHandle,
        code: &str,
        packages: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult> {
        let session = self.session(handle)?;
        let packages: Vec<&str> = packages.iter().map(String::as_str).collect();
        let expression = format!(
            "(async () => {{ const r = await window.{}.runCode({}, {}); \
             return typeof r === 'string' ? {{ output: r }} : (r ?? {{}}); }})()",
            self.cfg.bridge,
            js_string(code)?,
            serde_json::to_string(&packages).context("encode packages")?,
        );
        let timeout = Duration::from_secs(self.cfg.exec_timeout_secs);
        let reply: Option<RunReply> =
            self.drive(evaluate(&session.page, expression), timeout, cancel)?;
        let result = match reply {
            Some(reply) => ExecutionResult {
                output: reply.output,
                exit_code: reply.exit_code,
                timed_out: false,
            },
            None => {
                warn!(timeout_secs = self.cfg.exec_timeout_secs, "page execution timed out");
                ExecutionResult {
                    output: format!("[execution timed out after {}s]", self.cfg.exec_timeout_secs),
                    exit_code: None,
                    timed_out: true,
                }
            }
        };
        debug!(exit_code = ?result.exit_code, "execution finished");
        Ok(result)
    }

    #[instrument(skip_all, fields(output = %output.display()))]
    fn export_dataset(&mut self, handle: &BackendHandle, output: &Path, cancel: &CancelToken) -> Result<()> {
        let session = self.session(handle)?;
        let files: Vec<String> = self.call_bridge(
            session,
            format!("(async () => await window.{}.listFiles())()", self.cfg.bridge),
            BRIDGE_TIMEOUT,
            cancel,
        )?;
        fs::create_dir_all(output).with_context(|| format!("create {}", output.display()))?;

        let mut exported = 0usize;
        for file in files {
            let Some(rel) = safe_relative(&file) else {
                warn!(path = %file, "skipping file outside the page working directory");
                continue;
            };
            let encoded: String = self.call_bridge(
                session,
                format!(
                    "(async () => await window.{}.readFile({}))()",
                    self.cfg.bridge,
                    js_string(&file)?
                ),
                BRIDGE_TIMEOUT,
                cancel,
            )?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .with_context(|| format!("decode {file}"))?;
            let dest = output.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&dest, bytes).with_context(|| format!("write {}", dest.display()))?;
            exported += 1;
        }
        info!(files = exported, "dataset exported");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %handle))]
    fn release(&mut self, handle: BackendHandle) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Err(BackendError::NotAcquired.into());
        };
        if session.id != handle.id() {
            self.session = Some(session);
            return Err(BackendError::NotAcquired.into());
        }
        let closed = self
            .runtime
            .block_on(async { tokio::time::timeout(BRIDGE_TIMEOUT, session.browser.close()).await });
        session.events.abort();
        match closed {
            Ok(res) => {
                res.context("close browser")?;
            }
            Err(_) => return Err(anyhow!("closing the browser timed out")),
        }
        info!("browser closed");
        Ok(())
    }
}

async fn evaluate<T: DeserializeOwned>(page: &Page, expression: String) -> Result<T> {
    let params = EvaluateParams::builder()
        .expression(expression)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(|e| anyhow!("evaluate params: {e}"))?;
    let value = page
        .evaluate_expression(params)
        .await
        .context("evaluate in page")?
        .into_value()
        .context("decode page value")?;
    Ok(value)
}

async fn cancelled(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn js_string(value: &str) -> Result<String> {
    serde_json::to_string(value).context("encode javascript string")
}

/// Forward-slash path as the bridge expects it.
fn bridge_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative path for a file reported by the page; `None` when it would
/// escape the output directory.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(path.trim_start_matches("./")).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!rel.as_os_str().is_empty()).then_some(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_relative_rejects_escapes() {
        assert_eq!(safe_relative("result.txt"), Some(PathBuf::from("result.txt")));
        assert_eq!(
            safe_relative("./charts/index.html"),
            Some(PathBuf::from("charts/index.html"))
        );
        assert_eq!(safe_relative("../etc/passwd"), None);
        assert_eq!(safe_relative("/etc/passwd"), None);
        assert_eq!(safe_relative(""), None);
    }

    #[test]
    fn bridge_paths_use_forward_slashes() {
        let rel = Path::new("data").join("nested").join("a.csv");
        assert_eq!(bridge_path(&rel), "data/nested/a.csv");
    }

    #[test]
    fn code_is_embedded_as_a_string_literal() {
        let literal = js_string("console.log(\"hi\")\n`tpl`").expect("encode");
        assert_eq!(literal, "\"console.log(\\\"hi\\\")\\n`tpl`\"");
    }

    #[test]
    fn browser_launches_without_the_sandbox() {
        assert!(LAUNCH_ARGS.contains(&"--no-sandbox"));
        assert!(LAUNCH_ARGS.contains(&"--disable-setuid-sandbox"));
    }

    #[test]
    fn run_reply_tolerates_missing_fields() {
        let reply: RunReply = serde_json::from_str("{}").expect("parse");
        assert_eq!(reply.output, "");
        assert_eq!(reply.exit_code, None);
    }

    #[test]
    fn unacquired_handle_is_rejected() {
        let mut backend = SandboxedPage::new(PageConfig::default()).expect("backend");
        let err = backend
            .execute(
                &BackendHandle::new("nope"),
                "1",
                &BTreeSet::new(),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.downcast_ref::<BackendError>(), Some(&BackendError::NotAcquired));
        let err = backend.release(BackendHandle::new("nope")).unwrap_err();
        assert_eq!(err.downcast_ref::<BackendError>(), Some(&BackendError::NotAcquired));
    }
}
