//! Playwright browser automation
//!
//! Each run gets one long-lived `node` driver process. The driver launches the
//! browser, then reads one JSON command per line on stdin and answers on
//! stdout:
//!
//! ```text
//! -> {"id":1,"op":"step","stepId":"login","code":"await page.click(\"#go\");"}
//! <- {"id":1,"frame":"login-1.png"}
//! <- {"id":1,"ok":true}
//! -> {"id":2,"op":"close"}
//! <- {"id":2,"ok":true,"video":"video.webm","trace":"trace.zip"}
//! ```
//!
//! Step code is generated here from the step's action, so the driver itself
//! stays a fixed script.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use runcast_common::{Job, StepAction, StepDefinition};

use super::{Artifacts, Engine, EngineError, FrameSink, StepOutcome};
use crate::config::EngineConfig;

/// One line written by the driver
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverReply {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub fatal: bool,
    /// Screenshot file written mid-step
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
    /// `assertion` or `error`
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

impl DriverReply {
    /// Classify a final step reply. Failed expectations fail the step, anything
    /// else thrown by the page or browser is an engine error.
    pub fn into_outcome(self) -> Result<StepOutcome, EngineError> {
        if self.ok == Some(true) {
            return Ok(StepOutcome::passed());
        }
        let message = self
            .error
            .unwrap_or_else(|| "step failed without an error message".to_string());
        match self.kind.as_deref() {
            Some("assertion") => Ok(StepOutcome::failed(message, self.stack)),
            _ => Err(EngineError::Script {
                message,
                stack: self.stack,
            }),
        }
    }
}

struct DriverSession {
    run_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    // Holds driver.js until the process is gone
    _script_dir: tempfile::TempDir,
}

impl DriverSession {
    async fn send(&mut self, command: serde_json::Value) -> Result<(), EngineError> {
        let mut line = command.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Read lines until the final reply to `id`, forwarding frames as they come
    async fn reply_to(
        &mut self,
        id: u64,
        timeout: Duration,
        config: &EngineConfig,
        frames: Option<&FrameSink>,
    ) -> Result<DriverReply, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = tokio::time::timeout_at(deadline, self.stdout.next_line())
                .await
                .map_err(|_| EngineError::Timeout(timeout))??;
            let Some(line) = line else {
                let status = self.child.try_wait()?;
                return Err(EngineError::DriverExited(format!("{:?}", status)));
            };

            // Scripts may log to stdout; only JSON objects are protocol lines
            let reply: DriverReply = match serde_json::from_str(&line) {
                Ok(reply) => reply,
                Err(_) => {
                    debug!("[driver {}] {}", self.run_id, line);
                    continue;
                }
            };
            if reply.fatal {
                return Err(EngineError::Script {
                    message: reply.error.unwrap_or_else(|| "driver crashed".to_string()),
                    stack: reply.stack,
                });
            }
            if reply.id != Some(id) {
                continue;
            }
            if let Some(file) = &reply.frame {
                if let Some(frames) = frames {
                    frames.frame(config.artifact_url(&self.run_id, file));
                }
                continue;
            }
            return Ok(reply);
        }
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let line = tokio::time::timeout_at(deadline, self.stdout.next_line())
                .await
                .map_err(|_| EngineError::Timeout(timeout))??;
            let Some(line) = line else {
                return Err(EngineError::DriverExited(
                    "driver exited before the browser was ready".to_string(),
                ));
            };
            match serde_json::from_str::<DriverReply>(&line) {
                Ok(reply) if reply.ready => return Ok(()),
                Ok(reply) if reply.fatal => {
                    return Err(EngineError::Script {
                        message: reply.error.unwrap_or_else(|| "browser launch failed".to_string()),
                        stack: reply.stack,
                    })
                }
                _ => debug!("[driver {}] {}", self.run_id, line),
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Driver for run {} already gone: {}", self.run_id, e);
        }
    }
}

/// Playwright engine
pub struct PlaywrightEngine {
    config: EngineConfig,
    session: Option<DriverSession>,
    driver_checked: bool,
}

impl PlaywrightEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            session: None,
            driver_checked: false,
        }
    }

    /// Check that the configured `node` can be executed
    async fn check_driver_installed(&mut self) -> Result<(), EngineError> {
        if self.driver_checked {
            return Ok(());
        }
        let status = Command::new(&self.config.node_binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                self.driver_checked = true;
                Ok(())
            }
            _ => Err(EngineError::DriverNotFound(self.config.node_binary.clone())),
        }
    }

    /// Build the driver script for one run
    pub fn build_script(&self, job: &Job, run_dir: &Path) -> String {
        let config = serde_json::json!({
            "browser": self.config.browser,
            "headless": self.config.headless,
            "viewportWidth": self.config.viewport_width,
            "viewportHeight": self.config.viewport_height,
            "baseUrl": job.base_url,
            "runDir": run_dir.to_string_lossy(),
            "screenshotEveryStep": self.config.screenshot_every_step,
            "recordVideo": self.config.record_video,
            "recordTrace": self.config.record_trace,
        });
        DRIVER_TEMPLATE.replace("__CONFIG__", &config.to_string())
    }

    async fn spawn_driver(&self, job: &Job) -> Result<DriverSession, EngineError> {
        let run_dir: PathBuf = self.config.artifacts_dir().join(&job.run_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let script_dir = tempfile::tempdir()?;
        let script_path = script_dir.path().join("driver.js");
        tokio::fs::write(&script_path, self.build_script(job, &run_dir)).await?;

        let mut command = Command::new(&self.config.node_binary);
        command
            .arg(&script_path)
            .current_dir(&run_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(node_path) = &self.config.node_path {
            command.env("NODE_PATH", node_path);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Protocol("driver stdout unavailable".to_string()))?;

        Ok(DriverSession {
            run_id: job.run_id.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            _script_dir: script_dir,
        })
    }

    async fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.kill().await;
        }
    }
}

#[async_trait]
impl Engine for PlaywrightEngine {
    async fn start(&mut self, job: &Job) -> Result<(), EngineError> {
        if let Some(stale) = self.session.take() {
            warn!("Discarding driver left over from run {}", stale.run_id);
            stale.kill().await;
        }
        self.check_driver_installed().await?;

        let mut session = self.spawn_driver(job).await?;
        if let Err(e) = session.wait_ready(self.config.launch_timeout()).await {
            session.kill().await;
            return Err(e);
        }
        info!(
            "Launched {} for run {} ({} steps)",
            self.config.browser,
            job.run_id,
            job.steps.len()
        );
        self.session = Some(session);
        Ok(())
    }

    async fn execute(
        &mut self,
        step: &StepDefinition,
        frames: &FrameSink,
    ) -> Result<StepOutcome, EngineError> {
        let timeout = match &step.action {
            // A wait may legitimately need longer than the default step budget
            StepAction::Wait { timeout_ms, .. } => {
                self.config.step_timeout().max(Duration::from_millis(*timeout_ms))
            }
            _ => self.config.step_timeout(),
        };
        let config = &self.config;
        let session = self.session.as_mut().ok_or(EngineError::NotStarted)?;

        let id = session.next_id;
        session.next_id += 1;
        debug!("Executing step {}: {}", step.id, step.action.label());

        let result = async {
            session
                .send(serde_json::json!({
                    "id": id,
                    "op": "step",
                    "stepId": step.id,
                    "code": action_to_js(&step.action),
                }))
                .await?;
            session.reply_to(id, timeout, config, Some(frames)).await
        }
        .await;

        match result {
            Ok(reply) => reply.into_outcome(),
            Err(e) => {
                // The driver is in an unknown state; later steps are skipped anyway
                self.discard_session().await;
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> Result<Artifacts, EngineError> {
        let Some(mut session) = self.session.take() else {
            return Ok(Artifacts::default());
        };
        let id = session.next_id;
        let timeout = self.config.launch_timeout();

        let closed = match session.send(serde_json::json!({ "id": id, "op": "close" })).await {
            Ok(()) => session.reply_to(id, timeout, &self.config, None).await,
            Err(e) => Err(e),
        };

        match tokio::time::timeout(timeout, session.child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!("Driver for run {} exited with {}", session.run_id, status),
            _ => {}
        }
        let run_id = session.run_id.clone();
        session.kill().await;

        let reply = closed?;
        if reply.ok == Some(false) {
            warn!(
                "Driver for run {} failed to save artifacts: {}",
                run_id,
                reply.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(Artifacts {
            video: reply.video.map(|file| self.config.artifact_url(&run_id, &file)),
            trace: reply.trace.map(|file| self.config.artifact_url(&run_id, &file)),
        })
    }

    async fn shutdown(&mut self) {
        self.discard_session().await;
    }
}

/// JSON string literal, which is also a valid JavaScript string literal
fn js_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Convert a step action to the body of the driver's step function.
/// In scope: `page`, `expect`, `shot(fullPage)` and `resolve(url)`.
pub fn action_to_js(action: &StepAction) -> String {
    match action {
        StepAction::Navigate {
            url,
            wait_for_selector,
        } => {
            let mut code = format!("await page.goto(resolve({}));", js_str(url));
            if let Some(selector) = wait_for_selector {
                code.push_str(&format!("\nawait page.waitForSelector({});", js_str(selector)));
            }
            code
        }
        StepAction::Click {
            selector,
            timeout_ms,
        } => format!(
            "await page.click({}, {{ timeout: {} }});",
            js_str(selector),
            timeout_ms.unwrap_or(5000)
        ),
        StepAction::Fill { selector, value } => {
            format!("await page.fill({}, {});", js_str(selector), js_str(value))
        }
        StepAction::Type {
            selector,
            text,
            delay_ms,
        } => format!(
            "await page.type({}, {}, {{ delay: {} }});",
            js_str(selector),
            js_str(text),
            delay_ms.unwrap_or(50)
        ),
        StepAction::Press { selector, key } => match selector {
            Some(selector) => format!(
                "await page.locator({}).press({});",
                js_str(selector),
                js_str(key)
            ),
            None => format!("await page.keyboard.press({});", js_str(key)),
        },
        StepAction::Wait {
            selector,
            timeout_ms,
            state,
        } => format!(
            "await page.waitForSelector({}, {{ state: '{}', timeout: {} }});",
            js_str(selector),
            state.as_str(),
            timeout_ms
        ),
        StepAction::Sleep { ms } => format!("await page.waitForTimeout({});", ms),
        StepAction::Assert {
            selector,
            visible,
            text,
            text_contains,
            count,
        } => {
            let locator = format!("page.locator({})", js_str(selector));
            let mut assertions = Vec::new();
            match visible {
                Some(true) => assertions.push(format!("await expect({}).toBeVisible();", locator)),
                Some(false) => assertions.push(format!("await expect({}).toBeHidden();", locator)),
                None => {}
            }
            if let Some(text) = text {
                assertions.push(format!(
                    "await expect({}).toHaveText({});",
                    locator,
                    js_str(text)
                ));
            }
            if let Some(fragment) = text_contains {
                assertions.push(format!(
                    "await expect({}).toContainText({});",
                    locator,
                    js_str(fragment)
                ));
            }
            if let Some(count) = count {
                assertions.push(format!("await expect({}).toHaveCount({});", locator, count));
            }
            if assertions.is_empty() {
                assertions.push(format!("await expect({}).toBeAttached();", locator));
            }
            assertions.join("\n")
        }
        StepAction::Screenshot { full_page } => format!("await shot({});", full_page),
        StepAction::Hover { selector } => format!("await page.hover({});", js_str(selector)),
        StepAction::Select { selector, value } => format!(
            "await page.selectOption({}, {});",
            js_str(selector),
            js_str(value)
        ),
        StepAction::Check { selector } => format!("await page.check({});", js_str(selector)),
        StepAction::Uncheck { selector } => format!("await page.uncheck({});", js_str(selector)),
        StepAction::Evaluate { script } => format!("await page.evaluate({});", js_str(script)),
    }
}

const DRIVER_TEMPLATE: &str = r#"
const fs = require('fs');
const path = require('path');
const readline = require('readline');
const { chromium, firefox, webkit, expect } = require('@playwright/test');

const config = __CONFIG__;
const browsers = { chromium, firefox, webkit };
const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;

function send(message) {
  process.stdout.write(JSON.stringify(message) + '\n');
}

function resolve(url) {
  return config.baseUrl ? new URL(url, config.baseUrl).toString() : url;
}

function isAssertion(error) {
  return error.name === 'AssertionError' || error.matcherResult !== undefined;
}

(async () => {
  fs.mkdirSync(config.runDir, { recursive: true });
  const browser = await browsers[config.browser].launch({ headless: config.headless });
  const viewport = { width: config.viewportWidth, height: config.viewportHeight };
  const context = await browser.newContext({
    viewport,
    recordVideo: config.recordVideo ? { dir: config.runDir, size: viewport } : undefined,
  });
  if (config.recordTrace) {
    await context.tracing.start({ screenshots: true, snapshots: true });
  }
  const page = await context.newPage();
  let shots = 0;

  const lines = readline.createInterface({ input: process.stdin });
  send({ ready: true });

  for await (const line of lines) {
    if (!line.trim()) continue;
    const command = JSON.parse(line);

    if (command.op === 'close') {
      const reply = { id: command.id, ok: true };
      try {
        if (config.recordTrace) {
          await context.tracing.stop({ path: path.join(config.runDir, 'trace.zip') });
          reply.trace = 'trace.zip';
        }
        const video = page.video();
        await context.close();
        if (video) {
          await video.saveAs(path.join(config.runDir, 'video.webm'));
          await video.delete();
          reply.video = 'video.webm';
        }
      } catch (error) {
        Object.assign(reply, { ok: false, kind: 'error', error: error.message, stack: error.stack });
      }
      await browser.close();
      send(reply);
      break;
    }

    const shot = async (fullPage) => {
      shots += 1;
      const file = `${command.stepId}-${shots}.png`;
      await page.screenshot({ path: path.join(config.runDir, file), fullPage: !!fullPage });
      send({ id: command.id, frame: file });
    };

    try {
      const step = new AsyncFunction('page', 'expect', 'shot', 'resolve', command.code);
      await step(page, expect, shot, resolve);
      if (config.screenshotEveryStep) await shot(false);
      send({ id: command.id, ok: true });
    } catch (error) {
      const kind = isAssertion(error) ? 'assertion' : 'error';
      if (kind === 'assertion' && config.screenshotEveryStep) {
        try { await shot(false); } catch (_) {}
      }
      send({ id: command.id, ok: false, kind, error: error.message, stack: error.stack });
    }
  }
  process.exit(0);
})().catch((error) => {
  send({ fatal: true, ok: false, kind: 'error', error: error.message, stack: error.stack });
  process.exit(1);
});
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use runcast_common::WaitState;

    fn job() -> Job {
        Job {
            run_id: "run-1".into(),
            scenario_id: "login".into(),
            base_url: Some("http://app.local".into()),
            steps: Vec::new(),
            attempt: 1,
        }
    }

    #[test]
    fn test_actions_escape_user_strings() {
        let code = action_to_js(&StepAction::Fill {
            selector: "input[name='user']".into(),
            value: "it's \"quoted\"\n".into(),
        });
        assert_eq!(
            code,
            r#"await page.fill("input[name='user']", "it's \"quoted\"\n");"#
        );
    }

    #[test]
    fn test_navigate_resolves_against_base_url() {
        let code = action_to_js(&StepAction::Navigate {
            url: "/login".into(),
            wait_for_selector: Some("#form".into()),
        });
        assert!(code.starts_with(r#"await page.goto(resolve("/login"));"#));
        assert!(code.contains(r##"waitForSelector("#form")"##));
    }

    #[test]
    fn test_assert_builds_one_expectation_per_check() {
        let code = action_to_js(&StepAction::Assert {
            selector: ".banner".into(),
            visible: Some(true),
            text: None,
            text_contains: Some("Welcome".into()),
            count: Some(1),
        });
        assert_eq!(code.lines().count(), 3);
        assert!(code.contains("toBeVisible()"));
        assert!(code.contains(r#"toContainText("Welcome")"#));
        assert!(code.contains("toHaveCount(1)"));

        let wait = action_to_js(&StepAction::Wait {
            selector: "#app".into(),
            timeout_ms: 100,
            state: WaitState::Detached,
        });
        assert!(wait.contains("state: 'detached', timeout: 100"));
    }

    #[test]
    fn test_script_embeds_run_config() {
        let engine = PlaywrightEngine::new(EngineConfig {
            browser: "webkit".into(),
            ..EngineConfig::default()
        });
        let script = engine.build_script(&job(), Path::new("/tmp/artifacts/run-1"));
        assert!(!script.contains("__CONFIG__"));
        assert!(script.contains(r#""browser":"webkit""#));
        assert!(script.contains(r#""baseUrl":"http://app.local""#));
        assert!(script.contains(r#""runDir":"/tmp/artifacts/run-1""#));
    }

    #[test]
    fn test_reply_classification() {
        let ok: DriverReply = serde_json::from_str(r#"{"id":3,"ok":true}"#).unwrap();
        assert_eq!(ok.into_outcome().unwrap(), StepOutcome::passed());

        let failed: DriverReply = serde_json::from_str(
            r#"{"id":3,"ok":false,"kind":"assertion","error":"expected visible","stack":"at x"}"#,
        )
        .unwrap();
        let outcome = failed.into_outcome().unwrap();
        assert_eq!(outcome.status, runcast_common::StepStatus::Failed);
        assert_eq!(outcome.error.unwrap().message, "expected visible");

        let broken: DriverReply =
            serde_json::from_str(r#"{"id":3,"ok":false,"kind":"error","error":"Target closed"}"#)
                .unwrap();
        match broken.into_outcome() {
            Err(EngineError::Script { message, .. }) => assert_eq!(message, "Target closed"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let frame: DriverReply = serde_json::from_str(r#"{"id":3,"frame":"s-1.png"}"#).unwrap();
        assert_eq!(frame.frame.as_deref(), Some("s-1.png"));
        assert_eq!(frame.ok, None);
    }

    #[tokio::test]
    async fn test_missing_node_is_reported() {
        let mut engine = PlaywrightEngine::new(EngineConfig {
            node_binary: "runcast-test-no-such-node".into(),
            ..EngineConfig::default()
        });
        match engine.start(&job()).await {
            Err(EngineError::DriverNotFound(binary)) => {
                assert_eq!(binary, "runcast-test-no-such-node")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(engine.finish().await.unwrap().video.is_none());
    }
}
