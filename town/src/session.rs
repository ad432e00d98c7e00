//! Terminal-multiplexer backend.
//!
//! Agents live in tmux sessions named `gt-<rig>-<role>[-<name>]`. The
//! backend shells out to `tmux`; every invocation carries a timeout so a
//! wedged tmux server cannot hang a dispatch tick. Text injection is
//! two-phase — literal keys first, then a separate Enter — because a
//! combined send drops the newline on slow panes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Default timeout for short tmux reads.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on waiting for a freshly started agent to come up.
pub const AGENT_START_TIMEOUT: Duration = Duration::from_secs(30);

/// Env var selecting the recording stub backend.
pub const TEST_MUX_ENV: &str = "GT_TEST_MUX";

/// Abstraction over the terminal multiplexer.
pub trait Multiplexer: Send + Sync {
    fn has_session(&self, name: &str) -> Result<bool>;
    fn list_sessions(&self) -> Result<Vec<String>>;
    fn start_session(
        &self,
        name: &str,
        cwd: &std::path::Path,
        env: &[(String, String)],
        command: &str,
    ) -> Result<()>;
    fn kill_session(&self, name: &str) -> Result<()>;
    /// Send literal text (no key interpretation).
    fn send_keys(&self, name: &str, text: &str) -> Result<()>;
    /// Send a bare Enter keypress.
    fn send_enter(&self, name: &str) -> Result<()>;
    /// Send an interrupt (C-c) to the pane.
    fn send_interrupt(&self, name: &str) -> Result<()>;
    fn get_pane_workdir(&self, name: &str) -> Result<PathBuf>;
    /// The command currently running in the session's active pane.
    fn current_command(&self, name: &str) -> Result<String>;
}

/// Run a command to completion, killing it at the deadline. Shared by
/// every subprocess bridge in the crate.
pub(crate) fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<std::process::Output> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let program = format!("{:?}", cmd.get_program());
    let mut child = cmd.spawn().with_context(|| format!("failed to spawn {program}"))?;
    let deadline = Instant::now() + timeout;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(child.wait_with_output()?);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            bail!("{program} timed out after {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// The real tmux backend.
pub struct TmuxBackend;

impl TmuxBackend {
    fn tmux(&self, args: &[&str], timeout: Duration) -> Result<std::process::Output> {
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        debug!(?args, "tmux");
        run_with_timeout(cmd, timeout)
    }

    fn tmux_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.tmux(args, SUBPROCESS_TIMEOUT)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux {} failed: {}", args.first().unwrap_or(&"?"), stderr.trim());
        }
        Ok(())
    }

    fn display(&self, name: &str, format: &str) -> Result<String> {
        let target = format!("={name}");
        let output = self.tmux(
            &["display-message", "-p", "-t", &target, format],
            SUBPROCESS_TIMEOUT,
        )?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("tmux display-message failed for {name}: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Multiplexer for TmuxBackend {
    fn has_session(&self, name: &str) -> Result<bool> {
        let target = format!("={name}");
        let output = self.tmux(&["has-session", "-t", &target], SUBPROCESS_TIMEOUT)?;
        Ok(output.status.success())
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self.tmux(
            &["list-sessions", "-F", "#{session_name}"],
            SUBPROCESS_TIMEOUT,
        )?;
        if !output.status.success() {
            // No server running means no sessions, not an error.
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("No such file") {
                return Ok(Vec::new());
            }
            bail!("tmux list-sessions failed: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect())
    }

    fn start_session(
        &self,
        name: &str,
        cwd: &std::path::Path,
        env: &[(String, String)],
        command: &str,
    ) -> Result<()> {
        let cwd_s = cwd.display().to_string();
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            name.into(),
            "-c".into(),
            cwd_s,
        ];
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(command.into());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tmux_ok(&arg_refs)
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let target = format!("={name}");
        self.tmux_ok(&["kill-session", "-t", &target])
    }

    fn send_keys(&self, name: &str, text: &str) -> Result<()> {
        let target = format!("={name}");
        self.tmux_ok(&["send-keys", "-t", &target, "-l", text])
    }

    fn send_enter(&self, name: &str) -> Result<()> {
        let target = format!("={name}");
        self.tmux_ok(&["send-keys", "-t", &target, "Enter"])
    }

    fn send_interrupt(&self, name: &str) -> Result<()> {
        let target = format!("={name}");
        self.tmux_ok(&["send-keys", "-t", &target, "C-c"])
    }

    fn get_pane_workdir(&self, name: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(self.display(name, "#{pane_current_path}")?))
    }

    fn current_command(&self, name: &str) -> Result<String> {
        self.display(name, "#{pane_current_command}")
    }
}

/// Block until the session's pane has moved from a shell to the agent
/// process, bounded by `timeout`.
pub fn wait_for_agent_ready(mux: &dyn Multiplexer, name: &str, timeout: Duration) -> Result<()> {
    const SHELLS: &[&str] = &["bash", "zsh", "sh", "fish", "dash"];
    let deadline = Instant::now() + timeout;
    loop {
        let command = mux.current_command(name)?;
        if !command.is_empty() && !SHELLS.contains(&command.as_str()) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("session {name} still at a shell after {timeout:?}");
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}

// ---------------------------------------------------------------------------
// StubMux: recording stub for tests
// ---------------------------------------------------------------------------

/// Recording multiplexer stub (`GT_TEST_MUX=stub`). Sessions live in a
/// set; sends are recorded for assertions.
#[derive(Default)]
pub struct StubMux {
    sessions: Mutex<BTreeSet<String>>,
    sent: Mutex<Vec<(String, String)>>,
    killed: Mutex<Vec<String>>,
    command: Mutex<String>,
}

impl StubMux {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            command: Mutex::new("claude".to_string()),
        }
    }

    pub fn with_session(self, name: &str) -> Self {
        self.sessions.lock().unwrap().insert(name.to_string());
        self
    }

    /// What `current_command` reports for every session.
    pub fn set_current_command(&self, command: &str) {
        *self.command.lock().unwrap() = command.to_string();
    }

    /// All `(session, text)` pairs sent so far, Enter recorded as `"<Enter>"`.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn live_sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().iter().cloned().collect()
    }
}

impl Multiplexer for StubMux {
    fn has_session(&self, name: &str) -> Result<bool> {
        Ok(self.sessions.lock().unwrap().contains(name))
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.live_sessions())
    }

    fn start_session(
        &self,
        name: &str,
        _cwd: &std::path::Path,
        _env: &[(String, String)],
        _command: &str,
    ) -> Result<()> {
        self.sessions.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        self.sessions.lock().unwrap().remove(name);
        self.killed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn send_keys(&self, name: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), text.to_string()));
        Ok(())
    }

    fn send_enter(&self, name: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), "<Enter>".to_string()));
        Ok(())
    }

    fn send_interrupt(&self, name: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), "<C-c>".to_string()));
        Ok(())
    }

    fn get_pane_workdir(&self, _name: &str) -> Result<PathBuf> {
        Ok(PathBuf::from("/tmp"))
    }

    fn current_command(&self, _name: &str) -> Result<String> {
        Ok(self.command.lock().unwrap().clone())
    }
}
