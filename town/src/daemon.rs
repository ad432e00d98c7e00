//! The heartbeat daemon.
//!
//! `daemon run` is the foreground loop: an exclusive lock on the pid
//! file keeps the daemon singular, then a timer drives dispatch ticks
//! and convoy advancement until SIGTERM/ctrl-c. Agent sessions are
//! deliberately left alone across daemon restarts; they re-sync through
//! the store.
//!
//! `daemon start` re-execs the current binary detached with its output
//! appended to `daemon/daemon.log`.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tracing::{info, warn};

use crate::convoy::advance_convoys;
use crate::events::{self, CHANNEL_DAEMON};
use crate::scheduler::{dispatch_scheduled_work, TickOptions, TickSource};
use crate::Town;

/// Foreground daemon loop. Returns when signalled.
pub async fn run(town: &Town) -> Result<()> {
    let pid_path = town.paths.daemon_pid();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Lock first so a racing start cannot wipe the live daemon's pid.
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&pid_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        bail!("daemon already running (lock on {})", pid_path.display());
    }
    let mut lock_file = lock_file;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;

    let interval = Duration::from_secs(town.config.heartbeat_interval_secs.max(1));
    info!(interval_secs = interval.as_secs(), "daemon up");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                heartbeat(town).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt; daemon stopping");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM; daemon stopping");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&pid_path);
    info!("daemon down");
    Ok(())
}

/// One heartbeat: dispatch tick, convoy advancement, mail drain.
/// Failures are logged, never fatal to the loop.
async fn heartbeat(town: &Town) {
    let tick_town = town.clone();
    let tick = tokio::task::spawn_blocking(move || {
        dispatch_scheduled_work(&tick_town, TickSource::Heartbeat, TickOptions::default())
    })
    .await;
    match tick {
        Ok(Ok(outcome)) => {
            if !outcome.dispatched.is_empty() || !outcome.failed.is_empty() {
                info!(
                    dispatched = outcome.dispatched.len(),
                    failed = outcome.failed.len(),
                    "heartbeat dispatch"
                );
            }
        }
        Ok(Err(e)) => warn!("heartbeat dispatch failed: {e:#}"),
        Err(join) => warn!("heartbeat dispatch panicked: {join}"),
    }

    match advance_convoys(town).await {
        Ok(report) => {
            if !report.advanced.is_empty() || !report.closed.is_empty() {
                info!(
                    advanced = report.advanced.len(),
                    closed = report.closed.len(),
                    "convoy advancement"
                );
            }
        }
        Err(e) => warn!("convoy advancement failed: {e:#}"),
    }

    // Lifecycle mail: consume and log.
    match events::drain(&town.paths, CHANNEL_DAEMON, true) {
        Ok(mail) => {
            for event in mail {
                info!(kind = %event.kind, payload = %event.payload, "daemon mail");
            }
        }
        Err(e) => warn!("daemon mail drain failed: {e:#}"),
    }
}

/// Spawn `gt daemon run` detached, logging to `daemon/daemon.log`.
pub fn start(town: &Town) -> Result<()> {
    if let Some(pid) = running_pid(town) {
        bail!("daemon already running (pid {pid})");
    }

    let log_path = town.paths.daemon_log();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let err = log.try_clone()?;

    let exe = std::env::current_exe().context("locating gt binary")?;
    let child = Command::new(exe)
        .args(["daemon", "run"])
        .current_dir(town.paths.root())
        .env("GT_ROOT", town.paths.root())
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(err)
        .spawn()
        .context("spawning daemon")?;
    info!(pid = child.id(), "daemon started");
    Ok(())
}

/// SIGTERM the recorded daemon, waiting briefly for it to exit.
pub fn stop(town: &Town) -> Result<()> {
    let Some(pid) = running_pid(town) else {
        info!("daemon not running");
        return Ok(());
    };

    let status = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .context("sending SIGTERM")?;
    if !status.success() {
        bail!("kill -TERM {pid} failed");
    }

    for _ in 0..50 {
        if running_pid(town).is_none() {
            info!(pid, "daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("daemon (pid {pid}) did not exit within 5s");
}

/// Pid of the live daemon, if any.
pub fn running_pid(town: &Town) -> Option<u32> {
    let raw = std::fs::read_to_string(town.paths.daemon_pid()).ok()?;
    let pid: u32 = raw.trim().parse().ok()?;
    // Liveness probe; signal 0 delivers nothing.
    let alive = Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    alive.then_some(pid)
}

/// Last `lines` of the daemon log.
pub fn tail_log(town: &Town, lines: usize) -> Result<String> {
    let path = town.paths.daemon_log();
    if !path.is_file() {
        return Ok(String::new());
    }
    let body = std::fs::read_to_string(&path)?;
    let all: Vec<&str> = body.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_town;

    #[test]
    fn test_running_pid_requires_live_process() {
        let (town, _h) = test_town();
        assert_eq!(running_pid(&town), None);

        // Our own pid is definitionally alive.
        let pid_path = town.paths.daemon_pid();
        std::fs::create_dir_all(pid_path.parent().unwrap()).unwrap();
        std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();
        assert_eq!(running_pid(&town), Some(std::process::id()));

        // A stale pid reads as not running.
        std::fs::write(&pid_path, "999999999\n").unwrap();
        assert_eq!(running_pid(&town), None);
    }

    #[test]
    fn test_tail_log() {
        let (town, _h) = test_town();
        assert_eq!(tail_log(&town, 10).unwrap(), "");

        let log = town.paths.daemon_log();
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_log(&town, 2).unwrap(), "c\nd");
    }
}
