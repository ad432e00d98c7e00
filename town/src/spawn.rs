//! Agent session spawning.
//!
//! A spawn is two writes and a session start: ensure the agent's record
//! bead exists, stamp its hook slot when the spawn carries work (so the
//! agent can never read its own record pre-hook), then start the tmux
//! session with the identity environment set.

use anyhow::{Context, Result};
use tracing::info;

use crate::beads::BeadStore;
use crate::hook::{ensure_agent_bead, HOOK_SLOT};
use crate::identity::{Address, Role, POLECAT_ENV, SELF_ENV};
use crate::session::Multiplexer;
use crate::Town;

/// Default command run inside fresh agent sessions.
pub fn default_agent_command() -> String {
    std::env::var("GT_AGENT_CMD").unwrap_or_else(|_| "claude".into())
}

#[derive(Debug, Default)]
pub struct SpawnOptions<'a> {
    /// Work to stamp on the agent record before the session starts.
    pub hook_bead: Option<&'a str>,
    /// Agent command override.
    pub agent_type: Option<&'a str>,
    pub account: Option<&'a str>,
}

pub fn spawn_agent(town: &Town, addr: &Address, opts: &SpawnOptions<'_>) -> Result<()> {
    let record = ensure_agent_bead(town.store.as_ref(), addr)?;
    if let Some(work) = opts.hook_bead {
        town.store
            .slot_set(&record.id, HOOK_SLOT, work)
            .with_context(|| format!("stamping hook on {}", record.id))?;
    }

    let cwd = addr
        .rig
        .as_deref()
        .and_then(|rig| town.config.rig_path(town.paths.root(), rig))
        .unwrap_or_else(|| town.paths.root().to_path_buf());

    let mut env = vec![
        ("GT_ROOT".to_string(), town.paths.root().display().to_string()),
        (SELF_ENV.to_string(), addr.to_string()),
    ];
    if addr.role == Role::Polecat {
        env.push((POLECAT_ENV.to_string(), "1".to_string()));
    }
    if let Some(account) = opts.account {
        env.push(("GT_ACCOUNT".to_string(), account.to_string()));
    }

    let command = opts
        .agent_type
        .map(String::from)
        .unwrap_or_else(default_agent_command);

    town.mux
        .start_session(&addr.session_name(), &cwd, &env, &command)
        .with_context(|| format!("starting session for {addr}"))?;
    info!(agent = %addr, session = %addr.session_name(), hook = ?opts.hook_bead, "spawned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::BeadStore;
    use crate::testing::test_town;

    #[test]
    fn test_spawn_stamps_hook_before_session() {
        let (town, h) = test_town();
        h.store.put(crate::beads::task("gt-1", "work"));
        let addr = Address::polecat("gastown", "nux");

        spawn_agent(&town, &addr, &SpawnOptions { hook_bead: Some("gt-1"), ..Default::default() })
            .unwrap();

        assert_eq!(
            h.store.slot_get(&addr.agent_bead_id(), HOOK_SLOT).unwrap(),
            Some("gt-1".to_string())
        );
        assert!(h.mux.live_sessions().contains(&"gt-gastown-polecats-nux".to_string()));
    }

    #[test]
    fn test_spawn_without_work_leaves_slot_empty() {
        let (town, h) = test_town();
        let addr = Address::crew("gastown", "organic");
        spawn_agent(&town, &addr, &SpawnOptions::default()).unwrap();
        assert_eq!(h.store.slot_get(&addr.agent_bead_id(), HOOK_SLOT).unwrap(), None);
    }
}
