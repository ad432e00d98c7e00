//! Escalating agent recovery.
//!
//! Three rungs: interrupt (poke the pane), soft (interrupt plus a
//! re-nudge of the current hook), force (kill the session, respawn with
//! the hook pre-stamped, re-nudge). The hook itself is never dropped by
//! recovery; the work stays attached throughout.

use anyhow::{bail, Result};
use tracing::{info, warn};

use crate::hook::get_hook;
use crate::identity::Address;
use crate::session::Multiplexer;
use crate::spawn::{spawn_agent, SpawnOptions};
use crate::Town;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverMode {
    /// Send an interrupt to the pane.
    Interrupt,
    /// Interrupt, then re-nudge the current hook.
    Soft,
    /// Kill and respawn the session, then re-nudge.
    Force,
}

#[derive(Debug)]
pub struct RecoverReport {
    pub target: Address,
    pub mode: RecoverMode,
    pub hook: Option<String>,
    pub respawned: bool,
}

pub fn recover(town: &Town, target: &str, mode: RecoverMode) -> Result<RecoverReport> {
    let addr: Address = target
        .parse()
        .map_err(|e| anyhow::anyhow!("bad recovery target {target:?}: {e}"))?;
    let session = addr.session_name();
    let hook = get_hook(town.store.as_ref(), &addr)?;

    let mut respawned = false;
    match mode {
        RecoverMode::Interrupt => {
            if !town.mux.has_session(&session)? {
                bail!("no session {session} to interrupt; try --force");
            }
            town.mux.send_interrupt(&session)?;
            info!(agent = %addr, "interrupted");
        }
        RecoverMode::Soft => {
            if !town.mux.has_session(&session)? {
                bail!("no session {session} to reset; try --force");
            }
            town.mux.send_interrupt(&session)?;
            renudge(town, &session, &addr, hook.as_deref());
            info!(agent = %addr, "soft reset");
        }
        RecoverMode::Force => {
            if town.mux.has_session(&session)? {
                town.mux.kill_session(&session)?;
            }
            spawn_agent(
                town,
                &addr,
                &SpawnOptions { hook_bead: hook.as_deref(), ..Default::default() },
            )?;
            respawned = true;
            renudge(town, &session, &addr, hook.as_deref());
            info!(agent = %addr, hook = ?hook, "killed and respawned");
        }
    }

    Ok(RecoverReport { target: addr, mode, hook, respawned })
}

fn renudge(town: &Town, session: &str, addr: &Address, hook: Option<&str>) {
    let Some(work) = hook else { return };
    let prompt = format!("You are {addr}. Resume your hook {work}; run `gt hook` for details.");
    if let Err(e) = town
        .mux
        .send_keys(session, &prompt)
        .and_then(|_| town.mux.send_enter(session))
    {
        warn!(session, "re-nudge failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::task;
    use crate::hook::{hook, HookPolicy};
    use crate::testing::test_town;

    #[test]
    fn test_interrupt_requires_session() {
        let (town, _h) = test_town();
        assert!(recover(&town, "gastown/polecats/nux", RecoverMode::Interrupt).is_err());
    }

    #[test]
    fn test_force_respawns_with_hook_preserved() {
        let (town, h) = test_town();
        h.store.put(task("gt-1", "work"));
        let addr = Address::polecat("gastown", "nux");
        hook(h.store.as_ref(), h.mux.as_ref(), &addr, "gt-1", HookPolicy::Default, false).unwrap();

        let report = recover(&town, "gastown/polecats/nux", RecoverMode::Force).unwrap();
        assert!(report.respawned);
        assert_eq!(report.hook, Some("gt-1".to_string()));
        assert!(h.mux.live_sessions().contains(&"gt-gastown-polecats-nux".to_string()));
        // The re-nudge mentions the hook.
        assert!(h.mux.sent().iter().any(|(_, text)| text.contains("gt-1")));
    }

    #[test]
    fn test_soft_interrupts_then_renudges() {
        let (town, h) = test_town();
        h.store.put(task("gt-1", "work"));
        let addr = Address::polecat("gastown", "nux");
        hook(h.store.as_ref(), h.mux.as_ref(), &addr, "gt-1", HookPolicy::Default, false).unwrap();
        h.mux
            .start_session(&addr.session_name(), std::path::Path::new("/tmp"), &[], "claude")
            .unwrap();

        recover(&town, "gastown/polecats/nux", RecoverMode::Soft).unwrap();
        let sent = h.mux.sent();
        assert_eq!(sent[0].1, "<C-c>");
        assert!(sent.iter().any(|(_, t)| t.contains("Resume your hook gt-1")));
    }
}
