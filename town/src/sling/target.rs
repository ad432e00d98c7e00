//! Sling target resolution.
//!
//! ```text
//! .                      → self
//! <rig>                  → fresh polecat, spawned after validation
//! <rig>/polecats/<name>  → existing polecat; dead session re-spawns
//! <rig>/crew/<name>      → persistent worker; session auto-starts
//! deacon/dogs[/<name>]   → helper pool; unnamed picks an idle dog
//! anything else          → must have a live session
//! ```
//!
//! Spawns are deferred: resolution only decides; no session is created
//! until the work has validated.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};

use crate::beads::{BeadFilter, BeadStore, BeadType};
use crate::hook::HOOK_SLOT;
use crate::identity::{self, Address, Role};
use crate::session::Multiplexer;
use crate::Town;

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh polecat name, unique within this process.
pub fn mint_polecat_name() -> String {
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("p{}-{}", std::process::id(), seq)
}

/// What sling resolved the target to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    /// A live agent; no session work needed.
    Existing(Address),
    /// Spawn a polecat (fresh, or re-spawn of a dead one) after the work
    /// validates.
    SpawnPolecat(Address),
    /// A persistent worker whose session must be auto-started.
    StartSession(Address),
}

impl ResolvedTarget {
    pub fn address(&self) -> &Address {
        match self {
            ResolvedTarget::Existing(a)
            | ResolvedTarget::SpawnPolecat(a)
            | ResolvedTarget::StartSession(a) => a,
        }
    }

    pub fn needs_spawn(&self) -> bool {
        !matches!(self, ResolvedTarget::Existing(_))
    }
}

pub fn resolve_target(town: &Town, raw: Option<&str>) -> Result<ResolvedTarget> {
    let raw = raw.unwrap_or(".").trim();

    if raw == "." {
        return Ok(ResolvedTarget::Existing(identity::self_address()));
    }

    // A bare rig name means "spawn me a polecat there".
    if town.config.is_rig(raw) {
        return Ok(ResolvedTarget::SpawnPolecat(Address::polecat(
            raw,
            &mint_polecat_name(),
        )));
    }

    let addr: Address = raw
        .parse()
        .map_err(|e| anyhow::anyhow!("cannot resolve target {raw:?}: {e}"))?;

    // Dogs carry `deacon` in the rig slot; only real rigs get checked.
    if addr.role != Role::Dog {
        if let Some(rig) = &addr.rig {
            if !town.config.is_rig(rig) {
                bail!("unknown rig {rig:?} in target {raw:?}");
            }
        }
    }

    match addr.role {
        Role::Polecat => {
            if town.mux.has_session(&addr.session_name())? {
                Ok(ResolvedTarget::Existing(addr))
            } else {
                // Dead polecat: re-spawn under the same name.
                Ok(ResolvedTarget::SpawnPolecat(addr))
            }
        }
        Role::Crew => {
            if town.mux.has_session(&addr.session_name())? {
                Ok(ResolvedTarget::Existing(addr))
            } else {
                Ok(ResolvedTarget::StartSession(addr))
            }
        }
        Role::Dog => {
            let addr = match addr.name {
                Some(_) => addr,
                None => pick_idle_dog(town)?,
            };
            if town.mux.has_session(&addr.session_name())? {
                Ok(ResolvedTarget::Existing(addr))
            } else {
                Ok(ResolvedTarget::StartSession(addr))
            }
        }
        _ => {
            if town.mux.has_session(&addr.session_name())? {
                Ok(ResolvedTarget::Existing(addr))
            } else {
                bail!("no live session for {addr}");
            }
        }
    }
}

/// Pool dispatch: first dog without an active hook, else a fresh name.
fn pick_idle_dog(town: &Town) -> Result<Address> {
    let dogs = town.store.list(&BeadFilter {
        bead_type: Some(BeadType::Agent),
        ..Default::default()
    })?;
    for bead in dogs {
        let Some(name) = bead.id.strip_prefix("hq-agent-deacon-dogs-") else {
            continue;
        };
        if bead.is_closed() {
            continue;
        }
        if town.store.slot_get(&bead.id, HOOK_SLOT)?.is_none() {
            return Ok(Address::dog(name));
        }
    }
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(Address::dog(&format!("dog-{seq}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_town;

    #[test]
    fn test_dot_is_self() {
        let (town, _tmp) = test_town();
        let resolved = resolve_target(&town, Some(".")).unwrap();
        assert_eq!(resolved, ResolvedTarget::Existing(Address::mayor()));
    }

    #[test]
    fn test_bare_rig_spawns_fresh_polecat() {
        let (town, _tmp) = test_town();
        let resolved = resolve_target(&town, Some("gastown")).unwrap();
        match resolved {
            ResolvedTarget::SpawnPolecat(addr) => {
                assert_eq!(addr.rig.as_deref(), Some("gastown"));
                assert_eq!(addr.role, Role::Polecat);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_dead_polecat_respawns_live_one_reused() {
        let (town, _tmp) = test_town();
        let resolved = resolve_target(&town, Some("gastown/polecats/nux")).unwrap();
        assert_eq!(
            resolved,
            ResolvedTarget::SpawnPolecat(Address::polecat("gastown", "nux"))
        );

        town.mux
            .start_session(
                "gt-gastown-polecats-nux",
                std::path::Path::new("/tmp"),
                &[],
                "claude",
            )
            .unwrap();
        let resolved = resolve_target(&town, Some("gastown/polecats/nux")).unwrap();
        assert_eq!(
            resolved,
            ResolvedTarget::Existing(Address::polecat("gastown", "nux"))
        );
    }

    #[test]
    fn test_crew_auto_starts() {
        let (town, _tmp) = test_town();
        let resolved = resolve_target(&town, Some("gastown/crew/organic")).unwrap();
        assert_eq!(
            resolved,
            ResolvedTarget::StartSession(Address::crew("gastown", "organic"))
        );
    }

    #[test]
    fn test_unknown_rig_rejected() {
        let (town, _tmp) = test_town();
        assert!(resolve_target(&town, Some("nowhere/crew/bob")).is_err());
        assert!(resolve_target(&town, Some("nowhere")).is_err());
    }

    #[test]
    fn test_singleton_requires_live_session() {
        let (town, _tmp) = test_town();
        assert!(resolve_target(&town, Some("gastown/witness")).is_err());
        town.mux
            .start_session("gt-gastown-witness", std::path::Path::new("/tmp"), &[], "claude")
            .unwrap();
        assert_eq!(
            resolve_target(&town, Some("gastown/witness")).unwrap(),
            ResolvedTarget::Existing(Address::witness("gastown"))
        );
    }
}
