//! Property-based invariant tests for container versions and changesets.
//!
//! 1. Every update scope bumps the version by exactly one
//! 2. `changes_since(v)` is the union of the scopes after `v` while the
//!    ledger still covers `v`, and a full reload once it does not
//! 3. `changes_since(current)` is always empty
//! 4. Discarding up to a version turns older requests into full reloads

use std::collections::BTreeSet;

use proptest::prelude::*;
use scanflow_core::{Changeset, Container, ContainerRegistry, INITIAL_VERSION};

// ── Helpers ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Touched {
    rows: BTreeSet<u8>,
    reload: bool,
}

impl Changeset for Touched {
    fn merge(&mut self, later: &Self) {
        self.rows.extend(later.rows.iter().copied());
        self.reload |= later.reload;
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty() && !self.reload
    }

    fn full_reload() -> Self {
        Self {
            rows: BTreeSet::new(),
            reload: true,
        }
    }
}

/// Each scope touches a (possibly empty) set of rows.
fn arb_scopes() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(0u8..16, 0..4), 0..40)
}

fn apply(container: &Container<Vec<u32>, Touched>, scopes: &[Vec<u8>]) {
    for rows in scopes {
        container.update(|state, changes| {
            for &row in rows {
                state[usize::from(row)] += 1;
                changes.rows.insert(row);
            }
        });
    }
}

fn expected_since(scopes: &[Vec<u8>], from: u64) -> BTreeSet<u8> {
    let skip = (from - INITIAL_VERSION) as usize;
    scopes[skip..].iter().flatten().copied().collect()
}

// ═════════════════════════════════════════════════════════════════════
// 1-3. Versions and aggregation
// ═════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn one_bump_per_scope(scopes in arb_scopes()) {
        let registry = ContainerRegistry::new();
        let container: Container<Vec<u32>, Touched> = Container::new(&registry, vec![0; 16]);
        apply(&container, &scopes);
        prop_assert_eq!(container.version(), INITIAL_VERSION + scopes.len() as u64);
        prop_assert!(!container.tracks_changesets());
    }

    #[test]
    fn aggregate_matches_union_within_capacity(
        scopes in arb_scopes(),
        capacity in 1usize..48,
        probe in any::<prop::sample::Index>(),
    ) {
        let registry = ContainerRegistry::new();
        let container: Container<Vec<u32>, Touched> = Container::builder(vec![0; 16])
            .track_changesets()
            .changeset_capacity(capacity)
            .register(&registry);
        apply(&container, &scopes);

        let head = container.version();
        let from = INITIAL_VERSION + probe.index(scopes.len() + 1) as u64;
        let changes = container.changes_since(from);
        let retained = scopes.len().min(capacity) as u64;

        if from == head {
            prop_assert!(changes.is_empty());
        } else if head - from <= retained {
            prop_assert!(!changes.reload);
            prop_assert_eq!(changes.rows, expected_since(&scopes, from));
        } else {
            prop_assert_eq!(changes, Touched::full_reload());
        }
        prop_assert!(container.changes_since(head).is_empty());
        prop_assert!(container.changes_since(0).reload);
    }
}

// ═════════════════════════════════════════════════════════════════════
// 4. Discarding
// ═════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn discard_raises_the_floor(
        scopes in proptest::collection::vec(proptest::collection::vec(0u8..16, 1..4), 2..20),
        cut in any::<prop::sample::Index>(),
    ) {
        let registry = ContainerRegistry::new();
        let container: Container<Vec<u32>, Touched> = Container::builder(vec![0; 16])
            .track_changesets()
            .register(&registry);
        apply(&container, &scopes);

        let cut_at = INITIAL_VERSION + cut.index(scopes.len()) as u64;
        container.discard_changes_before(cut_at);

        if cut_at > INITIAL_VERSION {
            prop_assert!(container.changes_since(cut_at - 1).reload);
        }
        let after = container.changes_since(cut_at);
        prop_assert!(!after.reload);
        prop_assert_eq!(after.rows, expected_since(&scopes, cut_at));
        prop_assert_eq!(
            container.with_ledger(|ledger| ledger.floor()),
            Some(cut_at)
        );
    }
}
