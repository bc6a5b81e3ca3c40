//! Property tests for artifact references.
//!
//! References are `<run id>_<type>_<hash>` and run ids themselves contain
//! underscores and hyphens, so parsing works right to left. These properties
//! pin that down:
//! 1. Parsing inverts formatting for every kind and any generated run id
//! 2. Malformed tails (non-hex hashes, unknown type labels) are rejected
//! 3. Whatever the store saves, it can resolve and read back verbatim

use chrono::{Duration, NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use tempfile::TempDir;

use paramlab_core::{RunId, SpecHash};
use paramlab_runner::{ArtifactKind, ArtifactRef, ArtifactStore};

// ── Strategies (proptest) ────────────────────────────────────────────

fn base_instant() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn arb_kind() -> impl Strategy<Value = ArtifactKind> {
    (0..ArtifactKind::ALL.len()).prop_map(|i| ArtifactKind::ALL[i])
}

/// Run ids generated the way the queue generates them, across every
/// pipeline label (several of which carry underscores).
fn arb_run_id() -> impl Strategy<Value = RunId> {
    let labels = ["grid_search", "walk_forward", "monte_carlo", "portfolio", "regime"];
    (0..labels.len(), "[0-9a-f]{8,40}", 0i64..100_000_000)
        .prop_map(move |(i, spec_hash, offset)| {
            let at = base_instant() + Duration::seconds(offset);
            RunId::generate(labels[i], &SpecHash(spec_hash), at)
        })
}

// ── 1. Parse Inverts Format ──────────────────────────────────────────

proptest! {
    #[test]
    fn parse_inverts_the_reference_format(
        run_id in arb_run_id(),
        kind in arb_kind(),
        hash in "[0-9a-f]{6,16}",
    ) {
        let reference = format!("{run_id}_{}_{hash}", kind.label());
        let (parsed_run, parsed_kind, parsed_hash) = ArtifactRef::parse(&reference).unwrap();
        prop_assert_eq!(parsed_run, run_id);
        prop_assert_eq!(parsed_kind, kind);
        prop_assert_eq!(parsed_hash, hash.as_str());
    }

    #[test]
    fn parse_rejects_a_non_hex_tail(
        run_id in arb_run_id(),
        kind in arb_kind(),
        tail in "[g-z]{1,10}",
    ) {
        let reference = format!("{run_id}_{}_{tail}", kind.label());
        prop_assert!(ArtifactRef::parse(&reference).is_err());
    }

    #[test]
    fn parse_rejects_an_unknown_type_label(
        run_id in arb_run_id(),
        label in "[a-z]{3,12}",
        hash in "[0-9a-f]{6,16}",
    ) {
        prop_assume!(label.parse::<ArtifactKind>().is_err());
        let reference = format!("{run_id}_{label}_{hash}");
        prop_assert!(ArtifactRef::parse(&reference).is_err());
    }
}

// ── 2. Store Round Trip ──────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn saved_artifacts_resolve_and_round_trip(
        run_id in arb_run_id(),
        kind in arb_kind(),
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();

        let artifact = store.save_bytes(&run_id, kind, &bytes).unwrap();
        prop_assert_eq!(artifact.kind, kind);
        prop_assert!(store.exists(&artifact.reference));

        let (parsed_run, parsed_kind, _) = ArtifactRef::parse(&artifact.reference).unwrap();
        prop_assert_eq!(parsed_run, run_id);
        prop_assert_eq!(parsed_kind, kind);
        prop_assert_eq!(store.load_bytes(&artifact.reference).unwrap(), bytes);
    }
}
