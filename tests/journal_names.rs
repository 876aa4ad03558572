// tests/journal_names.rs

//! Property: the journal-name parser recovers (fqname, fork, chunk, uniq,
//! state) exactly when the name matches the breadcrumb grammar.

use proptest::prelude::*;

use martian::journal::parse_journal_name;

fn fqname_strategy() -> impl Strategy<Value = String> {
    // Dotted components like real fqnames: ID.<psid>.<pipeline>.<stage>
    proptest::collection::vec("[A-Za-z][A-Za-z0-9_]{0,8}", 2..5)
        .prop_map(|parts| format!("ID.{}", parts.join(".")))
}

fn state_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("complete".to_string()),
        Just("errors".to_string()),
        Just("assert".to_string()),
        Just("heartbeat".to_string()),
        Just("queued_locally".to_string()),
        Just("log".to_string()),
        Just("split_complete".to_string()),
        Just("join_errors".to_string()),
        Just("progress".to_string()),
    ]
}

proptest! {
    #[test]
    fn parser_recovers_all_components(
        fqname in fqname_strategy(),
        fork in 0usize..1000,
        chunk in proptest::option::of(0usize..1000),
        uniq in proptest::option::of("[a-f0-9]{10}"),
        state in state_strategy(),
    ) {
        let mut name = format!("{fqname}.fork{fork}");
        if let Some(c) = chunk {
            name.push_str(&format!(".chnk{c}"));
        }
        if let Some(u) = &uniq {
            name.push_str(&format!(".u{u}"));
        }
        name.push('.');
        name.push_str(&state);

        let parsed = parse_journal_name(&name).expect("well-formed name must parse");
        prop_assert_eq!(parsed.fqname, fqname);
        prop_assert_eq!(parsed.fork_index, fork);
        prop_assert_eq!(parsed.chunk_index, chunk);
        prop_assert_eq!(parsed.uniquifier, uniq);
        prop_assert_eq!(parsed.state, state);
    }

    #[test]
    fn names_without_fork_never_parse(name in "[A-Za-z][A-Za-z0-9_.]{0,30}") {
        prop_assume!(!name.contains(".fork"));
        prop_assert!(parse_journal_name(&name).is_none());
    }
}
