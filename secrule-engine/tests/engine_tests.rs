//! End-to-end tests for the rule engine
//!
//! Each scenario drives a full transaction through the host-facing API:
//! rule-set compilation, request line and header extraction, body
//! processing, and the per-phase verdicts.

use std::cell::RefCell;
use std::rc::Rc;

use secrule_engine::transaction::{HeaderFind, HeaderTraverse, LogCallback, Transaction};
use secrule_engine::{Engine, Variant};

fn engine_with(rules: &str) -> Engine {
    let mut engine = Engine::new("error", None);
    engine.load(rules).expect("rules should load");
    engine.init().expect("init should succeed");
    engine
}

fn header_find<'t>(headers: &'t [(String, String)]) -> HeaderFind<'t> {
    Box::new(move |key: &str| {
        headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    })
}

fn header_traverse<'t>(headers: &'t [(String, String)]) -> HeaderTraverse<'t> {
    Box::new(move |visit: &mut dyn FnMut(&str, &str) -> bool| {
        for (name, value) in headers {
            if !visit(name, value) {
                break;
            }
        }
    })
}

fn log_recorder<'t>(hits: &Rc<RefCell<Vec<u64>>>) -> LogCallback<'t> {
    let hits = Rc::clone(hits);
    Box::new(move |rule| hits.borrow_mut().push(rule.id))
}

/// Run phases 1 and 2 for a request, returning the phase results.
fn run_request<'t>(
    txn: &mut Transaction<'t>,
    headers: &'t [(String, String)],
    body: &'t [u8],
    hits: &Rc<RefCell<Vec<u64>>>,
) -> (bool, bool) {
    let phase1 = txn.process_request_headers(
        header_find(headers),
        header_traverse(headers),
        headers.len(),
        log_recorder(hits),
    );
    if !phase1 {
        return (false, true);
    }
    let phase2 = txn.process_request_body(Box::new(move || body), log_recorder(hits));
    (phase1, phase2)
}

mod scenarios {
    use super::*;

    #[test]
    fn deny_on_query_argument() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS "@contains evil" "id:1,phase:2,deny,status:403"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_connection("203.0.113.7", 49152, "10.0.0.1", 80);
        txn.process_uri_line("GET /?q=evil HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(!phase2, "phase 2 must intervene");
        let intervention = txn.intervention.clone().expect("intervention recorded");
        assert_eq!(intervention.rule_id, 1);
        assert_eq!(intervention.status, 403);
        assert_eq!(txn.capture(0).to_text(), "evil");
        assert_eq!(txn.matched_variables().len(), 1);
        assert_eq!(txn.matched_variables()[0].full_name.to_string(), "ARGS:q");
    }

    #[test]
    fn capture_fills_tx_slots() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRequestBodyAccess On
SecRule ARGS "@rx ^(foo)(bar)$" "id:2,phase:2,capture,pass"
"#,
        );
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri("/submit", "POST", "1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"x=foobar", &hits);

        assert!(phase2, "pass must not intervene");
        assert_eq!(txn.capture(0).to_text(), "foobar");
        assert_eq!(txn.capture(1).to_text(), "foo");
        assert_eq!(txn.capture(2).to_text(), "bar");
        assert!(hits.borrow().contains(&2));
    }

    #[test]
    fn chain_requires_both_links() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecDefaultAction "phase:2,pass,log"
SecRule ARGS_GET:q "@streq hi" "id:3,phase:2,t:lowercase,chain"
SecRule REQUEST_HEADERS:X-Test "@streq yes" ""
"#,
        );
        let headers = vec![("x-test".to_string(), "yes".to_string())];
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?q=HI HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(phase2, "chain match with pass continues");
        assert_eq!(hits.borrow().as_slice(), &[3], "log fires once, id 3");
    }

    #[test]
    fn chain_fails_without_header() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS_GET:q "@streq hi" "id:3,phase:2,t:lowercase,chain,deny"
SecRule REQUEST_HEADERS:X-Test "@streq yes" ""
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?q=hi HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(phase2, "broken chain must not match");
        assert!(hits.borrow().is_empty());
    }

    #[test]
    fn setvar_score_accumulates_and_denies() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS "@rx foo" "id:4,phase:2,pass,setvar:tx.score=+5"
SecRule TX:score "@gt 3" "id:5,phase:2,deny"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?a=foo HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(!phase2, "rule 5 must intervene");
        assert_eq!(txn.intervention.clone().unwrap().rule_id, 5);
        assert_eq!(txn.get_tx_variable("score").to_int_lossy(), 5);
        assert_eq!(hits.borrow().as_slice(), &[4, 5]);
    }

    #[test]
    fn skip_after_jumps_over_deny() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule REQUEST_METHOD "@streq GET" "id:6,phase:1,pass,skipAfter:END"
SecRule ARGS "@unconditionalMatch" "id:7,phase:1,deny"
SecMarker END
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?a=b HTTP/1.1");
        let phase1 = txn.process_request_headers(
            header_find(&headers),
            header_traverse(&headers),
            0,
            log_recorder(&hits),
        );

        assert!(phase1, "rule 7 must be skipped");
        assert!(txn.intervention.is_none());
        assert_eq!(hits.borrow().as_slice(), &[6]);
    }

    #[test]
    fn multi_match_blocks_through_default_action() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRequestBodyAccess On
SecDefaultAction "phase:2,deny"
SecRule ARGS "@rx (?i)UNION\s+SELECT" "id:8,phase:2,t:urlDecodeUni,t:lowercase,multiMatch,block"
"#,
        );
        let headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        )];
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri("/search", "POST", "1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"q=UnIoN%20SeLeCt%201", &hits);

        assert!(!phase2, "block resolves to the default-action deny");
        assert_eq!(txn.intervention.clone().unwrap().rule_id, 8);
    }
}

mod properties {
    use super::*;

    #[test]
    fn transform_cache_runs_once_per_input() {
        let engine = engine_with("SecRuleEngine On\n");
        let mut txn = engine.make_transaction();

        let input = Variant::from("MiXeD Case");
        let first = txn
            .apply_transform_cached(&input, secrule_engine::Transform::Lowercase)
            .unwrap();
        let second = txn
            .apply_transform_cached(&input, secrule_engine::Transform::Lowercase)
            .unwrap();
        assert_eq!(first.to_text(), "mixed case");
        assert_eq!(first.to_text(), second.to_text());
        assert_eq!(txn.transform_cache_misses(), 1);

        // "no change" results are cached too
        let quiet = Variant::from("quiet");
        assert!(txn
            .apply_transform_cached(&quiet, secrule_engine::Transform::Lowercase)
            .is_none());
        assert!(txn
            .apply_transform_cached(&quiet, secrule_engine::Transform::Lowercase)
            .is_none());
        assert_eq!(txn.transform_cache_misses(), 2);
    }

    #[test]
    fn indices_stay_consistent_after_compile_time_removal() {
        let mut engine = Engine::new("error", None);
        engine
            .load(
                r#"
SecRuleEngine On
SecRule ARGS "@contains a" "id:10,phase:2,pass"
SecRule ARGS "@contains b" "id:11,phase:2,pass"
SecMarker MID
SecRule ARGS "@contains c" "id:12,phase:2,pass"
SecRuleRemoveById 10
"#,
            )
            .unwrap();

        let set = engine.ruleset();
        for (index, rule) in set.rules_by_phase[1].iter().enumerate() {
            assert_eq!(rule.index, index as i32);
        }
        assert!(set.find_rule(10).is_none());
        assert_eq!(set.marker_prev_index("MID", 2), Some(0));
        engine.init().unwrap();
    }

    #[test]
    fn chained_rules_inherit_phase_and_stay_out_of_phase_vectors() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule REQUEST_METHOD "@streq GET" "id:20,phase:1,chain,pass"
SecRule ARGS "@contains x" "chain"
SecRule ARGS "@contains y" ""
"#,
        );
        let set = engine.ruleset();
        assert_eq!(set.rules_by_phase[0].len(), 1);
        let top = &set.rules_by_phase[0][0];
        assert_eq!(top.chain_index, -1);
        let child = top.chain.as_deref().unwrap();
        assert_eq!(child.chain_index, 0);
        assert_eq!(child.phase, 1);
        let grandchild = child.chain.as_deref().unwrap();
        assert_eq!(grandchild.chain_index, 1);
        assert_eq!(grandchild.phase, 1);
        assert_eq!(top.chain_len(), 2);
    }

    #[test]
    fn intervention_does_not_rerun_earlier_phases() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule REQUEST_METHOD "@streq GET" "id:30,phase:1,deny"
SecRule ARGS "@unconditionalMatch" "id:31,phase:2,pass"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET / HTTP/1.1");
        let phase1 = txn.process_request_headers(
            header_find(&headers),
            header_traverse(&headers),
            0,
            log_recorder(&hits),
        );
        assert!(!phase1);

        // the host may still drive later phases; phase 1 rules do not re-run
        let phase2 = txn.process_request_body(Box::new(|| b"".as_slice()), log_recorder(&hits));
        assert!(phase2);
        assert_eq!(hits.borrow().as_slice(), &[30, 31]);
    }

    #[test]
    fn detection_only_logs_but_never_intervenes() {
        let engine = engine_with(
            r#"
SecRuleEngine DetectionOnly
SecRule ARGS "@contains evil" "id:40,phase:2,deny"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?q=evil HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(phase2, "DetectionOnly never intervenes");
        assert!(txn.intervention.is_none());
        assert_eq!(hits.borrow().as_slice(), &[40]);
    }

    #[test]
    fn redirect_verdict_carries_target_and_status() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS "@contains evil" "id:50,phase:2,redirect:https://example.test/blocked,status:302"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?q=evil HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(!phase2);
        let intervention = txn.intervention.clone().unwrap();
        assert_eq!(intervention.status, 302);
        assert_eq!(
            intervention.redirect.as_deref(),
            Some("https://example.test/blocked")
        );
    }

    #[test]
    fn ctl_rule_removal_only_affects_rules_ahead() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS "@unconditionalMatch" "id:60,phase:2,pass,ctl:ruleRemoveById=62"
SecRule ARGS "@unconditionalMatch" "id:61,phase:2,pass"
SecRule ARGS "@unconditionalMatch" "id:62,phase:2,deny"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?a=b HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);

        assert!(phase2, "removed rule 62 must not deny");
        assert_eq!(hits.borrow().as_slice(), &[60, 61]);
    }

    #[test]
    fn except_target_update_excludes_argument() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule ARGS "@contains evil" "id:70,phase:2,deny"
SecRuleUpdateTargetById 70 "!ARGS:trusted"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?trusted=evil HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);
        assert!(phase2, "excluded argument must not match");

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?other=evil HTTP/1.1");
        let (_, phase2) = run_request(&mut txn, &headers, b"", &hits);
        assert!(!phase2, "other arguments still match");
    }

    #[test]
    fn allow_ends_later_phases() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule REQUEST_METHOD "@streq GET" "id:80,phase:1,allow"
SecRule ARGS "@unconditionalMatch" "id:81,phase:2,deny"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET /?a=b HTTP/1.1");
        let (phase1, phase2) = run_request(&mut txn, &headers, b"", &hits);
        assert!(phase1);
        assert!(phase2, "allow suppresses the later deny");
        assert!(txn.intervention.is_none());
    }
}

mod parsing {
    use super::*;

    #[test]
    fn unknown_directive_fails_with_position() {
        let mut engine = Engine::new("error", None);
        let err = engine.load("SecBogusDirective On\n").unwrap_err();
        assert!(err.to_string().contains("<inline>:1"));
        assert!(err.to_string().contains("SecBogusDirective"));
    }

    #[test]
    fn unknown_operator_fails() {
        let mut engine = Engine::new("error", None);
        let err = engine
            .load(r#"SecRule ARGS "@noSuchOperator x" "id:1,phase:2,pass""#)
            .unwrap_err();
        assert!(err.to_string().contains("noSuchOperator"));
    }

    #[test]
    fn line_continuations_join() {
        let mut engine = Engine::new("error", None);
        engine
            .load("SecRule ARGS \\\n    \"@contains evil\" \\\n    \"id:1,phase:2,pass\"\n")
            .unwrap();
        engine.init().unwrap();
        assert!(engine.ruleset().find_rule(1).is_some());
    }

    #[test]
    fn default_action_requires_phase() {
        let mut engine = Engine::new("error", None);
        assert!(engine.load(r#"SecDefaultAction "pass,log""#).is_err());
    }

    #[test]
    fn negated_operator_flips_result() {
        let engine = engine_with(
            r#"
SecRuleEngine On
SecRule REQUEST_METHOD "!@streq POST" "id:90,phase:1,deny"
"#,
        );
        let headers: Vec<(String, String)> = Vec::new();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let mut txn = engine.make_transaction();
        txn.process_uri_line("GET / HTTP/1.1");
        let phase1 = txn.process_request_headers(
            header_find(&headers),
            header_traverse(&headers),
            0,
            log_recorder(&hits),
        );
        assert!(!phase1, "GET is not POST, negation matches");
    }
}
