//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use chrono::Utc;
use toolship_core::catalog::ToolCatalog;
use toolship_core::executor::ExecutionResult;
use toolship_core::options::{OptionGrammar, OptionRule, ToolOptions, render};
use toolship_core::plan::{ArgumentVector, EnvBindings, PlanStep, ToolSpec, build};
use toolship_core::policy::{ExitClassification, ExitPolicy, RawOutput};
use toolship_core::target::MountPlan;

fn classify(
    policy: ExitPolicy,
    exit_code: i32,
    stdout: &[u8],
    stderr: &[u8],
) -> ExitClassification {
    policy.classify(&RawOutput {
        exit_code,
        stdout: Some(stdout),
        stderr: Some(stderr),
    })
}

// --- Exit policy properties ---

proptest! {
    #[test]
    fn tolerant_policy_accepts_any_exit_with_output(
        exit_code in -1i32..256,
        body in "[a-z{}\":,]{1,64}",
    ) {
        let policy = ExitPolicy::AnySucceedsIfOutputNonEmpty;
        let class = classify(policy, exit_code, body.as_bytes(), b"");
        prop_assert!(class.succeeded());
    }

    #[test]
    fn tolerant_policy_rejects_blank_output(
        exit_code in -1i32..256,
        blank in "[ \t\r\n]{0,16}",
    ) {
        let policy = ExitPolicy::AnySucceedsIfOutputNonEmpty;
        let class = classify(policy, exit_code, blank.as_bytes(), b"warn");
        prop_assert_eq!(class, ExitClassification::EmptyOutput);
    }

    #[test]
    fn strict_policy_fails_nonzero_with_stderr_in_message(
        exit_code in 1i32..256,
        stderr in "[a-zA-Z ]{1,40}[a-z]",
    ) {
        let class = classify(ExitPolicy::Strict, exit_code, b"{}", stderr.as_bytes());
        prop_assert_eq!(class, ExitClassification::ToolReportedFailure);

        let result = ExecutionResult {
            tool: "trivy".into(),
            exit_code,
            stdout: b"{}".to_vec(),
            stderr: stderr.clone().into_bytes(),
            classification: class,
            started_at: Utc::now(),
            duration_ms: 0,
            artifact: None,
            failed_setup: None,
        };
        let err = result.failure().expect("strict failure carries an error");
        prop_assert!(err.to_string().contains(stderr.trim()));
    }

    #[test]
    fn zero_exit_with_output_succeeds_under_every_policy(body in "[a-z]{1,32}") {
        for policy in [
            ExitPolicy::Strict,
            ExitPolicy::AnySucceedsIfOutputNonEmpty,
            ExitPolicy::FallbackToStderr,
        ] {
            prop_assert_eq!(classify(policy, 0, body.as_bytes(), b""), ExitClassification::Success);
        }
    }
}

// --- Option rendering properties ---

fn grammar() -> OptionGrammar {
    OptionGrammar::new()
        .subcommand(&["scan"])
        .rule(OptionRule::switch("quiet", "--quiet"))
        .rule(OptionRule::value("config", "--config"))
        .rule(OptionRule::comma_list("check", "--check"))
        .rule(OptionRule::repeated("skip", "--skip"))
        .rule(OptionRule::value("format", "--format").after_target())
}

fn options_strategy() -> impl Strategy<Value = ToolOptions> {
    (
        proptest::option::of(any::<bool>()),
        proptest::option::of("[a-z]{1,8}\\.toml"),
        proptest::option::of(proptest::collection::vec("CKV_[0-9]{1,3}", 1..4)),
        proptest::option::of(proptest::collection::vec("[a-z]{1,6}", 1..3)),
        proptest::option::of(prop_oneof![Just("json"), Just("sarif")]),
    )
        .prop_map(|(quiet, config, check, skip, format)| {
            let mut options = ToolOptions::new();
            if let Some(q) = quiet {
                options.insert("quiet", q);
            }
            if let Some(c) = config {
                options.insert("config", c);
            }
            if let Some(c) = check {
                options.insert("check", c);
            }
            if let Some(s) = skip {
                options.insert("skip", s);
            }
            if let Some(f) = format {
                options.insert("format", f);
            }
            options
        })
}

proptest! {
    #[test]
    fn render_is_deterministic(options in options_strategy()) {
        let a = render("demo", &grammar(), &options, Some(".")).unwrap();
        let b = render("demo", &grammar(), &options, Some(".")).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn unset_options_never_appear(options in options_strategy()) {
        let args = render("demo", &grammar(), &options, Some(".")).unwrap();
        let flags = [
            ("config", "--config"),
            ("check", "--check"),
            ("skip", "--skip"),
            ("format", "--format"),
        ];
        for (name, flag) in flags {
            if options.get(name).is_none() {
                prop_assert!(
                    !args.iter().any(|a| a == flag),
                    "{} rendered without being set",
                    flag
                );
            }
        }
        prop_assert_eq!(args[0].as_str(), "scan");
    }

    #[test]
    fn after_target_options_follow_the_target(options in options_strategy()) {
        let args = render("demo", &grammar(), &options, Some("TARGET")).unwrap();
        let target = args.iter().position(|a| a == "TARGET").unwrap();
        if let Some(pos) = args.iter().position(|a| a == "--format") {
            prop_assert!(pos > target);
        }
    }
}

// --- Plan building properties ---

fn rank(step: &PlanStep) -> u8 {
    match step {
        PlanStep::Mount(_) => 0,
        PlanStep::Env { .. } => 1,
        PlanStep::Workdir { .. } => 2,
        PlanStep::Prepare { .. } => 3,
        PlanStep::Setup { .. } => 4,
        PlanStep::Exec { .. } => 5,
    }
}

proptest! {
    #[test]
    fn build_is_deterministic_and_ordered(
        args in proptest::collection::vec("[a-z-]{1,10}", 0..6),
        env in proptest::collection::btree_map("[A-Z_]{1,8}", "[a-z0-9]{0,8}", 0..4),
        setups in proptest::collection::vec(proptest::collection::vec("[a-z]{1,6}", 1..3), 0..3),
        workdir in proptest::option::of("/[a-z]{1,8}"),
    ) {
        let mut tool = ToolSpec::new("demo", "demo:latest", "demo", ExitPolicy::Strict);
        for setup in &setups {
            tool = tool.with_setup(setup.iter().cloned());
        }
        let mount = MountPlan { workdir, ..MountPlan::default() };
        let args: ArgumentVector = args.into_iter().collect();
        let env: EnvBindings = env.into_iter().collect();

        let first = build(&tool, &mount, &args, &env);
        let second = build(&tool, &mount, &args, &env);
        prop_assert_eq!(&first, &second);

        let ranks: Vec<u8> = first.steps().iter().map(rank).collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(ranks.last().copied(), Some(5));
        prop_assert_eq!(first.command().len(), args.len() + 1);
    }
}

// --- Catalog properties ---

proptest! {
    #[test]
    fn unknown_tools_are_rejected(name in "zz[a-z]{10,18}") {
        let catalog = ToolCatalog::builtin();
        prop_assert!(catalog.get(&name).is_err());
    }
}
