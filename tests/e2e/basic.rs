use crate::e2e::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.keel", "")?;
    let out = space.run(&mut keel_command(vec![]))?;
    assert_eq!(exit_code(&out), Some(3));
    assert_stderr_contains(&out, "no targets specified");
    Ok(())
}

#[test]
fn basic_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "hello")?;

    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "cat out");
    assert_output_contains(&out, "ran 1 tasks");
    assert_eq!(space.read("out")?, b"hello");

    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn default_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        TOUCH_RULE,
        "build a: touch",
        "build b: touch",
        "default a",
    ])?;
    space.run_expect(&mut keel_command(vec![]))?;
    assert!(space.exists("a"));
    assert!(!space.exists("b"));
    Ok(())
}

#[test]
fn rebuild_tracks_content_not_timestamps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build mid: cat in", "build out: cat mid"])?;
    space.write("in", "one")?;
    space.run_expect(&mut keel_command(vec!["out"]))?;

    // Rewriting the same bytes is not a change.
    space.write("in", "one")?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    space.write("in", "two")?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert_eq!(space.read("out")?, b"two");
    Ok(())
}

#[test]
fn timestamp_decider_flag() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "one")?;
    space.run_expect(&mut keel_command(vec!["--decider", "timestamp", "out"]))?;
    let out = space.run_expect(&mut keel_command(vec!["--decider", "timestamp", "out"]))?;
    assert_output_contains(&out, "no work to do");

    let out = space.run(&mut keel_command(vec!["--decider", "sometimes", "out"]))?;
    assert_eq!(exit_code(&out), Some(4));
    Ok(())
}

/// Changing a variable that feeds the command line is a change to the action.
#[cfg(unix)]
#[test]
fn command_change_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |flag: &str| {
        space.manifest(&[
            "rule stamp",
            "  command = touch $flag $out",
            "  description = stamp $out",
            format!("flag = {}", flag).as_str(),
            "build out: stamp",
        ])
    };
    manifest("-a")?;
    space.run_expect(&mut keel_command(vec!["out"]))?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    manifest("-m")?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "stamp out");
    Ok(())
}

#[test]
fn alias_builds_members() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        TOUCH_RULE,
        "alias all: a b",
        "build a: touch",
        "build b: touch",
        "build c: touch",
    ])?;
    let out = space.run_expect(&mut keel_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert!(space.exists("a"));
    assert!(space.exists("b"));
    assert!(!space.exists("c"));
    Ok(())
}

#[test]
fn unknown_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[TOUCH_RULE, "build out: touch"])?;
    let out = space.run(&mut keel_command(vec!["nope"]))?;
    assert_eq!(exit_code(&out), Some(2));
    assert_stderr_contains(&out, "unknown target \"nope\"");
    Ok(())
}

#[test]
fn cycle_is_a_config_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build a: cat b", "build b: cat a"])?;
    let out = space.run(&mut keel_command(vec!["a"]))?;
    assert_eq!(exit_code(&out), Some(2));
    assert_stderr_contains(&out, "dependency cycle");
    assert!(!space.exists("a"));
    assert!(!space.exists("b"));
    Ok(())
}

#[test]
fn missing_source_is_a_config_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        CAT_RULE,
        TOUCH_RULE,
        "build out: cat in",
        "build other: touch",
        "alias all: out other",
    ])?;
    let out = space.run(&mut keel_command(vec!["all"]))?;
    assert_eq!(exit_code(&out), Some(2));
    assert_stderr_contains(&out, "missing source \"in\"");
    assert!(!space.exists("other"));
    Ok(())
}

#[test]
fn parse_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&["build out: nosuchrule in"])?;
    let out = space.run(&mut keel_command(vec!["out"]))?;
    assert_eq!(exit_code(&out), Some(2));
    assert_stderr_contains(&out, "build.keel:1:");
    Ok(())
}

#[test]
fn failing_command() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[FAIL_RULE, TOUCH_RULE, "build bad: fail", "build out: touch bad"])?;
    let out = space.run(&mut keel_command(vec!["out"]))?;
    assert_eq!(exit_code(&out), Some(1));
    assert_output_contains(&out, "failed: fail bad");
    assert_output_contains(&out, "failing bad");
    assert!(!space.exists("out"));
    Ok(())
}

#[test]
fn keep_going() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        FAIL_RULE,
        TOUCH_RULE,
        "build bad: fail",
        "build user: touch bad",
        "build fine: touch",
        "alias all: user fine",
    ])?;
    let out = space.run(&mut keel_command(vec!["-j", "1", "-k", "0", "all"]))?;
    assert_eq!(exit_code(&out), Some(1));
    assert_output_contains(&out, "skipped user: depends on failed bad");
    assert!(space.exists("fine"));
    assert!(!space.exists("user"));
    Ok(())
}

#[test]
fn bad_parallelism() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[TOUCH_RULE, "build out: touch"])?;
    let out = space.run(&mut keel_command(vec!["-j", "0", "out"]))?;
    assert_eq!(exit_code(&out), Some(4));
    Ok(())
}

#[test]
fn side_effect_and_directory() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        TOUCH_RULE,
        "directory gen",
        "build gen/a: touch",
        "  side_effect = log",
        "build gen/b: touch",
        "  side_effect = log",
        "alias all: gen/a gen/b",
    ])?;
    let out = space.run_expect(&mut keel_command(vec!["-j", "4", "all"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    assert!(space.exists("gen/a"));
    assert!(space.exists("gen/b"));
    Ok(())
}

#[test]
fn ignore_errors() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[FAIL_RULE, TOUCH_RULE, "build bad: fail", "build user: touch bad"])?;
    let out = space.run_expect(&mut keel_command(vec!["-i", "user"]))?;
    assert_output_contains(&out, "failing bad");
    assert_output_contains(&out, "ignored 1 failed tasks");
    assert!(space.exists("user"));
    Ok(())
}

#[test]
fn always_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[TOUCH_RULE, "build out: touch", "  always_build = 1"])?;
    space.run_expect(&mut keel_command(vec!["out"]))?;
    let out = space.run_expect(&mut keel_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "keel explain: out: marked to always build");
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}
