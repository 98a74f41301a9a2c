//! Command-line modes other than a plain build.

use crate::e2e::*;

#[test]
fn clean() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        CAT_RULE,
        "build mid: cat in",
        "build out: cat mid",
        "build kept: cat in",
        "  noclean = 1",
        "alias all: out kept",
    ])?;
    space.write("in", "x")?;
    space.run_expect(&mut keel_command(vec!["all"]))?;

    let out = space.run_expect(&mut keel_command(vec!["-t", "clean", "all"]))?;
    assert_output_contains(&out, "removed 2 files");
    assert!(space.exists("in"));
    assert!(space.exists("kept"));
    assert!(!space.exists("mid"));
    assert!(!space.exists("out"));

    let out = space.run_expect(&mut keel_command(vec!["all"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    Ok(())
}

#[test]
fn dry_run() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build mid: cat in", "build out: cat mid"])?;
    space.write("in", "1")?;
    space.run_expect(&mut keel_command(vec!["out"]))?;

    space.write("in", "2")?;
    let out = space.run_expect(&mut keel_command(vec!["-n", "out"]))?;
    assert_output_contains(&out, "cat mid");
    assert_output_contains(&out, "cat out");
    assert_output_contains(&out, "would run 2 tasks");
    assert_eq!(space.read("out")?, b"1");

    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 2 tasks");
    Ok(())
}

#[test]
fn question() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "1")?;

    let out = space.run(&mut keel_command(vec!["-q", "out"]))?;
    assert_eq!(exit_code(&out), Some(1));
    assert!(!space.exists("out"));

    space.run_expect(&mut keel_command(vec!["out"]))?;
    let out = space.run(&mut keel_command(vec!["-q", "out"]))?;
    assert_eq!(exit_code(&out), Some(0));
    assert_output_not_contains(&out, "cat out");
    Ok(())
}

#[test]
fn explain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "1")?;

    let out = space.run_expect(&mut keel_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "keel explain: out: no record of a previous build");

    std::fs::remove_file(space.path().join("out"))?;
    let out = space.run_expect(&mut keel_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "keel explain: out: target is missing");
    Ok(())
}

#[test]
fn list_tools() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run_expect(&mut keel_command(vec!["-d", "list"]))?;
    assert_output_contains(&out, "explain");
    let out = space.run_expect(&mut keel_command(vec!["-t", "list"]))?;
    assert_output_contains(&out, "clean");
    let out = space.run(&mut keel_command(vec!["-t", "frobnicate"]))?;
    assert_eq!(exit_code(&out), Some(4));
    Ok(())
}

#[test]
fn chdir_and_build_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    std::fs::create_dir(space.path().join("sub"))?;
    space.write("sub/rules.keel", &[TOUCH_RULE, "build out: touch", ""].join("\n"))?;
    let out = space.run_expect(&mut keel_command(vec!["-C", "sub", "-f", "rules.keel", "out"]))?;
    assert_output_contains(&out, "touch out");
    assert!(space.exists("sub/out"));
    assert!(space.exists("sub/.keel_db"));
    Ok(())
}

#[test]
fn trace() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[TOUCH_RULE, "build out: touch"])?;
    space.run_expect(&mut keel_command(vec!["-d", "trace", "out"]))?;
    let events: serde_json::Value = serde_json::from_slice(&space.read("trace.json")?)?;
    let names: Vec<&str> = events
        .as_array()
        .map(|events| events.iter().filter_map(|e| e["name"].as_str()).collect())
        .unwrap_or_default();
    assert!(names.contains(&"out"), "{:?}", names);
    Ok(())
}
