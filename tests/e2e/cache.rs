//! The shared artifact cache.

use crate::e2e::*;

#[test]
fn fetch_instead_of_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "payload")?;

    let out = space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    assert_output_contains(&out, "cat out");
    assert!(space.exists("cache/config"));

    std::fs::remove_file(space.path().join("out"))?;
    let out = space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    assert_output_contains(&out, "fetched from cache: out");
    assert_output_contains(&out, "1 fetched from cache");
    assert_eq!(space.read("out")?, b"payload");

    let out = space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn shared_between_trees() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let cache_dir = cache.path().to_string_lossy().into_owned();
    let mut outputs = Vec::new();
    for _ in 0..2 {
        let space = TestSpace::new()?;
        space.manifest(&[CAT_RULE, "build mid: cat in", "build out: cat mid"])?;
        space.write("in", "same input")?;
        let out = space.run_expect(&mut keel_command(vec!["--cache-dir", &cache_dir, "out"]))?;
        outputs.push(String::from_utf8(out.stdout)?);
        assert_eq!(space.read("out")?, b"same input");
    }
    assert!(outputs[0].contains("ran 2 tasks, now up to date"));
    assert!(outputs[1].contains("2 fetched from cache"));
    Ok(())
}

#[test]
fn readonly_never_stores() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "payload")?;
    let args = vec!["--cache-dir", "cache", "--cache-readonly", "out"];

    space.run_expect(&mut keel_command(args.clone()))?;
    std::fs::remove_file(space.path().join("out"))?;
    let out = space.run_expect(&mut keel_command(args))?;
    assert_output_contains(&out, "cat out");
    assert_output_not_contains(&out, "fetched from cache");
    Ok(())
}

#[test]
fn nocache_nodes_are_always_built() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in", "  nocache = 1"])?;
    space.write("in", "payload")?;

    space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    std::fs::remove_file(space.path().join("out"))?;
    let out = space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    assert_output_contains(&out, "cat out");
    assert_output_not_contains(&out, "fetched from cache");
    Ok(())
}

#[test]
fn force_populates_from_up_to_date_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "build out: cat in"])?;
    space.write("in", "payload")?;

    // Built without a cache, then pushed into one.
    space.run_expect(&mut keel_command(vec!["out"]))?;
    space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "--cache-force", "out"]))?;

    std::fs::remove_file(space.path().join("out"))?;
    let out = space.run_expect(&mut keel_command(vec!["--cache-dir", "cache", "out"]))?;
    assert_output_contains(&out, "fetched from cache: out");
    Ok(())
}
