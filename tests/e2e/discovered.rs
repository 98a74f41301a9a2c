//! Inputs found while building: depfiles and scanners.

use crate::e2e::*;

#[cfg(unix)]
const GENDEP_RULE: &str = "
rule gendep
  description = gendep $out
  command = echo \"$dep_content\" > $out.d && touch $out
  depfile = $out.d
";

#[cfg(windows)]
const GENDEP_RULE: &str = "
rule gendep
  description = gendep $out
  command = cmd /c echo $dep_content > $out.d && type nul > $out
  depfile = $out.d
";

/// depfile contains invalid syntax.
#[test]
fn bad_depfile() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[GENDEP_RULE, "build out: gendep", "  dep_content = garbage text"])?;

    let out = space.run(&mut keel_command(vec!["out"]))?;
    assert_eq!(exit_code(&out), Some(1));
    assert_output_contains(&out, "parse error:");
    Ok(())
}

#[test]
fn depfile_inputs_are_tracked() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[GENDEP_RULE, "build out: gendep", "  dep_content = out: header"])?;
    space.write("header", "1")?;

    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "gendep out");

    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    space.write("header", "2")?;
    let out = space.run_expect(&mut keel_command(vec!["-d", "explain", "out"]))?;
    assert_output_contains(&out, "input header changed");
    assert_output_contains(&out, "gendep out");
    Ok(())
}

#[test]
fn scanned_includes_are_tracked() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "scan .c = include", "build out: cat main.c"])?;
    space.write("main.c", "#include \"defs.h\"\n")?;
    space.write("defs.h", "#define X 1\n")?;

    space.run_expect(&mut keel_command(vec!["out"]))?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");

    space.write("defs.h", "#define X 2\n")?;
    let out = space.run_expect(&mut keel_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}

#[test]
fn scanned_generated_header_is_built_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[
        CAT_RULE,
        "scan .c = include",
        "build gen.h: cat gen.in",
        "build out: cat main.c",
    ])?;
    space.write("main.c", "#include \"gen.h\"\n")?;
    space.write("gen.in", "#define GEN 1\n")?;

    let out = space.run_expect(&mut keel_command(vec!["-j", "4", "out"]))?;
    let stdout = std::str::from_utf8(&out.stdout)?;
    let gen = stdout.find("cat gen.h");
    let obj = stdout.find("cat out");
    assert!(gen.is_some() && obj.is_some() && gen < obj, "{}", stdout);
    assert!(space.exists("gen.h"));
    Ok(())
}

#[test]
fn missing_reference_policy() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "scan .c = include", "build out: cat main.c"])?;
    space.write("main.c", "#include \"nowhere.h\"\n")?;

    let out = space.run(&mut keel_command(vec!["--missing-refs", "error", "out"]))?;
    assert_eq!(exit_code(&out), Some(1));
    assert_output_contains(&out, "can't find referenced file \"nowhere.h\"");

    let out = space.run_expect(&mut keel_command(vec!["--missing-refs", "warn", "out"]))?;
    assert_output_contains(&out, "warning");
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}

#[test]
fn implicit_cache() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.manifest(&[CAT_RULE, "scan .c = include", "build out: cat main.c"])?;
    space.write("main.c", "#include \"defs.h\"\n")?;
    space.write("defs.h", "1\n")?;
    space.write("extra.h", "1\n")?;
    space.run_expect(&mut keel_command(vec!["out"]))?;

    // Stored results still cover defs.h.
    space.write("defs.h", "2\n")?;
    let out = space.run_expect(&mut keel_command(vec!["--implicit-cache", "out"]))?;
    assert_output_contains(&out, "ran 1 tasks");

    // A new include is not seen until something scans again.
    space.write("main.c", "#include \"defs.h\"\n#include \"extra.h\"\n")?;
    space.run_expect(&mut keel_command(vec!["--implicit-cache", "out"]))?;
    space.write("extra.h", "2\n")?;
    let out = space.run_expect(&mut keel_command(vec!["--implicit-cache", "out"]))?;
    assert_output_contains(&out, "no work to do");

    let out = space.run_expect(&mut keel_command(vec![
        "--implicit-cache",
        "--implicit-deps-changed",
        "out",
    ]))?;
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}
