use criterion::{criterion_group, criterion_main, Criterion};
use keel::canon::canon_path;
use keel::db::SignatureStore;
use keel::graph::Action;
use keel::progress::SilentProgress;
use keel::scan::ScannerRegistry;
use keel::sig::{build_signature, Signature};
use keel::work::{Options, Work};
use std::fmt::Write;
use std::path::Path;

pub fn bench_canon(c: &mut Criterion) {
    c.bench_function("canon plain", |b| {
        b.iter(|| {
            let path = "demos/OrcV2Examples/OrcV2CBindingsVeryLazy/\
                CMakeFiles/OrcV2CBindingsVeryLazy.dir/OrcV2CBindingsVeryLazy.c.o";
            canon_path(path);
        })
    });

    c.bench_function("canon with parents", |b| {
        b.iter(|| {
            let path = "demos/OrcV2Examples/OrcV2CBindingsVeryLazy/\
                ../../../\
                CMakeFiles/OrcV2CBindingsVeryLazy.dir/OrcV2CBindingsVeryLazy.c.o";
            canon_path(path);
        })
    });
}

pub fn bench_signatures(c: &mut Criterion) {
    let data = vec![0x5au8; 1 << 20];
    c.bench_function("content signature 1mb", |b| {
        b.iter(|| Signature::from_bytes(&data))
    });

    let inputs: Vec<Signature> = (0..100u32)
        .map(|i| Signature::from_bytes(&i.to_le_bytes()))
        .collect();
    let action = Signature::from_bytes(b"cc -c foo.c -o foo.o");
    c.bench_function("build signature 100 inputs", |b| {
        b.iter(|| build_signature(&action, inputs.iter().map(Some)))
    });
}

fn generate_manifest(n: usize) -> String {
    let mut input = String::new();
    writeln!(input, "rule cc\n  command = cc -c $in -o $out\n  depfile = $out.d").unwrap();
    for i in 0..n {
        writeln!(
            input,
            "build out/foo/bar{}.o: cc src/long/file/name{}.cc\n  flags = -O2",
            i, i
        )
        .unwrap();
    }
    input
}

pub fn bench_load(c: &mut Criterion) {
    let input = generate_manifest(1000);
    c.bench_function("load 1000 builds", |b| {
        b.iter(|| keel::load::parse(Path::new("build.keel"), &input).unwrap())
    });
}

/// Walk a wide graph where everything is already up to date: the cost of
/// a no-op build.
pub fn bench_noop_walk(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = keel::graph::Graph::new();
    let all = graph
        .add_node("all", keel::graph::NodeKind::Alias)
        .unwrap();
    for i in 0..500 {
        let src = dir.path().join(format!("src{}", i));
        std::fs::write(&src, format!("source {}", i)).unwrap();
        let src = graph.file_id(&src.to_string_lossy());
        let out = graph.file_id(&dir.path().join(format!("out{}", i)).to_string_lossy());
        graph
            .set_action(
                out,
                Action::function("copy", |ctx| {
                    std::fs::copy(&ctx.sources[0], ctx.target)?;
                    Ok(())
                }),
            )
            .unwrap();
        graph.add_dependency(out, src);
        graph.add_dependency(all, out);
    }
    graph.finalize().unwrap();
    let db = SignatureStore::in_memory();
    let scanners = ScannerRegistry::new();
    let walk = |graph: &mut keel::graph::Graph| {
        let mut progress = SilentProgress::default();
        let mut work = Work::new(graph, &db, &scanners, Options::default(), &mut progress);
        work.want_node(all).unwrap();
        work.run().unwrap()
    };
    walk(&mut graph);

    c.bench_function("no-op walk 500 nodes", |b| {
        b.iter(|| walk(&mut graph))
    });
}

criterion_group!(
    benches,
    bench_canon,
    bench_signatures,
    bench_load,
    bench_noop_walk
);
criterion_main!(benches);
