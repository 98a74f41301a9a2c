//! Removing built targets (`-t clean`).

use crate::graph::{Graph, NodeId, NodeKind};
use crate::progress::Progress;
use rustc_hash::FxHashSet;

/// Delete the derived files reachable from `targets`, leaving `noclean`
/// nodes and everything without an action alone.  Returns how many files
/// were removed.  The signature store is not touched: a removed target
/// simply reads as missing on the next walk.
pub fn clean(
    graph: &Graph,
    targets: &[NodeId],
    progress: &mut dyn Progress,
) -> anyhow::Result<usize> {
    let mut seen = FxHashSet::default();
    let mut stack: Vec<NodeId> = targets.to_vec();
    let mut removed = 0;
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let node = graph.node(id);
        stack.extend(node.all_children());
        if node.kind != NodeKind::DerivedFile || node.action.is_none() || node.flags.noclean {
            continue;
        }
        match std::fs::remove_file(node.path()) {
            Ok(()) => {
                removed += 1;
                progress.log(&format!("removed {}", node.name));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => anyhow::bail!("remove {}: {}", node.name, err),
        }
    }
    Ok(removed)
}
