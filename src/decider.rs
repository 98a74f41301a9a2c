//! Change detection: given what a node's last successful build recorded and
//! what its inputs look like now, decide whether to run its action again.

use crate::db::{BuildRecord, FileInfo};
use crate::fs::{MTime, Stat};
use crate::graph::NodeId;
use crate::sig::Signature;
use std::time::Duration;

/// How a node decides whether its inputs changed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Decider {
    /// Rebuild when any input is newer than the target.
    Timestamp,
    /// Rebuild when any input's content signature differs from the record.
    #[default]
    Content,
    /// Trust an unchanged (mtime, size) pair, hash otherwise.
    Hybrid,
}

impl std::str::FromStr for Decider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "timestamp" | "timestamp-newer" => Decider::Timestamp,
            "content" | "MD5" => Decider::Content,
            "hybrid" | "MD5-timestamp" | "content-timestamp" => Decider::Hybrid,
            _ => anyhow::bail!(
                "unknown decider {:?}, expected one of: timestamp, content, hybrid",
                s
            ),
        })
    }
}

impl std::fmt::Display for Decider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Decider::Timestamp => "timestamp",
            Decider::Content => "content",
            Decider::Hybrid => "hybrid",
        })
    }
}

/// An input's mtime must be at least this much older than the moment its
/// record was written for the hybrid policy to skip hashing it.  Files
/// modified within the same filesystem timestamp tick as the record could
/// otherwise change without their mtime moving.
pub const HYBRID_TRUST_MARGIN: Duration = Duration::from_secs(1);

/// Why a node is out of date.  Displayed by `-d explain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    NoRecord,
    ActionChanged,
    InputsChanged,
    InputNewer(String),
    InputModified(String),
    TargetMissing,
    TargetModified,
    InputWouldRebuild(String),
    AlwaysBuild,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::NoRecord => write!(f, "no record of a previous build"),
            Reason::ActionChanged => write!(f, "action changed"),
            Reason::InputsChanged => write!(f, "list of inputs changed"),
            Reason::InputNewer(name) => write!(f, "input {} is newer", name),
            Reason::InputModified(name) => write!(f, "input {} changed", name),
            Reason::TargetMissing => write!(f, "target is missing"),
            Reason::TargetModified => write!(f, "target was modified since it was built"),
            Reason::InputWouldRebuild(name) => write!(f, "input {} would be rebuilt", name),
            Reason::AlwaysBuild => write!(f, "marked to always build"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    UpToDate,
    Rebuild(Reason),
}

/// Current on-disk state of nodes, memoized by whoever implements it.
pub trait SigSource {
    fn name(&self, id: NodeId) -> &str;
    fn stat(&self, id: NodeId) -> Stat;
    /// Content signature, or None if the node has no content (missing).
    fn content(&self, id: NodeId) -> Option<Signature>;
}

/// A node as it stands now, ready to compare against its record.
pub struct Candidate<'a> {
    pub action_sig: Signature,
    /// Signature-affecting inputs, in order.
    pub inputs: &'a [NodeId],
    /// The node itself when it is backed by something on disk.
    pub target: Option<NodeId>,
}

impl Decider {
    /// Whether records made under this policy carry input content signatures.
    pub fn records_content(&self) -> bool {
        !matches!(self, Decider::Timestamp)
    }

    pub fn decide(
        &self,
        record: Option<&BuildRecord>,
        node: &Candidate,
        sigs: &dyn SigSource,
    ) -> Decision {
        let record = match record {
            None => return Decision::Rebuild(Reason::NoRecord),
            Some(record) => record,
        };
        if record.action_sig != node.action_sig {
            return Decision::Rebuild(Reason::ActionChanged);
        }
        if record.children.len() != node.inputs.len()
            || record
                .children
                .iter()
                .zip(node.inputs)
                .any(|(rec, &id)| rec.name != sigs.name(id))
        {
            return Decision::Rebuild(Reason::InputsChanged);
        }

        if let Some(target) = node.target {
            if let Some(reason) = self.check_target(record, target, sigs) {
                return Decision::Rebuild(reason);
            }
        }

        for (rec, &id) in record.children.iter().zip(node.inputs) {
            if let Some(reason) = self.check_input(record, &rec.info, id, node.target, sigs) {
                return Decision::Rebuild(reason);
            }
        }
        Decision::UpToDate
    }

    fn check_target(
        &self,
        record: &BuildRecord,
        target: NodeId,
        sigs: &dyn SigSource,
    ) -> Option<Reason> {
        let stat = sigs.stat(target);
        if !stat.exists() {
            return Some(Reason::TargetMissing);
        }
        let recorded = match &record.target {
            // Nothing recorded about the target itself; trust the inputs.
            None => return None,
            Some(info) => info,
        };
        if recorded.mtime == stat.mtime && recorded.size == stat.size {
            return None;
        }
        match self {
            Decider::Timestamp => Some(Reason::TargetModified),
            Decider::Content | Decider::Hybrid => {
                if recorded.csig.is_some() && sigs.content(target) == recorded.csig {
                    None
                } else {
                    Some(Reason::TargetModified)
                }
            }
        }
    }

    fn check_input(
        &self,
        record: &BuildRecord,
        recorded: &FileInfo,
        id: NodeId,
        target: Option<NodeId>,
        sigs: &dyn SigSource,
    ) -> Option<Reason> {
        let changed = || Some(Reason::InputModified(sigs.name(id).to_string()));
        match self {
            Decider::Timestamp => {
                let stat = sigs.stat(id);
                if stat.mtime.is_missing() != recorded.mtime.is_missing() {
                    return changed();
                }
                match target.map(|t| sigs.stat(t).mtime) {
                    Some(target_mtime) => {
                        if stat.mtime > target_mtime {
                            return Some(Reason::InputNewer(sigs.name(id).to_string()));
                        }
                    }
                    // No target to compare against; any movement counts.
                    None => {
                        if stat.mtime != recorded.mtime {
                            return changed();
                        }
                    }
                }
                None
            }
            Decider::Content => {
                if sigs.content(id) != recorded.csig {
                    return changed();
                }
                None
            }
            Decider::Hybrid => {
                let stat = sigs.stat(id);
                if recorded.csig.is_some()
                    && stat.mtime == recorded.mtime
                    && stat.size == recorded.size
                    && trusted(recorded.mtime, record)
                {
                    return None;
                }
                if sigs.content(id) != recorded.csig {
                    return changed();
                }
                None
            }
        }
    }
}

/// Whether an unchanged mtime is good evidence of unchanged content.
fn trusted(mtime: MTime, record: &BuildRecord) -> bool {
    match mtime {
        MTime::Missing => true,
        MTime::Stamp(t) => match t.checked_add(HYBRID_TRUST_MARGIN) {
            Some(limit) => limit <= record.recorded_at,
            None => false,
        },
    }
}
