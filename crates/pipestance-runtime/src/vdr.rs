//! Volatile data removal.
//!
//! A stage fork's files are reclaimable once the stage and every consumer of
//! its outputs are complete. Volatile stages lose all their files; other
//! split stages lose only chunk files their final outputs do not point into.
//! Outputs reachable from the top-level returns are never reclaimed.

use crate::events::VdrEvent;
use crate::graph::{Fork, Node};
use crate::pipestance::{EngineState, Pipestance};
use crate::state::node_state;
use pipestance_store::{MetadataFile, MetadataStoreResult, ReclaimedFiles, UnitRef, UnitState, write_json};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

impl Pipestance {
    /// Reclaims every eligible fork not yet reclaimed and records a
    /// `_vdrkill` report on each.
    pub(crate) async fn vdr_locked(&self, state: &EngineState) -> ReclaimedFiles {
        let mut total = ReclaimedFiles::default();
        let mut forks_reclaimed = 0usize;
        for node in state.graph.nodes() {
            if !self.vdr_eligible(state, node) {
                continue;
            }
            for fork in &node.forks {
                if state.snapshot.has(&fork.unit, MetadataFile::VdrKill) {
                    continue;
                }
                let Some(_section) = self.shutdown.enter() else {
                    return total;
                };
                let report = match self.reclaim_fork(node, fork).await {
                    Ok(report) => report,
                    Err(err) => {
                        warn!(fqname = %fork.unit.fqname, error = %err, "volatile data removal failed");
                        continue;
                    }
                };
                if let Err(err) =
                    write_json(self.store.as_ref(), &fork.unit, MetadataFile::VdrKill, &report)
                        .await
                {
                    warn!(fqname = %fork.unit.fqname, error = %err, "could not record vdr report");
                }
                debug!(
                    fqname = %fork.unit.fqname,
                    count = report.count,
                    size = report.size,
                    "reclaimed fork files"
                );
                forks_reclaimed += 1;
                total.merge(report);
            }
        }
        if forks_reclaimed > 0 {
            info!(
                psid = %self.psid,
                forks = forks_reclaimed,
                count = total.count,
                size = total.size,
                "volatile data removed"
            );
            self.events.vdr(VdrEvent::Completed {
                psid: self.psid.clone(),
                count: total.count,
                size: total.size,
            });
        }
        total
    }

    fn vdr_eligible(&self, state: &EngineState, node: &Node) -> bool {
        let Some(stage) = node.stage() else {
            return false;
        };
        if node.retained || !(node.modifiers.volatile || stage.split) {
            return false;
        }
        let complete = |id| node_state(&state.graph, &state.snapshot, id) == UnitState::Complete;
        complete(node.id) && node.postnodes.iter().all(|&post| complete(post))
    }

    async fn reclaim_fork(&self, node: &Node, fork: &Fork) -> MetadataStoreResult<ReclaimedFiles> {
        let Some(units) = fork.stage.as_ref() else {
            return Ok(ReclaimedFiles::default());
        };
        let chunks = units.chunks.iter().flatten().map(|chunk| &chunk.unit);

        let targets: Vec<&UnitRef> = if node.modifiers.volatile {
            [&fork.unit, &units.split, &units.join]
                .into_iter()
                .chain(chunks)
                .collect()
        } else {
            let outs = self
                .store
                .read_raw(&fork.unit, MetadataFile::Outs)
                .await?
                .unwrap_or_default();
            chunks
                .filter(|chunk| chunk.owns_files_dir())
                .filter(|chunk| !outs.contains(&chunk.files_dir.display().to_string()))
                .collect()
        };

        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut report = ReclaimedFiles::default();
        for unit in targets {
            if !seen.insert(unit.files_dir.clone()) {
                continue;
            }
            report.merge(self.store.reclaim_files(unit).await?);
        }
        Ok(report)
    }
}
