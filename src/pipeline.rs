use std::collections::HashMap;
use std::collections::HashSet;

use crate::domain::PipelineError;
use crate::domain::Stage;
use crate::domain::StageResult;

/// Predicate deciding whether a conditional branch fires for a given
/// stage outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCondition {
    HasAttachments,
}

impl BranchCondition {
    fn matches(&self, result: &StageResult) -> bool {
        match self {
            BranchCondition::HasAttachments => match result {
                StageResult::Advance(info) => info.has_attachments,
                StageResult::FanOut { .. } => true,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConditionalBranch {
    pub to: Stage,
    pub when: BranchCondition,
}

/// Declarative description of one stage: its inbound queue, where an
/// `Advance` goes, which conditional branches exist, and whether the
/// stage sits on a side path that must never advance the main flow.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage: Stage,
    pub default_next: Option<Stage>,
    pub branches: Vec<ConditionalBranch>,
    pub side_path: bool,
}

/// The directed acyclic pipeline graph. Construction validates the
/// topology so a bad edit fails at startup, not mid-submission.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    specs: HashMap<Stage, StageSpec>,
    topo: Vec<Stage>,
}

impl PipelineDefinition {
    /// The prior-authorization pipeline:
    /// `parse → {validate, attachments}; validate → enrich → convert →
    /// payer-call → build-response → notify-subscribers → ∅`.
    pub fn standard() -> Self {
        Self::build(vec![
            StageSpec {
                stage: Stage::Parse,
                default_next: Some(Stage::Validate),
                branches: vec![ConditionalBranch {
                    to: Stage::Attachments,
                    when: BranchCondition::HasAttachments,
                }],
                side_path: false,
            },
            StageSpec {
                stage: Stage::Validate,
                default_next: Some(Stage::Enrich),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::Enrich,
                default_next: Some(Stage::Convert),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::Convert,
                default_next: Some(Stage::PayerCall),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::PayerCall,
                default_next: Some(Stage::BuildResponse),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::BuildResponse,
                default_next: Some(Stage::NotifySubscribers),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::NotifySubscribers,
                default_next: None,
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::Attachments,
                default_next: None,
                branches: vec![],
                side_path: true,
            },
        ])
        .expect("the standard pipeline must be a valid DAG")
    }

    fn build(specs: Vec<StageSpec>) -> Result<Self, PipelineError> {
        let by_stage: HashMap<Stage, StageSpec> =
            specs.into_iter().map(|s| (s.stage, s)).collect();

        // every edge target must be a defined stage
        for spec in by_stage.values() {
            for target in spec
                .default_next
                .iter()
                .chain(spec.branches.iter().map(|b| &b.to))
            {
                if !by_stage.contains_key(target) {
                    return Err(PipelineError::transient(anyhow::anyhow!(
                        "stage {} routes to undefined stage {}",
                        spec.stage,
                        target
                    )));
                }
            }
        }

        let topo = topological_order(&by_stage)?;
        Ok(Self {
            specs: by_stage,
            topo,
        })
    }

    pub fn spec(&self, stage: Stage) -> &StageSpec {
        // all eight stages are present in the standard pipeline
        &self.specs[&stage]
    }

    pub fn default_next(&self, stage: Stage) -> Option<Stage> {
        self.spec(stage).default_next
    }

    pub fn is_side_path(&self, stage: Stage) -> bool {
        self.spec(stage).side_path
    }

    /// All destinations a result routes to: the default next stage plus
    /// every conditional branch whose predicate matches.
    pub fn destinations(&self, stage: Stage, result: &StageResult) -> Vec<Stage> {
        let spec = self.spec(stage);
        let mut out = Vec::new();
        if let Some(next) = spec.default_next {
            out.push(next);
        }
        for branch in &spec.branches {
            if branch.when.matches(result) {
                out.push(branch.to);
            }
        }
        out
    }

    /// Whether `from → to` is a declared edge; fan-out legs returned by a
    /// handler must each map to one.
    pub fn edge_exists(&self, from: Stage, to: Stage) -> bool {
        let spec = self.spec(from);
        spec.default_next == Some(to) || spec.branches.iter().any(|b| b.to == to)
    }

    /// Position of a stage in the topological order; `last_stage`
    /// sequences observed per submission must be increasing in it.
    pub fn topo_index(&self, stage: Stage) -> usize {
        self.topo
            .iter()
            .position(|s| *s == stage)
            .unwrap_or(usize::MAX)
    }
}

fn topological_order(
    specs: &HashMap<Stage, StageSpec>,
) -> Result<Vec<Stage>, PipelineError> {
    let mut order = Vec::new();
    let mut done: HashSet<Stage> = HashSet::new();
    let mut in_progress: HashSet<Stage> = HashSet::new();

    fn visit(
        stage: Stage,
        specs: &HashMap<Stage, StageSpec>,
        done: &mut HashSet<Stage>,
        in_progress: &mut HashSet<Stage>,
        order: &mut Vec<Stage>,
    ) -> Result<(), PipelineError> {
        if done.contains(&stage) {
            return Ok(());
        }
        if !in_progress.insert(stage) {
            return Err(PipelineError::transient(anyhow::anyhow!(
                "pipeline contains a cycle through {stage}"
            )));
        }
        let spec = &specs[&stage];
        for target in spec
            .default_next
            .iter()
            .chain(spec.branches.iter().map(|b| &b.to))
        {
            visit(*target, specs, done, in_progress, order)?;
        }
        in_progress.remove(&stage);
        done.insert(stage);
        order.push(stage);
        Ok(())
    }

    let mut stages: Vec<Stage> = specs.keys().copied().collect();
    stages.sort_by_key(|s| s.as_str());
    for stage in stages {
        visit(stage, specs, &mut done, &mut in_progress, &mut order)?;
    }
    order.reverse();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_standard_pipeline_is_a_valid_dag() {
        let pipeline = PipelineDefinition::standard();
        // main-path edges appear in topological order
        let chain = [
            Stage::Parse,
            Stage::Validate,
            Stage::Enrich,
            Stage::Convert,
            Stage::PayerCall,
            Stage::BuildResponse,
            Stage::NotifySubscribers,
        ];
        for pair in chain.windows(2) {
            assert!(pipeline.topo_index(pair[0]) < pipeline.topo_index(pair[1]));
        }
        assert!(pipeline.topo_index(Stage::Parse) < pipeline.topo_index(Stage::Attachments));
    }

    #[test]
    fn attachments_branch_fires_only_when_present() {
        let pipeline = PipelineDefinition::standard();
        let without = StageResult::Advance(crate::domain::AdvanceInfo::default());
        assert_eq!(
            pipeline.destinations(Stage::Parse, &without),
            vec![Stage::Validate]
        );

        let with = StageResult::Advance(crate::domain::AdvanceInfo {
            has_attachments: true,
            attachment_count: 2,
            ..Default::default()
        });
        assert_eq!(
            pipeline.destinations(Stage::Parse, &with),
            vec![Stage::Validate, Stage::Attachments]
        );
    }

    #[test]
    fn the_side_path_is_terminal_and_flagged() {
        let pipeline = PipelineDefinition::standard();
        assert!(pipeline.is_side_path(Stage::Attachments));
        assert_eq!(pipeline.default_next(Stage::Attachments), None);
        assert_eq!(pipeline.default_next(Stage::NotifySubscribers), None);
    }

    #[test]
    fn a_cycle_is_rejected() {
        let specs = vec![
            StageSpec {
                stage: Stage::Parse,
                default_next: Some(Stage::Validate),
                branches: vec![],
                side_path: false,
            },
            StageSpec {
                stage: Stage::Validate,
                default_next: Some(Stage::Parse),
                branches: vec![],
                side_path: false,
            },
        ];
        assert!(PipelineDefinition::build(specs).is_err());
    }
}
