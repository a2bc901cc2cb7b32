use serde::{Deserialize, Serialize};
use tracing::debug;

/// One worker's answer in a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Worker (or step) that proposed the content.
    pub proposer: String,
    /// Opaque token, compared by exact equality only.
    pub content: String,
    /// Vote weight; non-positive weights count as zero.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Proposal {
    /// A proposal with weight 1.0.
    pub fn new(proposer: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            proposer: proposer.into(),
            content: content.into(),
            weight: default_weight(),
        }
    }

    /// Set the vote weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Result of one consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    /// Winning content.
    pub winner: String,
    /// Summed weight of the winning group.
    pub score: f64,
    /// Share of proposals equal to the winner.
    pub agreement: f64,
    /// Every proposal considered in the round.
    pub proposals: Vec<Proposal>,
}

/// Weighted plurality voting over competing proposals.
///
/// Ties on score go to the longer content string, then to the group seen
/// first. The length rule is kept for compatibility and carries no meaning.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsensusResolver;

impl ConsensusResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Pick the winning content. `weights` is ignored unless it has exactly
    /// one entry per proposal. Returns `None` for an empty round.
    pub fn calculate_winner(&self, proposals: &[String], weights: Option<&[f64]>) -> Option<String> {
        let weights: Vec<f64> = match weights {
            Some(w) if w.len() == proposals.len() => w.to_vec(),
            Some(w) => {
                debug!(
                    proposals = proposals.len(),
                    weights = w.len(),
                    "Weight count mismatch, falling back to uniform weights"
                );
                vec![1.0; proposals.len()]
            }
            None => vec![1.0; proposals.len()],
        };

        // Groups in first-seen order.
        let mut groups: Vec<(&str, f64)> = Vec::new();
        for (content, weight) in proposals.iter().zip(weights) {
            match groups.iter_mut().find(|(c, _)| *c == content.as_str()) {
                Some(group) => group.1 += weight,
                None => groups.push((content.as_str(), weight)),
            }
        }

        let mut best: Option<(&str, f64)> = None;
        for (content, score) in groups {
            best = match best {
                None => Some((content, score)),
                Some((best_content, best_score)) => {
                    if score > best_score
                        || (score == best_score && content.len() > best_content.len())
                    {
                        Some((content, score))
                    } else {
                        Some((best_content, best_score))
                    }
                }
            };
        }
        best.map(|(content, _)| content.to_string())
    }

    /// Fraction of proposals equal to `winner`; `0.0` for an empty round.
    pub fn get_agreement_score(&self, proposals: &[String], winner: &str) -> f64 {
        if proposals.is_empty() {
            return 0.0;
        }
        let agreeing = proposals.iter().filter(|p| p.as_str() == winner).count();
        agreeing as f64 / proposals.len() as f64
    }

    /// Resolve a round using each proposal's own weight.
    pub fn resolve(&self, proposals: &[Proposal]) -> Option<ConsensusOutcome> {
        let contents: Vec<String> = proposals.iter().map(|p| p.content.clone()).collect();
        let weights: Vec<f64> = proposals.iter().map(|p| p.weight).collect();

        let winner = self.calculate_winner(&contents, Some(&weights))?;
        let score = proposals
            .iter()
            .filter(|p| p.content == winner)
            .map(|p| p.weight)
            .sum();
        let agreement = self.get_agreement_score(&contents, &winner);

        Some(ConsensusOutcome {
            winner,
            score,
            agreement,
            proposals: proposals.to_vec(),
        })
    }
}
