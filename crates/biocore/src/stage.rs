use ledger::{EpochMillis, MILLIS_PER_DAY};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionStage {
    Spore,
    Sprout,
    Sapling,
    Bloom,
    Ancient,
}

const STAGES: [EvolutionStage; 5] = [
    EvolutionStage::Spore,
    EvolutionStage::Sprout,
    EvolutionStage::Sapling,
    EvolutionStage::Bloom,
    EvolutionStage::Ancient,
];

impl EvolutionStage {
    /// Evolution time required to reach this stage.
    pub const fn min_duration(self) -> EpochMillis {
        match self {
            Self::Spore => 0,
            Self::Sprout => MILLIS_PER_DAY,
            Self::Sapling => 3 * MILLIS_PER_DAY,
            Self::Bloom => 7 * MILLIS_PER_DAY,
            Self::Ancient => 30 * MILLIS_PER_DAY,
        }
    }

    pub fn from_evolution(evolution_ms: EpochMillis) -> Self {
        STAGES
            .iter()
            .rev()
            .copied()
            .find(|stage| evolution_ms >= stage.min_duration())
            .unwrap_or(Self::Spore)
    }

    pub fn next(self) -> Option<Self> {
        STAGES
            .iter()
            .position(|stage| *stage == self)
            .and_then(|index| STAGES.get(index + 1))
            .copied()
    }

    /// Fraction (0..=1) of the way from this stage to the next one. The final
    /// stage always reports 1.
    pub fn progress(evolution_ms: EpochMillis) -> f64 {
        let stage = Self::from_evolution(evolution_ms);
        match stage.next() {
            Some(next) => {
                let span = (next.min_duration() - stage.min_duration()) as f64;
                let into = (evolution_ms - stage.min_duration()) as f64;
                (into / span).clamp(0.0, 1.0)
            }
            None => 1.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Spore => "spore",
            Self::Sprout => "sprout",
            Self::Sapling => "sapling",
            Self::Bloom => "bloom",
            Self::Ancient => "ancient",
        }
    }
}

impl std::fmt::Display for EvolutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
