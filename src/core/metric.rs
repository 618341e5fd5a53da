//! Distance and similarity metrics over embedding rows

use crate::{CycleAlignError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Metric used to compare two embedding rows.
///
/// The four distance metrics are turned into similarities by negation before
/// temperature scaling; [`Metric::Cosine`] is already a similarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    /// Squared L2 distance
    SquaredEuclidean,
    /// L2 distance, epsilon-stabilized at zero
    Euclidean,
    /// L1 distance
    Manhattan,
    /// L-infinity distance
    Chebyshev,
    /// Cosine similarity of unit-normalized rows
    Cosine,
}

impl Metric {
    /// Every supported metric, in declaration order
    pub const ALL: [Metric; 5] = [
        Metric::SquaredEuclidean,
        Metric::Euclidean,
        Metric::Manhattan,
        Metric::Chebyshev,
        Metric::Cosine,
    ];

    /// Canonical configuration name
    pub fn name(self) -> &'static str {
        match self {
            Metric::SquaredEuclidean => "squared-euclidean",
            Metric::Euclidean => "euclidean",
            Metric::Manhattan => "manhattan",
            Metric::Chebyshev => "chebyshev",
            Metric::Cosine => "cosine",
        }
    }

    /// Whether [`pairwise`](crate::core::pairwise) yields a distance
    /// (negated before use) rather than a similarity.
    pub fn is_distance(self) -> bool {
        !matches!(self, Metric::Cosine)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = CycleAlignError;

    fn from_str(s: &str) -> Result<Self> {
        // Underscore spellings show up in hand-written configs.
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "squared-euclidean" | "sqeuclidean" => Ok(Metric::SquaredEuclidean),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "manhattan" | "l1" => Ok(Metric::Manhattan),
            "chebyshev" | "linf" => Ok(Metric::Chebyshev),
            "cosine" => Ok(Metric::Cosine),
            _ => Err(CycleAlignError::InvalidConfiguration(format!(
                "unknown metric '{s}'"
            ))),
        }
    }
}

impl TryFrom<String> for Metric {
    type Error = CycleAlignError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_names() {
        for metric in Metric::ALL {
            assert_eq!(metric.name().parse::<Metric>().unwrap(), metric);
        }
        assert_eq!("SQUARED_EUCLIDEAN".parse::<Metric>().unwrap(), Metric::SquaredEuclidean);
        assert_eq!("l1".parse::<Metric>().unwrap(), Metric::Manhattan);
    }

    #[test]
    fn test_unknown_metric_names_the_input() {
        let err = "manhattan-typo".parse::<Metric>().unwrap_err();
        match err {
            CycleAlignError::InvalidConfiguration(msg) => assert!(msg.contains("manhattan-typo")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_serde_uses_names() {
        let json = serde_json::to_string(&Metric::Chebyshev).unwrap();
        assert_eq!(json, "\"chebyshev\"");
        let back: Metric = serde_json::from_str("\"cosine\"").unwrap();
        assert_eq!(back, Metric::Cosine);
        assert!(serde_json::from_str::<Metric>("\"hamming\"").is_err());
    }
}
