// src/reference/country.rs
//! Which reference divisions count as countries.
//!
//! Country status is derived, never stored. Reference datasets disagree on
//! what sits at the root level (continents in some, countries in others), so
//! the rule is configurable through `COUNTRY_RULE`.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::fmt;

use crate::matching::normalize::normalize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryRule {
    /// Every direct child of a root is a country. Roots are continents.
    ContinentChildren,
    /// Roots named like a continent are continents and their children are
    /// countries. Any other root is itself a country.
    Heuristic { continents: BTreeSet<String> },
    /// Divisions at exactly this depth (roots are depth 0) are countries.
    Depth(usize),
}

/// What the rule needs to know about the parent of a division.
#[derive(Debug, Clone, Copy)]
pub struct ParentInfo<'a> {
    pub normalized_name: &'a str,
    pub depth: usize,
}

impl CountryRule {
    pub fn heuristic<'a>(continents: impl Iterator<Item = &'a str>) -> Self {
        CountryRule::Heuristic {
            continents: continents
                .map(normalize)
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Parses `continent_children`, `heuristic` or `depth:N`.
    pub fn parse<'a>(raw: &str, continents: impl Iterator<Item = &'a str>) -> Result<Self> {
        let raw = raw.trim().to_lowercase();
        match raw.as_str() {
            "continent_children" => Ok(CountryRule::ContinentChildren),
            "heuristic" => Ok(Self::heuristic(continents)),
            other => {
                let depth = other
                    .strip_prefix("depth:")
                    .ok_or_else(|| anyhow!("unknown country rule '{}'", other))?;
                let depth = depth
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| anyhow!("invalid depth in country rule '{}': {}", other, e))?;
                Ok(CountryRule::Depth(depth))
            }
        }
    }

    fn is_continent_name(&self, normalized_name: &str) -> bool {
        match self {
            CountryRule::Heuristic { continents } => continents.contains(normalized_name),
            _ => false,
        }
    }

    /// Decides country status of one division from its own normalized name,
    /// its depth and its parent (if any).
    pub fn is_country(
        &self,
        normalized_name: &str,
        depth: usize,
        parent: Option<ParentInfo<'_>>,
    ) -> bool {
        match self {
            CountryRule::ContinentChildren => depth == 1,
            CountryRule::Depth(n) => depth == *n,
            CountryRule::Heuristic { .. } => match parent {
                None => !self.is_continent_name(normalized_name),
                Some(p) => p.depth == 0 && self.is_continent_name(p.normalized_name),
            },
        }
    }
}

impl fmt::Display for CountryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountryRule::ContinentChildren => write!(f, "continent_children"),
            CountryRule::Heuristic { continents } => {
                write!(f, "heuristic ({} continent names)", continents.len())
            }
            CountryRule::Depth(n) => write!(f, "depth:{}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn continents() -> CountryRule {
        CountryRule::heuristic(["Europe", "Asia"].into_iter())
    }

    #[test]
    fn test_heuristic_children_of_continents_are_countries() {
        let rule = continents();
        let europe = ParentInfo { normalized_name: "europe", depth: 0 };
        assert!(rule.is_country("germany", 1, Some(europe)));
        assert!(!rule.is_country("europe", 0, None));
    }

    #[test]
    fn test_heuristic_root_countries_are_countries() {
        let rule = continents();
        assert!(rule.is_country("france", 0, None));
        let france = ParentInfo { normalized_name: "france", depth: 0 };
        assert!(!rule.is_country("ile de france", 1, Some(france)));
    }

    #[test]
    fn test_parse_rules() {
        let none: [&str; 0] = [];
        assert_eq!(
            CountryRule::parse("depth:2", none.into_iter()).unwrap(),
            CountryRule::Depth(2)
        );
        assert_eq!(
            CountryRule::parse(" Continent_Children ", none.into_iter()).unwrap(),
            CountryRule::ContinentChildren
        );
        assert!(CountryRule::parse("depth:x", none.into_iter()).is_err());
        assert!(CountryRule::parse("whatever", none.into_iter()).is_err());
    }

    #[test]
    fn test_depth_rule() {
        let rule = CountryRule::Depth(0);
        assert!(rule.is_country("anything", 0, None));
        assert!(!rule.is_country("anything", 1, None));
    }
}
