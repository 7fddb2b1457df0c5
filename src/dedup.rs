//! Concept deduplication: canonical names, fuzzy matching, and merge rules.
//!
//! Concept mentions arrive from extraction in many surface forms ("IV",
//! "instrumental variables", "Instrumental Variables (IV)"). The
//! deduplicator projects them onto canonical names, measures similarity
//! between near-miss forms, and merges records that resolve to the same
//! concept. Embedding similarity is a last-resort signal that escalates to
//! manual review rather than merging automatically.

use regex::Regex;
use std::collections::BTreeSet;

use crate::config::DedupConfig;
use crate::embedding::cosine_similarity;
use crate::models::Concept;

/// Abbreviation expansions for the causal-inference domain.
///
/// Keys are matched against the whole normalized name. Expansions are
/// themselves canonical (lowercase, hyphenated where conventional), so
/// canonicalization is a projection.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("iv", "instrumental variables"),
    ("ivs", "instrumental variables"),
    ("2sls", "two-stage least squares"),
    ("tsls", "two-stage least squares"),
    ("did", "difference-in-differences"),
    ("dd", "difference-in-differences"),
    ("diff-in-diff", "difference-in-differences"),
    ("rdd", "regression discontinuity design"),
    ("rd", "regression discontinuity"),
    ("psm", "propensity score matching"),
    ("ate", "average treatment effect"),
    ("att", "average treatment effect on the treated"),
    ("atc", "average treatment effect on the controls"),
    ("atu", "average treatment effect on the untreated"),
    ("late", "local average treatment effect"),
    ("cate", "conditional average treatment effect"),
    ("itt", "intention to treat"),
    ("tot", "treatment on the treated"),
    ("ols", "ordinary least squares"),
    ("gls", "generalized least squares"),
    ("gmm", "generalized method of moments"),
    ("ml", "machine learning"),
    ("dml", "double machine learning"),
    ("lasso", "least absolute shrinkage and selection operator"),
    ("rf", "random forest"),
    ("gbm", "gradient boosting machine"),
    ("xgboost", "extreme gradient boosting"),
    ("dag", "directed acyclic graph"),
    ("scm", "structural causal model"),
    ("sem", "structural equation model"),
    ("rct", "randomized controlled trial"),
    ("fe", "fixed effects"),
    ("re", "random effects"),
    ("cia", "conditional independence assumption"),
    ("sutva", "stable unit treatment value assumption"),
    ("nuc", "no unmeasured confounding"),
];

/// Outcome of comparing two concept records for duplication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchDecision {
    /// Canonical names are identical: same concept, merge.
    Exact,
    /// Token-set similarity at or above the fuzzy threshold: merge.
    Fuzzy(f64),
    /// Only the embedding signal fired above the semantic threshold.
    /// Flag for manual review; never auto-merge on this alone.
    SemanticReview(f64),
    /// Not duplicates.
    Distinct,
}

/// Canonicalizes concept names and decides merges.
pub struct Deduplicator {
    fuzzy_threshold: f64,
    semantic_threshold: f64,
    parenthetical: Regex,
    special: Regex,
    whitespace: Regex,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Deduplicator {
            fuzzy_threshold: config.fuzzy_threshold,
            semantic_threshold: config.semantic_threshold,
            parenthetical: Regex::new(r"\s*\([^)]*\)\s*").expect("static pattern"),
            special: Regex::new(r"[^\w\s-]").expect("static pattern"),
            whitespace: Regex::new(r"\s+").expect("static pattern"),
        }
    }

    /// Project a raw concept name onto its canonical form.
    ///
    /// Lowercases, strips parenthetical asides (usually inline abbreviation
    /// definitions), drops punctuation other than hyphens, collapses
    /// whitespace, then expands known whole-string abbreviations. Applying
    /// the projection twice yields the same result as applying it once.
    pub fn to_canonical_name(&self, name: &str) -> String {
        let lowered = name.to_lowercase();
        let stripped = self.parenthetical.replace_all(lowered.trim(), " ");
        let cleaned = self.special.replace_all(&stripped, "");
        let collapsed = self
            .whitespace
            .replace_all(cleaned.trim(), " ")
            .to_string();

        match ABBREVIATIONS.iter().find(|(abbr, _)| *abbr == collapsed) {
            Some((_, expansion)) => expansion.to_string(),
            None => collapsed,
        }
    }

    /// Similarity between two names in [0, 1] over canonicalized forms.
    ///
    /// Exact canonical matches score 1.0; otherwise token-set Jaccard,
    /// with tokens split on non-alphanumerics so hyphenation differences
    /// ("difference in differences" vs "difference-in-differences") do not
    /// count against the match.
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        let ca = self.to_canonical_name(a);
        let cb = self.to_canonical_name(b);

        if ca.is_empty() || cb.is_empty() {
            return 0.0;
        }
        if ca == cb {
            return 1.0;
        }

        jaccard(&tokenize(&ca), &tokenize(&cb))
    }

    pub fn are_duplicates(&self, a: &str, b: &str) -> bool {
        self.similarity(a, b) >= self.fuzzy_threshold
    }

    /// Decide whether two concept records refer to the same concept.
    ///
    /// Name-level signals (canonical equality, fuzzy similarity, alias
    /// overlap) decide a merge on their own. When they all miss, a high
    /// embedding similarity escalates to review status instead of merging.
    pub fn decide(&self, a: &Concept, b: &Concept) -> MatchDecision {
        if a.canonical_name == b.canonical_name {
            return MatchDecision::Exact;
        }

        let a_aliases = self.aliases_for(a);
        let b_aliases = self.aliases_for(b);
        if a_aliases.contains(&b.canonical_name) || b_aliases.contains(&a.canonical_name) {
            return MatchDecision::Fuzzy(1.0);
        }

        let name_sim = self.similarity(&a.canonical_name, &b.canonical_name);
        if name_sim >= self.fuzzy_threshold {
            return MatchDecision::Fuzzy(name_sim);
        }

        if let (Some(ea), Some(eb)) = (a.embedding.as_deref(), b.embedding.as_deref()) {
            let cos = cosine_similarity(ea, eb) as f64;
            if cos > self.semantic_threshold {
                return MatchDecision::SemanticReview(cos);
            }
        }

        MatchDecision::Distinct
    }

    /// Merge concept records that resolved to the same canonical name.
    ///
    /// The first record is the base. Aliases are unioned; the definition is
    /// the longest non-empty one among inputs; confidence is the maximum
    /// (repeated independent extraction is evidence of validity, not
    /// noise); validation survives if any input was validated.
    pub fn merge_concepts(&self, concepts: Vec<Concept>) -> Option<Concept> {
        let mut iter = concepts.into_iter();
        let mut merged = iter.next()?;

        let mut aliases: BTreeSet<String> = merged.aliases.iter().cloned().collect();

        for concept in iter {
            aliases.extend(concept.aliases.iter().cloned());
            if concept.name != merged.name {
                aliases.insert(concept.name.clone());
            }

            let current_len = merged.definition.as_deref().map_or(0, str::len);
            if let Some(def) = &concept.definition {
                if def.len() > current_len {
                    merged.definition = Some(def.clone());
                }
            }

            merged.confidence_score = match (merged.confidence_score, concept.confidence_score) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            merged.validated = merged.validated || concept.validated;
        }

        aliases.remove(&merged.name);
        merged.aliases = aliases.into_iter().collect();
        Some(merged)
    }

    /// All canonical aliases of a concept, including abbreviation forms
    /// that expand to its canonical name.
    pub fn aliases_for(&self, concept: &Concept) -> BTreeSet<String> {
        let mut aliases: BTreeSet<String> = BTreeSet::new();
        aliases.insert(self.to_canonical_name(&concept.name));
        for alias in &concept.aliases {
            aliases.insert(self.to_canonical_name(alias));
        }

        let canonical = self.to_canonical_name(&concept.name);
        for (abbr, expansion) in ABBREVIATIONS {
            if *expansion == canonical {
                aliases.insert((*abbr).to_string());
            }
        }

        aliases
    }
}

fn tokenize(s: &str) -> BTreeSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConceptType, Metadata};
    use uuid::Uuid;

    fn dedup() -> Deduplicator {
        Deduplicator::new(&DedupConfig::default())
    }

    fn concept(name: &str, canonical: &str) -> Concept {
        Concept {
            id: Uuid::new_v4(),
            name: name.to_string(),
            canonical_name: canonical.to_string(),
            aliases: vec![],
            concept_type: ConceptType::Method,
            category: None,
            definition: None,
            embedding: None,
            extraction_method: None,
            confidence_score: None,
            validated: false,
            metadata: Metadata::new(),
            created_at: 0,
        }
    }

    #[test]
    fn test_abbreviation_expansion() {
        let d = dedup();
        assert_eq!(d.to_canonical_name("IV"), "instrumental variables");
        assert_eq!(d.to_canonical_name("DiD"), "difference-in-differences");
        assert_eq!(d.to_canonical_name("DD"), "difference-in-differences");
        assert_eq!(d.to_canonical_name("2SLS"), "two-stage least squares");
        assert_eq!(d.to_canonical_name("TSLS"), "two-stage least squares");
        assert_eq!(d.to_canonical_name("SUTVA"), "stable unit treatment value assumption");
    }

    #[test]
    fn test_unknown_terms_pass_through_normalized() {
        let d = dedup();
        assert_eq!(d.to_canonical_name("  Backdoor   Criterion! "), "backdoor criterion");
        assert_eq!(d.to_canonical_name("Pearl's do-calculus"), "pearls do-calculus");
    }

    #[test]
    fn test_parenthetical_definitions_stripped() {
        let d = dedup();
        assert_eq!(
            d.to_canonical_name("Instrumental Variables (IV)"),
            "instrumental variables"
        );
        // Stripping the aside leaves the bare abbreviation, which expands
        assert_eq!(
            d.to_canonical_name("IV (instrumental variables)"),
            "instrumental variables"
        );
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let d = dedup();
        for raw in [
            "IV",
            "IV (instrumental variables)",
            "Difference in Differences",
            "difference-in-differences",
            "Regression Discontinuity Design",
            "Pearl's Back-Door Criterion (1995)",
            "2SLS",
            "  weird   spacing\tname ",
            "",
        ] {
            let once = d.to_canonical_name(raw);
            let twice = d.to_canonical_name(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_hyphenation_variants_are_duplicates() {
        let d = dedup();
        assert!(d.are_duplicates("Difference in Differences", "difference-in-differences"));
        assert_eq!(
            d.similarity("Difference in Differences", "difference-in-differences"),
            1.0
        );
    }

    #[test]
    fn test_abbreviation_variants_are_duplicates() {
        let d = dedup();
        assert!(d.are_duplicates("IV", "instrumental variables"));
        assert!(d.are_duplicates("DiD", "DD"));
    }

    #[test]
    fn test_distinct_concepts_are_not_duplicates() {
        let d = dedup();
        assert!(!d.are_duplicates("instrumental variables", "propensity score matching"));
        assert!(d.similarity("instrumental variables", "propensity score matching") < 0.5);
    }

    #[test]
    fn test_similarity_bounds() {
        let d = dedup();
        for (a, b) in [
            ("iv", "iv"),
            ("average treatment effect", "local average treatment effect"),
            ("", "something"),
            ("x y z", "a b c"),
        ] {
            let s = d.similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "similarity {} out of range", s);
        }
    }

    #[test]
    fn test_decide_exact() {
        let d = dedup();
        let a = concept("IV", "instrumental variables");
        let b = concept("instrumental variables", "instrumental variables");
        assert_eq!(d.decide(&a, &b), MatchDecision::Exact);
    }

    #[test]
    fn test_decide_semantic_escalates_to_review() {
        let d = dedup();
        let mut a = concept("backdoor criterion", "backdoor criterion");
        let mut b = concept("frontdoor criterion", "frontdoor criterion");
        // Nearly identical embeddings, but names disagree: review, not merge
        a.embedding = Some(vec![1.0, 0.0, 0.001]);
        b.embedding = Some(vec![1.0, 0.0, 0.0]);
        match d.decide(&a, &b) {
            MatchDecision::SemanticReview(sim) => assert!(sim > 0.95),
            other => panic!("expected SemanticReview, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_distinct_without_embeddings() {
        let d = dedup();
        let a = concept("backdoor criterion", "backdoor criterion");
        let b = concept("random forest", "random forest");
        assert_eq!(d.decide(&a, &b), MatchDecision::Distinct);
    }

    #[test]
    fn test_merge_unions_aliases_and_keeps_best_fields() {
        let d = dedup();
        let mut a = concept("instrumental variables", "instrumental variables");
        a.aliases = vec!["iv".to_string()];
        a.definition = Some("short".to_string());
        a.confidence_score = Some(0.6);

        let mut b = concept("IV estimation", "instrumental variables");
        b.aliases = vec!["ivs".to_string()];
        b.definition = Some("a considerably longer definition of the estimator".to_string());
        b.confidence_score = Some(0.9);
        b.validated = true;

        let merged = d.merge_concepts(vec![a, b]).unwrap();
        assert_eq!(merged.name, "instrumental variables");
        assert!(merged.aliases.contains(&"iv".to_string()));
        assert!(merged.aliases.contains(&"ivs".to_string()));
        assert!(merged.aliases.contains(&"IV estimation".to_string()));
        assert_eq!(
            merged.definition.as_deref(),
            Some("a considerably longer definition of the estimator")
        );
        assert_eq!(merged.confidence_score, Some(0.9));
        assert!(merged.validated);
    }

    #[test]
    fn test_merge_empty_input() {
        let d = dedup();
        assert!(d.merge_concepts(vec![]).is_none());
    }

    #[test]
    fn test_aliases_include_reverse_abbreviations() {
        let d = dedup();
        let c = concept("Instrumental Variables", "instrumental variables");
        let aliases = d.aliases_for(&c);
        assert!(aliases.contains("iv"));
        assert!(aliases.contains("ivs"));
    }
}
