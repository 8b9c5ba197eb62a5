//! Spanish-aware keyword matching: normalization, light stemming and
//! synonym-expanded variant groups.
//!
//! The morphology (suffix table) and synonym dictionary are data, with
//! compiled-in defaults and an optional YAML override, so adding a language
//! touches no matcher code.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "mirador-match";

/// Suffixes stripped by the default Spanish stemmer, tried in order.
const DEFAULT_SUFFIXES: &[&str] = &[
    "oso", "osa", "idad", "cion", "sion", "ero", "era", "ado", "ada",
];

/// Function words dropped when splitting a raw keyword string.
const STOPWORDS: &[&str] = &[
    "que", "con", "para", "por", "una", "uno", "los", "las", "del", "de", "la", "el",
];

/// Built-in synonym seeds; keys and values are already normalized.
const DEFAULT_SYNONYMS: &[(&str, &[&str])] = &[
    ("apto", &["apartamento", "apartamentos"]),
    ("apartamento", &["apto", "apartamentos"]),
    ("garage", &["garaje", "cochera", "parking"]),
    ("garaje", &["garage", "cochera", "parking"]),
    ("cochera", &["garage", "garaje", "parking"]),
    ("balcon", &["terraza", "balcones"]),
    ("terraza", &["balcon", "terrazas"]),
    ("parrillero", &["parrilla", "barbacoa"]),
    ("parrilla", &["parrillero", "barbacoa"]),
    ("barbacoa", &["parrillero", "parrilla"]),
    ("piscina", &["pileta"]),
    ("pileta", &["piscina"]),
    ("luminoso", &["luminosa", "iluminado", "iluminada"]),
    ("amueblado", &["amueblada", "equipado", "equipada"]),
    ("mascotas", &["mascota", "pet friendly"]),
];

/// Canonicalizes text for matching: NFKD, combining marks stripped,
/// lower-cased, whitespace collapsed to single spaces.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Suffix-stripping stemmer over a replaceable suffix table.
#[derive(Debug, Clone)]
pub struct Morphology {
    suffixes: Vec<String>,
}

impl Default for Morphology {
    fn default() -> Self {
        Self {
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Morphology {
    pub fn new(suffixes: Vec<String>) -> Self {
        Self { suffixes }
    }

    /// Strips the first suffix that leaves a stem of at least three
    /// characters; returns the word unchanged when none applies.
    pub fn stem<'a>(&self, word: &'a str) -> &'a str {
        for suffix in &self.suffixes {
            if let Some(stem) = word.strip_suffix(suffix.as_str()) {
                if stem.chars().count() >= 3 {
                    return stem;
                }
            }
        }
        word
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LexiconFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    suffixes: Option<Vec<String>>,
    #[serde(default)]
    synonyms: BTreeMap<String, Vec<String>>,
}

/// Morphology plus synonym dictionary; defaults compiled in, both
/// replaceable from a YAML file.
#[derive(Debug, Clone)]
pub struct Lexicon {
    pub morphology: Morphology,
    synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for Lexicon {
    fn default() -> Self {
        let synonyms = DEFAULT_SYNONYMS
            .iter()
            .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
            .collect();
        Self {
            morphology: Morphology::default(),
            synonyms,
        }
    }
}

impl Lexicon {
    /// Loads an override file; its suffix table (when present) replaces the
    /// default, its synonym entries merge over the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: LexiconFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut lexicon = Lexicon::default();
        if let Some(suffixes) = file.suffixes {
            lexicon.morphology = Morphology::new(suffixes);
        }
        for (key, values) in file.synonyms {
            lexicon
                .synonyms
                .insert(normalize(&key), values.iter().map(|v| normalize(v)).collect());
        }
        Ok(lexicon)
    }

    pub fn synonyms_of(&self, canonical: &str) -> &[String] {
        self.synonyms
            .get(canonical)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// One keyword with every way it may appear; all entries normalized,
/// canonical first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantGroup {
    pub canonical: String,
    pub variants: Vec<String>,
}

impl VariantGroup {
    /// Builds a group from a keyword plus stored variants, seeding extra
    /// variants from the lexicon's synonym dictionary.
    pub fn expand(keyword: &str, stored_variants: &[String], lexicon: &Lexicon) -> Self {
        fn push(variants: &mut Vec<String>, candidate: String) {
            if !candidate.is_empty() && !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
        let canonical = normalize(keyword);
        let mut variants = vec![canonical.clone()];
        for stored in stored_variants {
            push(&mut variants, normalize(stored));
        }
        for synonym in lexicon.synonyms_of(&canonical) {
            push(&mut variants, synonym.clone());
        }
        // Qualifying stems join the set as variants in their own right, so
        // the prefix rule also covers derived forms.
        for index in 0..variants.len() {
            let stem = lexicon.morphology.stem(&variants[index]).to_string();
            if stem != variants[index] {
                push(&mut variants, stem);
            }
        }
        Self { canonical, variants }
    }
}

/// Which rule resolved a keyword against a text, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Exact,
    Stem,
    Prefix,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::Exact => "exact",
            MatchRule::Stem => "stem",
            MatchRule::Prefix => "prefix",
        }
    }
}

/// Splits a raw keyword string into candidate keywords: normalized tokens,
/// comma or whitespace separated, short tokens and function words dropped,
/// order-preserving dedup.
pub fn split_raw_keywords(raw: &str) -> Vec<String> {
    let normalized = normalize(raw);
    let mut out: Vec<String> = Vec::new();
    for token in normalized.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim();
        if token.chars().count() <= 2 || STOPWORDS.contains(&token) {
            continue;
        }
        if !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}

fn prefix_of(variant: &str) -> Option<String> {
    let chars: Vec<char> = variant.chars().collect();
    if chars.len() > 4 {
        Some(chars[..chars.len() - 2].iter().collect())
    } else {
        None
    }
}

/// Tests one group against normalized text: exact substring first, then the
/// stemmed form, then a two-character-shortened prefix for longer variants.
/// Returns the winning variant and rule.
pub fn group_hit(
    text_norm: &str,
    group: &VariantGroup,
    morphology: &Morphology,
) -> Option<(String, MatchRule)> {
    for variant in &group.variants {
        if text_norm.contains(variant.as_str()) {
            return Some((variant.clone(), MatchRule::Exact));
        }
    }
    for variant in &group.variants {
        let stem = morphology.stem(variant);
        if stem != variant && text_norm.contains(stem) {
            return Some((variant.clone(), MatchRule::Stem));
        }
    }
    for variant in &group.variants {
        if let Some(prefix) = prefix_of(variant) {
            if text_norm.contains(prefix.as_str()) {
                return Some((variant.clone(), MatchRule::Prefix));
            }
        }
    }
    None
}

/// Strict conjunction: every group must hit (OR within a group, AND across
/// groups). No groups means everything matches.
pub fn matches(text_norm: &str, groups: &[VariantGroup], morphology: &Morphology) -> bool {
    groups
        .iter()
        .all(|group| group_hit(text_norm, group, morphology).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_accents_and_collapses_space() {
        assert_eq!(normalize("  Balcón   con  PARRILLERO "), "balcon con parrillero");
        assert_eq!(normalize("Ñandú"), "nandu");
        // Idempotent.
        let once = normalize("Luminosidad  única");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn stemming_requires_three_char_stem() {
        let m = Morphology::default();
        assert_eq!(m.stem("luminoso"), "lumin");
        assert_eq!(m.stem("luminosidad"), "luminos");
        assert_eq!(m.stem("oso"), "oso");
        assert_eq!(m.stem("casa"), "casa");
    }

    #[test]
    fn stem_rule_bridges_derived_forms() {
        let morphology = Morphology::default();
        let group = VariantGroup {
            canonical: "luminoso".into(),
            variants: vec!["luminoso".into()],
        };
        let hit = group_hit("apartamento de gran luminosidad", &group, &morphology);
        assert_eq!(hit, Some(("luminoso".to_string(), MatchRule::Stem)));
    }

    #[test]
    fn expanded_groups_carry_stems_as_variants() {
        let lexicon = Lexicon {
            synonyms: BTreeMap::new(),
            ..Lexicon::default()
        };
        let group = VariantGroup::expand("parrillada", &[], &lexicon);
        assert!(group.variants.contains(&"parrill".to_string()));
        // The prefix rule now reaches the stem: "parri" is in "parrilera".
        let hit = group_hit("gran parrilera techada", &group, &lexicon.morphology);
        assert_eq!(hit, Some(("parrill".to_string(), MatchRule::Prefix)));
    }

    #[test]
    fn prefix_rule_needs_length_over_four() {
        let morphology = Morphology::new(Vec::new());
        let group = VariantGroup {
            canonical: "parrilleros".into(),
            variants: vec!["parrilleros".into()],
        };
        // "parriller" is the shortened form and appears in the singular.
        let hit = group_hit("amplio parrillero techado", &group, &morphology);
        assert_eq!(hit, Some(("parrilleros".to_string(), MatchRule::Prefix)));

        let short = VariantGroup {
            canonical: "pati".into(),
            variants: vec!["pati".into()],
        };
        assert_eq!(group_hit("patio interno", &short, &morphology), None);
    }

    #[test]
    fn exact_wins_over_weaker_rules() {
        let lexicon = Lexicon::default();
        let group = VariantGroup::expand("terraza", &[], &lexicon);
        let hit = group_hit("terraza lavadero", &group, &lexicon.morphology);
        assert_eq!(hit, Some(("terraza".to_string(), MatchRule::Exact)));
    }

    #[test]
    fn synonyms_expand_the_group() {
        let lexicon = Lexicon::default();
        let group = VariantGroup::expand("Garagé", &[], &lexicon);
        assert_eq!(group.canonical, "garage");
        assert!(group.variants.contains(&"cochera".to_string()));
        let hit = group_hit("cuenta con cochera fija", &group, &lexicon.morphology);
        assert_eq!(hit, Some(("cochera".to_string(), MatchRule::Exact)));
    }

    #[test]
    fn conjunction_is_strict_across_groups() {
        let lexicon = Lexicon::default();
        let groups = vec![
            VariantGroup::expand("terraza", &[], &lexicon),
            VariantGroup::expand("garaje", &[], &lexicon),
        ];
        let text = normalize("Apartamento con terraza al frente");
        assert!(!matches(&text, &groups, &lexicon.morphology));
        let text = normalize("Terraza al frente y garaje para dos");
        assert!(matches(&text, &groups, &lexicon.morphology));
        assert!(matches(&text, &[], &lexicon.morphology));
    }

    #[test]
    fn raw_splitting_drops_stopwords_and_short_tokens() {
        let words = split_raw_keywords("Apto con terraza, de 2 baños para la familia");
        assert_eq!(
            words,
            vec!["apto".to_string(), "terraza".into(), "banos".into(), "familia".into()]
        );
    }

    #[test]
    fn yaml_override_replaces_suffix_table() {
        let dir = std::env::temp_dir().join("mirador-match-lexicon-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lexicon.yaml");
        std::fs::write(
            &path,
            "version: 1\nsuffixes: [\"mente\"]\nsynonyms:\n  hogar: [casa]\n",
        )
        .unwrap();
        let lexicon = Lexicon::from_yaml_file(&path).unwrap();
        assert_eq!(lexicon.morphology.stem("rapidamente"), "rapida");
        // Old default suffix no longer applies.
        assert_eq!(lexicon.morphology.stem("luminoso"), "luminoso");
        assert_eq!(lexicon.synonyms_of("hogar"), ["casa".to_string()]);
        // Defaults survive the merge.
        assert!(!lexicon.synonyms_of("terraza").is_empty());
    }
}
