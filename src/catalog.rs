//! The process-wide party catalog: display records, per-election
//! overrides, and the longitudinal family table.
//!
//! Party codes are election-scoped (the same short code can denote
//! different lists in different elections), so every lookup takes an
//! `(ElectionId, PartyCode)` pair. The catalog is built once at startup
//! from an embedded asset and read-only afterwards.

use color_eyre::eyre::{Context, ContextCompat, Result};
use std::collections::HashMap;

use crate::ballots::ElectionId;

/// Everything we know how to display about a party list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartyInfo {
    pub name: String,
    #[serde(default)]
    pub name_en: String,
    pub color: String,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub ideology: String,
    #[serde(default)]
    pub description: String,
}

/// A per-election patch overlayed on a base record.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PartyPatch {
    pub name: Option<String>,
    pub name_en: Option<String>,
    pub color: Option<String>,
    pub leader: Option<String>,
    pub ideology: Option<String>,
    pub description: Option<String>,
}

/// Identifier of a cross-election party family ("the same political force"
/// for longitudinal metrics; meaningless outside the metrics layer).
pub type FamilyId = String;

/// Color used for synthesized default records and the abstention column.
const OTHER_COLOR: &str = "#6b7280";

#[derive(Deserialize)]
struct CatalogFile {
    parties: HashMap<String, PartyInfo>,
    #[serde(default)]
    overrides: HashMap<String, HashMap<String, PartyPatch>>,
    /// family id -> list of "election:code" members.
    #[serde(default)]
    families: HashMap<String, Vec<String>>,
}

pub struct PartyCatalog {
    base: HashMap<String, PartyInfo>,
    overrides: HashMap<(ElectionId, String), PartyPatch>,
    families: HashMap<(ElectionId, String), FamilyId>,
}

impl PartyCatalog {
    /// The catalog shipped with the binary.
    pub fn embedded() -> Result<Self> {
        Self::from_toml(include_str!("../assets/parties.toml"))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: CatalogFile =
            toml_edit::de::from_str(raw).context("party catalog could not be parsed")?;

        let mut overrides = HashMap::new();
        for (election, patches) in file.overrides {
            for (code, patch) in patches {
                overrides.insert((ElectionId::new(election.clone()), code), patch);
            }
        }

        let mut families = HashMap::new();
        for (family, members) in file.families {
            for member in members {
                let (election, code) = member.split_once(':').with_context(|| {
                    format!("family member {member} of {family} is not election:code")
                })?;
                families.insert(
                    (ElectionId::from(election), code.to_string()),
                    family.clone(),
                );
            }
        }

        Ok(PartyCatalog {
            base: file.parties,
            overrides,
            families,
        })
    }

    /// Display record for a code in a given election.
    ///
    /// Resolution order: per-election override overlayed on the base
    /// record, then the base record, then a synthesized default carrying
    /// the code itself as display name. Never fails.
    pub fn info(&self, code: &str, election: &ElectionId) -> PartyInfo {
        let mut info = self.base.get(code).cloned().unwrap_or_else(|| PartyInfo {
            name: code.to_string(),
            name_en: String::new(),
            color: OTHER_COLOR.to_string(),
            leader: String::new(),
            ideology: String::new(),
            description: String::new(),
        });
        if let Some(patch) = self.overrides.get(&(election.clone(), code.to_string())) {
            if let Some(v) = &patch.name {
                info.name = v.clone();
            }
            if let Some(v) = &patch.name_en {
                info.name_en = v.clone();
            }
            if let Some(v) = &patch.color {
                info.color = v.clone();
            }
            if let Some(v) = &patch.leader {
                info.leader = v.clone();
            }
            if let Some(v) = &patch.ideology {
                info.ideology = v.clone();
            }
            if let Some(v) = &patch.description {
                info.description = v.clone();
            }
        }
        info
    }

    /// Family membership, when the code participates in one.
    pub fn family_of(&self, code: &str, election: &ElectionId) -> Option<&FamilyId> {
        self.families.get(&(election.clone(), code.to_string()))
    }

    /// All elections in which the family has at least one member code.
    pub fn family_elections(&self, family: &str) -> Vec<ElectionId> {
        let mut out: Vec<ElectionId> = self
            .families
            .iter()
            .filter(|(_, f)| f.as_str() == family)
            .map(|((e, _), _)| e.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
[parties."מחל"]
name = "הליכוד"
name_en = "Likud"
color = "#2563eb"

[parties."כן"]
name = "המחנה הממלכתי"
name_en = "National Unity"
color = "#7c3aed"

[overrides.17."כן"]
name = "קדימה"
name_en = "Kadima"
color = "#1d4ed8"

[families]
likud = ["16:מחל", "17:מחל"]
kadima = ["17:כן", "18:כן"]
"##;

    #[test]
    fn base_and_override_resolution() {
        let cat = PartyCatalog::from_toml(SAMPLE).unwrap();
        let e17 = ElectionId::from("17");
        let e25 = ElectionId::from("25");

        // Base record when no override.
        assert_eq!(cat.info("מחל", &e25).name_en, "Likud");
        // Override overlays, base fields not patched survive.
        let kn = cat.info("כן", &e17);
        assert_eq!(kn.name, "קדימה");
        assert_eq!(kn.color, "#1d4ed8");
        // Same code, different election: base meaning.
        assert_eq!(cat.info("כן", &e25).name, "המחנה הממלכתי");
    }

    #[test]
    fn unknown_code_synthesizes_default() {
        let cat = PartyCatalog::from_toml(SAMPLE).unwrap();
        let info = cat.info("זץ", &ElectionId::from("25"));
        assert_eq!(info.name, "זץ");
        assert_eq!(info.color, OTHER_COLOR);
    }

    #[test]
    fn family_lookup_is_election_scoped() {
        let cat = PartyCatalog::from_toml(SAMPLE).unwrap();
        assert_eq!(
            cat.family_of("כן", &ElectionId::from("17")).unwrap(),
            "kadima"
        );
        assert!(cat.family_of("כן", &ElectionId::from("25")).is_none());
        assert_eq!(
            cat.family_elections("likud"),
            vec![ElectionId::from("16"), ElectionId::from("17")]
        );
    }

    #[test]
    fn embedded_catalog_parses() {
        let cat = PartyCatalog::embedded().unwrap();
        assert_eq!(cat.info("מחל", &ElectionId::from("25")).name_en, "Likud");
        assert!(cat.family_of("מחל", &ElectionId::from("25")).is_some());
    }
}
