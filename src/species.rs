use crate::error::{PipelineError, Result};
use log::info;
use regex::Regex;
use specprimer_protocol::AlignmentHit;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::Path,
};

const SUBSPECIES_MARKERS: [&str; 2] = ["subsp.", "pv."];

/// Species name from a subject title.
///
/// Titles carrying a sub-species or pathovar marker keep four words
/// (`Bacillus subtilis subsp. subtilis`), everything else keeps two. Virus
/// titles are cut at the first comma instead.
pub fn derive_species(title: &str, virus: bool) -> String {
    if virus {
        return title.split(',').next().unwrap_or_default().trim().to_string();
    }
    let words = if SUBSPECIES_MARKERS.iter().any(|m| title.contains(m)) {
        4
    } else {
        2
    };
    title
        .split_whitespace()
        .take(words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `Bacillus_subtilis_subsp_spizizenii` → `Bacillus subtilis subsp. spizizenii`.
pub fn species_from_underscored(name: &str) -> String {
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| match w {
            "subsp" => "subsp.",
            "pv" => "pv.",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The target species and its synonyms. Never off-target.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesExceptionSet {
    names: Vec<String>,
}

impl SpeciesExceptionSet {
    pub fn new(target: &str, synonyms: &[String]) -> Self {
        let mut names = vec![species_from_underscored(target)];
        for synonym in synonyms {
            let name = species_from_underscored(synonym);
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        Self { names }
    }

    pub fn target_species(&self) -> &str {
        &self.names[0]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, species: &str) -> bool {
        self.names.iter().any(|n| n == species)
    }

    /// Looser test used for quality control: a sub-species of the target
    /// still counts as the target.
    pub fn matches(&self, species: &str) -> bool {
        self.names.iter().any(|n| species.contains(n.as_str()))
    }
}

/// Species that are allowed to show up as non-target hits.
#[derive(Debug, Clone)]
pub struct NontargetAllowlist {
    pattern: Regex,
}

impl NontargetAllowlist {
    pub fn new(names: &[String]) -> Result<Option<Self>> {
        let alternatives: Vec<String> = names
            .iter()
            .map(|n| species_from_underscored(n))
            .filter(|n| !n.is_empty())
            .map(|n| regex::escape(&n))
            .collect();
        if alternatives.is_empty() {
            return Ok(None);
        }
        let pattern = Regex::new(&alternatives.join("|")).map_err(|e| {
            PipelineError::InvalidInput(format!("Invalid non-target species list: {e}"))
        })?;
        Ok(Some(Self { pattern }))
    }

    pub fn matches(&self, species: &str) -> bool {
        self.pattern.is_match(species)
    }
}

/// Subject identifiers (GI or accession) that are dropped before
/// classification.
#[derive(Debug, Clone, Default)]
pub struct ExcludedIdentifierSet {
    ids: HashSet<String>,
}

impl ExcludedIdentifierSet {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = lines
            .into_iter()
            .filter_map(|line| {
                let line = line.as_ref().trim();
                if line.is_empty() || line.contains('#') {
                    None
                } else {
                    Some(line.to_string())
                }
            })
            .collect();
        Self { ids }
    }

    /// A missing file means nothing is excluded.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path).map_err(|e| {
            PipelineError::io(format!("Could not open denylist '{}'", path.display()), e)
        })?;
        let lines = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<Vec<String>>>()
            .map_err(|e| {
                PipelineError::io(format!("Could not read denylist '{}'", path.display()), e)
            })?;
        Ok(Self::from_lines(lines))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn excludes(&self, hit: &AlignmentHit) -> bool {
        self.contains(&hit.subject_gi) || self.contains(&hit.subject_accession)
    }
}

/// Copy the identifiers of a shared denylist into the run's config
/// directory, dropping comments and duplicates. Nothing is written when the
/// list is empty.
pub fn install_denylist(source: &Path, destination: &Path) -> Result<usize> {
    let text = fs::read_to_string(source).map_err(|e| {
        PipelineError::io(format!("Could not read denylist '{}'", source.display()), e)
    })?;
    let mut seen = HashSet::new();
    let ids: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains('#'))
        .filter(|l| seen.insert(*l))
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::io(format!("Could not create '{}'", parent.display()), e)
        })?;
    }
    let mut out = ids.join("\n");
    out.push('\n');
    fs::write(destination, out).map_err(|e| {
        PipelineError::io(format!("Could not write '{}'", destination.display()), e)
    })?;
    info!("Excluded identifiers: {}", ids.len());
    Ok(ids.len())
}
