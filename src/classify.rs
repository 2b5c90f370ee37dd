//! Classification of alignment hits.
//!
//! All three policies start the same way (drop denylisted subjects, derive a
//! species per hit) and then diverge completely, so each one lives in its own
//! handler and [`classify`] only dispatches on the mode tag.

use crate::{
    error::{PipelineError, Result},
    species::{ExcludedIdentifierSet, NontargetAllowlist, SpeciesExceptionSet, derive_species},
};
use itertools::Itertools;
use specprimer_protocol::{
    AlignmentHit, ClassificationMode, OfftargetRow, PartialRange, PrimerHitRow, QcRow,
};
use std::collections::{BTreeMap, BTreeSet};

pub const PASSED_QC: &str = "passed QC";
pub const FAILED_QC: &str = "failed QC";

/// Everything a classification pass needs besides the hits. Loaded once per
/// run and only read afterwards.
#[derive(Debug, Clone)]
pub struct ClassifierContext<'a> {
    pub exceptions: &'a SpeciesExceptionSet,
    pub excluded: &'a ExcludedIdentifierSet,
    pub allowlist: Option<&'a NontargetAllowlist>,
    pub virus: bool,
    /// Percent identity floor for off-target hits; 0 disables it.
    pub min_identity: f64,
    pub max_evalue: f64,
    pub min_product_size: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct SpeciesHit {
    hit: AlignmentHit,
    species: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Summary {
    QualityControl(Vec<QcRow>),
    Conserved(Vec<OfftargetRow>),
    Primer(Vec<PrimerHitRow>),
}

impl Summary {
    pub fn empty(mode: ClassificationMode) -> Self {
        match mode {
            ClassificationMode::QualityControl => Self::QualityControl(vec![]),
            ClassificationMode::Conserved => Self::Conserved(vec![]),
            ClassificationMode::Primer => Self::Primer(vec![]),
        }
    }

    pub fn mode(&self) -> ClassificationMode {
        match self {
            Self::QualityControl(_) => ClassificationMode::QualityControl,
            Self::Conserved(_) => ClassificationMode::Conserved,
            Self::Primer(_) => ClassificationMode::Primer,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::QualityControl(rows) => rows.len(),
            Self::Conserved(rows) => rows.len(),
            Self::Primer(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct query ids, sorted.
    pub fn query_ids(&self) -> BTreeSet<String> {
        match self {
            Self::QualityControl(rows) => rows.iter().map(|r| r.query_id.clone()).collect(),
            Self::Conserved(rows) => rows.iter().map(|r| r.query_id.clone()).collect(),
            Self::Primer(rows) => rows.iter().map(|r| r.query_id.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub summary: Summary,
    pub partial_ranges: Vec<PartialRange>,
    /// Off-target species that were not on the non-target allowlist.
    pub unlisted_species: BTreeSet<String>,
}

impl Classification {
    pub fn empty(mode: ClassificationMode) -> Self {
        Self {
            summary: Summary::empty(mode),
            partial_ranges: vec![],
            unlisted_species: BTreeSet::new(),
        }
    }

    /// Append the result of another file classified in the same mode.
    pub fn merge(&mut self, other: Classification) -> Result<()> {
        match (&mut self.summary, other.summary) {
            (Summary::QualityControl(a), Summary::QualityControl(b)) => a.extend(b),
            (Summary::Conserved(a), Summary::Conserved(b)) => a.extend(b),
            (Summary::Primer(a), Summary::Primer(b)) => a.extend(b),
            (mine, theirs) => {
                return Err(PipelineError::InvalidInput(format!(
                    "Cannot merge {} results into {} results",
                    theirs.mode(),
                    mine.mode()
                )));
            }
        }
        self.partial_ranges.extend(other.partial_ranges);
        self.unlisted_species.extend(other.unlisted_species);
        Ok(())
    }
}

pub fn classify(
    hits: Vec<AlignmentHit>,
    mode: ClassificationMode,
    ctx: &ClassifierContext<'_>,
) -> Classification {
    let annotated = annotate(hits, ctx);
    match mode {
        ClassificationMode::QualityControl => quality_control(annotated, ctx),
        ClassificationMode::Conserved => conserved(annotated, ctx),
        ClassificationMode::Primer => primer(annotated, ctx),
    }
}

fn annotate(hits: Vec<AlignmentHit>, ctx: &ClassifierContext<'_>) -> Vec<SpeciesHit> {
    hits.into_iter()
        .filter(|hit| !ctx.excluded.excludes(hit))
        .map(|hit| {
            let species = derive_species(&hit.subject_title, ctx.virus);
            SpeciesHit { hit, species }
        })
        .collect()
}

/// Best hit per query decides whether the query sequence really belongs to
/// the target species.
fn quality_control(mut hits: Vec<SpeciesHit>, ctx: &ClassifierContext<'_>) -> Classification {
    hits.sort_by(|a, b| b.hit.bit_score.total_cmp(&a.hit.bit_score));
    let target = ctx.exceptions.target_species();
    let rows = hits
        .into_iter()
        .unique_by(|h| h.hit.query_id.clone())
        .sorted_by(|a, b| a.hit.query_id.cmp(&b.hit.query_id))
        .map(|h| {
            let status = if ctx.exceptions.matches(&h.species) {
                PASSED_QC
            } else {
                FAILED_QC
            };
            QcRow {
                query_id: h.hit.query_id,
                subject_gi: h.hit.subject_gi,
                subject_accession: h.hit.subject_accession,
                species: h.species,
                target_species: target.to_string(),
                status: status.to_string(),
            }
        })
        .collect();
    Classification {
        summary: Summary::QualityControl(rows),
        partial_ranges: vec![],
        unlisted_species: BTreeSet::new(),
    }
}

/// Hits on a species outside the exception set, restricted to the allowlist
/// when there is one. Off-target species missing from the allowlist are
/// returned separately.
fn offtarget_candidates(
    hits: Vec<SpeciesHit>,
    ctx: &ClassifierContext<'_>,
) -> (Vec<SpeciesHit>, BTreeSet<String>) {
    let offtarget = hits
        .into_iter()
        .filter(|h| !ctx.exceptions.contains(&h.species));
    let Some(allowlist) = ctx.allowlist else {
        return (offtarget.collect(), BTreeSet::new());
    };
    let (listed, unlisted): (Vec<SpeciesHit>, Vec<SpeciesHit>) =
        offtarget.partition(|h| allowlist.matches(&h.species));
    let unlisted = unlisted.into_iter().map(|h| h.species).collect();
    (listed, unlisted)
}

fn conserved(hits: Vec<SpeciesHit>, ctx: &ClassifierContext<'_>) -> Classification {
    let (candidates, unlisted_species) = offtarget_candidates(hits, ctx);
    let offtarget: Vec<SpeciesHit> = candidates
        .into_iter()
        .filter(|h| ctx.min_identity <= 0.0 || h.hit.percent_identity >= ctx.min_identity)
        .filter(|h| h.hit.evalue <= ctx.max_evalue)
        .collect();

    let partial_ranges = partial_ranges(&offtarget, ctx.min_product_size);
    let rows = offtarget
        .into_iter()
        .map(|h| OfftargetRow {
            query_id: h.hit.query_id,
            species: h.species,
            subject_gi: h.hit.subject_gi,
            subject_accession: h.hit.subject_accession,
            percent_identity: h.hit.percent_identity,
            evalue: h.hit.evalue,
            bit_score: h.hit.bit_score,
        })
        .collect();
    Classification {
        summary: Summary::Conserved(rows),
        partial_ranges,
        unlisted_species,
    }
}

/// Usable template ranges at either end of each query with an off-target
/// match: at most one leading range (before the earliest alignment start)
/// and one trailing range (after the alignment with the shortest trailing
/// overhang), each only if it can still hold a minimum-size product.
fn partial_ranges(offtarget: &[SpeciesHit], min_product_size: u64) -> Vec<PartialRange> {
    let mut by_query: BTreeMap<&str, Vec<&AlignmentHit>> = BTreeMap::new();
    for h in offtarget {
        by_query.entry(h.hit.query_id.as_str()).or_default().push(&h.hit);
    }

    let mut leading = Vec::new();
    let mut trailing = Vec::new();
    for (query_id, hits) in by_query {
        if let Some(first) = hits.iter().min_by_key(|h| h.query_start) {
            if first.query_start >= min_product_size {
                leading.push(PartialRange {
                    seq_id: query_id.to_string(),
                    start: 1,
                    stop: first.query_start,
                });
            }
        }
        if let Some(last) = hits
            .iter()
            .min_by_key(|h| h.query_length.saturating_sub(h.query_end))
        {
            if last.query_length.saturating_sub(last.query_end) >= min_product_size {
                trailing.push(PartialRange {
                    seq_id: query_id.to_string(),
                    start: last.query_end,
                    stop: last.query_length,
                });
            }
        }
    }
    leading.extend(trailing);
    leading
}

fn primer(hits: Vec<SpeciesHit>, ctx: &ClassifierContext<'_>) -> Classification {
    let (offtarget, unlisted_species) = offtarget_candidates(hits, ctx);
    let rows = offtarget
        .into_iter()
        .map(|h| PrimerHitRow {
            query_id: h.hit.query_id,
            species: h.species,
            subject_gi: h.hit.subject_gi,
            subject_accession: h.hit.subject_accession,
            subject_start: h.hit.subject_start,
            subject_end: h.hit.subject_end,
            subject_length: h.hit.subject_length,
        })
        .collect();
    Classification {
        summary: Summary::Primer(rows),
        partial_ranges: vec![],
        unlisted_species,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hits::fixtures::hit;

    struct Fixture {
        exceptions: SpeciesExceptionSet,
        excluded: ExcludedIdentifierSet,
        allowlist: Option<NontargetAllowlist>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                exceptions: SpeciesExceptionSet::new(
                    "Bacillus_subtilis",
                    &["Bacillus_spizizenii".to_string()],
                ),
                excluded: ExcludedIdentifierSet::from_lines(["NC_EXCLUDED", "4242"]),
                allowlist: None,
            }
        }

        fn ctx(&self, min_product_size: u64) -> ClassifierContext<'_> {
            ClassifierContext {
                exceptions: &self.exceptions,
                excluded: &self.excluded,
                allowlist: self.allowlist.as_ref(),
                virus: false,
                min_identity: 0.0,
                max_evalue: 500.0,
                min_product_size,
            }
        }
    }

    fn qc_rows(c: &Classification) -> &[QcRow] {
        match &c.summary {
            Summary::QualityControl(rows) => rows,
            other => panic!("unexpected {:?}", other.mode()),
        }
    }

    fn conserved_rows(c: &Classification) -> &[OfftargetRow] {
        match &c.summary {
            Summary::Conserved(rows) => rows,
            other => panic!("unexpected {:?}", other.mode()),
        }
    }

    #[test]
    fn test_quality_control_keeps_best_bit_score() {
        let fx = Fixture::new();
        let mut low = hit("16S_1", "NC_LOW", "Bacillus cereus ATCC 14579");
        low.bit_score = 50.0;
        let mut high = hit("16S_1", "NC_HIGH", "Bacillus subtilis subsp. subtilis str. 168");
        high.bit_score = 80.0;
        let c = classify(vec![low, high], ClassificationMode::QualityControl, &fx.ctx(70));
        let rows = qc_rows(&c);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject_accession, "NC_HIGH");
        assert_eq!(rows[0].status, PASSED_QC);
        assert_eq!(rows[0].target_species, "Bacillus subtilis");
        assert!(c.partial_ranges.is_empty());
    }

    #[test]
    fn test_quality_control_ties_keep_first() {
        let fx = Fixture::new();
        let a = hit("q2", "NC_A", "Bacillus cereus ATCC 14579");
        let b = hit("q2", "NC_B", "Bacillus subtilis 168");
        let other = hit("q1", "NC_C", "Bacillus subtilis 168");
        let c = classify(vec![a, b, other], ClassificationMode::QualityControl, &fx.ctx(70));
        let rows = qc_rows(&c);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].query_id, "q1");
        assert_eq!(rows[1].subject_accession, "NC_A");
        assert_eq!(rows[1].status, FAILED_QC);
    }

    #[test]
    fn test_quality_control_accepts_synonym_subspecies() {
        let fx = Fixture::new();
        let synonym = hit(
            "q1",
            "NC_SYN",
            "Bacillus spizizenii subsp. inaquosorum KCTC 13429 chromosome",
        );
        let other = hit("q2", "NC_VEL", "Bacillus velezensis FZB42 chromosome");
        let c = classify(vec![synonym, other], ClassificationMode::QualityControl, &fx.ctx(70));
        let rows = qc_rows(&c);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].species, "Bacillus spizizenii subsp. inaquosorum");
        assert_eq!(rows[0].status, PASSED_QC);
        assert_eq!(rows[0].target_species, "Bacillus subtilis");
        assert_eq!(rows[1].status, FAILED_QC);
        assert!(!fx.exceptions.contains(&rows[0].species));
    }

    #[test]
    fn test_conserved_trailing_trim_respects_min_size() {
        let fx = Fixture::new();
        let mut h = hit("cons_1", "NC_OFF", "Bacillus cereus ATCC 14579");
        h.query_length = 500;
        h.query_start = 10;
        h.query_end = 480;
        let c = classify(vec![h.clone()], ClassificationMode::Conserved, &fx.ctx(15));
        assert_eq!(
            c.partial_ranges,
            vec![PartialRange {
                seq_id: "cons_1".to_string(),
                start: 480,
                stop: 500
            }]
        );
        let c = classify(vec![h], ClassificationMode::Conserved, &fx.ctx(25));
        assert!(c.partial_ranges.is_empty());
        assert_eq!(conserved_rows(&c).len(), 1);
    }

    #[test]
    fn test_conserved_leading_trim_uses_earliest_start() {
        let fx = Fixture::new();
        let mut a = hit("cons_2", "NC_A", "Bacillus cereus ATCC 14579");
        a.query_start = 120;
        a.query_end = 300;
        a.query_length = 300;
        let mut b = hit("cons_2", "NC_B", "Bacillus anthracis Ames");
        b.query_start = 90;
        b.query_end = 300;
        b.query_length = 300;
        let c = classify(vec![a, b], ClassificationMode::Conserved, &fx.ctx(70));
        assert_eq!(
            c.partial_ranges,
            vec![PartialRange {
                seq_id: "cons_2".to_string(),
                start: 1,
                stop: 90
            }]
        );
    }

    #[test]
    fn test_conserved_filters_identity_and_evalue() {
        let fx = Fixture::new();
        let mut weak = hit("c", "NC_WEAK", "Bacillus cereus ATCC 14579");
        weak.percent_identity = 80.0;
        let mut insignificant = hit("c", "NC_E", "Bacillus cereus ATCC 14579");
        insignificant.evalue = 900.0;
        let kept = hit("c", "NC_OK", "Bacillus cereus ATCC 14579");
        let on_target = hit("c", "NC_T", "Bacillus spizizenii TU-B-10");
        let mut ctx = fx.ctx(70);
        ctx.min_identity = 90.0;
        let c = classify(
            vec![weak, insignificant, kept, on_target],
            ClassificationMode::Conserved,
            &ctx,
        );
        let rows = conserved_rows(&c);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject_accession, "NC_OK");
        assert_eq!(rows[0].species, "Bacillus cereus");
    }

    #[test]
    fn test_allowlist_records_unlisted_species() {
        let mut fx = Fixture::new();
        fx.allowlist = NontargetAllowlist::new(&["Bacillus_cereus".to_string()]).unwrap();
        let listed = hit("c", "NC_1", "Bacillus cereus ATCC 14579");
        let unlisted = hit("c", "NC_2", "Paenibacillus polymyxa E681");
        let c = classify(vec![listed, unlisted], ClassificationMode::Primer, &fx.ctx(70));
        match &c.summary {
            Summary::Primer(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].subject_accession, "NC_1");
                assert_eq!(rows[0].subject_length, 1_000_000);
            }
            other => panic!("unexpected {:?}", other.mode()),
        }
        assert!(c.unlisted_species.contains("Paenibacillus polymyxa"));
    }

    #[test]
    fn test_excluded_identifiers_never_reach_output() {
        let fx = Fixture::new();
        let mut by_gi = hit("q", "NC_FINE", "Bacillus cereus ATCC 14579");
        by_gi.subject_gi = "4242".to_string();
        let by_acc = hit("q", "NC_EXCLUDED", "Bacillus cereus ATCC 14579");
        for mode in [
            ClassificationMode::QualityControl,
            ClassificationMode::Conserved,
            ClassificationMode::Primer,
        ] {
            let c = classify(vec![by_gi.clone(), by_acc.clone()], mode, &fx.ctx(1));
            assert!(c.summary.is_empty(), "{mode} leaked an excluded hit");
            assert!(c.partial_ranges.is_empty());
        }
    }

    #[test]
    fn test_merge_appends() {
        let fx = Fixture::new();
        let mut total = Classification::empty(ClassificationMode::Conserved);
        for q in ["a", "b"] {
            let c = classify(
                vec![hit(q, "NC_1", "Bacillus cereus ATCC 14579")],
                ClassificationMode::Conserved,
                &fx.ctx(70),
            );
            total.merge(c).unwrap();
        }
        assert_eq!(total.summary.len(), 2);
        assert_eq!(
            total.summary.query_ids().into_iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let primer = Classification::empty(ClassificationMode::Primer);
        assert!(total.merge(primer).is_err());
    }
}
