use crate::error::{PipelineError, Result};
use bio::io::fasta;
use log::{info, warn};
use specprimer_protocol::PartialRange;
use std::{collections::BTreeSet, fs, path::Path};

pub const PRIMER3_INPUT_FILE: &str = "primer3_input";
pub const SEQUENCE_ID_TAG: &str = "SEQUENCE_ID=";
pub const PICK_INTERNAL_OLIGO_TAG: &str = "PRIMER_PICK_INTERNAL_OLIGO=";

/// One primer3 record block.
#[derive(Debug, Clone, PartialEq)]
pub struct Primer3Request {
    pub seq_id: String,
    pub template: String,
    pub min_product_size: u64,
    pub max_product_size: u64,
    pub pick_internal_oligo: bool,
}

impl Primer3Request {
    pub fn render(&self) -> String {
        let mut block = format!(
            "{SEQUENCE_ID_TAG}{}\nSEQUENCE_TEMPLATE={}\nPRIMER_PRODUCT_SIZE_RANGE={}-{}\n",
            self.seq_id, self.template, self.min_product_size, self.max_product_size
        );
        if self.pick_internal_oligo {
            block.push_str(PICK_INTERNAL_OLIGO_TAG);
            block.push_str("1\n");
        }
        block.push_str("=\n");
        block
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProductSettings {
    pub min_product_size: u64,
    pub max_product_size: u64,
    pub probe: bool,
}

/// Slice of `seq` for a 1-based inclusive range, clamped to the sequence.
fn slice_1based(seq: &[u8], start: u64, stop: u64) -> &[u8] {
    let len = seq.len();
    let from = (start.max(1) as usize - 1).min(len);
    let to = (stop as usize).min(len).max(from);
    &seq[from..to]
}

/// Conserved sequences without any off-target hit become full templates, in
/// input order; each partial range then adds a trimmed template.
pub fn build_requests(
    conserved: &[fasta::Record],
    offtarget_ids: &BTreeSet<String>,
    partial_ranges: &[PartialRange],
    settings: ProductSettings,
) -> Vec<Primer3Request> {
    let request = |seq_id: &str, template: &[u8]| Primer3Request {
        seq_id: seq_id.to_string(),
        template: String::from_utf8_lossy(template).into_owned(),
        min_product_size: settings.min_product_size,
        max_product_size: settings.max_product_size,
        pick_internal_oligo: settings.probe,
    };

    let mut requests: Vec<Primer3Request> = conserved
        .iter()
        .filter(|r| !offtarget_ids.contains(r.id()))
        .map(|r| request(r.id(), r.seq()))
        .collect();

    for range in partial_ranges {
        let Some(record) = conserved.iter().find(|r| r.id() == range.seq_id) else {
            warn!(
                "Partial range for '{}' has no conserved sequence; skipped",
                range.seq_id
            );
            continue;
        };
        let template = slice_1based(record.seq(), range.start, range.stop);
        if template.is_empty() {
            continue;
        }
        requests.push(request(record.id(), template));
    }
    requests
}

pub fn render_requests(requests: &[Primer3Request]) -> String {
    requests.iter().map(Primer3Request::render).collect()
}

/// Write `text` to `path` unless the file already holds exactly these bytes.
/// Returns whether the file was (re)written.
pub fn write_if_changed(path: &Path, text: &str) -> Result<bool> {
    if let Ok(existing) = fs::read(path) {
        if existing == text.as_bytes() {
            info!("primer3 input unchanged: {}", path.display());
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            PipelineError::io(format!("Could not create '{}'", parent.display()), e)
        })?;
    }
    fs::write(path, text)
        .map_err(|e| PipelineError::io(format!("Could not write '{}'", path.display()), e))?;
    Ok(true)
}
