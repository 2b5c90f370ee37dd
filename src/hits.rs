use crate::error::{PipelineError, Result};
use csv::ReaderBuilder;
use specprimer_protocol::{AlignmentHit, BLAST_COLUMNS};
use std::{fs::File, io::Read, path::Path};

/// Parse header-less, tab-separated alignment output.
pub fn read_hits<R: Read>(reader: R, source: &str) -> Result<Vec<AlignmentHit>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .quoting(false)
        .from_reader(reader);
    let mut hits = Vec::new();
    for (line_no, result) in rdr.deserialize::<AlignmentHit>().enumerate() {
        let hit = result.map_err(|e| PipelineError::MalformedResult {
            path: source.to_string(),
            reason: format!(
                "line {} does not match the {}-column schema: {e}",
                line_no + 1,
                BLAST_COLUMNS.len()
            ),
        })?;
        hits.push(hit);
    }
    Ok(hits)
}

pub fn read_hits_file(path: &Path) -> Result<Vec<AlignmentHit>> {
    let file = File::open(path).map_err(|e| {
        PipelineError::io(format!("Could not open BLAST results '{}'", path.display()), e)
    })?;
    read_hits(file, &path.display().to_string())
}
