//! CSV helpers shared by the cleansing argument grammars and the schema
//! provider: delimiter auto-detection over a sampled buffer and a small
//! in-memory CSV parse.

use crate::error::{PipeError, PipeResult};

/// Candidate delimiters, examined over the first 2 KiB of the buffer.
const CANDIDATES: [char; 4] = [',', '|', '\t', '~'];

const SAMPLE_LEN: usize = 2048;

/// Auto-detect the CSV delimiter from a sampled buffer. The strict maximum
/// count wins; a tie (or no candidate at all) is an explicit error that
/// callers treat as "assume a single column".
pub fn detect_delimiter(buf: &[u8]) -> PipeResult<char> {
    let nb = buf.len().min(SAMPLE_LEN);
    let txt = String::from_utf8_lossy(&buf[..nb]);
    let mut counts = [0usize; 4];
    for ch in txt.chars() {
        for (i, cand) in CANDIDATES.iter().enumerate() {
            if ch == *cand {
                counts[i] += 1;
            }
        }
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    let winners: Vec<usize> = (0..CANDIDATES.len()).filter(|&i| counts[i] == max).collect();
    if max == 0 || winners.len() != 1 {
        return Err(PipeError::system(
            "cannot determine the csv delimiter from the sampled buffer",
        ));
    }
    Ok(CANDIDATES[winners[0]])
}

/// Parse an in-memory CSV buffer into rows of fields. When the delimiter
/// cannot be detected the content is assumed to be a single column and the
/// comma is used.
pub fn parse(csv_buf: &str) -> PipeResult<Vec<Vec<String>>> {
    let sep = detect_delimiter(csv_buf.as_bytes()).unwrap_or(',');
    parse_with(csv_buf, sep)
}

pub fn parse_with(csv_buf: &str, sep: char) -> PipeResult<Vec<Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(sep as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(csv_buf.as_bytes());
    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        rows.push(rec.iter().map(|f| f.to_string()).collect());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_the_strict_maximum() {
        assert_eq!(detect_delimiter(b"a,b,c|d").unwrap(), ',');
        assert_eq!(detect_delimiter(b"a|b|c|d").unwrap(), '|');
        assert_eq!(detect_delimiter(b"a\tb\tc").unwrap(), '\t');
        assert_eq!(detect_delimiter(b"a~b~c").unwrap(), '~');
    }

    #[test]
    fn tie_is_an_error() {
        assert!(detect_delimiter(b"a,b|c").is_err());
        assert!(detect_delimiter(b"plain text").is_err());
    }

    #[test]
    fn only_the_first_two_kib_are_sampled() {
        let mut buf = vec![b'x'; 2048];
        buf.extend_from_slice(b",,,,,");
        assert!(detect_delimiter(&buf).is_err());
    }

    #[test]
    fn parse_falls_back_to_single_column() {
        let rows = parse("singleton").unwrap();
        assert_eq!(rows, vec![vec!["singleton".to_string()]]);
    }
}
