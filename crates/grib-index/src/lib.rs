//! Grib index sidecar (`.idx`) parsing and download chunk planning.
//!
//! A grib `.idx` file is a plain-text table with one line per grib record:
//!
//! ```text
//! 1:0:d=2024011512:PRMSL:mean sea level:6 hour fcst:
//! 2:990071:d=2024011512:TMP:850 mb:6 hour fcst:
//! ```
//!
//! The planner selects the records matching a variable list and turns them
//! into HTTP byte ranges so only the interesting slices of a multi-hundred
//! megabyte grib are transferred.

use serde::{Deserialize, Serialize};

use wx_common::{WxError, WxResult};

/// One group of the download filter: the cartesian product of `levels` and
/// `vars` is selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarGroup {
    pub levels: Vec<String>,
    pub vars: Vec<String>,
}

impl VarGroup {
    pub fn matches(&self, level: &str, var: &str) -> bool {
        self.levels.iter().any(|l| l == level) && self.vars.iter().any(|v| v == var)
    }
}

/// A parsed `.idx` line.
#[derive(Debug, Clone, PartialEq)]
pub struct IdxRecord {
    pub ordinal: String,
    pub offset: u64,
    pub date_spec: String,
    pub var: String,
    pub level: String,
    pub forecast_spec: String,
}

/// A byte range to request. `end` is inclusive; `None` means open-ended
/// (`Range: bytes=start-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub end: Option<u64>,
}

impl Chunk {
    /// Header value for this chunk, e.g. `bytes=0-1023` or `bytes=4096-`.
    pub fn range_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Parse the full text of an `.idx` sidecar.
///
/// Every line must split into exactly seven colon fields (the last one
/// empty, from the trailing colon) with an integer byte offset.
pub fn parse_index(text: &str) -> WxResult<Vec<IdxRecord>> {
    let mut records = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            return Err(WxError::GribIndex(format!("bad index line: {}", line)));
        }
        let offset: u64 = fields[1]
            .parse()
            .map_err(|_| WxError::GribIndex(format!("bad index offset: {}", fields[1])))?;

        records.push(IdxRecord {
            ordinal: fields[0].to_string(),
            offset,
            date_spec: fields[2].to_string(),
            var: fields[3].to_string(),
            level: fields[4].to_string(),
            forecast_spec: fields[5].to_string(),
        });
    }

    Ok(records)
}

/// Plan the byte ranges covering the records selected by `groups`.
///
/// The index is walked in reverse so each selected record's end is the byte
/// before the following record's offset; a selected record with nothing
/// after it gets an open-ended range. Adjacent chunks are deliberately not
/// coalesced.
pub fn plan_chunks(index: &[IdxRecord], groups: &[VarGroup]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut next_start: Option<u64> = None;

    for record in index.iter().rev() {
        if groups.iter().any(|g| g.matches(&record.level, &record.var)) {
            chunks.push(Chunk {
                start: record.offset,
                end: next_start.map(|s| s.saturating_sub(1)),
            });
        }
        next_start = Some(record.offset);
    }

    chunks.reverse();
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDX: &str = "\
1:0:d=2024011512:PRMSL:mean sea level:6 hour fcst:
2:990071:d=2024011512:TMP:850 mb:6 hour fcst:
3:1500000:d=2024011512:UGRD:850 mb:6 hour fcst:
4:2100500:d=2024011512:VGRD:850 mb:6 hour fcst:
5:2700123:d=2024011512:RH:850 mb:6 hour fcst:
6:3100000:d=2024011512:TMP:700 mb:6 hour fcst:
";

    fn wind_groups() -> Vec<VarGroup> {
        vec![VarGroup {
            levels: vec!["850 mb".into()],
            vars: vec!["UGRD".into(), "VGRD".into()],
        }]
    }

    #[test]
    fn parses_all_records() {
        let index = parse_index(IDX).unwrap();
        assert_eq!(index.len(), 6);
        assert_eq!(index[1].var, "TMP");
        assert_eq!(index[1].level, "850 mb");
        assert_eq!(index[1].offset, 990071);
    }

    #[test]
    fn rejects_bad_field_count() {
        let err = parse_index("1:0:d=2024011512:PRMSL:mean sea level:6 hour fcst").unwrap_err();
        assert!(matches!(err, WxError::GribIndex(_)));
    }

    #[test]
    fn rejects_bad_offset() {
        let err = parse_index("1:zero:d=2024011512:PRMSL:mean sea level:anl:").unwrap_err();
        assert!(matches!(err, WxError::GribIndex(_)));
    }

    #[test]
    fn plans_selected_ranges() {
        let index = parse_index(IDX).unwrap();
        let chunks = plan_chunks(&index, &wind_groups());

        assert_eq!(
            chunks,
            vec![
                Chunk { start: 1500000, end: Some(2100499) },
                Chunk { start: 2100500, end: Some(2700122) },
            ]
        );
    }

    #[test]
    fn chunks_are_ordered_and_disjoint() {
        let index = parse_index(IDX).unwrap();
        let groups = vec![VarGroup {
            levels: vec!["850 mb".into(), "700 mb".into(), "mean sea level".into()],
            vars: vec!["TMP".into(), "PRMSL".into()],
        }];
        let chunks = plan_chunks(&index, &groups);
        assert_eq!(chunks.len(), 3);

        for pair in chunks.windows(2) {
            assert!(pair[0].start <= pair[1].start);
            if let Some(end) = pair[0].end {
                assert!(end < pair[1].start);
            }
        }
    }

    #[test]
    fn last_record_is_open_ended() {
        let index = parse_index(IDX).unwrap();
        let groups = vec![VarGroup {
            levels: vec!["700 mb".into()],
            vars: vec!["TMP".into()],
        }];
        let chunks = plan_chunks(&index, &groups);
        assert_eq!(chunks, vec![Chunk { start: 3100000, end: None }]);
    }

    #[test]
    fn range_headers() {
        assert_eq!(Chunk { start: 0, end: Some(99) }.range_header(), "bytes=0-99");
        assert_eq!(Chunk { start: 100, end: None }.range_header(), "bytes=100-");
    }

    #[test]
    fn empty_selection_plans_nothing() {
        let index = parse_index(IDX).unwrap();
        let groups = vec![VarGroup { levels: vec!["500 mb".into()], vars: vec!["TMP".into()] }];
        assert!(plan_chunks(&index, &groups).is_empty());
    }
}
