//! Raw extract preparation: prescribing + list-size files → tidy records.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::config::{IngestConfig, ListSizeColumns, PrescribingColumns};
use crate::models::{DataQualityReport, IssueKind, Period, Reported, TidyRecord, UnitId};
use crate::tabular::non_blank;

use super::{
    parse_count, parse_period, read_csv_table, DatasetKind, DatasetManifest,
    IngestError, IngestResult, TidyRecordStore,
};

/// One prescribing extract row (one drug line for one practice).
#[derive(Debug, Clone, PartialEq)]
pub struct PrescribingRow {
    pub practice_code: String,
    pub period: Period,
    pub bnf_code: Option<String>,
    pub items: Option<u64>,
}

/// One list-size extract row.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSizeRow {
    pub practice_code: String,
    pub period: Period,
    pub list_size: Option<u64>,
    pub pcn_code: Option<String>,
    pub icb_code: Option<String>,
}

/// Resolve a row's period from its month column or the manifest month.
fn row_period(
    fields: &[String],
    month_idx: Option<usize>,
    default_period: Option<Period>,
    source_name: &str,
    line_no: usize,
    column: &str,
) -> IngestResult<Period> {
    match month_idx.and_then(|i| non_blank(fields.get(i))) {
        Some(raw) => parse_period(raw, source_name, line_no, column),
        None => default_period.ok_or_else(|| {
            let reason = if month_idx.is_some() {
                "blank month and no manifest month"
            } else {
                "no month column and no manifest month"
            };
            IngestError::schema(source_name, line_no, Some(column), reason)
        }),
    }
}

fn require_practice<'f>(
    fields: &'f [String],
    idx: usize,
    source_name: &str,
    line_no: usize,
    column: &str,
) -> IngestResult<&'f str> {
    non_blank(fields.get(idx))
        .ok_or_else(|| IngestError::schema(source_name, line_no, Some(column), "blank practice code"))
}

/// Read a prescribing extract using the configured column names.
pub fn read_prescribing<R: BufRead>(
    reader: R,
    source_name: &str,
    columns: &PrescribingColumns,
    default_period: Option<Period>,
) -> IngestResult<Vec<PrescribingRow>> {
    let table = read_csv_table(reader, source_name)?;
    let practice_idx = table.require(source_name, &columns.practice_code)?;
    let items_idx = table.require(source_name, &columns.items)?;
    let month_idx = table.header.index_of(&columns.month);
    let bnf_idx = table.header.index_of(&columns.bnf_code);

    let mut rows = Vec::with_capacity(table.rows.len());
    for (line_no, fields) in &table.rows {
        let line_no = *line_no;
        rows.push(PrescribingRow {
            practice_code: require_practice(fields, practice_idx, source_name, line_no, &columns.practice_code)?
                .to_string(),
            period: row_period(
                fields,
                month_idx,
                default_period,
                source_name,
                line_no,
                &columns.month,
            )?,
            bnf_code: bnf_idx
                .and_then(|i| non_blank(fields.get(i)))
                .map(str::to_string),
            items: parse_count(non_blank(fields.get(items_idx)), source_name, line_no, &columns.items)?,
        });
    }
    Ok(rows)
}

/// Read a list-size extract using the configured column names.
pub fn read_list_sizes<R: BufRead>(
    reader: R,
    source_name: &str,
    columns: &ListSizeColumns,
    default_period: Option<Period>,
) -> IngestResult<Vec<ListSizeRow>> {
    let table = read_csv_table(reader, source_name)?;
    let practice_idx = table.require(source_name, &columns.practice_code)?;
    let list_idx = table.require(source_name, &columns.list_size)?;
    let month_idx = table.header.index_of(&columns.month);
    let pcn_idx = table.header.index_of(&columns.pcn_code);
    let icb_idx = table.header.index_of(&columns.icb_code);

    let mut rows = Vec::with_capacity(table.rows.len());
    for (line_no, fields) in &table.rows {
        let line_no = *line_no;
        rows.push(ListSizeRow {
            practice_code: require_practice(fields, practice_idx, source_name, line_no, &columns.practice_code)?
                .to_string(),
            period: row_period(
                fields,
                month_idx,
                default_period,
                source_name,
                line_no,
                &columns.month,
            )?,
            list_size: parse_count(
                non_blank(fields.get(list_idx)),
                source_name,
                line_no,
                &columns.list_size,
            )?,
            pcn_code: pcn_idx
                .and_then(|i| non_blank(fields.get(i)))
                .map(str::to_string),
            icb_code: icb_idx
                .and_then(|i| non_blank(fields.get(i)))
                .map(str::to_string),
        });
    }
    Ok(rows)
}

/// Build the tidy store from raw rows.
///
/// Prescribing rows are filtered to `bnf_prefix` (rows without a BNF code
/// are kept), items are summed per practice and month, then list sizes are
/// left-joined. A practice/month without a list size keeps a missing
/// denominator so the aggregator can exclude and report it.
pub fn prepare_tidy(
    prescribing: &[PrescribingRow],
    list_sizes: &[ListSizeRow],
    bnf_prefix: &str,
) -> Reported<TidyRecordStore> {
    let mut report = DataQualityReport::new();

    let mut lists: BTreeMap<(&str, Period), &ListSizeRow> = BTreeMap::new();
    for row in list_sizes {
        match lists.entry((row.practice_code.as_str(), row.period)) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(_) => report.push(
                IssueKind::DuplicateRow,
                Some(&UnitId::new(row.practice_code.as_str())),
                Some(row.period),
                "duplicate list-size row; first occurrence kept",
            ),
        }
    }

    // (items total or None once it overflows, rows with a count)
    let mut totals: BTreeMap<(&str, Period), (Option<u64>, usize)> = BTreeMap::new();
    let mut filtered_out = 0usize;
    for row in prescribing {
        let matches_measure = row
            .bnf_code
            .as_deref()
            .map_or(true, |code| code.starts_with(bnf_prefix));
        if !matches_measure {
            filtered_out += 1;
            continue;
        }

        let total = totals
            .entry((row.practice_code.as_str(), row.period))
            .or_insert((Some(0), 0));
        match row.items {
            Some(items) => {
                let sum = total.0.and_then(|sum| sum.checked_add(items));
                if total.0.is_some() && sum.is_none() {
                    report.push(
                        IssueKind::CountOverflow,
                        Some(&UnitId::new(row.practice_code.as_str())),
                        Some(row.period),
                        "summed item count overflows; practice-month has no item count",
                    );
                }
                total.0 = sum;
                total.1 += 1;
            }
            None => {
                report.push(
                    IssueKind::MissingItems,
                    Some(&UnitId::new(row.practice_code.as_str())),
                    Some(row.period),
                    "prescribing row without an item count dropped",
                );
            }
        }
    }

    let mut unmatched = 0usize;
    let records: Vec<TidyRecord> = totals
        .into_iter()
        .map(|((practice_code, period), (items, counted))| {
            let list = lists.get(&(practice_code, period));
            if list.is_none() {
                unmatched += 1;
            }
            TidyRecord {
                practice_code: practice_code.to_string(),
                pcn_code: list.and_then(|l| l.pcn_code.clone()),
                icb_code: list.and_then(|l| l.icb_code.clone()),
                period,
                items: items.filter(|_| counted > 0),
                list_size: list.and_then(|l| l.list_size),
            }
        })
        .collect();

    info!(
        "Prepared {} tidy records ({} prescribing rows outside BNF prefix {})",
        records.len(),
        filtered_out,
        bnf_prefix
    );
    if unmatched > 0 {
        warn!("{} practice-months have no matching list size", unmatched);
    }

    Reported::new(TidyRecordStore::new(records), report)
}

/// Load every dataset named in a manifest from `raw_dir` and prepare the
/// tidy store. A listed file that is missing aborts the load.
pub fn load_from_manifest(
    manifest: &DatasetManifest,
    raw_dir: &Path,
    config: &IngestConfig,
) -> IngestResult<Reported<TidyRecordStore>> {
    let mut prescribing = Vec::new();
    let mut list_sizes = Vec::new();

    for entry in manifest.entries() {
        let path = raw_dir.join(&entry.file_name);
        let file = File::open(&path).map_err(|e| IngestError::io(&path, e))?;
        let reader = BufReader::new(file);
        let name = path.display().to_string();

        match entry.kind {
            DatasetKind::Prescribing => {
                let rows = read_prescribing(reader, &name, &config.columns.prescribing, entry.month)?;
                info!("Read {} prescribing rows from {}", rows.len(), name);
                prescribing.extend(rows);
            }
            DatasetKind::ListSize => {
                let rows = read_list_sizes(reader, &name, &config.columns.list_size, entry.month)?;
                info!("Read {} list-size rows from {}", rows.len(), name);
                list_sizes.extend(rows);
            }
        }
    }

    Ok(prepare_tidy(&prescribing, &list_sizes, &config.bnf_prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jan() -> Period {
        Period::new(2024, 1).unwrap()
    }

    fn presc(practice: &str, bnf: &str, items: Option<u64>) -> PrescribingRow {
        PrescribingRow {
            practice_code: practice.into(),
            period: jan(),
            bnf_code: Some(bnf.into()),
            items,
        }
    }

    fn list(practice: &str, size: u64) -> ListSizeRow {
        ListSizeRow {
            practice_code: practice.into(),
            period: jan(),
            list_size: Some(size),
            pcn_code: Some("U001".into()),
            icb_code: None,
        }
    }

    #[test]
    fn test_bnf_filter_and_sum() {
        let prescribing = vec![
            presc("A81001", "0501013B0AAABAB", Some(10)),
            presc("A81001", "0501015P0AAABAB", Some(5)),
            presc("A81001", "0212000B0AAADAD", Some(99)),
        ];
        let lists = vec![list("A81001", 4000)];

        let (store, report) = prepare_tidy(&prescribing, &lists, "0501").into_parts();
        assert_eq!(store.len(), 1);
        let r = &store.records()[0];
        assert_eq!(r.items, Some(15));
        assert_eq!(r.list_size, Some(4000));
        assert_eq!(r.pcn_code.as_deref(), Some("U001"));
        assert!(report.is_empty());
    }

    #[test]
    fn test_unmatched_list_size_is_missing() {
        let prescribing = vec![presc("B82005", "0501013B0AAABAB", Some(3))];
        let (store, _) = prepare_tidy(&prescribing, &[], "0501").into_parts();
        assert_eq!(store.records()[0].list_size, None);
    }

    #[test]
    fn test_duplicates_and_missing_items_reported() {
        let prescribing = vec![
            presc("A81001", "0501013B0AAABAB", None),
            presc("A81001", "0501013B0AAABAB", Some(4)),
        ];
        let lists = vec![list("A81001", 4000), list("A81001", 9999)];

        let (store, report) = prepare_tidy(&prescribing, &lists, "0501").into_parts();
        assert_eq!(store.records()[0].items, Some(4));
        assert_eq!(store.records()[0].list_size, Some(4000));
        assert_eq!(report.count(IssueKind::DuplicateRow), 1);
        assert_eq!(report.count(IssueKind::MissingItems), 1);
    }

    #[test]
    fn test_overflowing_item_sum_left_missing() {
        let prescribing = vec![
            presc("A81001", "0501013B0AAABAB", Some(u64::MAX - 1)),
            presc("A81001", "0501015P0AAABAB", Some(5)),
            presc("A81001", "0501015P0AAABAB", Some(5)),
        ];
        let lists = vec![list("A81001", 4000)];

        let (store, report) = prepare_tidy(&prescribing, &lists, "0501").into_parts();
        assert_eq!(store.records()[0].items, None);
        assert_eq!(report.count(IssueKind::CountOverflow), 1);
    }

    #[test]
    fn test_read_prescribing_with_column_map() {
        let columns = PrescribingColumns {
            practice_code: "PRACTICE_CODE".into(),
            month: "YEAR_MONTH".into(),
            bnf_code: "BNF_CODE".into(),
            items: "ITEMS".into(),
        };
        let csv = "YEAR_MONTH,PRACTICE_CODE,BNF_CODE,ITEMS,NIC\n\
                   202401,A81001,0501013B0AAABAB,12,30.5\n";
        let rows = read_prescribing(csv.as_bytes(), "epd.csv", &columns, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].period, jan());
        assert_eq!(rows[0].items, Some(12));
    }

    #[test]
    fn test_manifest_month_used_when_column_absent() {
        let csv = "practice_code,list_size\nA81001,4000\n";
        let rows =
            read_list_sizes(csv.as_bytes(), "list.csv", &ListSizeColumns::default(), Some(jan()))
                .unwrap();
        assert_eq!(rows[0].period, jan());

        let err = read_list_sizes(csv.as_bytes(), "list.csv", &ListSizeColumns::default(), None)
            .unwrap_err();
        assert!(err.to_string().contains("no month column"));
    }

    #[test]
    fn test_load_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("epd.csv"),
            "practice_code,bnf_code,items\nA81001,0501013B0AAABAB,8\nA81002,0501013B0AAABAB,2\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("list.csv"),
            "practice_code,list_size\nA81001,4000\nA81002,0\n",
        )
        .unwrap();
        let manifest = DatasetManifest::from_csv_reader(
            "month,file_name,type\n2024-01,epd.csv,prescribing\n2024-01,list.csv,list_size\n"
                .as_bytes(),
            "datasets.csv",
        )
        .unwrap();

        let (store, _) = load_from_manifest(&manifest, dir.path(), &IngestConfig::default())
            .unwrap()
            .into_parts();
        assert_eq!(store.len(), 2);
        assert_eq!(store.records()[1].list_size, Some(0));
    }

    #[test]
    fn test_load_from_manifest_missing_file_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = DatasetManifest::from_csv_reader(
            "month,file_name,type\n2024-01,absent.csv,prescribing\n".as_bytes(),
            "datasets.csv",
        )
        .unwrap();
        let result = load_from_manifest(&manifest, dir.path(), &IngestConfig::default());
        assert!(matches!(result, Err(IngestError::Io { .. })));
    }
}
