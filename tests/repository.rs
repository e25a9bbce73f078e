use std::io::Write;
use std::sync::Mutex;

use chrono::NaiveDate;
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use uke_stations::db::Database;
use uke_stations::domain::{Location, PointFilter};
use uke_stations::downloader::{PublicationClient, SaveHandler};
use uke_stations::error::StationError;
use uke_stations::repository::{NullProgressSink, PointsRepository, ProgressEvent, ProgressSink};
use uke_stations::storage::FileStorage;

const COORD_TOLERANCE: f64 = 1e-4;

struct MockClient {
    date: NaiveDate,
    files: Vec<(String, Vec<u8>)>,
}

impl PublicationClient for MockClient {
    fn fetch_current_data_date(&self, _page_url: &str) -> Result<NaiveDate, StationError> {
        Ok(self.date)
    }

    fn download_files(&self, _page_url: &str, save: SaveHandler<'_>) -> Result<(), StationError> {
        for (name, data) in &self.files {
            save(self.date, data, name);
        }
        Ok(())
    }
}

struct RecordingSink {
    fractions: Mutex<Vec<f64>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.fractions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.fraction);
    }
}

/// Builds a minimal permit workbook whose data rows are `fields` in columns
/// A through J, with the expiry date in column D as an Excel serial.
fn workbook(rows: &[[&str; 10]]) -> Vec<u8> {
    let mut sheet = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet><sheetData>
<row r="1"><c r="A1"><v>Operator</v></c><c r="B1"><v>Decyzja</v></c></row>
"#,
    );
    for (i, fields) in rows.iter().enumerate() {
        let row_number = i + 2;
        sheet.push_str(&format!("<row r=\"{row_number}\">"));
        for (j, value) in fields.iter().enumerate() {
            let column = (b'A' + j as u8) as char;
            sheet.push_str(&format!(
                "<c r=\"{column}{row_number}\"><v>{value}</v></c>"
            ));
        }
        sheet.push_str("</row>\n");
    }
    sheet.push_str("</sheetData></worksheet>");

    let workbook_xml = r#"<workbook><sheets><sheet name="Arkusz1" sheetId="1" r:id="rId1"/></sheets></workbook>"#;
    let rels_xml = r#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/></Relationships>"#;

    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.start_file("xl/workbook.xml", options).unwrap();
    writer.write_all(workbook_xml.as_bytes()).unwrap();
    writer.start_file("xl/_rels/workbook.xml.rels", options).unwrap();
    writer.write_all(rels_xml.as_bytes()).unwrap();
    writer.start_file("xl/worksheets/sheet1.xml", options).unwrap();
    writer.write_all(sheet.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

fn station_row<'a>(operator: &'a str, station_id: &'a str) -> [&'a str; 10] {
    [
        operator,
        "DRR.WRROK.6171.1.2024",
        "P",
        "45658.5",
        "21E00'44\"",
        "52N13'47\"",
        "Warszawa",
        "ul. Marszałkowska 1",
        station_id,
        "1465011",
    ]
}

fn publication_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn repository(
    dir: &TempDir,
    files: Vec<(String, Vec<u8>)>,
    date: NaiveDate,
) -> PointsRepository<MockClient> {
    let storage = FileStorage::new(
        camino::Utf8PathBuf::from_path_buf(dir.path().join("publications")).unwrap(),
    );
    let db = Database::open(&dir.path().join("stations.sqlite")).unwrap();
    let client = MockClient { date, files };
    PointsRepository::new(client, storage, db, "https://example.test/index.html".to_string())
}

#[test]
fn refresh_ingests_a_publication_end_to_end() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[
        station_row("Orange Polska S.A.", "STA001"),
        // Missing coordinates; dropped without failing the file.
        ["Orange Polska S.A.", "DRR.2", "P", "45658.5", "", "", "Warszawa", "x", "STA009", "1465011"],
    ]);
    let gsm = workbook(&[
        station_row("Orange Polska S.A.", "STA001"),
        station_row("Play sp. z o.o.", "STA002"),
    ]);
    let repo = repository(
        &dir,
        vec![
            ("lte_-_stan_na_2024-05-01.xlsx".to_string(), lte),
            ("gsm_-_stan_na_2024-05-01.xlsx".to_string(), gsm),
        ],
        publication_date(),
    );

    let date = repo.refresh(&NullProgressSink).unwrap();
    assert_eq!(date, Some(publication_date()));

    let points = repo.get_all_points(None).unwrap();
    assert_eq!(points.len(), 2);

    let sta001 = points
        .iter()
        .find(|p| p.details.station_id == "STA001")
        .unwrap();
    let mut technologies: Vec<_> = sta001
        .permissions
        .iter()
        .map(|p| p.technology.clone())
        .collect();
    technologies.sort();
    assert_eq!(technologies, vec!["gsm", "lte"]);
    assert!((sta001.latitude - 52.2297222).abs() < COORD_TOLERANCE);
    assert!((sta001.longitude - 21.0122222).abs() < COORD_TOLERANCE);
    // Serial 45658.5 is 2025-01-01T12:00:00Z.
    assert_eq!(sta001.permissions[0].expiry_date, 1_735_732_800);

    assert_eq!(repo.get_technologies().unwrap(), vec!["gsm", "lte"]);
    assert_eq!(
        repo.get_operator_names().unwrap(),
        vec!["Orange Polska S.A.", "Play sp. z o.o."]
    );
}

#[test]
fn spatial_queries_use_the_ingested_coordinates() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    let repo = repository(
        &dir,
        vec![("lte.xlsx".to_string(), lte)],
        publication_date(),
    );
    repo.refresh(&NullProgressSink).unwrap();

    let near = Location {
        latitude: 52.2297,
        longitude: 21.0122,
    };
    let filter = PointFilter {
        technologies: None,
        operator_names: None,
    };
    let hits = repo.get_points(near, 2_000.0, &filter).unwrap();
    assert_eq!(hits.len(), 1);

    let far = Location {
        latitude: 50.0,
        longitude: 20.0,
    };
    assert!(repo.get_points(far, 2_000.0, &filter).unwrap().is_empty());
}

#[test]
fn unreadable_files_are_skipped_without_failing_the_refresh() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    let repo = repository(
        &dir,
        vec![
            ("broken.xlsx".to_string(), b"not a zip archive".to_vec()),
            ("lte.xlsx".to_string(), lte),
        ],
        publication_date(),
    );

    repo.refresh(&NullProgressSink).unwrap();
    let points = repo.get_all_points(None).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].details.station_id, "STA001");
}

#[test]
fn unstorable_files_do_not_abort_the_refresh() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    // The first file is rejected by the store (wrong extension); the rest of
    // the publication still goes through.
    let repo = repository(
        &dir,
        vec![
            ("report.pdf".to_string(), b"%PDF-1.4".to_vec()),
            ("lte.xlsx".to_string(), lte),
        ],
        publication_date(),
    );

    let date = repo.refresh(&NullProgressSink).unwrap();
    assert_eq!(date, Some(publication_date()));

    let points = repo.get_all_points(None).unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].details.station_id, "STA001");
}

#[test]
fn refresh_without_new_downloads_reuses_the_latest_local_publication() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    let repo = repository(
        &dir,
        vec![("lte.xlsx".to_string(), lte)],
        publication_date(),
    );
    repo.refresh(&NullProgressSink).unwrap();
    drop(repo);

    // Nothing downloadable this run; the stored publication is re-ingested.
    let repo = repository(&dir, Vec::new(), publication_date());
    let date = repo.refresh(&NullProgressSink).unwrap();
    assert_eq!(date, Some(publication_date()));
    assert_eq!(repo.get_all_points(None).unwrap().len(), 1);
}

#[test]
fn refresh_with_no_data_anywhere_completes_at_full_progress() {
    let dir = TempDir::new().unwrap();
    let repo = repository(&dir, Vec::new(), publication_date());

    let sink = RecordingSink {
        fractions: Mutex::new(Vec::new()),
    };
    let date = repo.refresh(&sink).unwrap();
    assert_eq!(date, None);
    assert!(repo.get_all_points(None).unwrap().is_empty());

    let fractions = sink.fractions.into_inner().unwrap();
    assert_eq!(fractions.last().copied(), Some(1.0));
}

#[test]
fn refresh_reports_monotonic_progress_from_zero_to_one() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    let repo = repository(
        &dir,
        vec![("lte.xlsx".to_string(), lte)],
        publication_date(),
    );

    let sink = RecordingSink {
        fractions: Mutex::new(Vec::new()),
    };
    repo.refresh(&sink).unwrap();

    let fractions = sink.fractions.into_inner().unwrap();
    assert_eq!(fractions.first().copied(), Some(0.0));
    assert_eq!(fractions.last().copied(), Some(1.0));
    assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn freshness_compares_remote_against_latest_local_date() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);

    // Nothing local yet.
    let repo = repository(
        &dir,
        vec![("lte.xlsx".to_string(), lte.clone())],
        publication_date(),
    );
    assert!(repo.is_new_version_available().unwrap());

    repo.refresh(&NullProgressSink).unwrap();
    assert!(!repo.is_new_version_available().unwrap());
    assert_eq!(repo.get_local_dates().unwrap(), vec![publication_date()]);
    drop(repo);

    // A newer remote publication makes the local copy stale again.
    let newer = publication_date().succ_opt().unwrap();
    let repo = repository(&dir, vec![("lte.xlsx".to_string(), lte)], newer);
    assert!(repo.is_new_version_available().unwrap());
}

#[test]
fn delete_all_local_data_clears_database_and_files() {
    let dir = TempDir::new().unwrap();
    let lte = workbook(&[station_row("Orange Polska S.A.", "STA001")]);
    let repo = repository(
        &dir,
        vec![("lte.xlsx".to_string(), lte)],
        publication_date(),
    );
    repo.refresh(&NullProgressSink).unwrap();

    repo.delete_all_local_data().unwrap();

    assert!(repo.get_all_points(None).unwrap().is_empty());
    assert!(repo.get_local_dates().unwrap().is_empty());
}
