use kef_adapters::{decode_row, ColumnLayout, CsvFileSheetReader, FetchContext, ScoreVocabulary, SheetReader};
use kef_core::{DecodeError, Score};

fn workspace_root() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn sample_sheet_decodes_against_shipped_vocabulary() {
    let root = workspace_root();
    let vocab = ScoreVocabulary::from_yaml_file(root.join("rules/vocabulary.yaml")).expect("vocabulary");
    let reader = CsvFileSheetReader::new(root.join("fixtures/sample-sheet/responses.csv"));

    let rows = reader
        .fetch_rows_after(&FetchContext::new(), 1)
        .await
        .expect("fixture rows");
    let numbers = rows.iter().map(|r| r.row_number).collect::<Vec<_>>();
    assert_eq!(numbers, vec![2, 3, 4, 5, 6, 7]);
    assert!(rows[4].is_blank());

    let layout = ColumnLayout::default();
    let decoded = rows
        .iter()
        .filter(|r| !r.is_blank())
        .map(|r| decode_row(r, &layout, &vocab))
        .collect::<Vec<_>>();
    assert_eq!(decoded[0].as_ref().map(|r| r.score), Ok(Score::Achieved));
    assert_eq!(
        decoded[2].as_ref().map(|r| r.score),
        Err(&DecodeError::UnknownResponseText { text: "maybe".into() })
    );
    assert_eq!(decoded[4].as_ref().map(|r| r.score), Ok(Score::Partial));
}

#[tokio::test]
async fn cursor_past_fixture_end_yields_no_rows() {
    let reader = CsvFileSheetReader::new(workspace_root().join("fixtures/sample-sheet/responses.csv"));
    let rows = reader
        .fetch_rows_after(&FetchContext::new(), 7)
        .await
        .expect("fixture rows");
    assert!(rows.is_empty());
}
