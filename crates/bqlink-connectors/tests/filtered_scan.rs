//! A filtered read spread over five streams, checked against the
//! control-plane row count for the same filter.

use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use arrow::array::{AsArray, RecordBatch};
use arrow::datatypes::Int64Type;
use bqlink_connectors::testing::{FakeControlApi, InMemoryStorage, TableData};
use bqlink_connectors::{BigQueryClient, BigQueryTable, DestinationTableCache, ReadSessionCreator};
use bqlink_core::model::{FieldMode, FieldSchema, FieldType, TableSchema, TableType};
use bqlink_core::{ReadConfig, TableInfo, TableReference};
use datafusion::prelude::SessionContext;

const SHAKESPEARE: &str = r#"{"type":"record","name":"__root__","fields":[
    {"name":"word","type":["null","string"]},
    {"name":"word_count","type":["null","long"]},
    {"name":"corpus","type":["null","string"]}
]}"#;

const MATCHING_ROWS: u64 = 164_656;

/// Storage applies the row restriction server side, so the fake serves only
/// the rows that satisfy `word_count = 4`.
async fn setup() -> (Arc<FakeControlApi>, Arc<InMemoryStorage>, BigQueryTable) {
    let api = Arc::new(FakeControlApi::new());
    let storage = Arc::new(InMemoryStorage::new());
    let table = TableReference::new("bigquery-public-data", "samples", "shakespeare");

    let mut info = TableInfo::new(
        table.clone(),
        TableType::Table,
        TableSchema::new(vec![
            FieldSchema::new("word", FieldType::String, FieldMode::Nullable),
            FieldSchema::new("word_count", FieldType::Integer, FieldMode::Nullable),
            FieldSchema::new("corpus", FieldType::String, FieldMode::Nullable),
        ]),
    );
    info.num_rows = Some(MATCHING_ROWS * 3);
    api.add_table(info);
    api.set_query_count(MATCHING_ROWS);

    let rows: Vec<Value> = (0..MATCHING_ROWS)
        .map(|i| {
            Value::Record(vec![
                ("word".into(), Value::Union(1, Box::new(Value::String(format!("w{}", i % 977))))),
                ("word_count".into(), Value::Union(1, Box::new(Value::Long(4)))),
                ("corpus".into(), Value::Union(1, Box::new(Value::String(format!("c{}", i % 42))))),
            ])
        })
        .collect();
    storage.add_table(table.clone(), TableData::avro(SHAKESPEARE, &rows, 1000).unwrap());

    let client = BigQueryClient::new(api.clone(), "billing")
        .with_job_polling(Duration::from_millis(1), Duration::from_secs(5));
    let creator = Arc::new(ReadSessionCreator::new(
        client,
        storage.clone(),
        Arc::new(DestinationTableCache::default()),
    ));
    let mut config = ReadConfig::new(table);
    config.max_parallelism = Some(5);

    let provider = BigQueryTable::try_new(creator, config).await.unwrap();
    (api, storage, provider)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_filtered_five_stream_read_matches_count() {
    let (_api, storage, provider) = setup().await;
    let expected = provider.count_rows(Some("word_count = 4")).await.unwrap();
    assert_eq!(expected, MATCHING_ROWS);

    let ctx = SessionContext::new();
    ctx.register_table("shakespeare", Arc::new(provider)).unwrap();
    let batches: Vec<RecordBatch> = ctx
        .sql("SELECT word, word_count FROM shakespeare WHERE word_count = 4")
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
    assert_eq!(rows as u64, expected);
    assert!(batches.iter().all(|b| b
        .column(1)
        .as_primitive::<Int64Type>()
        .iter()
        .all(|v| v == Some(4))));

    let request = storage.last_session_request().unwrap();
    assert_eq!(request.requested_streams, 5);
    assert_eq!(
        request.selected_fields,
        vec!["word".to_string(), "word_count".to_string()]
    );
    let restriction = request.row_restriction.unwrap();
    assert!(restriction.contains("word_count"), "{}", restriction);
    assert!(restriction.contains("= 4"), "{}", restriction);

    // Every stream was read to the end exactly once.
    let mut streams: Vec<String> = storage
        .read_requests()
        .into_iter()
        .map(|r| r.stream.name)
        .collect();
    streams.sort();
    streams.dedup();
    assert_eq!(streams.len(), 5);
    assert_eq!(storage.read_requests().len(), 5);
}

#[tokio::test]
async fn test_count_star_uses_row_count() {
    let (api, storage, provider) = setup().await;
    let ctx = SessionContext::new();
    ctx.register_table("shakespeare", Arc::new(provider)).unwrap();

    let batches = ctx
        .sql("SELECT COUNT(*) AS n FROM shakespeare")
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    let n = batches[0].column(0).as_primitive::<Int64Type>().value(0);
    assert_eq!(n as u64, MATCHING_ROWS * 3);
    assert_eq!(storage.sessions_created(), 0);
    assert!(api.queries().is_empty());
}
