//! Integration tests for read sessions, stream readers and the table provider
//! against the in-memory service fakes.

use std::sync::Arc;
use std::time::Duration;

use apache_avro::types::Value;
use arrow::array::{Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use bqlink_connectors::testing::{FailurePlan, FakeControlApi, InMemoryStorage, TableData};
use bqlink_connectors::{
    BigQueryClient, BigQueryTable, DestinationTableCache, ManualClock, ReadRetryPolicy,
    ReadSessionCreator, RowDecoder, StreamPartitionReader,
};
use bqlink_core::model::{
    DataFormat, FieldMode, FieldSchema, FieldType, JobError, ReadSessionConfig, TableSchema,
    TableType,
};
use bqlink_core::{ConnectorError, ReadConfig, TableInfo, TableReference};
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;

const WORDS_SCHEMA: &str = r#"{"type":"record","name":"r","fields":[
    {"name":"word","type":["null","string"]},
    {"name":"word_count","type":["null","long"]}
]}"#;

const PAIR_SCHEMA: &str = r#"{"type":"record","name":"r","fields":[
    {"name":"a","type":"long"},
    {"name":"b","type":"string"}
]}"#;

fn word_rows(n: i64) -> Vec<Value> {
    (0..n)
        .map(|i| {
            Value::Record(vec![
                ("word".into(), Value::Union(1, Box::new(Value::String(format!("w{}", i))))),
                ("word_count".into(), Value::Union(1, Box::new(Value::Long(i)))),
            ])
        })
        .collect()
}

fn words_schema() -> TableSchema {
    TableSchema::new(vec![
        FieldSchema::new("word", FieldType::String, FieldMode::Nullable),
        FieldSchema::new("word_count", FieldType::Integer, FieldMode::Nullable),
    ])
}

fn pair_arrow_schema() -> Schema {
    Schema::new(vec![
        Field::new("a", DataType::Int64, false),
        Field::new("b", DataType::Utf8, false),
    ])
}

fn client(api: Arc<FakeControlApi>) -> BigQueryClient {
    BigQueryClient::new(api, "billing")
        .with_job_polling(Duration::from_millis(1), Duration::from_secs(5))
}

/// A view over `p.d.base`, with materialized tables served from default data.
fn view_setup(api: &FakeControlApi, storage: &InMemoryStorage) -> TableReference {
    let base = TableReference::new("p", "d", "base");
    let view = TableReference::new("p", "d", "recent");
    api.add_table(TableInfo::new(base, TableType::Table, words_schema()));
    api.add_table(TableInfo::new(view.clone(), TableType::View, words_schema()));
    storage.set_default(TableData::avro(WORDS_SCHEMA, &word_rows(4), 2).unwrap());
    view
}

fn session_config(filter: Option<&str>) -> ReadSessionConfig {
    ReadSessionConfig::new(
        2,
        &["word".to_string(), "word_count".to_string()],
        filter.map(str::to_string),
        DataFormat::Avro,
    )
}

async fn read_all(reader: &mut StreamPartitionReader) -> Result<Vec<Vec<ScalarValue>>, ConnectorError> {
    let mut rows = Vec::new();
    while let Some(row) = reader.next_row().await? {
        rows.push(row);
    }
    reader.close();
    Ok(rows)
}

#[tokio::test]
async fn test_concurrent_view_reads_materialize_once() {
    let api = Arc::new(FakeControlApi::new().with_job_delay(Duration::from_millis(50)));
    let storage = Arc::new(InMemoryStorage::new());
    let view = view_setup(&api, &storage);
    let creator = Arc::new(
        ReadSessionCreator::new(
            client(api.clone()),
            storage.clone(),
            Arc::new(DestinationTableCache::default()),
        )
        .with_views(true, 24),
    );

    let config = session_config(Some("word_count > 1"));
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let creator = creator.clone();
            let view = view.clone();
            let config = config.clone();
            tokio::spawn(async move { creator.create(&view, &config).await })
        })
        .collect();

    let mut destinations = Vec::new();
    for task in tasks {
        let response = task.await.unwrap().unwrap();
        destinations.push(response.table_info.reference);
    }

    assert_eq!(api.jobs_submitted(), 1);
    assert_eq!(storage.sessions_created(), 4);
    assert!(destinations.iter().all(|d| d == &destinations[0]));
    assert!(destinations[0].table.starts_with("_bqc_"));
    assert!(api.queries()[0].contains("WHERE (word_count > 1)"));
}

#[tokio::test]
async fn test_expired_cache_entry_materializes_again() {
    let api = Arc::new(FakeControlApi::new());
    let storage = Arc::new(InMemoryStorage::new());
    let view = view_setup(&api, &storage);
    let clock = Arc::new(ManualClock::default());
    let cache = Arc::new(DestinationTableCache::new(
        10,
        Duration::from_secs(15 * 60),
        clock.clone(),
    ));
    let creator = ReadSessionCreator::new(client(api.clone()), storage, cache.clone())
        .with_views(true, 24);

    creator.create(&view, &session_config(None)).await.unwrap();
    creator.create(&view, &session_config(None)).await.unwrap();
    assert_eq!(api.jobs_submitted(), 1);

    clock.advance(Duration::from_secs(16 * 60));
    creator.create(&view, &session_config(None)).await.unwrap();
    assert_eq!(api.jobs_submitted(), 2);

    creator
        .create(&view, &session_config(Some("word_count = 3")))
        .await
        .unwrap();
    creator.create(&view, &session_config(None)).await.unwrap();
    assert_eq!(api.jobs_submitted(), 3);
    assert_eq!(cache.len().await, 2);
}

#[tokio::test]
async fn test_failed_materialization_then_concurrent_retry() {
    let api = Arc::new(
        FakeControlApi::new()
            .with_job_delay(Duration::from_millis(50))
            .with_job_error(JobError {
                reason: "backendError".into(),
                message: "Backend error".into(),
                location: None,
            }),
    );
    let storage = Arc::new(InMemoryStorage::new());
    let view = view_setup(&api, &storage);
    let cache = Arc::new(DestinationTableCache::default());
    let creator = Arc::new(
        ReadSessionCreator::new(client(api.clone()), storage.clone(), cache.clone())
            .with_views(true, 24),
    );

    let spawn_all = |n: usize| -> Vec<_> {
        (0..n)
            .map(|_| {
                let creator = creator.clone();
                let view = view.clone();
                tokio::spawn(async move { creator.create(&view, &session_config(None)).await })
            })
            .collect()
    };

    for task in spawn_all(4) {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectorError::MaterializationFailure { .. }));
    }
    assert_eq!(api.jobs_submitted(), 1);
    assert!(cache.is_empty().await);
    assert_eq!(storage.sessions_created(), 0);

    api.set_job_error(None);
    let mut destinations = Vec::new();
    for task in spawn_all(4) {
        destinations.push(task.await.unwrap().unwrap().table_info.reference);
    }
    assert_eq!(api.jobs_submitted(), 2);
    assert_eq!(cache.len().await, 1);
    assert_eq!(storage.sessions_created(), 4);
    assert!(destinations.iter().all(|d| d == &destinations[0]));
}

#[tokio::test]
async fn test_concurrent_readers_are_isolated() {
    let storage = Arc::new(InMemoryStorage::new());
    let data = TableData::avro(WORDS_SCHEMA, &word_rows(6), 2).unwrap();
    let healthy = storage.add_stream("s/healthy", data.batches.clone());
    let broken = storage.add_stream("s/broken", data.batches.clone());
    storage.fail_stream(
        "s/broken",
        FailurePlan {
            times: 1,
            after_batches: 1,
            retryable: false,
        },
    );

    let target = bqlink_core::schema::to_engine_schema(&words_schema()).unwrap();
    let columns = vec!["word".to_string(), "word_count".to_string()];
    let open = |stream| {
        StreamPartitionReader::open(
            storage.clone(),
            stream,
            RowDecoder::new(&data.schema, &target, &columns).unwrap(),
            ReadRetryPolicy::no_delay(3),
        )
    };
    let mut good = open(healthy);
    let mut bad = open(broken);

    let (good_rows, bad_rows) = tokio::join!(read_all(&mut good), read_all(&mut bad));

    let good_rows = good_rows.unwrap();
    assert_eq!(good_rows.len(), 6);
    assert_eq!(good_rows[5][1], ScalarValue::Int64(Some(5)));
    assert_eq!(good.metrics().retries, 0);
    assert!(matches!(
        bad_rows,
        Err(ConnectorError::StreamReadFailure { attempts: 1, .. })
    ));
}

#[tokio::test]
async fn test_empty_table_and_empty_stream() {
    let api = Arc::new(FakeControlApi::new());
    let storage = Arc::new(InMemoryStorage::new());
    let table = TableReference::new("p", "d", "empty");
    let mut info = TableInfo::new(table.clone(), TableType::Table, words_schema());
    info.num_rows = Some(0);
    api.add_table(info);
    storage.add_table(table.clone(), TableData::avro(WORDS_SCHEMA, &[], 2).unwrap());

    let creator = Arc::new(ReadSessionCreator::new(
        client(api),
        storage.clone(),
        Arc::new(DestinationTableCache::default()),
    ));
    let provider = BigQueryTable::try_new(creator, ReadConfig::new(table)).await.unwrap();
    let ctx = SessionContext::new();
    ctx.register_table("empty", Arc::new(provider)).unwrap();

    let batches = ctx
        .sql("SELECT word FROM empty")
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 0);

    let stream = storage.add_stream("s/empty", vec![]);
    let target = bqlink_core::schema::to_engine_schema(&words_schema()).unwrap();
    let schema = bqlink_core::model::SessionSchema::Avro(WORDS_SCHEMA.to_string());
    let mut reader = StreamPartitionReader::open(
        storage,
        stream,
        RowDecoder::new(&schema, &target, &["word".to_string()]).unwrap(),
        ReadRetryPolicy::no_delay(3),
    );
    assert!(!reader.has_next().await.unwrap());
    assert!(reader.next_row().await.unwrap().is_none());
}

#[tokio::test]
async fn test_scan_fails_after_retries_are_exhausted() {
    let api = Arc::new(FakeControlApi::new());
    let storage = Arc::new(InMemoryStorage::new());
    let table = TableReference::new("p", "d", "flaky");
    api.add_table(TableInfo::new(table.clone(), TableType::Table, words_schema()));
    storage.add_table(table.clone(), TableData::avro(WORDS_SCHEMA, &word_rows(4), 4).unwrap());
    // The first session gets id 0 and a single stream.
    storage.fail_stream(
        "projects/p/sessions/s0/streams/0",
        FailurePlan {
            times: 10,
            after_batches: 0,
            retryable: true,
        },
    );

    let creator = Arc::new(ReadSessionCreator::new(
        client(api),
        storage.clone(),
        Arc::new(DestinationTableCache::default()),
    ));
    let provider = BigQueryTable::try_new(creator, ReadConfig::new(table))
        .await
        .unwrap()
        .with_retry_policy(ReadRetryPolicy::no_delay(3));
    let ctx = SessionContext::new();
    ctx.register_table("flaky", Arc::new(provider)).unwrap();

    let err = ctx
        .sql("SELECT word FROM flaky")
        .await
        .unwrap()
        .collect()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed after 3 attempt(s)"));
    assert_eq!(storage.read_requests().len(), 3);
}

#[tokio::test]
async fn test_requested_column_order_in_both_formats() {
    let storage = Arc::new(InMemoryStorage::new());
    let target = pair_arrow_schema();
    let columns = vec!["b".to_string(), "a".to_string()];

    let avro = TableData::avro(
        PAIR_SCHEMA,
        &[Value::Record(vec![
            ("a".into(), Value::Long(1)),
            ("b".into(), Value::String("x".into())),
        ])],
        1,
    )
    .unwrap();
    let batch = RecordBatch::try_new(
        Arc::new(target.clone()),
        vec![
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(StringArray::from(vec!["x"])),
        ],
    )
    .unwrap();
    let arrow = TableData::arrow(&target, &[batch]).unwrap();

    for (name, data) in [("s/avro", avro), ("s/arrow", arrow)] {
        let stream = storage.add_stream(name, data.batches.clone());
        let mut reader = StreamPartitionReader::open(
            storage.clone(),
            stream,
            RowDecoder::new(&data.schema, &target, &columns).unwrap(),
            ReadRetryPolicy::no_delay(1),
        );
        let row = reader.next_row().await.unwrap().unwrap();
        assert_eq!(
            row,
            vec![
                ScalarValue::Utf8(Some("x".into())),
                ScalarValue::Int64(Some(1))
            ],
            "stream {}",
            name
        );
        assert_eq!(reader.schema().field(0).name(), "b");
        assert!(reader.next_row().await.unwrap().is_none());
    }
}
