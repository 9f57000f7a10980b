#![allow(missing_docs)]

use std::sync::Arc;

use arrow_array::{Int64Array, RecordBatch, StringArray};
use bytes::Bytes;
use lakelog_core::{
    schema::{Column, ColumnType, Schema},
    storage::{ObjectStorage, ObjectStoreStorage, PutOutcome, StorageRef},
    table::{MergeMode, MergeOptions, ReadOptions, Table, TableDefinition},
    Lake, Predicate,
};
use object_store::memory::InMemory;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn schema() -> Result<Schema, Box<dyn std::error::Error>> {
    Ok(Schema::new(vec![
        Column::new("id", ColumnType::Int64, false),
        Column::new("name", ColumnType::Utf8, true),
    ])?)
}

fn people(ids: Vec<i64>, names: Vec<&str>) -> Result<RecordBatch, arrow::error::ArrowError> {
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids)) as _),
        ("name", Arc::new(StringArray::from(names)) as _),
    ])
}

#[tokio::test]
async fn full_lifecycle_on_an_object_store() -> TestResult {
    let storage: StorageRef = Arc::new(ObjectStoreStorage::new(
        Arc::new(InMemory::new()),
        "warehouse/people",
        "memory://lifecycle",
    ));
    let definition = TableDefinition::new("people", schema()?).with_primary_keys(["id"]);
    let table = Table::create_in(Arc::clone(&storage), definition).await?;

    table
        .append(&[people(vec![1, 2, 3], vec!["ann", "bob", "cy"])?])
        .await?;
    let metrics = table
        .merge(
            &[people(vec![2, 4], vec!["bobby", "dee"])?],
            MergeOptions::new(MergeMode::Upsert),
        )
        .await?;
    assert_eq!(metrics.rows_updated, 1);
    assert_eq!(metrics.rows_inserted, 1);

    let deleted = table.delete(Predicate::eq("id", 1i64)).await?;
    assert_eq!(deleted.rows_deleted, 1);

    let reopened = Table::open_in(storage).await?;
    let scan = reopened.read(ReadOptions::default()).await?;
    assert_eq!(scan.version(), 3);
    assert_eq!(scan.count_rows().await?, 3);
    assert_eq!(reopened.read(ReadOptions::at_version(1)).await?.count_rows().await?, 3);
    assert_eq!(reopened.history().await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn put_if_absent_has_exactly_one_winner() -> TestResult {
    let storage: StorageRef = Arc::new(ObjectStoreStorage::new(
        Arc::new(InMemory::new()),
        "race",
        "memory://put-race",
    ));

    let mut handles = Vec::new();
    for writer in 0..16u8 {
        let storage = Arc::clone(&storage);
        handles.push(tokio::spawn(async move {
            storage
                .put_if_absent("_log/00000000000000000001.json", Bytes::from(vec![writer]))
                .await
        }));
    }

    let mut winners = Vec::new();
    for (writer, handle) in handles.into_iter().enumerate() {
        if handle.await?? == PutOutcome::Created {
            winners.push(writer as u8);
        }
    }
    assert_eq!(winners.len(), 1);
    let stored = storage.get("_log/00000000000000000001.json").await?;
    assert_eq!(stored.as_ref(), &[winners[0]]);
    Ok(())
}

#[tokio::test]
async fn lake_tables_share_one_store() -> TestResult {
    let lake = Lake::new(Arc::new(ObjectStoreStorage::new(
        Arc::new(InMemory::new()),
        "lake",
        "memory://shared-lake",
    )));
    let a = lake
        .create_table("a", TableDefinition::new("a", schema()?))
        .await?;
    let b = lake
        .create_table("b", TableDefinition::new("b", schema()?))
        .await?;
    a.append(&[people(vec![1], vec!["ann"])?]).await?;
    b.append(&[people(vec![1, 2], vec!["bob", "cy"])?]).await?;

    assert_eq!(lake.list_tables().await?, vec!["a", "b"]);
    assert_eq!(lake.table_info("a").await?.total_rows, 1);
    assert_eq!(lake.table_info("b").await?.total_rows, 2);

    lake.drop_table("a").await?;
    assert_eq!(lake.list_tables().await?, vec!["b"]);
    assert_eq!(
        lake.open_table("b")
            .await?
            .read(ReadOptions::default())
            .await?
            .count_rows()
            .await?,
        2
    );
    Ok(())
}
