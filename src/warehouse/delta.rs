//! Delta Lake warehouse backend.
//!
//! Each projection table lives at `{root}/{table}`. A load infers an Arrow
//! schema from the NDJSON rows, writes them as a single Parquet file, and
//! recreates the table with `SaveMode::Overwrite` before committing the new
//! file, so every load truncates and replaces the table.

use async_trait::async_trait;
use bytes::Bytes;
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use deltalake::arrow::json::ReaderBuilder;
use deltalake::arrow::json::reader::infer_json_schema;
use deltalake::kernel::{Action, Add};
use deltalake::operations::create::CreateBuilder;
use deltalake::parquet::arrow::ArrowWriter;
use deltalake::protocol::SaveMode;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{JobStatus, LoadJob, LoadRequest, Warehouse};
use crate::error::{
    DeltaError, DeltaLakeSnafu, DeltaLoadSnafu, DeltaUploadSnafu, ParquetWriteSnafu,
    ProvisionError, StorageError, StructTypeSnafu, UnsupportedArrowTypeSnafu, UrlParseSnafu,
    WarehouseError,
};
use crate::storage::provision::{self, Provisioned, Provisioner};
use crate::storage::{BackendConfig, StorageProvider, StorageProviderRef};
use crate::transform::ProjectionName;

/// Number of rows sampled for schema inference.
const SAMPLE_SIZE: usize = 1000;

/// Loads projections into Delta Lake tables under one root.
pub struct DeltaWarehouse {
    root: StorageProviderRef,
    container: Arc<dyn Provisioner>,
}

impl DeltaWarehouse {
    pub fn new(root: StorageProviderRef, container: Arc<dyn Provisioner>) -> Self {
        deltalake::gcp::register_handlers(None);
        Self { root, container }
    }

    async fn table_storage(&self, table: &str) -> Result<StorageProvider, StorageError> {
        let url = format!("{}/{}", self.root.canonical_url().trim_end_matches('/'), table);
        StorageProvider::for_url_with_options(&url, self.root.storage_options().clone()).await
    }

    // The data file is uploaded before the log is touched, and the table is
    // replaced by one commit carrying the new metadata, the removes of the
    // previous files and the add of the new one. A failed load leaves the
    // previous version live.
    async fn replace_table(&self, request: &LoadRequest) -> Result<(i64, u64), DeltaError> {
        let storage = self.table_storage(&request.table).await.context(DeltaUploadSnafu)?;
        if let BackendConfig::Local(local) = storage.config() {
            tokio::fs::create_dir_all(&local.path)
                .await
                .map_err(|source| StorageError::Io { source })
                .context(DeltaUploadSnafu)?;
        }

        let schema = infer_schema(request.projection, &request.rows)?;
        let delta_schema = arrow_schema_to_delta(&schema)?;
        let table_url = table_url(&storage)?;

        let mut actions = Vec::new();
        let mut rows = 0;
        if !request.rows.is_empty() {
            let (parquet, count) = encode_parquet(schema, &request.rows)?;
            let filename = format!("part-00000-{}.parquet", Uuid::new_v4());
            let size = parquet.len() as i64;
            storage
                .put_payload(&Path::from(filename.as_str()), PutPayload::from(parquet))
                .await
                .context(DeltaUploadSnafu)?;
            debug!("Uploaded {} ({} bytes, {} rows)", filename, size, count);

            actions.push(add_action(filename, size));
            rows = count;
        }

        info!("Replacing Delta table {}", table_url);
        let table = CreateBuilder::new()
            .with_location(table_url.as_str())
            .with_columns(delta_schema.fields().cloned())
            .with_save_mode(SaveMode::Overwrite)
            .with_storage_options(storage.storage_options().clone())
            .with_actions(actions)
            .await
            .context(DeltaLakeSnafu)?;

        Ok((table.version().unwrap_or_default(), rows))
    }
}

#[async_trait]
impl Warehouse for DeltaWarehouse {
    fn dataset(&self) -> String {
        self.root.canonical_url().to_string()
    }

    async fn ensure_dataset(&self) -> Result<Provisioned, ProvisionError> {
        provision::ensure(self.container.as_ref()).await
    }

    async fn submit_load(&self, request: LoadRequest) -> Result<LoadJob, WarehouseError> {
        let (version, rows) = self
            .replace_table(&request)
            .await
            .context(DeltaLoadSnafu {
                table: &request.table,
            })?;

        Ok(LoadJob {
            id: format!("{}@v{}", request.table, version),
            location: None,
            status: JobStatus::Succeeded { rows },
        })
    }

    // Loads commit synchronously, so submitted jobs are already terminal.
    async fn poll_job(&self, _table: &str, job: &LoadJob) -> Result<JobStatus, WarehouseError> {
        Ok(job.status.clone())
    }
}

/// Columns each projection is known to carry. Used when the rows cannot
/// tell the type of a column (no rows, or only nulls).
fn projection_columns(projection: ProjectionName) -> Vec<Field> {
    match projection {
        ProjectionName::Sales => vec![
            Field::new("title", DataType::Utf8, true),
            Field::new("price", DataType::Float64, true),
            Field::new("category", DataType::Utf8, true),
        ],
        ProjectionName::Product => vec![
            Field::new("title", DataType::Utf8, true),
            Field::new("description", DataType::Utf8, true),
            Field::new("image", DataType::Utf8, true),
        ],
        ProjectionName::Finance => vec![
            Field::new("id", DataType::Int64, true),
            Field::new("price", DataType::Float64, true),
            Field::new("rating", DataType::Float64, true),
        ],
    }
}

/// Infer the table schema from NDJSON rows.
fn infer_schema(projection: ProjectionName, rows: &Bytes) -> Result<SchemaRef, DeltaError> {
    let known = projection_columns(projection);
    if rows.is_empty() {
        return Ok(Arc::new(Schema::new(known)));
    }

    let (schema, records_read) =
        infer_json_schema(Cursor::new(rows.as_ref()), Some(SAMPLE_SIZE)).map_err(|e| {
            DeltaError::SchemaInference {
                message: e.to_string(),
            }
        })?;
    debug!("Inferred schema from {records_read} rows");

    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|field| match field.data_type() {
            DataType::Null => {
                let data_type = known
                    .iter()
                    .find(|k| k.name() == field.name())
                    .map(|k| k.data_type().clone())
                    .unwrap_or(DataType::Utf8);
                Field::new(field.name(), data_type, true)
            }
            _ => field.as_ref().clone(),
        })
        .collect();

    Ok(Arc::new(Schema::new(fields)))
}

/// Decode NDJSON rows with `schema` and write them as one Parquet file.
fn encode_parquet(schema: SchemaRef, rows: &Bytes) -> Result<(Bytes, u64), DeltaError> {
    let reader = ReaderBuilder::new(schema.clone())
        .with_strict_mode(false)
        .build(Cursor::new(rows.as_ref()))
        .map_err(|e| DeltaError::RecordDecode {
            message: e.to_string(),
        })?;

    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, schema, None).context(ParquetWriteSnafu)?;
    let mut count = 0u64;
    for batch in reader {
        let batch = batch.map_err(|e| DeltaError::RecordDecode {
            message: e.to_string(),
        })?;
        count += batch.num_rows() as u64;
        writer.write(&batch).context(ParquetWriteSnafu)?;
    }
    writer.close().context(ParquetWriteSnafu)?;

    Ok((Bytes::from(buffer), count))
}

/// Table URL understood by deltalake for a storage provider.
fn table_url(storage: &StorageProvider) -> Result<Url, DeltaError> {
    let url = match storage.config() {
        BackendConfig::Gcs(gcs) => {
            let root = Path::default();
            format!("gs://{}/{}", gcs.bucket, storage.qualify_path(&root))
        }
        BackendConfig::Local(local) => format!("file://{}", local.path),
    };
    Url::parse(&url).context(UrlParseSnafu)
}

/// Convert an Arrow schema to a Delta schema.
fn arrow_schema_to_delta(schema: &Schema) -> Result<deltalake::kernel::StructType, DeltaError> {
    use deltalake::kernel::{StructField, StructType};

    let fields: Vec<StructField> = schema
        .fields()
        .iter()
        .map(|field| {
            let delta_type = arrow_type_to_delta(field.data_type())?;
            Ok(StructField::new(
                field.name(),
                delta_type,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, DeltaError>>()?;

    StructType::try_new(fields).map_err(|e| {
        StructTypeSnafu {
            message: e.to_string(),
        }
        .build()
    })
}

fn arrow_type_to_delta(arrow_type: &DataType) -> Result<deltalake::kernel::DataType, DeltaError> {
    use deltalake::kernel::DataType as DeltaType;

    let delta_type = match arrow_type {
        DataType::Boolean => DeltaType::BOOLEAN,
        DataType::Int64 => DeltaType::LONG,
        DataType::Float64 => DeltaType::DOUBLE,
        DataType::Utf8 | DataType::LargeUtf8 => DeltaType::STRING,
        other => {
            return UnsupportedArrowTypeSnafu {
                arrow_type: other.clone(),
            }
            .fail();
        }
    };

    Ok(delta_type)
}

fn add_action(path: String, size: i64) -> Action {
    Action::Add(Add {
        path,
        size,
        partition_values: HashMap::new(),
        modification_time: chrono::Utc::now().timestamp_millis(),
        data_change: true,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parse_catalog;
    use crate::storage::provision::LocalDirectory;
    use crate::transform::shape;
    use crate::warehouse::WarehouseSink;
    use deltalake::DeltaTable;
    use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    const CATALOG: &[u8] = br#"[
        {"id":1,"title":"Shirt","price":19.99,"category":"clothing","description":"desc","image":"img.jpg"},
        {"id":2,"title":"Ring","price":5.5,"category":"jewelery","description":"gold","image":"ring.jpg"}
    ]"#;

    async fn warehouse(root: &std::path::Path) -> DeltaWarehouse {
        let storage = StorageProvider::for_url_with_options(root.to_str().unwrap(), HashMap::new())
            .await
            .unwrap();
        DeltaWarehouse::new(
            Arc::new(storage),
            Arc::new(LocalDirectory {
                path: root.to_path_buf(),
            }),
        )
    }

    async fn open(root: &std::path::Path, table: &str) -> DeltaTable {
        let url = Url::parse(&format!("file://{}/{}", root.display(), table)).unwrap();
        deltalake::open_table_with_storage_options(url, HashMap::new())
            .await
            .unwrap()
    }

    fn parquet_files(dir: std::path::PathBuf) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .collect()
    }

    #[test]
    fn test_all_null_column_takes_known_type() {
        let rows = Bytes::from_static(
            b"{\"id\":1,\"price\":19.99,\"rating\":null}\n{\"id\":2,\"price\":5.5,\"rating\":null}",
        );
        let schema = infer_schema(ProjectionName::Finance, &rows).unwrap();

        assert_eq!(schema.field_with_name("id").unwrap().data_type(), &DataType::Int64);
        assert_eq!(
            schema.field_with_name("rating").unwrap().data_type(),
            &DataType::Float64
        );
    }

    #[test]
    fn test_empty_rows_use_projection_columns() {
        let schema = infer_schema(ProjectionName::Product, &Bytes::new()).unwrap();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["title", "description", "image"]);
    }

    #[tokio::test]
    async fn test_load_writes_each_table() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store_data");
        let sink = WarehouseSink::new(Arc::new(warehouse(&root).await));

        let report = sink
            .load(&shape(&parse_catalog(CATALOG).unwrap()))
            .await
            .unwrap();

        assert_eq!(report.len(), 3);
        assert!(report.tables.iter().all(|t| t.rows == 2));

        let files = parquet_files(root.join("finance_products"));
        assert_eq!(files.len(), 1);
        let reader =
            ParquetRecordBatchReaderBuilder::try_new(std::fs::File::open(&files[0]).unwrap())
                .unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);

        let table = open(&root, "sales_products").await;
        assert_eq!(table.get_file_uris().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_reload_replaces_table_contents() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store_data");
        let sink = WarehouseSink::new(Arc::new(warehouse(&root).await));

        sink.load(&shape(&parse_catalog(CATALOG).unwrap()))
            .await
            .unwrap();
        let report = sink.load(&shape(&[])).await.unwrap();

        assert!(report.tables.iter().all(|t| t.rows == 0));
        let table = open(&root, "sales_products").await;
        assert_eq!(table.get_file_uris().unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_files_in_one_commit() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store_data");
        let sink = WarehouseSink::new(Arc::new(warehouse(&root).await));
        let projections = shape(&parse_catalog(CATALOG).unwrap());

        sink.load(&projections).await.unwrap();
        let report = sink.load(&projections).await.unwrap();
        assert!(report.tables.iter().any(|t| t.job_id == "finance_products@v1"));

        let mut table = open(&root, "finance_products").await;
        assert_eq!(table.version(), Some(1));
        for version in 0..=1 {
            table.load_version(version).await.unwrap();
            assert_eq!(
                table.get_file_uris().unwrap().count(),
                1,
                "version {version} has no live data file"
            );
        }
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_table() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("store_data");
        let warehouse = Arc::new(warehouse(&root).await);
        let sink = WarehouseSink::new(warehouse.clone());
        sink.load(&shape(&parse_catalog(CATALOG).unwrap()))
            .await
            .unwrap();

        // A list column has no Delta mapping, so this load fails after inference.
        let err = warehouse
            .submit_load(LoadRequest {
                projection: ProjectionName::Finance,
                table: "finance_products".to_string(),
                rows: Bytes::from_static(b"{\"id\":1,\"price\":[1,2],\"rating\":null}"),
                row_count: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::DeltaLoad { .. }));

        let table = open(&root, "finance_products").await;
        assert_eq!(table.version(), Some(0));
        assert_eq!(table.get_file_uris().unwrap().count(), 1);
        assert_eq!(parquet_files(root.join("finance_products")).len(), 1);
    }
}
