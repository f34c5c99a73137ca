//! MongoDB adapters for `reporter`: a document-kind
//! [`reporter::ports::DatasourceConnection`], plus the
//! [`reporter::ports::TemplateStore`] and [`reporter::ports::ReportStore`]
//! metadata stores, per the comments on those traits in `reporter::ports`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use reporter::datasource::{sample_size_for, DatasourceConfig};
use reporter::orchestrator::model::{ErrorMetadata, Report, ReportStatus, Template};
use reporter::ports::{DatasourceConnection, ReportStore, Row, SchemaInfo, TemplateStore};
use reporter::ReportError;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => serde_json::json!(f),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => serde_json::json!(n),
        Bson::Int64(n) => serde_json::json!(n),
        Bson::Null => Value::Null,
        Bson::ObjectId(id) => Value::String(id.to_hex()),
        Bson::DateTime(dt) => Value::String(dt.try_to_rfc3339_string().unwrap_or_default()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => {
            let map = doc.iter().map(|(k, v)| (k.clone(), bson_to_json(v))).collect();
            Value::Object(map)
        }
        other => Value::String(other.to_string()),
    }
}

/// Document-kind datasource connection, with the tiered sampling schema
/// discovery (tiered sampling above a full-scan threshold).
pub struct MongoConnection {
    config: DatasourceConfig,
    client: RwLock<Option<Client>>,
}

impl MongoConnection {
    pub fn new(config: DatasourceConfig) -> Self {
        Self { config, client: RwLock::new(None) }
    }

    async fn database(&self) -> Result<Database, ReportError> {
        let client = self.client.read().await.clone().ok_or_else(|| ReportError::unknown_msg("mongo connection not yet established"))?;
        Ok(client.database(&self.config.database))
    }
}

#[async_trait]
impl DatasourceConnection for MongoConnection {
    async fn connect(&self) -> Result<(), ReportError> {
        let client = Client::with_uri_str(self.config.connection_string()).await.map_err(|e| {
            tracing::error!(name = %self.config.name, dsn = %self.config.redacted_connection_string(), error = %e, "mongo connect failed");
            ReportError::unknown(e)
        })?;
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn probe(&self) -> Result<(), ReportError> {
        let db = self.database().await?;
        db.run_command(doc! { "ping": 1 }).await.map_err(ReportError::unknown)?;
        Ok(())
    }

    async fn query(&self, table: &str, fields: &[String]) -> Result<Vec<Row>, ReportError> {
        let db = self.database().await?;
        let collection: Collection<Document> = db.collection(table);

        let projection: Document = if fields.is_empty() {
            Document::new()
        } else {
            fields.iter().map(|f| (f.clone(), Bson::Int32(1))).collect()
        };
        let find_opts = mongodb::options::FindOptions::builder().projection(projection).build();
        let mut cursor = collection.find(doc! {}).with_options(find_opts).await.map_err(ReportError::unknown)?;

        let mut out = Vec::new();
        while let Some(document) = cursor.try_next().await.map_err(ReportError::unknown)? {
            let mut row: Row = HashMap::new();
            for (key, value) in document.iter() {
                if key == "_id" {
                    continue;
                }
                row.insert(key.clone(), bson_to_json(value));
            }
            out.push(row);
        }
        Ok(out)
    }

    async fn discover_schema(&self) -> Result<SchemaInfo, ReportError> {
        let db = self.database().await?;
        let mut tables = HashMap::new();

        for table in &self.config.schemas {
            let collection: Collection<Document> = db.collection(table);
            let estimated_count = collection.estimated_document_count().await.unwrap_or(0) as u64;
            let sample_size = sample_size_for(estimated_count);

            let mut cursor = if sample_size >= estimated_count {
                collection.find(doc! {}).await.map_err(ReportError::unknown)?
            } else {
                let pipeline = vec![doc! { "$sample": { "size": sample_size as i64 } }];
                let raw = db.collection::<Document>(table).aggregate(pipeline).await.map_err(ReportError::unknown)?;
                // Re-deserialize into the typed collection's document shape.
                let docs: Vec<Document> = raw.try_collect().await.map_err(ReportError::unknown)?;
                let mut fields = std::collections::BTreeSet::new();
                for d in &docs {
                    for (k, _) in d.iter() {
                        if k != "_id" {
                            fields.insert(k.clone());
                        }
                    }
                }
                tables.insert(table.clone(), fields.into_iter().collect());
                continue;
            };

            let mut fields = std::collections::BTreeSet::new();
            while let Some(document) = cursor.try_next().await.map_err(ReportError::unknown)? {
                for (k, _) in document.iter() {
                    if k != "_id" {
                        fields.insert(k.clone());
                    }
                }
            }
            tables.insert(table.clone(), fields.into_iter().collect());
        }

        Ok(SchemaInfo { tables })
    }
}

/// Read-only template metadata/bytes lookup, backed by a `templates`
/// collection; the template's rendered-source bytes live inline in the
/// same document (`body`), keyed by `filename`.
pub struct MongoTemplateStore {
    collection: Collection<TemplateDocument>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TemplateDocument {
    #[serde(rename = "_id")]
    id: Uuid,
    output_format: String,
    description: String,
    filename: String,
    mapped_fields: HashMap<String, HashMap<String, Vec<String>>>,
    body: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<&TemplateDocument> for Template {
    fn from(doc: &TemplateDocument) -> Self {
        Template {
            id: doc.id,
            output_format: doc.output_format.clone(),
            description: doc.description.clone(),
            filename: doc.filename.clone(),
            mapped_fields: doc.mapped_fields.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            deleted_at: doc.deleted_at,
        }
    }
}

impl MongoTemplateStore {
    pub fn new(database: &Database) -> Self {
        Self { collection: database.collection("templates") }
    }
}

#[async_trait]
impl TemplateStore for MongoTemplateStore {
    async fn get(&self, id: Uuid) -> Result<Template, ReportError> {
        let found = self
            .collection
            .find_one(doc! { "_id": id, "deleted_at": Bson::Null })
            .await
            .map_err(ReportError::unknown)?;
        found
            .as_ref()
            .map(Template::from)
            .ok_or_else(|| ReportError::entity_not_found("TPL-0404", format!("template '{id}' not found")))
    }

    async fn get_bytes(&self, template: &Template) -> Result<Vec<u8>, ReportError> {
        let found = self
            .collection
            .find_one(doc! { "_id": template.id })
            .await
            .map_err(ReportError::unknown)?;
        found
            .map(|doc| doc.body)
            .ok_or_else(|| ReportError::entity_not_found("TPL-0404", format!("template '{}' body not found", template.id)))
    }
}

/// Report metadata persistence, with an atomic conditional upsert that
/// never overwrites a terminal status once a report has reached one.
pub struct MongoReportStore {
    collection: Collection<ReportDocument>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct ReportDocument {
    #[serde(rename = "_id")]
    id: Uuid,
    status: ReportStatus,
    artifact_ref: Option<String>,
    error_metadata: Option<ErrorMetadata>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ReportDocument> for Report {
    fn from(doc: ReportDocument) -> Self {
        Report {
            id: doc.id,
            status: doc.status,
            artifact_ref: doc.artifact_ref,
            error_metadata: doc.error_metadata,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

impl MongoReportStore {
    pub fn new(database: &Database) -> Self {
        Self { collection: database.collection("reports") }
    }
}

#[async_trait]
impl ReportStore for MongoReportStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Report>, ReportError> {
        let found = self.collection.find_one(doc! { "_id": id }).await.map_err(ReportError::unknown)?;
        Ok(found.map(Report::from))
    }

    async fn update_status(
        &self,
        id: Uuid,
        new_status: ReportStatus,
        metadata: Option<ErrorMetadata>,
        artifact_ref: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), ReportError> {
        let terminal_statuses = vec![
            mongodb::bson::to_bson(&ReportStatus::Finished).map_err(ReportError::unknown)?,
            mongodb::bson::to_bson(&ReportStatus::Error).map_err(ReportError::unknown)?,
        ];
        let filter = doc! {
            "_id": id,
            "status": { "$nin": terminal_statuses },
        };
        let mut update = doc! {
            "$set": {
                "status": mongodb::bson::to_bson(&new_status).map_err(ReportError::unknown)?,
                "updated_at": mongodb::bson::to_bson(&finished_at.unwrap_or_else(Utc::now)).map_err(ReportError::unknown)?,
            }
        };
        if let Some(meta) = &metadata {
            update.get_document_mut("$set").unwrap().insert("error_metadata", mongodb::bson::to_bson(meta).map_err(ReportError::unknown)?);
        }
        if let Some(key) = &artifact_ref {
            update.get_document_mut("$set").unwrap().insert("artifact_ref", key.clone());
        }

        let options = FindOneAndUpdateOptions::builder().return_document(ReturnDocument::After).upsert(false).build();
        let outcome = self.collection.find_one_and_update(filter, update).with_options(options).await.map_err(ReportError::unknown)?;

        if outcome.is_none() {
            tracing::debug!(report_id = %id, status = ?new_status, "update_status skipped: report already terminal or missing");
        }
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<(), ReportError> {
        let index = IndexModel::builder()
            .keys(doc! { "status": 1 })
            .options(IndexOptions::builder().build())
            .build();
        self.collection.create_index(index).await.map_err(ReportError::unknown)?;
        Ok(())
    }
}
