//! The engine context: schema registry, backend and configuration.
//!
//! [`Persistor`] is built once at startup and passed to whoever needs
//! storage. It owns no instances; every read materializes into the
//! [`ObjectGraph`] the caller supplies, and every write goes through a
//! [`Transaction`].

use std::sync::Arc;

use serde_json::{Value, json};

use crate::config::PersistorConfig;
use crate::core::{Backend, Row};
use crate::error::{StorageResult, ValidationError};
use crate::instance::{InstanceId, ObjectGraph};
use crate::mapper::FetchSpec;
use crate::mapper::read::Loader;
use crate::query::{FilterExpr, Pagination, SortSpec, translate, translate_expr};
use crate::schema::{PRIMARY_KEY, PropertyKind, SchemaRegistry};
use crate::transaction::{SaveReport, Transaction, TransactionManager, TransactionOptions};

/// A query against one template.
///
/// # Example
///
/// ```
/// use helios_persistor::{FetchRequest, FetchSpec};
/// use serde_json::json;
///
/// let request = FetchRequest::new("Customer")
///     .filter(json!({"name": {"$regex": "^sa", "$options": "i"}}))
///     .fetch(FetchSpec::only("primaryAddresses"))
///     .limit(10);
/// assert_eq!(request.template(), "Customer");
/// ```
#[derive(Debug, Clone)]
pub struct FetchRequest {
    template: String,
    filter: Value,
    spec: FetchSpec,
    sort: SortSpec,
    page: Pagination,
}

impl FetchRequest {
    /// Every instance of `template`, schema-eager relationships resolved.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            filter: json!({}),
            spec: FetchSpec::none(),
            sort: SortSpec::default(),
            page: Pagination::default(),
        }
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn fetch(mut self, spec: FetchSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.page.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.page.limit = Some(limit);
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

/// Entry point for every persistence operation.
///
/// Cheap to clone; clones share the backend pool.
#[derive(Debug, Clone)]
pub struct Persistor {
    registry: Arc<SchemaRegistry>,
    backend: Arc<dyn Backend>,
    config: PersistorConfig,
    transactions: TransactionManager,
}

impl Persistor {
    /// Creates an engine over `backend`. Storage is not touched; call
    /// [`synchronize`](Self::synchronize) to create missing tables.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        backend: Arc<dyn Backend>,
        config: PersistorConfig,
    ) -> StorageResult<Self> {
        config.validate().map_err(|errors| ValidationError::InvalidConfig {
            message: errors.join("; "),
        })?;
        tracing::info!(
            backend = %backend.kind(),
            templates = registry.registered_templates().len(),
            "Persistor initialized"
        );
        Ok(Self {
            transactions: TransactionManager::new(Arc::clone(&backend), config.clone()),
            registry,
            backend,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &PersistorConfig {
        &self.config
    }

    /// A fresh, empty graph over this engine's registry.
    pub fn graph(&self) -> ObjectGraph {
        ObjectGraph::new(Arc::clone(&self.registry))
    }

    /// Creates missing storage for every registered template.
    pub async fn synchronize(&self) -> StorageResult<()> {
        self.backend.synchronize(&self.registry).await?;
        Ok(())
    }

    /// Drops the storage behind `template`, shared subtypes included.
    pub async fn drop_storage(&self, template: &str) -> StorageResult<()> {
        let target = self.registry.table_name(template)?;
        self.backend.drop_storage(target).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Runs `request` and materializes the matching instances into `graph`.
    ///
    /// Results are in backend order unless the request sorts.
    pub async fn fetch(&self, graph: &mut ObjectGraph, request: &FetchRequest) -> StorageResult<Vec<InstanceId>> {
        let schema = self.registry.template(&request.template)?;
        let predicate = translate(schema, &request.filter, self.backend.dialect())?;
        let mut conn = self.backend.acquire().await?;
        let mut loader = Loader::new(graph, conn.as_mut(), self.backend.dialect(), self.config.max_fetch_depth);
        loader
            .fetch(&request.template, &predicate, &request.sort, request.page, &request.spec)
            .await
    }

    /// Fetches one instance by identity.
    ///
    /// A missing identity fails before any I/O with
    /// `The operator "undefined" is not permitted`.
    pub async fn fetch_by_id(
        &self,
        graph: &mut ObjectGraph,
        template: &str,
        id: Option<&str>,
        spec: &FetchSpec,
    ) -> StorageResult<Option<InstanceId>> {
        let id = id.ok_or_else(|| ValidationError::MissingIdentity {
            template: template.to_string(),
        })?;
        let schema = self.registry.template(template)?;
        let predicate = translate_expr(schema, FilterExpr::eq(PRIMARY_KEY, id), self.backend.dialect())?;
        let mut conn = self.backend.acquire().await?;
        let mut loader = Loader::new(graph, conn.as_mut(), self.backend.dialect(), self.config.max_fetch_depth);
        let found = loader
            .fetch(template, &predicate, &SortSpec::default(), Pagination::new(None, Some(1)), spec)
            .await?;
        Ok(found.into_iter().next())
    }

    /// Matching rows as stored, without instantiation.
    pub async fn fetch_raw(
        &self,
        template: &str,
        filter: &Value,
        sort: &SortSpec,
        page: Pagination,
    ) -> StorageResult<Vec<Row>> {
        let schema = self.registry.template(template)?;
        let predicate = translate(schema, filter, self.backend.dialect())?;
        let mut conn = self.backend.acquire().await?;
        Ok(conn.query(schema.storage_name(), &predicate, sort, page).await?)
    }

    /// Number of rows matching `filter`.
    pub async fn count(&self, template: &str, filter: &Value) -> StorageResult<u64> {
        let schema = self.registry.template(template)?;
        let predicate = translate(schema, filter, self.backend.dialect())?;
        let mut conn = self.backend.acquire().await?;
        let count = conn.count(schema.storage_name(), &predicate).await?;
        tracing::debug!(template = %template, count, "Counted rows");
        Ok(count)
    }

    /// Resolves one relationship of an existing instance and returns its
    /// members. An already-resolved relationship is returned as is.
    pub async fn fetch_relationship(
        &self,
        graph: &mut ObjectGraph,
        id: InstanceId,
        relationship: &str,
    ) -> StorageResult<Vec<InstanceId>> {
        let template = graph.instance(id)?.template().to_string();
        let kind = self.registry.relationship(&template, relationship)?.kind.clone();
        self.fetch_relationships(graph, id, &FetchSpec::only(relationship))
            .await?;
        Ok(match kind {
            PropertyKind::ToOne { .. } => graph.reference(id, relationship).into_iter().collect(),
            _ => graph.collection(id, relationship).to_vec(),
        })
    }

    /// Resolves the relationships named by `spec`, recursively, reusing
    /// instances already in the graph.
    pub async fn fetch_relationships(
        &self,
        graph: &mut ObjectGraph,
        id: InstanceId,
        spec: &FetchSpec,
    ) -> StorageResult<()> {
        let mut conn = self.backend.acquire().await?;
        let mut loader = Loader::new(graph, conn.as_mut(), self.backend.dialect(), self.config.max_fetch_depth);
        loader.resolve_from(id, spec).await
    }

    /// Whether the stored version differs from the local one.
    ///
    /// Reads the stored version only; the instance is left untouched. A
    /// deleted row counts as stale, an unsaved instance never is.
    pub async fn is_stale(&self, graph: &ObjectGraph, id: InstanceId) -> StorageResult<bool> {
        let instance = graph.instance(id)?;
        let Some(key) = instance.id() else {
            return Ok(false);
        };
        let target = self.registry.table_name(instance.template())?;
        let mut conn = self.backend.acquire().await?;
        let stored = conn.read_version(target, key).await?;
        Ok(stored != Some(instance.version()))
    }

    /// Re-reads an instance from storage, discarding local changes.
    ///
    /// Returns `false` if the row is gone; the instance is then marked deleted.
    pub async fn refresh(&self, graph: &mut ObjectGraph, id: InstanceId) -> StorageResult<bool> {
        let mut conn = self.backend.acquire().await?;
        let mut loader = Loader::new(graph, conn.as_mut(), self.backend.dialect(), self.config.max_fetch_depth);
        loader.refresh(id).await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn begin(&self, options: TransactionOptions) -> StorageResult<Transaction> {
        self.transactions.begin(options).await
    }

    /// Writes everything registered on `txn`. See [`TransactionManager::end`].
    pub async fn end(&self, txn: &mut Transaction, graph: &mut ObjectGraph) -> StorageResult<SaveReport> {
        self.transactions.end(txn, graph).await
    }

    /// Saves instances in an implicit transaction.
    pub async fn save(&self, graph: &mut ObjectGraph, ids: &[InstanceId]) -> StorageResult<SaveReport> {
        let mut txn = self.begin(TransactionOptions::default()).await?;
        for id in ids {
            txn.set_dirty(graph, *id)?;
        }
        self.end(&mut txn, graph).await
    }

    /// Marks `id` and its cascade closure dirty.
    ///
    /// Without a transaction an implicit one is begun and ended, and its
    /// report returned.
    pub async fn cascade_save(
        &self,
        graph: &mut ObjectGraph,
        id: InstanceId,
        txn: Option<&mut Transaction>,
    ) -> StorageResult<Option<SaveReport>> {
        match txn {
            Some(txn) => {
                txn.cascade_save(graph, id)?;
                Ok(None)
            }
            None => {
                let mut txn = self.begin(TransactionOptions::default()).await?;
                txn.cascade_save(graph, id)?;
                self.end(&mut txn, graph).await.map(Some)
            }
        }
    }

    /// Deletes the row behind `id`, version-checked.
    pub async fn delete(
        &self,
        graph: &mut ObjectGraph,
        id: InstanceId,
        txn: Option<&mut Transaction>,
    ) -> StorageResult<Option<SaveReport>> {
        match txn {
            Some(txn) => {
                txn.delete(graph, id)?;
                Ok(None)
            }
            None => {
                let mut txn = self.begin(TransactionOptions::default()).await?;
                txn.delete(graph, id)?;
                self.end(&mut txn, graph).await.map(Some)
            }
        }
    }

    /// Rewrites `id` unchanged, bumping its version.
    ///
    /// Fails with "Update Conflict" if someone else wrote the row first, which
    /// makes it a cheap way to assert a record is still current at commit.
    pub async fn touch(
        &self,
        graph: &mut ObjectGraph,
        id: InstanceId,
        txn: Option<&mut Transaction>,
    ) -> StorageResult<Option<SaveReport>> {
        if graph.instance(id)?.is_new() {
            return Err(ValidationError::MissingIdentity {
                template: graph.instance(id)?.template().to_string(),
            }
            .into());
        }
        match txn {
            Some(txn) => {
                txn.set_dirty(graph, id)?;
                Ok(None)
            }
            None => self.save(graph, &[id]).await.map(Some),
        }
    }

    // ------------------------------------------------------------------
    // Storage keys
    // ------------------------------------------------------------------

    pub fn table_name(&self, template: &str) -> StorageResult<&str> {
        self.registry.table_name(template)
    }

    pub fn parent_key(&self, template: &str, relationship: &str) -> StorageResult<&str> {
        self.registry.parent_key(template, relationship)
    }

    pub fn child_key(&self, template: &str, relationship: &str) -> StorageResult<&str> {
        self.registry.child_key(template, relationship)
    }

    pub fn primary_key(&self) -> &'static str {
        self.registry.primary_key()
    }

    pub fn registered_templates(&self) -> Vec<&str> {
        self.registry.registered_templates()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use crate::error::StorageError;
    use crate::schema::{ScalarKind, Template};

    async fn create_persistor() -> Persistor {
        let registry = SchemaRegistry::builder()
            .template(Template::new("Customer").scalar("name", ScalarKind::String))
            .build()
            .expect("Failed to build registry");
        let persistor = Persistor::new(
            Arc::new(registry),
            Arc::new(MemoryBackend::new()),
            PersistorConfig::default(),
        )
        .expect("Failed to create persistor");
        persistor.synchronize().await.expect("Failed to synchronize");
        persistor
    }

    #[tokio::test]
    async fn test_fetch_by_id_requires_identity() {
        let persistor = create_persistor().await;
        let mut graph = persistor.graph();
        let err = persistor
            .fetch_by_id(&mut graph, "Customer", None, &FetchSpec::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::MissingIdentity { .. })
        ));
        assert_eq!(err.to_string(), r#"The operator "undefined" is not permitted"#);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = Arc::new(SchemaRegistry::builder().build().unwrap());
        let err = Persistor::new(
            registry,
            Arc::new(MemoryBackend::new()),
            PersistorConfig::default().with_max_fetch_depth(0),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_fetch_depth"));
    }

    #[tokio::test]
    async fn test_save_fetch_and_touch() {
        let persistor = create_persistor().await;
        let mut graph = persistor.graph();
        let sam = graph.create("Customer").unwrap();
        graph.set(sam, "name", "Sam").unwrap();
        let report = persistor.save(&mut graph, &[sam]).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(graph.instance(sam).unwrap().version(), 1);

        let key = graph.instance(sam).unwrap().id().map(str::to_string);
        let mut other = persistor.graph();
        let copy = persistor
            .fetch_by_id(&mut other, "Customer", key.as_deref(), &FetchSpec::none())
            .await
            .unwrap()
            .expect("customer should exist");
        assert_eq!(other.get(copy, "name").unwrap(), &json!("Sam"));

        assert!(!persistor.is_stale(&graph, sam).await.unwrap());
        persistor.touch(&mut other, copy, None).await.unwrap();
        assert!(persistor.is_stale(&graph, sam).await.unwrap());
        assert_eq!(graph.instance(sam).unwrap().version(), 1);

        assert!(persistor.refresh(&mut graph, sam).await.unwrap());
        assert_eq!(graph.instance(sam).unwrap().version(), 2);
        assert!(!persistor.is_stale(&graph, sam).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_and_raw_rows() {
        let persistor = create_persistor().await;
        let mut graph = persistor.graph();
        for name in ["Sam", "Karen", "Sandy"] {
            let id = graph.create("Customer").unwrap();
            graph.set(id, "name", name).unwrap();
            persistor.save(&mut graph, &[id]).await.unwrap();
        }

        let filter = json!({"name": {"$regex": "^sa", "$options": "i"}});
        assert_eq!(persistor.count("Customer", &filter).await.unwrap(), 2);

        let rows = persistor
            .fetch_raw(
                "Customer",
                &json!({}),
                &SortSpec::parse(&json!({"name": 1})).unwrap(),
                Pagination::new(None, Some(2)),
            )
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![json!("Karen"), json!("Sam")]);
        assert_eq!(rows[0]["__version__"], json!(1));
    }

    #[tokio::test]
    async fn test_delete_marks_instance() {
        let persistor = create_persistor().await;
        let mut graph = persistor.graph();
        let sam = graph.create("Customer").unwrap();
        persistor.save(&mut graph, &[sam]).await.unwrap();

        persistor.delete(&mut graph, sam, None).await.unwrap();
        assert!(graph.instance(sam).unwrap().is_deleted());
        assert_eq!(persistor.count("Customer", &json!({})).await.unwrap(), 0);
    }
}
