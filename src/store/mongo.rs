//! MongoDB backend.
//!
//! Documents keep the field names used by the rest of the platform
//! (`statusLock`, `executorIP`, `lastUpdate`, ...). Job status is an array
//! with the current status at index 0, so "current status in S" is the
//! query `{"status.0": {"$in": S}}` and a prepend is `$push` at position 0.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, ReturnDocument};
use mongodb::{Client, Collection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{FailedJobFilter, JobFilter, JobPatch, Store, StoreError, WorkerFilter, WorkerPatch};
use crate::state_machine::{
    ClusterMember, Job, JobStatus, JobType, WorkerAddr, WorkerNode, WorkerStatus,
};

pub const STATUS_COLLECTION: &str = "status";
pub const JOBS_COLLECTION: &str = "jobs";
pub const JOBS_ARCHIVE_COLLECTION: &str = "jobs_archive";
pub const FAILED_JOBS_ARCHIVE_COLLECTION: &str = "failed_jobs_archive";

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDocument {
    /// Either an ObjectId assigned by the submission API or a plain string.
    #[serde(rename = "_id")]
    id: Bson,
    status: Vec<JobStatus>,
    #[serde(default)]
    status_lock: bool,
    #[serde(rename = "type")]
    job_type: JobType,
    #[serde(rename = "executorIP", default, skip_serializing_if = "Option::is_none")]
    executor_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    executor_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_date: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_date: Option<bson::DateTime>,
    #[serde(default)]
    input: Vec<String>,
    #[serde(default)]
    output: Vec<String>,
}

/// One entry per failure, stored flat like an active job with its own
/// document id and the job id in `jobId`, so consumers can query
/// `executorIP` / `executorPort` / `startDate` at the top level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedJobDocument {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    oid: Option<ObjectId>,
    job_id: String,
    archived_at: bson::DateTime,
    status: Vec<JobStatus>,
    #[serde(default)]
    status_lock: bool,
    #[serde(rename = "type")]
    job_type: JobType,
    #[serde(rename = "executorIP", default, skip_serializing_if = "Option::is_none")]
    executor_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    executor_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_date: Option<bson::DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_date: Option<bson::DateTime>,
    #[serde(default)]
    input: Vec<String>,
    #[serde(default)]
    output: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerDocument {
    ip: String,
    port: u16,
    status: WorkerStatus,
    #[serde(default)]
    status_lock: bool,
    compute_type: JobType,
    #[serde(default)]
    clusters: BTreeMap<String, Vec<ClusterMember>>,
    last_update: bson::DateTime,
}

fn to_bson_date(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_date(at: bson::DateTime) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(at.timestamp_millis())
        .ok_or_else(|| StoreError::Corrupt(format!("date out of range: {at}")))
}

/// Job ids that look like ObjectIds are queried as ObjectIds.
fn id_value(id: &str) -> Bson {
    match ObjectId::parse_str(id) {
        Ok(oid) => Bson::ObjectId(oid),
        Err(_) => Bson::String(id.to_string()),
    }
}

fn id_string(id: &Bson) -> Result<String, StoreError> {
    match id {
        Bson::ObjectId(oid) => Ok(oid.to_hex()),
        Bson::String(s) => Ok(s.clone()),
        other => Err(StoreError::Corrupt(format!("unsupported job id {other}"))),
    }
}

fn status_tags(statuses: &[JobStatus]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

impl JobDocument {
    fn from_job(job: &Job) -> Self {
        Self {
            id: id_value(&job.id),
            status: job.status.as_slice().to_vec(),
            status_lock: job.status_lock,
            job_type: job.job_type,
            executor_ip: job.executor.as_ref().map(|e| e.ip.clone()),
            executor_port: job.executor.as_ref().map(|e| e.port),
            start_date: job.start_date.map(to_bson_date),
            end_date: job.end_date.map(to_bson_date),
            input: job.input.clone(),
            output: job.output.clone(),
        }
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let executor = match (self.executor_ip, self.executor_port) {
            (Some(ip), Some(port)) => Some(WorkerAddr::new(ip, port)),
            _ => None,
        };
        Ok(Job {
            id: id_string(&self.id)?,
            status: self.status.into(),
            status_lock: self.status_lock,
            job_type: self.job_type,
            executor,
            start_date: self.start_date.map(from_bson_date).transpose()?,
            end_date: self.end_date.map(from_bson_date).transpose()?,
            input: self.input,
            output: self.output,
        })
    }
}

impl FailedJobDocument {
    fn from_job(job: &Job, archived_at: bson::DateTime) -> Self {
        let flat = JobDocument::from_job(job);
        Self {
            oid: None,
            job_id: job.id.clone(),
            archived_at,
            status: flat.status,
            status_lock: flat.status_lock,
            job_type: flat.job_type,
            executor_ip: flat.executor_ip,
            executor_port: flat.executor_port,
            start_date: flat.start_date,
            end_date: flat.end_date,
            input: flat.input,
            output: flat.output,
        }
    }

    fn into_job(self) -> Result<Job, StoreError> {
        JobDocument {
            id: Bson::String(self.job_id),
            status: self.status,
            status_lock: self.status_lock,
            job_type: self.job_type,
            executor_ip: self.executor_ip,
            executor_port: self.executor_port,
            start_date: self.start_date,
            end_date: self.end_date,
            input: self.input,
            output: self.output,
        }
        .into_job()
    }
}

impl WorkerDocument {
    fn into_node(self) -> Result<WorkerNode, StoreError> {
        Ok(WorkerNode {
            ip: self.ip,
            port: self.port,
            status: self.status,
            status_lock: self.status_lock,
            compute_type: self.compute_type,
            clusters: self.clusters,
            last_update: from_bson_date(self.last_update)?,
        })
    }
}

fn job_filter_doc(filter: &JobFilter) -> Document {
    let mut query = Document::new();
    if let Some(id) = &filter.id {
        query.insert("_id", id_value(id));
    }
    if let Some(statuses) = &filter.current_status {
        query.insert("status.0", doc! { "$in": status_tags(statuses) });
    }
    if let Some(lock) = filter.status_lock {
        query.insert("statusLock", lock);
    }
    if let Some(at) = filter.started_before {
        query.insert("startDate", doc! { "$lt": to_bson_date(at) });
    }
    if let Some(at) = filter.ended_before {
        query.insert("endDate", doc! { "$lt": to_bson_date(at) });
    }
    query
}

fn job_update_doc(patch: &JobPatch) -> Document {
    let mut set = Document::new();
    if let Some(lock) = patch.status_lock {
        set.insert("statusLock", lock);
    }
    if let Some(addr) = &patch.executor {
        set.insert("executorIP", addr.ip.clone());
        set.insert("executorPort", i32::from(addr.port));
    }
    if let Some(at) = patch.start_date {
        set.insert("startDate", to_bson_date(at));
    }
    if let Some(at) = patch.end_date {
        set.insert("endDate", to_bson_date(at));
    }

    let mut update = Document::new();
    if !set.is_empty() {
        update.insert("$set", set);
    }
    if !patch.prepend.is_empty() {
        update.insert(
            "$push",
            doc! { "status": { "$each": status_tags(&patch.prepend), "$position": 0 } },
        );
    }
    update
}

fn worker_filter_doc(filter: &WorkerFilter) -> Document {
    let mut query = Document::new();
    if let Some(addr) = &filter.addr {
        query.insert("ip", addr.ip.clone());
        query.insert("port", i32::from(addr.port));
    }
    if let Some(statuses) = &filter.statuses {
        let tags: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        query.insert("status", doc! { "$in": tags });
    }
    if let Some(compute_type) = filter.compute_type {
        query.insert("computeType", compute_type.to_string());
    }
    if let Some(lock) = filter.status_lock {
        query.insert("statusLock", lock);
    }
    if let Some(at) = filter.updated_before {
        query.insert("lastUpdate", doc! { "$lt": to_bson_date(at) });
    }
    query
}

fn worker_update_doc(patch: &WorkerPatch) -> Document {
    let mut set = Document::new();
    if let Some(status) = patch.status {
        set.insert("status", status.to_string());
    }
    if let Some(lock) = patch.status_lock {
        set.insert("statusLock", lock);
    }
    doc! { "$set": set }
}

fn failed_filter_doc(filter: &FailedJobFilter) -> Document {
    let mut query = Document::new();
    if let Some(id) = &filter.job_id {
        query.insert("jobId", id.clone());
    }
    if let Some(addr) = &filter.executor {
        query.insert("executorIP", addr.ip.clone());
        query.insert("executorPort", i32::from(addr.port));
    }
    if let Some(since) = filter.started_since {
        query.insert("startDate", doc! { "$gte": to_bson_date(since) });
    }
    query
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

/// Decode every raw document on its own. A document that does not decode is
/// logged and skipped so one bad record cannot fail a whole query.
fn decode_each<D, T>(
    collection: &'static str,
    raw: Vec<Document>,
    convert: impl Fn(D) -> Result<T, StoreError>,
) -> Vec<T>
where
    D: DeserializeOwned,
{
    let total = raw.len();
    let records: Vec<T> = raw
        .into_iter()
        .filter_map(|document| {
            let id = document.get("_id").map(ToString::to_string).unwrap_or_default();
            match bson::from_document::<D>(document)
                .map_err(StoreError::from)
                .and_then(&convert)
            {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(collection, id = %id, error = %e, "skipping corrupt document");
                    None
                }
            }
        })
        .collect();
    if records.len() < total {
        warn!(collection, skipped = total - records.len(), total, "query skipped corrupt documents");
    }
    records
}

/// Store backed by the four platform collections in one MongoDB database.
#[derive(Debug, Clone)]
pub struct MongoStore {
    workers: Collection<WorkerDocument>,
    jobs: Collection<JobDocument>,
    archive: Collection<JobDocument>,
    failed: Collection<FailedJobDocument>,
    op_timeout: Duration,
}

impl MongoStore {
    /// Connect to `url` and bind the collections of `database`.
    ///
    /// Every later call fails with [`StoreError::Timeout`] if it takes longer
    /// than `op_timeout`.
    pub async fn connect(url: &str, database: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(url).await?;
        options.app_name = Some("opal-scheduler".to_string());
        options.connect_timeout = Some(op_timeout);
        options.server_selection_timeout = Some(op_timeout);
        let client = Client::with_options(options)?;
        let db = client.database(database);

        tracing::info!(database, "Connected to MongoDB");
        Ok(Self {
            workers: db.collection(STATUS_COLLECTION),
            jobs: db.collection(JOBS_COLLECTION),
            archive: db.collection(JOBS_ARCHIVE_COLLECTION),
            failed: db.collection(FAILED_JOBS_ARCHIVE_COLLECTION),
            op_timeout,
        })
    }

    async fn find_raw<D: Send + Sync>(
        collection: &Collection<D>,
        query: Document,
    ) -> Result<Vec<Document>, StoreError> {
        let raw = collection.clone_with_type::<Document>();
        Ok(raw.find(query).await?.try_collect().await?)
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

impl Store for MongoStore {
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let query = job_filter_doc(filter);
        self.bounded(async {
            let raw = Self::find_raw(&self.jobs, query).await?;
            Ok::<_, StoreError>(decode_each(JOBS_COLLECTION, raw, JobDocument::into_job))
        })
        .await
    }

    async fn update_job(&self, filter: &JobFilter, patch: &JobPatch) -> Result<bool, StoreError> {
        let query = job_filter_doc(filter);
        let update = job_update_doc(patch);
        self.bounded(async {
            let result = self.jobs.update_one(query, update).await?;
            Ok::<bool, StoreError>(result.matched_count > 0)
        })
        .await
    }

    async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        self.bounded(async {
            let result = self.jobs.delete_one(doc! { "_id": id_value(id) }).await?;
            Ok::<bool, StoreError>(result.deleted_count > 0)
        })
        .await
    }

    async fn find_workers(&self, filter: &WorkerFilter) -> Result<Vec<WorkerNode>, StoreError> {
        let query = worker_filter_doc(filter);
        self.bounded(async {
            let raw = Self::find_raw(&self.workers, query).await?;
            Ok::<_, StoreError>(decode_each(STATUS_COLLECTION, raw, WorkerDocument::into_node))
        })
        .await
    }

    async fn update_worker(
        &self,
        filter: &WorkerFilter,
        patch: &WorkerPatch,
    ) -> Result<Option<WorkerNode>, StoreError> {
        let query = worker_filter_doc(filter);
        let update = worker_update_doc(patch);
        self.bounded(async {
            let before = self
                .workers
                .find_one_and_update(query, update)
                .return_document(ReturnDocument::Before)
                .await?;
            before.map(WorkerDocument::into_node).transpose()
        })
        .await
    }

    async fn insert_archived_job(&self, job: &Job) -> Result<bool, StoreError> {
        let document = JobDocument::from_job(job);
        self.bounded(async {
            let existing = self
                .archive
                .count_documents(doc! { "_id": document.id.clone() })
                .await?;
            if existing > 0 {
                return Ok(false);
            }
            let inserted: Result<bool, StoreError> = match self.archive.insert_one(document).await {
                Ok(_) => Ok(true),
                Err(e) if is_duplicate_key(&e) => Ok(false),
                Err(e) => Err(e.into()),
            };
            inserted
        })
        .await
    }

    async fn find_archived_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let query = job_filter_doc(filter);
        self.bounded(async {
            let raw = Self::find_raw(&self.archive, query).await?;
            Ok::<_, StoreError>(decode_each(JOBS_ARCHIVE_COLLECTION, raw, JobDocument::into_job))
        })
        .await
    }

    async fn insert_failed_job(&self, job: &Job) -> Result<(), StoreError> {
        let document = FailedJobDocument::from_job(job, bson::DateTime::now());
        self.bounded(async {
            self.failed.insert_one(document).await?;
            Ok::<(), StoreError>(())
        })
        .await
    }

    async fn find_failed_jobs(&self, filter: &FailedJobFilter) -> Result<Vec<Job>, StoreError> {
        let query = failed_filter_doc(filter);
        self.bounded(async {
            let raw = Self::find_raw(&self.failed, query).await?;
            Ok::<_, StoreError>(decode_each(
                FAILED_JOBS_ARCHIVE_COLLECTION,
                raw,
                FailedJobDocument::into_job,
            ))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Transition;

    #[test]
    fn claim_filter_targets_history_head() {
        let at = Utc::now();
        let filter = JobFilter::claimable(&[JobStatus::Scheduled, JobStatus::Running])
            .started_before(at)
            .with_id("job-1");
        let query = job_filter_doc(&filter);
        assert_eq!(query.get_str("_id").unwrap(), "job-1");
        assert!(!query.get_bool("statusLock").unwrap());
        let head = query.get_document("status.0").unwrap();
        let tags = head.get_array("$in").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].as_str(), Some("SCHEDULED"));
        assert_eq!(
            query.get_document("startDate").unwrap().get_datetime("$lt").unwrap(),
            &to_bson_date(at)
        );
    }

    #[test]
    fn object_id_strings_query_as_object_ids() {
        let oid = ObjectId::new();
        let query = job_filter_doc(&JobFilter::by_id(oid.to_hex()));
        assert_eq!(query.get_object_id("_id").unwrap(), oid);
    }

    #[test]
    fn prepend_pushes_at_position_zero() {
        let patch = JobPatch::transition(Transition::Retire).unlocked();
        let update = job_update_doc(&patch);
        assert!(!update.get_document("$set").unwrap().get_bool("statusLock").unwrap());
        let push = update.get_document("$push").unwrap().get_document("status").unwrap();
        assert_eq!(push.get_i32("$position").unwrap(), 0);
        let each = push.get_array("$each").unwrap();
        assert_eq!(each[0].as_str(), Some("COMPLETED"));
        assert_eq!(each[1].as_str(), Some("DEAD"));
    }

    #[test]
    fn executor_is_stored_flat() {
        let patch = JobPatch::unlock().with_executor(WorkerAddr::new("10.1.1.1", 9000));
        let update = job_update_doc(&patch);
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("executorIP").unwrap(), "10.1.1.1");
        assert_eq!(set.get_i32("executorPort").unwrap(), 9000);
    }

    #[test]
    fn lock_only_patch_has_no_push() {
        let update = job_update_doc(&JobPatch::lock());
        assert!(update.get_document("$push").is_err());
    }

    #[test]
    fn worker_reservation_filter() {
        let query = worker_filter_doc(&WorkerFilter::available(JobType::Spark));
        assert_eq!(query.get_str("computeType").unwrap(), "spark");
        assert!(!query.get_bool("statusLock").unwrap());
        let statuses = query.get_document("status").unwrap().get_array("$in").unwrap();
        assert_eq!(statuses[0].as_str(), Some("IDLE"));
    }

    #[test]
    fn worker_release_update() {
        let update = worker_update_doc(&WorkerPatch::release());
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "IDLE");
        assert!(!set.get_bool("statusLock").unwrap());
    }

    #[test]
    fn failed_filter_uses_top_level_fields() {
        let since = Utc::now();
        let query = failed_filter_doc(&FailedJobFilter::executor_since(
            WorkerAddr::new("10.0.0.3", 81),
            since,
        ));
        assert_eq!(query.get_str("executorIP").unwrap(), "10.0.0.3");
        assert_eq!(query.get_i32("executorPort").unwrap(), 81);
        assert!(query.get_document("startDate").unwrap().contains_key("$gte"));
    }

    #[test]
    fn failed_job_is_stored_flat_under_its_own_id() {
        let oid = ObjectId::new();
        let mut job = Job::new(JobType::Python2);
        job.id = oid.to_hex();
        job.executor = Some(WorkerAddr::new("10.0.0.5", 9000));
        job.start_date = DateTime::from_timestamp_millis(1_700_000_000_000);

        let document =
            bson::to_document(&FailedJobDocument::from_job(&job, bson::DateTime::now())).unwrap();
        assert!(!document.contains_key("_id"));
        assert!(!document.contains_key("job"));
        assert_eq!(document.get_str("jobId").unwrap(), oid.to_hex());
        assert_eq!(document.get_str("executorIP").unwrap(), "10.0.0.5");
        assert_eq!(document.get_i32("executorPort").unwrap(), 9000);

        let back: FailedJobDocument = bson::from_document(document).unwrap();
        assert_eq!(back.into_job().unwrap(), job);
    }

    #[test]
    fn corrupt_documents_are_skipped_not_fatal() {
        let good = bson::to_document(&JobDocument::from_job(&Job::new(JobType::R))).unwrap();
        let mut unknown_type = good.clone();
        unknown_type.insert("_id", "bad-type");
        unknown_type.insert("type", "fortran");
        let mut unknown_status = good.clone();
        unknown_status.insert("_id", "bad-status");
        unknown_status.insert("status", vec!["PAUSED"]);

        let jobs = decode_each(
            JOBS_COLLECTION,
            vec![unknown_type, good, unknown_status],
            JobDocument::into_job,
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::R);
    }

    #[test]
    fn worker_without_last_update_does_not_hide_the_others() {
        let healthy = doc! {
            "ip": "10.0.0.1",
            "port": 8000,
            "status": "BUSY",
            "statusLock": false,
            "computeType": "r",
            "lastUpdate": bson::DateTime::now(),
        };
        let mut missing_update = healthy.clone();
        missing_update.insert("port", 8001);
        missing_update.remove("lastUpdate");

        let nodes = decode_each(
            STATUS_COLLECTION,
            vec![missing_update, healthy],
            WorkerDocument::into_node,
        );
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].port, 8000);
    }

    #[test]
    fn job_document_roundtrip_through_bson() {
        let mut job = Job::new(JobType::Spark);
        job.executor = Some(WorkerAddr::new("10.0.0.4", 7077));
        job.start_date = DateTime::from_timestamp_millis(1_700_000_000_000);
        job.input = vec!["data.csv".into()];

        let document = bson::to_document(&JobDocument::from_job(&job)).unwrap();
        assert_eq!(document.get_str("executorIP").unwrap(), "10.0.0.4");
        assert_eq!(document.get_str("type").unwrap(), "spark");

        let back: JobDocument = bson::from_document(document).unwrap();
        assert_eq!(back.into_job().unwrap(), job);
    }

    #[test]
    fn worker_document_tolerates_extra_member_fields() {
        let document = doc! {
            "_id": ObjectId::new(),
            "ip": "10.0.0.1",
            "port": 8000,
            "status": "IDLE",
            "statusLock": false,
            "computeType": "spark",
            "lastUpdate": bson::DateTime::now(),
            "clusters": {
                "spark": [
                    { "ip": "10.0.0.2", "port": 8001, "statusLock": false, "status": "IDLE" }
                ]
            }
        };
        let node = bson::from_document::<WorkerDocument>(document)
            .unwrap()
            .into_node()
            .unwrap();
        assert_eq!(node.cluster("spark").len(), 1);
        assert_eq!(node.cluster("spark")[0].port, 8001);
    }
}
