//! PostgreSQL-backed store tests. Require `DATABASE_URL`; run with
//! `cargo test -p brandkit-db -- --ignored`.

use assert_matches::assert_matches;
use brandkit_core::build_job::{BuildJob, BuildJobFilter, BuildJobPatch, BuildMode, BuildStatus};
use brandkit_core::types::new_job_id;
use brandkit_db::{JobStore, PgJobStore, StoreError};
use chrono::Utc;
use sqlx::PgPool;

fn queued(brand: &str) -> BuildJob {
    BuildJob::queued(new_job_id(), brand, BuildMode::Native, Utc::now())
}

// ---------------------------------------------------------------------------
// Test: insert, patch, and read back a job
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn insert_update_get_round_trip(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = queued("acme");
    store.insert(&job).await.expect("insert");

    let updated = store
        .update(job.id, &BuildJobPatch::progress(20, "Manifest"))
        .await
        .expect("update");
    assert_eq!(updated.status, BuildStatus::Building);
    assert_eq!(updated.progress_percent, 20);

    let fetched = store.get(job.id).await.expect("get").expect("row exists");
    assert_eq!(fetched.message, "Manifest");
    assert_eq!(fetched.build_mode, BuildMode::Native);
}

// ---------------------------------------------------------------------------
// Test: the partial unique index rejects a second active job
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn second_active_job_violates_single_slot_index(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.insert(&queued("acme")).await.expect("first insert");

    let result = store.insert(&queued("globex")).await;
    assert_matches!(result, Err(StoreError::Conflict(c)) if c == "uq_build_jobs_single_active");
}

// ---------------------------------------------------------------------------
// Test: purge deletes only failed rows for the brand
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn delete_by_brand_and_status(pool: PgPool) {
    let store = PgJobStore::new(pool);
    for brand in ["acme", "acme", "globex"] {
        let job = queued(brand);
        store.insert(&job).await.expect("insert");
        store
            .update(
                job.id,
                &BuildJobPatch {
                    status: Some(BuildStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .expect("fail job");
    }

    let filter = BuildJobFilter {
        brand_id: Some("acme".into()),
        status: Some(BuildStatus::Failed),
    };
    assert_eq!(store.delete(&filter).await.expect("delete"), 2);
    assert_eq!(store.list(&BuildJobFilter::default()).await.expect("list").len(), 1);
}

// ---------------------------------------------------------------------------
// Test: a terminal row refuses a status change but keeps accepting notes
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn cancelled_row_cannot_return_to_building(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = queued("acme");
    store.insert(&job).await.expect("insert");
    store
        .update(
            job.id,
            &BuildJobPatch {
                status: Some(BuildStatus::Cancelled),
                ..Default::default()
            },
        )
        .await
        .expect("cancel");

    let result = store.update(job.id, &BuildJobPatch::progress(20, "again")).await;
    assert_matches!(result, Err(StoreError::Conflict(_)));

    let noted = store
        .update(job.id, &BuildJobPatch::message("Cancelled by operator"))
        .await
        .expect("message update");
    assert_eq!(noted.status, BuildStatus::Cancelled);
    assert_eq!(noted.progress_percent, 0);
}
