#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

mod common;

use common::Fixture;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use workforce::clock::ManualClock;
use workforce::setup_database;
use workforce::store::{JobStore, PgDriver};

const RETRY_AFTER: Duration = Duration::from_secs(30);

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Start Postgres with `TestContainers` and return its URL and the container
    pub(super) async fn start_postgres() -> anyhow::Result<(String, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        // Get the connection parameters from the container
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        // Use the standard postgres/postgres credentials for testcontainers
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        Ok((connection_string, container))
    }

    /// A migrated driver on a manual clock
    pub(super) async fn create_driver(url: &str, clock: &ManualClock) -> anyhow::Result<PgDriver> {
        let driver = PgDriver::connect(url, "pgsql")
            .await?
            .retry_after(RETRY_AFTER)
            .with_clock(Arc::new(clock.clone()));
        setup_database(driver.pool()).await?;
        Ok(driver)
    }

    /// Set up a test database and return the fixture and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(Fixture, ContainerAsync<Postgres>)> {
        let (url, container) = start_postgres().await?;
        let clock = ManualClock::default();
        let driver = create_driver(&url, &clock).await?;
        Ok((Fixture::new(Arc::new(driver), clock), container))
    }
}

#[tokio::test]
async fn setup_database_is_idempotent() -> anyhow::Result<()> {
    let (url, _container) = test_utils::start_postgres().await?;
    let clock = ManualClock::default();
    let driver = test_utils::create_driver(&url, &clock).await?;
    setup_database(driver.pool()).await?;

    let fixture = Fixture::new(Arc::new(driver), clock);
    let report = fixture.manager.test_connection(Some("pgsql")).await?;
    assert!(report.healthy);
    assert_eq!(report.connection, "pgsql");
    Ok(())
}

#[tokio::test]
async fn drivers_sharing_a_database_share_the_queue() -> anyhow::Result<()> {
    let (url, _container) = test_utils::start_postgres().await?;
    let clock = ManualClock::default();
    let first = test_utils::create_driver(&url, &clock).await?;
    let second = test_utils::create_driver(&url, &clock).await?;

    let fixture = Fixture::new(Arc::new(first), clock);
    let id = fixture
        .manager
        .push("test", serde_json::json!(null), None, None)
        .await?;

    let job = claims::assert_some!(second.reserve("default").await?);
    assert_eq!(job.id, id);
    claims::assert_none!(fixture.driver.reserve("default").await?);
    Ok(())
}

#[tokio::test]
async fn concurrent_reservers_get_each_job_once() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::concurrent_reservers_get_each_job_once(fixture).await
}

#[tokio::test]
async fn reserves_by_priority_then_age() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::reserves_by_priority_then_age(fixture).await
}

#[tokio::test]
async fn delayed_jobs_become_visible_on_time() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::delayed_jobs_become_visible_on_time(fixture).await
}

#[tokio::test]
async fn expired_reservations_are_recovered() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::expired_reservations_are_recovered(fixture, RETRY_AFTER).await
}

#[tokio::test]
async fn lapsed_reservations_cannot_be_settled() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::lapsed_reservations_cannot_be_settled(fixture, RETRY_AFTER).await
}

#[tokio::test]
async fn release_requeues_then_fails() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::release_requeues_then_fails(fixture).await
}

#[tokio::test]
async fn bulk_matches_sequential_order() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::bulk_matches_sequential_order(fixture).await
}

#[tokio::test]
async fn failed_jobs_are_retried_forgotten_and_pruned() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::failed_jobs_are_retried_forgotten_and_pruned(fixture).await
}

#[tokio::test]
async fn batch_callback_is_dispatched_once() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::batch_callback_is_dispatched_once(fixture).await
}

#[tokio::test]
async fn locks_are_exclusive() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::locks_are_exclusive(fixture).await
}

#[tokio::test]
async fn health_and_stats() -> anyhow::Result<()> {
    let (fixture, _container) = test_utils::setup_test_db().await?;
    common::health_and_stats(fixture).await
}
