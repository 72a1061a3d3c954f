//! Jobs Executor - Entry Point
//!
//! Background worker that executes Fibonacci jobs from the `Fibonacci` topic.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_jobs_executor::run().await
}
