/// Piecework worker entry point
///
/// Loads configuration from the environment and runs the worker until ctrl-c.
/// The process serves:
/// - Liveness probe at /healthz
/// - Readiness probe with consumer stats at /readyz
/// - Webhook ingress at /webhook/{flow_id}
///
/// Started as `piecework --run-chunk` it instead evaluates one sandbox request
/// from stdin and exits; process-isolated sandboxes run that way.

use piecework::{config::Config, sandbox::runner, server::start_server};

fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some(runner::RUN_CHUNK_ARG) {
        runner::serve_stdio()?;
        return Ok(());
    }
    serve()
}

#[tokio::main]
async fn serve() -> anyhow::Result<()> {
    let config = Config::default();
    start_server(config).await
}
