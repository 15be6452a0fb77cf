mod config;
mod db;
mod executor;
mod ipc;
mod logging;
mod model;
mod plan;
mod report;
mod resolver;
mod session;
mod store;
#[cfg(test)]
mod testing;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    logging::init();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "promotiond starting");

    let mut state = ipc::AppState::new();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req).await,
            // Can't reply with an id we never parsed.
            Err(e) => ipc::bad_json(e.to_string()),
        };

        let mut out = serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string());
        out.push('\n');
        if let Err(e) = stdout.write_all(out.as_bytes()).await {
            tracing::error!(error = %e, "stdout write failed");
            break;
        }
        let _ = stdout.flush().await;
    }

    // Let an in-flight batch finish and settle before the process goes away.
    state.drain_tasks().await;
    tracing::info!("promotiond stopped");
}
