use std::net::SocketAddr;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

use crate::error::BuildError;

/// Serves `root` on `127.0.0.1:<port>`, blocking the calling thread on a
/// current-thread runtime.
pub fn serve(root: Utf8PathBuf, port: u16) -> Result<(), BuildError> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "serving {root}");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| BuildError::Serve(e.into()))?
        .block_on(listen(root, port))
        .map_err(BuildError::Serve)
}

async fn listen(root: Utf8PathBuf, port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new().fallback_service(ServeDir::new(root));

    axum::serve(address, router).await?;

    Ok(())
}
