//! Shared Postgres connection utilities for the control plane.

use tokio_postgres::Client;

use crate::error::{CdcError, CdcResult};

/// Connect to Postgres for control-plane work (slot management, log-table
/// reads). Spawns the connection task and returns only the client.
pub async fn connect_postgres(connection_string: &str) -> CdcResult<Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
        .await
        .map_err(|e| CdcError::Connection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Postgres connection error");
        }
    });

    Ok(client)
}
