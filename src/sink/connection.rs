use log::error;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use url::Url;

use crate::session::SinkError;

pub fn create_ssl_connector(sslrootcert_path: Option<&str>) -> Result<MakeTlsConnector, SinkError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| SinkError(format!("SSL builder error: {}", e)))?;

    if let Some(path) = sslrootcert_path {
        builder
            .set_ca_file(path)
            .map_err(|e| SinkError(format!("error loading CA cert: {}", e)))?;
    }

    builder.set_verify(SslVerifyMode::NONE); // TEMPORARY FOR SELF-SIGNED CERTS

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Connect, run one statement, return. The sink contract is single
/// attempt: a failed publish is dropped by the caller, never retried.
pub async fn with_client<F, Fut>(database_url: &str, operation: F) -> Result<(), SinkError>
where
    F: FnOnce(tokio_postgres::Client) -> Fut,
    Fut: std::future::Future<Output = Result<u64, tokio_postgres::Error>>,
{
    let url = Url::parse(database_url).map_err(|e| SinkError(format!("database URL: {}", e)))?;

    // Pull the sslrootcert parameter out of the URL; tokio-postgres does
    // not understand it.
    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.to_string());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    let connector = create_ssl_connector(sslrootcert_path.as_deref())?;

    let (client, connection) = tokio_postgres::connect(clean_url.as_str(), connector)
        .await
        .map_err(|e| SinkError(format!("connection error: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Connection error: {}", e);
        }
    });

    operation(client)
        .await
        .map(|_| ())
        .map_err(|e| SinkError(format!("query error: {}", e)))
}
