use std::sync::Arc;

use url::Url;

use super::{IndexBackend, RedbIndexBackendConfig};
use crate::Error;

/// Constructs a new instance of an [IndexBackend] from an URI.
///
/// The following URIs are supported:
/// - `redb:`
///   Uses a in-memory redb implementation.
/// - `redb:///absolute/path/to/somewhere`
///   Uses redb, using a path on the disk for persistency. Can be only opened
///   from one process at the same time.
pub async fn from_addr(uri: &str) -> Result<Arc<dyn IndexBackend>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::StorageError(format!("unable to parse url: {}", e)))?;

    let backend: Arc<dyn IndexBackend> = match url.scheme() {
        "redb" => {
            let config = RedbIndexBackendConfig::try_from(url)
                .map_err(|e| Error::StorageError(e.to_string()))?;
            Arc::new(config.build().await?)
        }
        scheme => {
            return Err(Error::StorageError(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::from_addr;

    #[rstest]
    /// This uses an unsupported scheme.
    #[case::unsupported_scheme("http://foo.example/test", false)]
    /// This configures redb in temporary mode.
    #[case::redb_valid_temporary("redb://", true)]
    /// This configures redb with /, which should fail.
    #[case::redb_invalid_root("redb:///", false)]
    /// This configures redb with a host, which should fail.
    #[case::redb_invalid_host("redb://foo.example", false)]
    /// This configures redb with a host and a path, which should fail.
    #[case::redb_invalid_host_with_path("redb://foo.example/index.redb", false)]
    #[tokio::test]
    async fn test_from_addr_tokio(#[case] uri_str: &str, #[case] exp_succeed: bool) {
        if exp_succeed {
            from_addr(uri_str).await.expect("should succeed");
        } else {
            assert!(from_addr(uri_str).await.is_err(), "should fail");
        }
    }

    #[tokio::test]
    async fn redb_with_path() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let uri = format!("redb://{}", tmpdir.path().join("index.redb").display());
        from_addr(&uri).await.expect("should succeed");
    }
}
