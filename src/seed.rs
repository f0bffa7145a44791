//! `seedfrom` redirection
//!
//! An OVF environment may point at another location holding `meta-data`,
//! `user-data` and `vendor-data`. Local paths and `file://` URLs are read from
//! disk, `http(s)://` URLs are fetched.

use crate::{DatasourceError, Metadata};
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// Data read from a seed location
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedData {
    pub metadata: Metadata,
    pub userdata: Option<Vec<u8>>,
    pub vendordata: Option<Vec<u8>>,
}

/// Read `meta-data` (required), `user-data` and `vendor-data` relative to
/// `base`. A `%s` in `base` is replaced by the file name.
pub async fn read_seeded(base: &str) -> Result<SeedData, DatasourceError> {
    let md = fetch(&seed_url(base, "meta-data"))
        .await?
        .ok_or_else(|| DatasourceError::MissingFile(seed_url(base, "meta-data")))?;
    let metadata = parse_metadata(&md)?;

    let userdata = fetch(&seed_url(base, "user-data")).await?;
    let vendordata = match fetch(&seed_url(base, "vendor-data")).await {
        Ok(vd) => vd,
        Err(e) => {
            debug!("Ignoring vendor-data from {}: {}", base, e);
            None
        }
    };

    Ok(SeedData {
        metadata,
        userdata,
        vendordata,
    })
}

fn seed_url(base: &str, name: &str) -> String {
    if base.contains("%s") {
        base.replace("%s", name)
    } else if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

fn parse_metadata(raw: &[u8]) -> Result<Metadata, DatasourceError> {
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        return Ok(Metadata::new());
    }
    match serde_yaml::from_str::<serde_yaml::Value>(&text)? {
        serde_yaml::Value::Null => Ok(Metadata::new()),
        value @ serde_yaml::Value::Mapping(_) => Ok(serde_yaml::from_value(value)?),
        _ => Err(DatasourceError::ParseFailure(
            "seeded meta-data is not a mapping".to_string(),
        )),
    }
}

/// Contents of `url`, `None` when it does not exist
async fn fetch(url: &str) -> Result<Option<Vec<u8>>, DatasourceError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return fetch_http(url).await;
    }

    let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
    match fs::read(&path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn fetch_http(url: &str) -> Result<Option<Vec<u8>>, DatasourceError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| DatasourceError::Http(e.to_string()))?;

    debug!("Fetching {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| DatasourceError::Http(format!("{}: {}", url, e)))?;

    match response.status() {
        status if status.is_success() => {
            let body = response
                .bytes()
                .await
                .map_err(|e| DatasourceError::Http(format!("{}: {}", url, e)))?;
            Ok(Some(body.to_vec()))
        }
        StatusCode::NOT_FOUND => Ok(None),
        status => Err(DatasourceError::Http(format!(
            "Failed to fetch {}: {}",
            url, status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_seed_url() {
        assert_eq!(seed_url("/srv/seed/", "meta-data"), "/srv/seed/meta-data");
        assert_eq!(seed_url("/srv/seed", "user-data"), "/srv/seed/user-data");
        assert_eq!(
            seed_url("http://10.0.0.1/%s.txt", "meta-data"),
            "http://10.0.0.1/meta-data.txt"
        );
    }

    #[tokio::test]
    async fn test_read_local_seed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("meta-data"), "instance-id: seeded\n").unwrap();
        std::fs::write(tmp.path().join("user-data"), "#cloud-config\n").unwrap();

        let base = format!("file://{}/", tmp.path().display());
        let seed = read_seeded(&base).await.unwrap();
        assert_eq!(seed.metadata["instance-id"], Value::from("seeded"));
        assert_eq!(seed.userdata.as_deref(), Some(&b"#cloud-config\n"[..]));
        assert!(seed.vendordata.is_none());
    }

    #[tokio::test]
    async fn test_local_seed_requires_metadata() {
        let tmp = TempDir::new().unwrap();
        let base = format!("{}/", tmp.path().display());
        assert!(matches!(
            read_seeded(&base).await,
            Err(DatasourceError::MissingFile(_))
        ));
    }

    #[tokio::test]
    async fn test_read_http_seed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seed/meta-data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("local-hostname: web1\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/seed/vendor-data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#cloud-config\n"))
            .mount(&server)
            .await;

        let seed = read_seeded(&format!("{}/seed/", server.uri())).await.unwrap();
        assert_eq!(seed.metadata["local-hostname"], Value::from("web1"));
        assert!(seed.userdata.is_none());
        assert_eq!(seed.vendordata.as_deref(), Some(&b"#cloud-config\n"[..]));
    }
}
