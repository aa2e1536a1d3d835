//! HTTP client for the external object store.
//!
//! The store exposes its namespace-scoped operations over three ports: an
//! upload port (upload, delete), a read port (get, ping, download-info) and
//! answers with XML bodies. Every request carries the configured
//! `Authorization` header.

use std::time::Duration;

use reqwest::header;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::byte_stream::ByteStream;
use crate::error::DriverError;

/// Result of an upload, decoded from the `<post …>` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "post")]
pub struct UploadInfo {
    #[serde(rename = "@obj")]
    pub obj: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@key")]
    pub key: String,
    #[serde(rename = "@size")]
    pub size: u64,
    #[serde(rename = "@groups", default)]
    pub groups: i32,

    #[serde(rename = "complete", default)]
    pub complete: Vec<UploadComplete>,

    #[serde(rename = "written", default)]
    pub written: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadComplete {
    #[serde(rename = "@addr")]
    pub addr: String,
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "@group")]
    pub group: i32,
    #[serde(rename = "@status")]
    pub status: i32,
}

/// A direct link to a stored file, decoded from `<download-info>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "download-info")]
pub struct DownloadInfo {
    pub host: String,
    pub path: String,
    pub ts: String,
    #[serde(default)]
    pub region: i32,
    #[serde(rename = "s")]
    pub sign: String,
}

impl DownloadInfo {
    /// Construct the signed direct link.
    pub fn url(&self) -> String {
        format!("http://{}{}?ts={}sign={}", self.host, self.path, self.ts, self.sign)
    }
}

/// Byte range for ranged reads: from an offset to the end, or a closed span.
#[derive(Debug, Clone, Copy)]
pub enum GetRange {
    From(u64),
    Span(u64, u64),
}

#[derive(Debug, Clone)]
pub struct MdsClientConfig {
    pub host: String,
    pub upload_port: u16,
    pub read_port: u16,
    pub auth_header: String,
}

/// Client for the object store proxy.
pub struct MdsClient {
    config: MdsClientConfig,
    client: reqwest::Client,
}

impl MdsClient {
    pub fn new(config: MdsClientConfig) -> Result<MdsClient, DriverError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(MdsClient { config, client })
    }

    fn upload_url(&self, namespace: &str, filename: &str) -> String {
        format!(
            "http://{}:{}/upload-{}/{}",
            self.config.host, self.config.upload_port, namespace, filename
        )
    }

    /// URL which could be used to read data directly, unsigned.
    pub fn read_url(&self, namespace: &str, filename: &str) -> String {
        format!(
            "http://{}:{}/get-{}/{}",
            self.config.host, self.config.read_port, namespace, filename
        )
    }

    fn delete_url(&self, namespace: &str, filename: &str) -> String {
        format!(
            "http://{}:{}/delete-{}/{}",
            self.config.host, self.config.upload_port, namespace, filename
        )
    }

    fn ping_url(&self) -> String {
        format!("http://{}:{}/ping", self.config.host, self.config.read_port)
    }

    fn downloadinfo_url(&self, namespace: &str, filename: &str) -> String {
        format!(
            "http://{}:{}/downloadinfo-{}/{}",
            self.config.host, self.config.read_port, namespace, filename
        )
    }

    /// Store `body` under `filename` in `namespace`. The anticipated `size`
    /// becomes the request Content-Length when the body itself carries none.
    pub async fn upload(
        &self,
        namespace: &str,
        filename: &str,
        size: Option<u64>,
        body: ByteStream,
    ) -> Result<UploadInfo, DriverError> {
        let url = self.upload_url(namespace, filename);

        let mut req = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, &self.config.auth_header)
            .body(reqwest::Body::wrap_stream(body));
        if let Some(size) = size {
            req = req.header(header::CONTENT_LENGTH, size);
        }

        let resp = req.send().await?;
        if resp.status() != StatusCode::OK {
            return Err(method_error("upload", &url, resp).await);
        }

        let body = resp.text().await?;
        Ok(quick_xml::de::from_str(&body)?)
    }

    /// Stream the value of `filename`, optionally restricted to a byte range.
    pub async fn get(
        &self,
        namespace: &str,
        filename: &str,
        range: Option<GetRange>,
    ) -> Result<ByteStream, DriverError> {
        let url = self.read_url(namespace, filename);

        let mut req = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.config.auth_header);
        match range {
            None => {}
            Some(GetRange::From(offset)) => {
                req = req.header(header::RANGE, format!("bytes={}-", offset));
            }
            Some(GetRange::Span(start, end)) => {
                req = req.header(header::RANGE, format!("bytes={}-{}", start, end));
            }
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(method_error("get", &url, resp).await);
        }

        let stream = futures::StreamExt::map(resp.bytes_stream(), |chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        });
        Ok(ByteStream::new(stream))
    }

    /// Like [`MdsClient::get`], but buffers the whole value.
    pub async fn get_file(
        &self,
        namespace: &str,
        filename: &str,
        range: Option<GetRange>,
    ) -> Result<Vec<u8>, DriverError> {
        let body = self.get(namespace, filename, range).await?.collect_bytes().await?;
        Ok(body.to_vec())
    }

    /// Delete `filename` from `namespace`.
    pub async fn delete(&self, namespace: &str, filename: &str) -> Result<(), DriverError> {
        let url = self.delete_url(namespace, filename);

        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.config.auth_header)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(method_error("delete", &url, resp).await);
        }

        Ok(())
    }

    /// Check availability of the proxy.
    pub async fn ping(&self) -> Result<(), DriverError> {
        let url = self.ping_url();

        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.config.auth_header)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(method_error("ping", &url, resp).await);
        }

        Ok(())
    }

    /// Retrieve the signed direct-link description for `filename`.
    pub async fn download_info(
        &self,
        namespace: &str,
        filename: &str,
    ) -> Result<DownloadInfo, DriverError> {
        let url = self.downloadinfo_url(namespace, filename);

        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, &self.config.auth_header)
            .send()
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(method_error("downloadInfo", &url, resp).await);
        }

        let body = resp.text().await?;
        Ok(quick_xml::de::from_str(&body)?)
    }
}

/// Wrap a non-success reply, keeping at most 512 bytes of its body.
async fn method_error(method: &'static str, url: &str, resp: reqwest::Response) -> DriverError {
    let status = resp.status().as_u16();
    let body = resp.bytes().await.unwrap_or_default();
    let prefix = &body[..body.len().min(512)];

    DriverError::Method {
        method,
        url: url.to_string(),
        status,
        body_prefix: String::from_utf8_lossy(prefix).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MdsClient {
        MdsClient::new(MdsClientConfig {
            host: "storage.example.net".to_string(),
            upload_port: 1111,
            read_port: 80,
            auth_header: "Basic dGVzdA==".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn url_layout_is_bit_exact() {
        let c = client();
        assert_eq!(
            c.upload_url("docker-registry", "blob1"),
            "http://storage.example.net:1111/upload-docker-registry/blob1"
        );
        assert_eq!(
            c.read_url("docker-registry", "blob1"),
            "http://storage.example.net:80/get-docker-registry/blob1"
        );
        assert_eq!(
            c.delete_url("docker-registry", "blob1"),
            "http://storage.example.net:1111/delete-docker-registry/blob1"
        );
        assert_eq!(c.ping_url(), "http://storage.example.net:80/ping");
        assert_eq!(
            c.downloadinfo_url("docker-registry", "blob1"),
            "http://storage.example.net:80/downloadinfo-docker-registry/blob1"
        );
    }

    #[test]
    fn upload_reply_decodes() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<post obj="namespace.filename" id="81d8ba78..." groups="3" size="100" key="221/namespace.filename">
  <complete addr="141.8.145.55:1032" path="/src/storage/8/data-0.0" group="223" status="0"/>
  <complete addr="141.8.145.116:1032" path="/srv/storage/8/data-0.0" group="221" status="0"/>
  <written>2</written>
</post>"#;

        let info: UploadInfo = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(info.obj, "namespace.filename");
        assert_eq!(info.id, "81d8ba78...");
        assert_eq!(info.key, "221/namespace.filename");
        assert_eq!(info.size, 100);
        assert_eq!(info.groups, 3);
        assert_eq!(info.written, 2);
        assert_eq!(info.complete.len(), 2);
        assert_eq!(info.complete[0].addr, "141.8.145.55:1032");
        assert_eq!(info.complete[1].group, 221);
    }

    #[test]
    fn download_info_builds_signed_url() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<download-info>
  <host>storage.example.net</host>
  <path>/get-namespace/filename</path>
  <ts>4fb317985a3a2</ts>
  <region>-1</region>
  <s>acbece3a05cf1e0171dcf67b43ae19b4</s>
</download-info>"#;

        let info: DownloadInfo = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(
            info.url(),
            "http://storage.example.net/get-namespace/filename?ts=4fb317985a3a2sign=acbece3a05cf1e0171dcf67b43ae19b4"
        );
    }
}
