//! reqwest-backed implementation of the platform client.
//!
//! Every API call is a JSON POST to `{api_server}/{entity}/{verb}`,
//! authenticated with the environment's bearer token, run through a
//! pooled client with bounded retries. Ranged data downloads go through
//! a separate client so long transfers never starve the pool of clients
//! for short calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use dxfuse_common::{Error, Result, NUM_RETRIES_DEFAULT};

use crate::env::PlatformEnvironment;
use crate::pool::ClientPool;
use crate::retry::retry_with_backoff;
use crate::types::{
    DataObjectDescriptor, DownloadUrl, FileDescriptor, FileState, FolderContents,
    PlatformClient, ProjectDescriptor, ProjectPermission, RangeFetcher,
};

/// Folder describes page through listings this many entries at a time.
const DESCRIBE_PAGE_SIZE: usize = 1000;

/// Timeout for a single ranged GET. Windows are at most 16 MiB, but the
/// backing store can be slow from outside a worker.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Map a transport failure onto the shared error kinds.
fn http_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::IO(err.to_string())
    }
}

// ============================================================================
// API response payloads
// ============================================================================

#[derive(Deserialize)]
struct ProjectDescribeResponse {
    id: String,
    name: String,
    level: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    modified: i64,
}

#[derive(Deserialize)]
struct ListFolderObject {
    id: String,
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    modified: i64,
    #[serde(rename = "symlinkPath")]
    symlink_path: Option<String>,
}

#[derive(Deserialize)]
struct ListFolderResponse {
    #[serde(default)]
    objects: Vec<ListFolderObject>,
    /// Absolute folder paths within the project.
    #[serde(default)]
    folders: Vec<String>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct FileDescribeResponse {
    id: String,
    project: String,
    name: String,
    state: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    modified: i64,
}

#[derive(Deserialize)]
struct FindProjectsResponse {
    #[serde(default)]
    results: Vec<IdResponse>,
}

// ============================================================================
// Client
// ============================================================================

/// [`PlatformClient`] implementation over the HTTPS API.
pub struct HttpPlatformClient {
    env: PlatformEnvironment,
    pool: ClientPool,
    retries: u32,
}

impl HttpPlatformClient {
    /// Build a client with `pool_size` pooled connections.
    pub fn new(env: PlatformEnvironment, pool_size: usize) -> HttpPlatformClient {
        HttpPlatformClient {
            env,
            pool: ClientPool::new(pool_size),
            retries: NUM_RETRIES_DEFAULT,
        }
    }

    /// One JSON API call with retries. `entity` is an object id or a
    /// system endpoint, `verb` the operation on it.
    async fn call(&self, entity: &str, verb: &str, payload: Value) -> Result<Value> {
        let url: String = format!("{}/{}/{}", self.env.api_server, entity, verb);
        let op_name: String = format!("{}/{}", entity, verb);

        retry_with_backoff(&op_name, self.retries, |_attempt| {
            let url = url.clone();
            let payload = payload.clone();
            async move {
                let client = self.pool.acquire().await;
                let response = client
                    .post(&url)
                    .bearer_auth(&self.env.token)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(http_error)?;

                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    return Err(Error::Auth(format!("{} returned {}", url, status)));
                }
                if !status.is_success() {
                    let body: String = response.text().await.unwrap_or_default();
                    return Err(Error::IO(format!("{} returned {}: {}", url, status, body)));
                }
                response.json::<Value>().await.map_err(http_error)
            }
        })
        .await
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, entity: &str, value: Value) -> Result<T> {
        serde_json::from_value(value)
            .map_err(|e| Error::IO(format!("malformed {} response: {}", entity, e)))
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn describe_project(&self, project_id: &str) -> Result<ProjectDescriptor> {
        let value: Value = self.call(project_id, "describe", json!({})).await?;
        let desc: ProjectDescribeResponse = self.decode("project describe", value)?;
        Ok(ProjectDescriptor {
            id: desc.id,
            name: desc.name,
            level: ProjectPermission::parse(&desc.level),
            ctime: desc.created,
            mtime: desc.modified,
        })
    }

    async fn describe_folder(&self, project_id: &str, folder: &str) -> Result<FolderContents> {
        let mut contents = FolderContents::default();
        let mut cursor: Option<String> = None;

        loop {
            let payload: Value = json!({
                "folder": folder,
                "describe": true,
                "limit": DESCRIBE_PAGE_SIZE,
                "starting": cursor,
            });
            let value: Value = self.call(project_id, "listFolder", payload).await?;
            let page: ListFolderResponse = self.decode("listFolder", value)?;

            for o in page.objects {
                contents.data_objects.push(DataObjectDescriptor {
                    id: o.id,
                    proj_id: project_id.to_string(),
                    name: o.name,
                    size: o.size,
                    ctime: o.created,
                    mtime: o.modified,
                    symlink_path: o.symlink_path,
                });
            }
            // Folders come back as absolute project paths; keep the
            // final component.
            for f in page.folders {
                let name: &str = f.rsplit('/').next().unwrap_or(&f);
                if !name.is_empty() {
                    contents.subdirs.push(name.to_string());
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(contents)
    }

    async fn file_new(
        &self,
        project_id: &str,
        name: &str,
        folder: &str,
        nonce: &str,
    ) -> Result<String> {
        let payload: Value = json!({
            "project": project_id,
            "name": name,
            "folder": folder,
            "parents": false,
            "nonce": nonce,
        });
        let value: Value = self.call("file", "new", payload).await?;
        let resp: IdResponse = self.decode("file new", value)?;
        Ok(resp.id)
    }

    async fn file_upload_part(&self, file_id: &str, index: u32, data: &[u8]) -> Result<()> {
        // Mint the part URL and PUT the bytes as one retried unit, so a
        // failed PUT gets a fresh URL on the next attempt.
        let op_name: String = format!("{}/upload part {}", file_id, index);
        retry_with_backoff(&op_name, self.retries, |_attempt| {
            let data: Vec<u8> = data.to_vec();
            async move {
                let value: Value = self
                    .call(file_id, "upload", json!({ "index": index, "size": data.len() }))
                    .await?;
                let target: DownloadUrl = self.decode("upload URL", value)?;

                let client = self.pool.acquire().await;
                let mut request = client.put(&target.url).body(data);
                for (k, v) in &target.headers {
                    request = request.header(k.as_str(), v.as_str());
                }
                let response = request.send().await.map_err(http_error)?;
                if !response.status().is_success() {
                    return Err(Error::IO(format!(
                        "part {} of {} rejected: {}",
                        index,
                        file_id,
                        response.status()
                    )));
                }
                Ok(())
            }
        })
        .await
    }

    async fn file_close(&self, file_id: &str) -> Result<()> {
        self.call(file_id, "close", json!({})).await?;
        Ok(())
    }

    async fn file_describe(&self, file_id: &str) -> Result<FileDescriptor> {
        let value: Value = self.call(file_id, "describe", json!({})).await?;
        let desc: FileDescribeResponse = self.decode("file describe", value)?;
        Ok(FileDescriptor {
            id: desc.id,
            proj_id: desc.project,
            name: desc.name,
            size: desc.size,
            state: FileState::parse(&desc.state),
            ctime: desc.created,
            mtime: desc.modified,
        })
    }

    async fn file_download_url(&self, file_id: &str, project_id: &str) -> Result<DownloadUrl> {
        let payload: Value = json!({
            "project": project_id,
            "preauthenticated": true,
        });
        let value: Value = self.call(file_id, "download", payload).await?;
        self.decode("download URL", value)
    }

    async fn find_project(&self, name: &str) -> Result<Option<String>> {
        let payload: Value = json!({
            "name": name,
            "level": "VIEW",
        });
        let value: Value = self.call("system", "findProjects", payload).await?;
        let resp: FindProjectsResponse = self.decode("findProjects", value)?;
        Ok(resp.results.into_iter().next().map(|r| r.id))
    }
}

// ============================================================================
// Ranged downloads
// ============================================================================

/// [`RangeFetcher`] over plain HTTP GETs with a `Range` header.
pub struct HttpRangeFetcher {
    client: reqwest::Client,
}

impl HttpRangeFetcher {
    pub fn new() -> HttpRangeFetcher {
        let client: reqwest::Client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        HttpRangeFetcher { client }
    }
}

impl Default for HttpRangeFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    async fn fetch_range(&self, url: &DownloadUrl, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut request = self.client.get(&url.url).header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", offset, offset + len - 1),
        );
        for (k, v) in &url.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            // The presigned URL has expired; the caller refreshes it.
            return Err(Error::Auth(format!("download URL rejected: {}", status)));
        }
        if !status.is_success() {
            return Err(Error::IO(format!("range GET returned {}", status)));
        }

        let body = response.bytes().await.map_err(http_error)?;
        if (body.len() as u64) != len {
            return Err(Error::IO(format!(
                "short range read: wanted {} bytes at offset {}, got {}",
                len,
                offset,
                body.len()
            )));
        }
        Ok(body.to_vec())
    }
}
