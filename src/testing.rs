//! In-process fake of the artifact cache service and the listing API.

use std::{
    collections::{BTreeMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_RANGE, RANGE},
        HeaderMap,
        StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    cache::Cache,
    config::CacheConfig,
    credentials::{Credentials, Permission, Scope},
    error::ALREADY_EXISTS_TYPE_KEY,
    listing::RestApi,
};

pub const TEST_REPO: &str = "octo/cache-test";

pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

/// Unsigned runner-style token whose `ac` claim grants `scopes`.
pub fn fake_token(scopes: &[Scope]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"none"}"#);
    let ac = serde_json::to_string(scopes).unwrap_or_default();
    let claims = json!({ "ac": ac, "iss": "fake-cache" });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub fn default_scopes() -> Vec<Scope> {
    vec![
        Scope {
            scope: "refs/heads/main".to_string(),
            permission: Permission::READ | Permission::WRITE,
        },
        Scope {
            scope: "refs/heads/default".to_string(),
            permission: Permission::READ,
        },
    ]
}

struct PendingUpload {
    key: String,
    version: String,
    chunks: BTreeMap<u64, Bytes>,
    committed: bool,
}

#[derive(Clone)]
struct StoredEntry {
    key: String,
    version: String,
    data: Bytes,
}

#[derive(Default)]
struct FakeState {
    base_url: String,
    token: String,
    next_id: i64,
    uploads: BTreeMap<i64, PendingUpload>,
    taken: HashSet<(String, String)>,
    /// Commit order; the index is the download id.
    entries: Vec<StoredEntry>,
    chunk_ranges: Vec<Range<u64>>,
    fail_uploads: bool,
    ignore_ranges: bool,
    page_size: Option<usize>,
    list_requests: usize,
    upload_delay: Option<Duration>,
    uploads_in_flight: usize,
    peak_uploads_in_flight: usize,
}

#[derive(Clone, Default)]
struct FakeCache {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCache {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let expected = format!("Bearer {}", self.lock().token);
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(value) if value == expected => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "unauthorized").into_response()),
        }
    }
}

/// Counts one chunk request as in flight until dropped, including when the
/// client disconnects mid-request.
struct InFlightUpload(FakeCache);

impl InFlightUpload {
    fn start(fake: &FakeCache, state: &mut FakeState) -> Self {
        state.uploads_in_flight += 1;
        state.peak_uploads_in_flight = state.peak_uploads_in_flight.max(state.uploads_in_flight);
        Self(fake.clone())
    }
}

impl Drop for InFlightUpload {
    fn drop(&mut self) {
        self.0.lock().uploads_in_flight -= 1;
    }
}

fn api_error(status: StatusCode, type_key: &str, message: &str) -> Response {
    let body = json!({
        "$id": "1",
        "innerException": null,
        "message": message,
        "typeName": format!("Microsoft.Azure.DevOps.ArtifactCache.WebApi.{type_key}"),
        "typeKey": type_key,
        "errorCode": 0,
        "eventId": 3000,
    });
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ReserveBody {
    key: String,
    version: String,
}

async fn reserve(
    State(fake): State<FakeCache>,
    headers: HeaderMap,
    Json(body): Json<ReserveBody>,
) -> Response {
    if let Err(resp) = fake.authorize(&headers) {
        return resp;
    }
    let mut state = fake.lock();
    if !state.taken.insert((body.key.clone(), body.version.clone())) {
        return api_error(
            StatusCode::CONFLICT,
            ALREADY_EXISTS_TYPE_KEY,
            &format!("Cache already exists. Key: {}", body.key),
        );
    }
    state.next_id += 1;
    let id = state.next_id;
    state.uploads.insert(
        id,
        PendingUpload {
            key: body.key,
            version: body.version,
            chunks: BTreeMap::new(),
            committed: false,
        },
    );
    Json(json!({ "cacheId": id })).into_response()
}

fn parse_content_range(headers: &HeaderMap) -> Option<Range<u64>> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (range, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    if total != "*" {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let (start, end): (u64, u64) = (start.parse().ok()?, end.parse().ok()?);
    (start <= end).then_some(start..end + 1)
}

async fn upload_chunk(
    State(fake): State<FakeCache>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = fake.authorize(&headers) {
        return resp;
    }
    let Some(range) = parse_content_range(&headers) else {
        return api_error(StatusCode::BAD_REQUEST, "InvalidContentRange", "bad Content-Range");
    };
    let (delay, _in_flight) = {
        let mut state = fake.lock();
        if state.fail_uploads {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ChunkUploadFailedException",
                "chunk upload failed",
            );
        }
        if range.end - range.start != body.len() as u64 {
            return api_error(StatusCode::BAD_REQUEST, "InvalidContentRange", "length mismatch");
        }
        let Some(upload) = state.uploads.get_mut(&id) else {
            return api_error(StatusCode::NOT_FOUND, "CacheNotFoundException", "no such cache");
        };
        if upload.committed {
            return api_error(StatusCode::BAD_REQUEST, "CacheAlreadyCommitted", "already committed");
        }
        upload.chunks.insert(range.start, body);
        state.chunk_ranges.push(range);
        (state.upload_delay, InFlightUpload::start(&fake, &mut state))
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct CommitBody {
    size: u64,
}

async fn commit(
    State(fake): State<FakeCache>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<CommitBody>,
) -> Response {
    if let Err(resp) = fake.authorize(&headers) {
        return resp;
    }
    let mut state = fake.lock();
    let Some(upload) = state.uploads.get_mut(&id) else {
        return api_error(StatusCode::NOT_FOUND, "CacheNotFoundException", "no such cache");
    };
    if upload.committed {
        return api_error(StatusCode::BAD_REQUEST, "CacheAlreadyCommitted", "already committed");
    }
    let mut data = BytesMut::new();
    for (start, chunk) in &upload.chunks {
        if *start != data.len() as u64 {
            return api_error(StatusCode::BAD_REQUEST, "InvalidChunks", "chunks are not contiguous");
        }
        data.extend_from_slice(chunk);
    }
    if data.len() as u64 != body.size {
        return api_error(StatusCode::BAD_REQUEST, "InvalidSize", "size does not match chunks");
    }
    upload.committed = true;
    let stored = StoredEntry {
        key: upload.key.clone(),
        version: upload.version.clone(),
        data: data.freeze(),
    };
    state.entries.push(stored);
    StatusCode::NO_CONTENT.into_response()
}

/// Most recently committed entry of `version` accepted by `matches`.
fn newest<'a>(
    entries: &'a [StoredEntry],
    version: &str,
    matches: impl Fn(&StoredEntry) -> bool,
) -> Option<(usize, &'a StoredEntry)> {
    entries
        .iter()
        .enumerate()
        .rev()
        .find(|(_, e)| e.version == version && matches(e))
}

#[derive(Deserialize)]
struct LookupQuery {
    keys: String,
    version: String,
}

async fn lookup(
    State(fake): State<FakeCache>,
    headers: HeaderMap,
    Query(query): Query<LookupQuery>,
) -> Response {
    if let Err(resp) = fake.authorize(&headers) {
        return resp;
    }
    let state = fake.lock();
    for candidate in query.keys.split(',') {
        let found = newest(&state.entries, &query.version, |e| e.key == candidate)
            .or_else(|| newest(&state.entries, &query.version, |e| e.key.starts_with(candidate)));
        if let Some((index, entry)) = found {
            return Json(json!({
                "cacheKey": entry.key,
                "scope": "refs/heads/main",
                "cacheVersion": entry.version,
                "archiveLocation": format!("{}_download/{index}", state.base_url),
            }))
            .into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()))
}

async fn download(
    State(fake): State<FakeCache>,
    Path(index): Path<usize>,
    headers: HeaderMap,
) -> Response {
    let state = fake.lock();
    let Some(entry) = state.entries.get(index) else {
        return api_error(
            StatusCode::NOT_FOUND,
            "ArtifactCacheItemNotFoundException",
            "cache blob not found",
        );
    };
    let data = entry.data.clone();
    let range = if state.ignore_ranges { None } else { parse_range(&headers) };
    let Some((start, end)) = range else {
        return (StatusCode::OK, data).into_response();
    };
    let len = data.len() as u64;
    if start >= len {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    let end = end.map_or(len, |end| (end + 1).min(len));
    (
        StatusCode::PARTIAL_CONTENT,
        [(CONTENT_RANGE, format!("bytes {start}-{}/{len}", end - 1))],
        data.slice(start as usize..end as usize),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    key: String,
    per_page: usize,
    page: usize,
}

async fn list_caches(
    State(fake): State<FakeCache>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    if let Err(resp) = fake.authorize(&headers) {
        return resp;
    }
    if format!("{owner}/{repo}") != TEST_REPO {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" }))).into_response();
    }
    let mut state = fake.lock();
    state.list_requests += 1;
    let per_page = state.page_size.unwrap_or(query.per_page).min(query.per_page).max(1);
    let matching: Vec<_> = state
        .entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.key.starts_with(&query.key))
        .collect();
    let page: Vec<_> = matching
        .iter()
        .skip(query.page.saturating_sub(1) * per_page)
        .take(per_page)
        .map(|(index, e)| {
            json!({
                "id": index + 1,
                "ref": "refs/heads/main",
                "key": e.key,
                "version": e.version,
                "last_accessed_at": "2024-01-24T22:45:36.000Z",
                "created_at": "2024-01-24T22:45:36.000Z",
                "size_in_bytes": e.data.len(),
            })
        })
        .collect();
    Json(json!({
        "total_count": matching.len(),
        "actions_caches": page,
    }))
    .into_response()
}

pub struct TestCacheServer {
    pub base_url: String,
    fake: FakeCache,
    handle: JoinHandle<()>,
}

impl TestCacheServer {
    pub async fn start() -> Result<Self> {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}/", listener.local_addr()?);
        let fake = FakeCache::default();
        {
            let mut state = fake.lock();
            state.base_url = base_url.clone();
            state.token = fake_token(&default_scopes());
        }

        let app = Router::new()
            .route("/_apis/artifactcache/caches", post(reserve))
            .route("/_apis/artifactcache/caches/{id}", patch(upload_chunk).post(commit))
            .route("/_apis/artifactcache/cache", get(lookup))
            .route("/_download/{index}", get(download))
            .route("/repos/{owner}/{repo}/actions/caches", get(list_caches))
            .with_state(fake.clone());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            base_url,
            fake,
            handle,
        })
    }

    pub fn token(&self) -> String {
        self.fake.lock().token.clone()
    }

    pub fn cache(&self) -> Cache {
        self.cache_with_config(CacheConfig::default())
    }

    pub fn cache_with_config(&self, config: CacheConfig) -> Cache {
        let credentials = Credentials::parse(&self.token(), &self.base_url).unwrap();
        Cache::new(credentials, config).unwrap()
    }

    pub fn cache_with_token(&self, token: &str) -> Cache {
        let credentials = Credentials::new(token, vec![], &self.base_url).unwrap();
        Cache::new(credentials, CacheConfig::default()).unwrap()
    }

    pub fn rest_api(&self) -> RestApi {
        RestApi::with_base_url(&self.base_url, TEST_REPO, self.token(), &CacheConfig::default())
            .unwrap()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fake.lock().fail_uploads = fail;
    }

    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.fake.lock().ignore_ranges = ignore;
    }

    pub fn set_page_size(&self, size: usize) {
        self.fake.lock().page_size = Some(size);
    }

    /// Holds every chunk request open for `delay` after it is recorded.
    pub fn set_upload_delay(&self, delay: Duration) {
        self.fake.lock().upload_delay = Some(delay);
    }

    pub fn peak_uploads_in_flight(&self) -> usize {
        self.fake.lock().peak_uploads_in_flight
    }

    pub fn chunk_ranges(&self) -> Vec<Range<u64>> {
        self.fake.lock().chunk_ranges.clone()
    }

    pub fn committed_keys(&self) -> Vec<String> {
        self.fake.lock().entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn list_requests(&self) -> usize {
        self.fake.lock().list_requests
    }
}

impl Drop for TestCacheServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
