//! Content backend client: reconciles listings against a WordPress-style REST API.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pfs_core::{OfferKind, PropertyRecord};
use pfs_storage::{FetchError, HttpFetcher};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pfs-backend";

/// Metadata key under which every listing post stores its feed identifier.
pub const EXTERNAL_ID_META_KEY: &str = "property_identity";

const PAGE_SIZE: usize = 100;
const ERROR_BODY_LIMIT: usize = 512;

/// A listing post as the backend reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackendPost {
    pub id: u64,
    #[serde(default, deserialize_with = "rendered_text")]
    pub title: String,
    #[serde(default, deserialize_with = "rendered_text")]
    pub content: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "meta_bag")]
    pub meta: Map<String, Value>,
}

impl BackendPost {
    pub fn external_id(&self) -> Option<String> {
        match self.meta.get(EXTERNAL_ID_META_KEY)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// WordPress reports `title`/`content` as `{ "rendered": ... }` objects.
fn rendered_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Object(map) => map
            .get("rendered")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    })
}

/// An empty meta bag arrives as `[]` rather than `{}`.
fn meta_bag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Map<String, Value>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

#[derive(Debug, Deserialize)]
struct CreatedObject {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Term {
    id: u64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned {status} for {method} {path}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },
    #[error("unexpected backend response for {path}: {message}")]
    Decode { path: String, message: String },
}

/// The backend rejected the create/update call for one listing.
#[derive(Debug, Error)]
#[error("upsert of listing {external_id} failed: {source}")]
pub struct UpsertError {
    pub external_id: String,
    pub source: ApiError,
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("resolving term {label:?} in {taxonomy}: {source}")]
    Resolve {
        taxonomy: String,
        label: String,
        source: ApiError,
    },
    #[error("assigning {taxonomy} terms to post {post_id}: {source}")]
    Assign {
        taxonomy: String,
        post_id: u64,
        source: ApiError,
    },
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("downloading {url}: {source}")]
    Download { url: String, source: FetchError },
    #[error("uploading {url}: {source}")]
    Upload { url: String, source: ApiError },
    #[error("updating gallery of post {post_id}: {source}")]
    Gallery { post_id: u64, source: ApiError },
}

#[derive(Debug, Error)]
#[error("listing published posts for archival: {0}")]
pub struct ArchiveError(#[from] pub ApiError);

/// Result of a successful create/update. Taxonomy failures are carried
/// along for logging; they never fail the upsert itself.
#[derive(Debug)]
pub struct UpsertOutcome {
    pub post_id: u64,
    pub created: bool,
    pub taxonomy_failures: Vec<TaxonomyError>,
}

/// Attachments created for one post, in URL order, plus skipped URLs.
#[derive(Debug, Default)]
pub struct MediaReport {
    pub attachment_ids: Vec<u64>,
    pub failures: Vec<MediaError>,
}

/// Backend operations the sync pipeline depends on.
#[async_trait]
pub trait ListingBackend: Send + Sync {
    /// Called once at the start of every sync run.
    async fn begin_run(&self) {}

    /// Lossy lookup: transport errors are logged and reported as not found.
    async fn find_by_external_id(&self, external_id: &str) -> Option<BackendPost>;

    async fn upsert(&self, record: &PropertyRecord) -> Result<UpsertOutcome, UpsertError>;

    async fn resolve_or_create_term(&self, taxonomy: &str, label: &str) -> Result<u64, TaxonomyError>;

    /// Download and attach images one at a time; the first success becomes
    /// the featured image.
    async fn attach_images(&self, post_id: u64, urls: &[String]) -> MediaReport;

    /// Move every published listing whose external id is not in
    /// `current_ids` to draft. Returns how many were moved.
    async fn archive_stale(&self, current_ids: &HashSet<String>) -> Result<usize, ArchiveError>;
}

/// Taxonomy names and labels used when classifying a listing post.
#[derive(Debug, Clone)]
pub struct TaxonomyVocabulary {
    pub type_taxonomy: String,
    pub offer_taxonomy: String,
    pub condition_taxonomy: String,
    pub amenity_taxonomy: String,
    /// Feed property-type code (lowercase) -> term label.
    pub type_labels: BTreeMap<String, String>,
    pub sale_label: String,
    pub rent_label: String,
    pub condition_label: String,
}

impl Default for TaxonomyVocabulary {
    fn default() -> Self {
        let type_labels = [
            ("apartment", "Apartamento"),
            ("house", "Casa"),
            ("commercial", "Local Comercial"),
            ("land", "Lote"),
        ]
        .into_iter()
        .map(|(code, label)| (code.to_string(), label.to_string()))
        .collect();

        Self {
            type_taxonomy: "property-type".into(),
            offer_taxonomy: "property-status".into(),
            condition_taxonomy: "property-label".into(),
            amenity_taxonomy: "amenity".into(),
            type_labels,
            sale_label: "Venta".into(),
            rent_label: "Arriendo".into(),
            condition_label: "Usado".into(),
        }
    }
}

impl TaxonomyVocabulary {
    /// Unmapped codes pass through unchanged.
    pub fn type_label(&self, code: &str) -> String {
        self.type_labels
            .get(&code.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| code.trim().to_string())
    }

    pub fn offer_label(&self, offer: OfferKind) -> &str {
        match offer {
            OfferKind::Sale => &self.sale_label,
            OfferKind::Rent => &self.rent_label,
        }
    }

    /// Taxonomy -> labels to assign for one record, skipping empty labels.
    pub fn assignments(&self, record: &PropertyRecord) -> Vec<(String, Vec<String>)> {
        let mut out = vec![
            (self.type_taxonomy.clone(), vec![self.type_label(&record.property_type)]),
            (
                self.offer_taxonomy.clone(),
                vec![self.offer_label(record.offer).to_string()],
            ),
            (self.condition_taxonomy.clone(), vec![self.condition_label.clone()]),
        ];
        if !record.amenities.is_empty() {
            out.push((self.amenity_taxonomy.clone(), record.amenities.clone()));
        }
        out.into_iter()
            .map(|(taxonomy, labels)| {
                let labels: Vec<String> = labels.into_iter().filter(|l| !l.trim().is_empty()).collect();
                (taxonomy, labels)
            })
            .filter(|(_, labels)| !labels.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub post_type: String,
    pub timeout: Duration,
    pub vocabulary: TaxonomyVocabulary,
}

/// [`ListingBackend`] over the WordPress REST API (`/wp-json/wp/v2`).
pub struct WordPressClient {
    api_root: String,
    username: String,
    password: String,
    post_type: String,
    client: reqwest::Client,
    images: HttpFetcher,
    vocabulary: TaxonomyVocabulary,
    term_cache: Mutex<HashMap<(String, String), u64>>,
}

impl WordPressClient {
    pub fn new(config: BackendConfig, images: HttpFetcher) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building backend http client")?;
        Ok(Self {
            api_root: format!("{}/wp-json/wp/v2", config.base_url.trim_end_matches('/')),
            username: config.username,
            password: config.password,
            post_type: config.post_type,
            client,
            images,
            vocabulary: config.vocabulary,
            term_cache: Mutex::new(HashMap::new()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_root, path))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn decode<T: DeserializeOwned>(resp: Response, method: &Method, path: &str) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ApiError::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>().await.map_err(|e| ApiError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        let resp = self.request(Method::GET, path).query(query).send().await?;
        Self::decode(resp, &Method::GET, path).await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        let resp = self.request(Method::POST, path).json(body).send().await?;
        Self::decode(resp, &Method::POST, path).await
    }

    /// Strict lookup used by `upsert`: transport errors propagate so a
    /// transient failure never turns into a duplicate create.
    async fn lookup(&self, external_id: &str) -> Result<Option<BackendPost>, ApiError> {
        let posts: Vec<BackendPost> = self
            .get_json(
                "/posts",
                &[
                    ("type", self.post_type.as_str()),
                    ("status", "publish,draft"),
                    ("meta_key", EXTERNAL_ID_META_KEY),
                    ("meta_value", external_id),
                ],
            )
            .await?;

        // Only an exact identifier match counts. A server that ignores the
        // meta filter or hides the meta field must not hand us someone else's post.
        Ok(posts
            .into_iter()
            .find(|p| p.external_id().as_deref() == Some(external_id)))
    }

    fn post_payload(&self, record: &PropertyRecord) -> Value {
        json!({
            "title": record.title,
            "content": record.description,
            "type": self.post_type,
            "status": "publish",
            "meta": {
                EXTERNAL_ID_META_KEY: record.external_id,
                "property_price_value": record.price,
                "property_bedrooms": record.bedrooms,
                "property_bathrooms": record.bathrooms,
                "nivel_de_piso": record.floor,
                "property_additional_detail": format!("Cuota: {}", record.fee),
                "property_land": record.plot_area,
                "property_size": record.floor_area,
                "property_location": record.location().unwrap_or_default(),
                "property_address": record.address,
                "property_postal_code": record.postal_code,
                "property_other_agent_name": record.agent_name,
                "property_other_agent_email": record.agent_email,
                "property_other_agent_phone": record.agent_phone,
            },
        })
    }

    async fn assign_terms(
        &self,
        post_id: u64,
        taxonomy: &str,
        labels: &[String],
        failures: &mut Vec<TaxonomyError>,
    ) {
        let mut term_ids = Vec::with_capacity(labels.len());
        for label in labels {
            match self.resolve_or_create_term(taxonomy, label).await {
                Ok(id) => term_ids.push(id),
                Err(err) => failures.push(err),
            }
        }
        if term_ids.is_empty() {
            return;
        }

        let mut body = Map::new();
        body.insert(taxonomy.to_string(), json!(term_ids));
        let assigned: Result<Value, ApiError> = self
            .post_json(&format!("/posts/{post_id}"), &Value::Object(body))
            .await;
        if let Err(source) = assigned {
            failures.push(TaxonomyError::Assign {
                taxonomy: taxonomy.to_string(),
                post_id,
                source,
            });
        }
    }

    async fn upload_from_url(&self, post_id: u64, url: &str) -> Result<u64, MediaError> {
        let fetched = self
            .images
            .fetch_bytes(url)
            .await
            .map_err(|source| MediaError::Download {
                url: url.to_string(),
                source,
            })?;

        let file_name = media_file_name(url);
        let content_type = fetched
            .content_type
            .clone()
            .unwrap_or_else(|| "image/jpeg".to_string());
        let upload_err = |source| MediaError::Upload {
            url: url.to_string(),
            source,
        };

        let resp = self
            .request(Method::POST, "/media")
            .query(&[("post", post_id)])
            .header(CONTENT_TYPE, content_type)
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            )
            .body(fetched.body)
            .send()
            .await
            .map_err(|e| upload_err(ApiError::Request(e)))?;
        let created: CreatedObject = Self::decode(resp, &Method::POST, "/media")
            .await
            .map_err(upload_err)?;
        Ok(created.id)
    }

    async fn set_gallery(&self, post_id: u64, ids: &[u64]) -> Result<(), ApiError> {
        let path = format!("/posts/{post_id}");
        let _: Value = self.post_json(&path, &json!({ "featured_media": ids[0] })).await?;
        let gallery_json = json!(ids).to_string();
        let _: Value = self
            .post_json(
                &path,
                &json!({
                    "meta": {
                        "tf_gallery_images": ids,
                        "gallery_images": gallery_json,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    async fn published_listings(&self) -> Result<Vec<BackendPost>, ApiError> {
        let mut all = Vec::new();
        let per_page = PAGE_SIZE.to_string();
        for page in 1.. {
            let page_str = page.to_string();
            let result: Result<Vec<BackendPost>, ApiError> = self
                .get_json(
                    "/posts",
                    &[
                        ("type", self.post_type.as_str()),
                        ("status", "publish"),
                        ("per_page", per_page.as_str()),
                        ("page", page_str.as_str()),
                    ],
                )
                .await;
            let posts = match result {
                Ok(posts) => posts,
                // Asking past the last page is a 400 when the total is an
                // exact multiple of the page size.
                Err(ApiError::Status { status: 400, .. }) if page > 1 => break,
                Err(err) => return Err(err),
            };
            let short_page = posts.len() < PAGE_SIZE;
            all.extend(posts);
            if short_page {
                break;
            }
        }
        Ok(all)
    }
}

fn media_file_name(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .map(|name| name.replace('"', ""))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "image.jpg".to_string())
}

#[async_trait]
impl ListingBackend for WordPressClient {
    async fn begin_run(&self) {
        self.term_cache.lock().await.clear();
    }

    async fn find_by_external_id(&self, external_id: &str) -> Option<BackendPost> {
        match self.lookup(external_id).await {
            Ok(post) => post,
            Err(err) => {
                warn!(external_id, error = %err, "listing lookup failed; treating as not found");
                None
            }
        }
    }

    async fn upsert(&self, record: &PropertyRecord) -> Result<UpsertOutcome, UpsertError> {
        let upsert_err = |source| UpsertError {
            external_id: record.external_id.clone(),
            source,
        };
        let existing = self.lookup(&record.external_id).await.map_err(upsert_err)?;
        let payload = self.post_payload(record);

        let (post_id, created) = match existing {
            Some(post) => {
                let _: Value = self
                    .post_json(&format!("/posts/{}", post.id), &payload)
                    .await
                    .map_err(upsert_err)?;
                (post.id, false)
            }
            None => {
                let created: CreatedObject = self.post_json("/posts", &payload).await.map_err(upsert_err)?;
                (created.id, true)
            }
        };
        debug!(external_id = %record.external_id, post_id, created, "listing upserted");

        let mut taxonomy_failures = Vec::new();
        for (taxonomy, labels) in self.vocabulary.assignments(record) {
            self.assign_terms(post_id, &taxonomy, &labels, &mut taxonomy_failures)
                .await;
        }

        Ok(UpsertOutcome {
            post_id,
            created,
            taxonomy_failures,
        })
    }

    async fn resolve_or_create_term(&self, taxonomy: &str, label: &str) -> Result<u64, TaxonomyError> {
        let key = (taxonomy.to_string(), label.to_string());
        if let Some(id) = self.term_cache.lock().await.get(&key).copied() {
            return Ok(id);
        }

        let path = format!("/{taxonomy}");
        let resolve_err = |source| TaxonomyError::Resolve {
            taxonomy: taxonomy.to_string(),
            label: label.to_string(),
            source,
        };
        let terms: Vec<Term> = self
            .get_json(&path, &[("search", label)])
            .await
            .map_err(resolve_err)?;

        // Search is a substring match; only an exact name counts as a hit.
        let id = match terms.iter().find(|t| t.name.trim().eq_ignore_ascii_case(label.trim())) {
            Some(term) => term.id,
            None => {
                let created: Term = self
                    .post_json(&path, &json!({ "name": label }))
                    .await
                    .map_err(resolve_err)?;
                info!(taxonomy, label, term_id = created.id, "created taxonomy term");
                created.id
            }
        };

        self.term_cache.lock().await.insert(key, id);
        Ok(id)
    }

    async fn attach_images(&self, post_id: u64, urls: &[String]) -> MediaReport {
        let mut report = MediaReport::default();
        for url in urls {
            match self.upload_from_url(post_id, url).await {
                Ok(id) => report.attachment_ids.push(id),
                Err(err) => report.failures.push(err),
            }
        }

        if !report.attachment_ids.is_empty() {
            if let Err(source) = self.set_gallery(post_id, &report.attachment_ids).await {
                report.failures.push(MediaError::Gallery { post_id, source });
            }
        }
        report
    }

    async fn archive_stale(&self, current_ids: &HashSet<String>) -> Result<usize, ArchiveError> {
        let posts = self.published_listings().await?;
        let mut archived = 0usize;

        for post in posts {
            let Some(external_id) = post.external_id() else {
                continue;
            };
            if current_ids.contains(&external_id) {
                continue;
            }
            let result: Result<Value, ApiError> = self
                .post_json(&format!("/posts/{}", post.id), &json!({ "status": "draft" }))
                .await;
            match result {
                Ok(_) => {
                    archived += 1;
                    debug!(post_id = post.id, %external_id, "archived stale listing");
                }
                Err(err) => warn!(post_id = post.id, %external_id, error = %err, "could not archive listing"),
            }
        }
        Ok(archived)
    }
}
