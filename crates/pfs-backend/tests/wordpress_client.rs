use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pfs_backend::{
    BackendConfig, ListingBackend, MediaError, TaxonomyError, TaxonomyVocabulary, WordPressClient,
};
use pfs_core::{OfferKind, PropertyRecord};
use pfs_storage::{HttpClientConfig, HttpFetcher};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Default)]
struct FakePost {
    title: String,
    status: String,
    meta: Map<String, Value>,
    featured_media: Option<u64>,
    taxonomies: HashMap<String, Vec<u64>>,
}

#[derive(Debug, Clone)]
struct FakeMedia {
    id: u64,
    file_name: String,
    parent: Option<u64>,
}

/// In-memory stand-in for the subset of the WordPress REST API the client uses.
#[derive(Debug, Default)]
struct FakeWp {
    next_id: u64,
    posts: BTreeMap<u64, FakePost>,
    terms: HashMap<String, Vec<(u64, String)>>,
    media: Vec<FakeMedia>,
    term_searches: usize,
    fail_listing: bool,
    fail_lookup: bool,
    unfiltered_lookup: bool,
    fail_taxonomy: Option<String>,
    reject_creates: bool,
}

impl FakeWp {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn seed(&mut self, external_id: Option<&str>, status: &str) -> u64 {
        let id = self.allocate_id();
        let mut meta = Map::new();
        if let Some(external_id) = external_id {
            meta.insert("property_identity".into(), json!(external_id));
        }
        self.posts.insert(
            id,
            FakePost {
                title: format!("seeded {id}"),
                status: status.into(),
                meta,
                ..Default::default()
            },
        );
        id
    }

    fn posts_with_external_id(&self, external_id: &str) -> Vec<(u64, FakePost)> {
        self.posts
            .iter()
            .filter(|(_, p)| p.meta.get("property_identity") == Some(&json!(external_id)))
            .map(|(id, p)| (*id, p.clone()))
            .collect()
    }

    fn status_of(&self, external_id: &str) -> String {
        self.posts_with_external_id(external_id)[0].1.status.clone()
    }
}

fn post_json(id: u64, post: &FakePost) -> Value {
    json!({
        "id": id,
        "title": { "rendered": post.title },
        "status": post.status,
        "meta": post.meta,
    })
}

type Shared = Arc<Mutex<FakeWp>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "))
}

fn server_error(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}

async fn list_resource(
    State(state): State<Shared>,
    Path(resource): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut wp = state.lock().unwrap();

    if resource == "posts" {
        if let Some(external_id) = query.get("meta_value") {
            if wp.fail_lookup {
                return server_error("lookup unavailable");
            }
            // Some installs drop unregistered meta filters and fields.
            if wp.unfiltered_lookup {
                let all: Vec<Value> = wp
                    .posts
                    .iter()
                    .map(|(id, p)| {
                        let mut post = post_json(*id, p);
                        post["meta"] = json!({});
                        post
                    })
                    .collect();
                return Json(all).into_response();
            }
            let found: Vec<Value> = wp
                .posts_with_external_id(external_id)
                .iter()
                .map(|(id, p)| post_json(*id, p))
                .collect();
            return Json(found).into_response();
        }

        if wp.fail_listing {
            return server_error("listing unavailable");
        }
        let status = query.get("status").cloned().unwrap_or_else(|| "publish".into());
        let per_page: usize = query.get("per_page").and_then(|v| v.parse().ok()).unwrap_or(10);
        let page: usize = query.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
        let matching: Vec<Value> = wp
            .posts
            .iter()
            .filter(|(_, p)| p.status == status)
            .map(|(id, p)| post_json(*id, p))
            .collect();
        let total_pages = matching.len().div_ceil(per_page).max(1);
        if page > total_pages {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "code": "rest_post_invalid_page_number" })),
            )
                .into_response();
        }
        let items: Vec<Value> = matching
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        return Json(items).into_response();
    }

    if wp.fail_taxonomy.as_deref() == Some(resource.as_str()) {
        return server_error("taxonomy unavailable");
    }
    wp.term_searches += 1;
    let search = query.get("search").cloned().unwrap_or_default().to_lowercase();
    let terms: Vec<Value> = wp
        .terms
        .get(&resource)
        .into_iter()
        .flatten()
        .filter(|(_, name)| name.to_lowercase().contains(&search))
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    Json(terms).into_response()
}

async fn create_resource(
    State(state): State<Shared>,
    Path(resource): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut wp = state.lock().unwrap();

    match resource.as_str() {
        "posts" => {
            if wp.reject_creates {
                return server_error("cannot create post");
            }
            let payload: Value = serde_json::from_slice(&body).unwrap();
            let id = wp.allocate_id();
            wp.posts.insert(
                id,
                FakePost {
                    title: payload["title"].as_str().unwrap_or_default().to_string(),
                    status: payload["status"].as_str().unwrap_or("draft").to_string(),
                    meta: payload["meta"].as_object().cloned().unwrap_or_default(),
                    ..Default::default()
                },
            );
            (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
        }
        "media" => {
            let disposition = headers
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let file_name = disposition
                .split("filename=\"")
                .nth(1)
                .unwrap_or_default()
                .trim_end_matches('"')
                .to_string();
            let id = wp.allocate_id();
            wp.media.push(FakeMedia {
                id,
                file_name,
                parent: query.get("post").and_then(|v| v.parse().ok()),
            });
            (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
        }
        taxonomy => {
            if wp.fail_taxonomy.as_deref() == Some(taxonomy) {
                return server_error("taxonomy unavailable");
            }
            let payload: Value = serde_json::from_slice(&body).unwrap();
            let name = payload["name"].as_str().unwrap_or_default().to_string();
            let id = wp.allocate_id();
            wp.terms
                .entry(taxonomy.to_string())
                .or_default()
                .push((id, name.clone()));
            (StatusCode::CREATED, Json(json!({ "id": id, "name": name }))).into_response()
        }
    }
}

async fn update_post(
    State(state): State<Shared>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut wp = state.lock().unwrap();
    let Some(post) = wp.posts.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    for (key, value) in body.as_object().cloned().unwrap_or_default() {
        match key.as_str() {
            "title" => post.title = value.as_str().unwrap_or_default().to_string(),
            "status" => post.status = value.as_str().unwrap_or_default().to_string(),
            "featured_media" => post.featured_media = value.as_u64(),
            "meta" => {
                for (meta_key, meta_value) in value.as_object().cloned().unwrap_or_default() {
                    post.meta.insert(meta_key, meta_value);
                }
            }
            "content" | "type" => {}
            taxonomy => {
                let ids = value
                    .as_array()
                    .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
                    .unwrap_or_default();
                post.taxonomies.insert(taxonomy.to_string(), ids);
            }
        }
    }
    Json(post_json(id, post)).into_response()
}

async fn serve_image(Path(name): Path<String>) -> Response {
    if name.starts_with("missing") {
        return StatusCode::NOT_FOUND.into_response();
    }
    ([(header::CONTENT_TYPE, "image/png")], vec![0x89u8, b'P', b'N', b'G']).into_response()
}

async fn start_fake() -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(FakeWp::default()));
    let app = Router::new()
        .route(
            "/wp-json/wp/v2/{resource}",
            get(list_resource).post(create_resource),
        )
        .route("/wp-json/wp/v2/posts/{id}", post(update_post))
        .route("/images/{name}", get(serve_image))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn client(base_url: &str) -> WordPressClient {
    let images = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
    })
    .unwrap();
    WordPressClient::new(
        BackendConfig {
            base_url: format!("{base_url}/"),
            username: "importer".into(),
            password: "secret".into(),
            post_type: "real-estate".into(),
            timeout: Duration::from_secs(5),
            vocabulary: TaxonomyVocabulary::default(),
        },
        images,
    )
    .unwrap()
}

fn listing(external_id: &str, title: &str) -> PropertyRecord {
    PropertyRecord {
        external_id: external_id.into(),
        title: title.into(),
        description: "Amplio y bien ubicado".into(),
        price: "350000000".into(),
        property_type: "apartment".into(),
        offer: OfferKind::Sale,
        latitude: "4.65".into(),
        longitude: "-74.05".into(),
        amenities: vec!["Piscina".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn repeated_upsert_updates_one_post() {
    let (base, state) = start_fake().await;
    let backend = client(&base);

    let mut record = listing("C21-1", "First title");
    let first = backend.upsert(&record).await.unwrap();
    record.title = "Second title".into();
    let second = backend.upsert(&record).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.post_id, second.post_id);

    let wp = state.lock().unwrap();
    let posts = wp.posts_with_external_id("C21-1");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].1.title, "Second title");
    assert_eq!(posts[0].1.status, "publish");
    assert_eq!(posts[0].1.meta["property_location"], json!("4.65, -74.05"));
}

#[tokio::test]
async fn upsert_assigns_terms_and_caches_them_per_run() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    backend.begin_run().await;

    let first = backend.upsert(&listing("A", "One")).await.unwrap();
    backend.upsert(&listing("B", "Two")).await.unwrap();
    assert!(first.taxonomy_failures.is_empty());

    {
        let wp = state.lock().unwrap();
        assert_eq!(wp.term_searches, 4);
        assert_eq!(wp.terms["property-type"].len(), 1);
        assert_eq!(wp.terms["property-type"][0].1, "Apartamento");
        let type_term = wp.terms["property-type"][0].0;
        let post = &wp.posts[&first.post_id];
        assert_eq!(post.taxonomies["property-type"], vec![type_term]);
        assert_eq!(post.taxonomies["amenity"].len(), 1);
        assert_eq!(wp.terms["property-status"][0].1, "Venta");
        assert_eq!(wp.terms["property-label"][0].1, "Usado");
    }

    backend.begin_run().await;
    backend.upsert(&listing("A", "One again")).await.unwrap();
    let wp = state.lock().unwrap();
    assert_eq!(wp.term_searches, 8);
    assert_eq!(wp.terms["property-type"].len(), 1);
}

#[tokio::test]
async fn taxonomy_failure_does_not_fail_upsert() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    state.lock().unwrap().fail_taxonomy = Some("amenity".into());

    let outcome = backend.upsert(&listing("T-1", "Con piscina")).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.taxonomy_failures.len(), 1);
    assert!(matches!(
        &outcome.taxonomy_failures[0],
        TaxonomyError::Resolve { taxonomy, .. } if taxonomy == "amenity"
    ));

    let wp = state.lock().unwrap();
    let post = &wp.posts[&outcome.post_id];
    assert!(post.taxonomies.contains_key("property-type"));
    assert!(!post.taxonomies.contains_key("amenity"));
}

#[tokio::test]
async fn blank_property_type_creates_no_type_term() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    let mut record = listing("T-0", "Sin tipo");
    record.property_type = String::new();

    let outcome = backend.upsert(&record).await.unwrap();
    assert!(outcome.taxonomy_failures.is_empty());

    let wp = state.lock().unwrap();
    let post = &wp.posts[&outcome.post_id];
    assert!(!post.taxonomies.contains_key("property-type"));
    assert!(post.taxonomies.contains_key("property-status"));
    assert!(post.taxonomies.contains_key("property-label"));
    assert!(wp.terms.get("property-type").map_or(true, Vec::is_empty));
}

#[tokio::test]
async fn rejected_create_is_an_upsert_error() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    state.lock().unwrap().reject_creates = true;

    let err = backend.upsert(&listing("R-1", "Rejected")).await.unwrap_err();
    assert_eq!(err.external_id, "R-1");
    assert!(state.lock().unwrap().posts.is_empty());
}

#[tokio::test]
async fn failed_lookup_is_lossy_for_find_but_strict_for_upsert() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    state.lock().unwrap().seed(Some("L-1"), "publish");
    state.lock().unwrap().fail_lookup = true;

    assert!(backend.find_by_external_id("L-1").await.is_none());
    assert!(backend.upsert(&listing("L-1", "Retry later")).await.is_err());
    assert_eq!(state.lock().unwrap().posts_with_external_id("L-1").len(), 1);

    state.lock().unwrap().fail_lookup = false;
    let found = backend.find_by_external_id("L-1").await.unwrap();
    assert_eq!(found.external_id().as_deref(), Some("L-1"));
}

#[tokio::test]
async fn unfiltered_lookup_never_adopts_another_listing() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    let other = state.lock().unwrap().seed(Some("OTHER"), "publish");
    state.lock().unwrap().unfiltered_lookup = true;

    let outcome = backend.upsert(&listing("NEW", "Fresh listing")).await.unwrap();
    assert!(outcome.created);
    assert_ne!(outcome.post_id, other);

    let wp = state.lock().unwrap();
    assert_eq!(wp.posts.len(), 2);
    assert_eq!(wp.posts[&other].title, format!("seeded {other}"));
    assert_eq!(wp.posts_with_external_id("OTHER").len(), 1);
}

#[tokio::test]
async fn failed_image_is_skipped_and_first_success_is_featured() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    let post_id = backend.upsert(&listing("M-1", "Fotos")).await.unwrap().post_id;

    let urls = vec![
        format!("{base}/images/front.png"),
        format!("{base}/images/missing.png"),
        format!("{base}/images/garden.png?size=large"),
    ];
    let report = backend.attach_images(post_id, &urls).await;

    assert_eq!(report.attachment_ids.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(&report.failures[0], MediaError::Download { url, .. } if url.ends_with("missing.png")));

    let wp = state.lock().unwrap();
    let names: Vec<_> = report
        .attachment_ids
        .iter()
        .map(|id| wp.media.iter().find(|m| m.id == *id).unwrap().file_name.clone())
        .collect();
    assert_eq!(names, ["front.png", "garden.png"]);
    assert!(wp.media.iter().all(|m| m.parent == Some(post_id)));

    let post = &wp.posts[&post_id];
    assert_eq!(post.featured_media, Some(report.attachment_ids[0]));
    assert_eq!(post.meta["tf_gallery_images"], json!(report.attachment_ids));
    assert_eq!(
        post.meta["gallery_images"],
        json!(json!(report.attachment_ids).to_string())
    );
}

#[tokio::test]
async fn all_images_failing_leaves_post_untouched() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    let post_id = backend.upsert(&listing("M-2", "Sin fotos")).await.unwrap().post_id;

    let report = backend
        .attach_images(post_id, &[format!("{base}/images/missing-1.jpg")])
        .await;
    assert!(report.attachment_ids.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(state.lock().unwrap().posts[&post_id].featured_media, None);
}

#[tokio::test]
async fn archive_only_touches_posts_missing_from_feed() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    {
        let mut wp = state.lock().unwrap();
        wp.seed(Some("A"), "publish");
        wp.seed(Some("B"), "publish");
        wp.seed(Some("C"), "publish");
        wp.seed(Some("D"), "draft");
        wp.seed(None, "publish");
    }

    let current: HashSet<String> = ["A", "C"].into_iter().map(String::from).collect();
    let archived = backend.archive_stale(&current).await.unwrap();
    assert_eq!(archived, 1);

    let wp = state.lock().unwrap();
    assert_eq!(wp.status_of("A"), "publish");
    assert_eq!(wp.status_of("B"), "draft");
    assert_eq!(wp.status_of("C"), "publish");
    assert_eq!(wp.status_of("D"), "draft");
    assert!(wp
        .posts
        .values()
        .any(|p| p.meta.is_empty() && p.status == "publish"));
}

#[tokio::test]
async fn archive_walks_every_page() {
    for total in [150usize, 100] {
        let (base, state) = start_fake().await;
        let backend = client(&base);
        let ids: Vec<String> = (0..total).map(|i| format!("P-{i}")).collect();
        {
            let mut wp = state.lock().unwrap();
            for id in &ids {
                wp.seed(Some(id), "publish");
            }
        }

        let stale = [ids[7].clone(), ids[total - 1].clone()];
        let current: HashSet<String> = ids.iter().filter(|id| !stale.contains(id)).cloned().collect();
        let archived = backend.archive_stale(&current).await.unwrap();

        assert_eq!(archived, 2, "total={total}");
        let wp = state.lock().unwrap();
        assert_eq!(wp.status_of(&stale[1]), "draft");
    }
}

#[tokio::test]
async fn archive_listing_failure_is_an_archive_error() {
    let (base, state) = start_fake().await;
    let backend = client(&base);
    {
        let mut wp = state.lock().unwrap();
        wp.seed(Some("A"), "publish");
        wp.fail_listing = true;
    }

    assert!(backend.archive_stale(&HashSet::new()).await.is_err());
    assert_eq!(state.lock().unwrap().status_of("A"), "publish");
}
