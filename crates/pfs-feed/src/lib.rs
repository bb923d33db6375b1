//! Listing feed parsing + the feed source contract used by the sync pipeline.

use async_trait::async_trait;
use chrono::Utc;
use pfs_core::{OfferKind, PropertyRecord};
use pfs_storage::{FeedSnapshotStore, FetchError, HttpFetcher};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pfs-feed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed feed near byte {position}: {message}")]
pub struct ParseError {
    pub position: u64,
    pub message: String,
}

impl ParseError {
    fn new(position: u64, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("feed parse failed: {0}")]
    Parse(#[from] ParseError),
}

/// Where the sync pipeline gets its listings from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn location(&self) -> &str;

    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, FeedError>;
}

/// Feed served over HTTP, optionally archiving every body it fetches.
pub struct HttpFeedSource {
    url: String,
    http: HttpFetcher,
    snapshots: Option<FeedSnapshotStore>,
}

impl HttpFeedSource {
    pub fn new(url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            url: url.into(),
            http,
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, store: FeedSnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    fn location(&self) -> &str {
        &self.url
    }

    async fn fetch_records(&self) -> Result<Vec<PropertyRecord>, FeedError> {
        let fetched_at = Utc::now();
        let resp = self.http.fetch_bytes(&self.url).await?;

        if let Some(store) = &self.snapshots {
            match store.store(fetched_at, &resp.body).await {
                Ok(stored) => info!(
                    path = %stored.absolute_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived feed snapshot"
                ),
                Err(err) => warn!("could not archive feed snapshot: {err:#}"),
            }
        }

        let records = parse_feed(&resp.body)?;
        info!(count = records.len(), bytes = resp.body.len(), "parsed feed");
        Ok(records)
    }
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First element named `name` below this one, in document order.
    fn first_descendant(&self, name: &str) -> Option<&Element> {
        for child in self.child_elements() {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.first_descendant(name) {
                return Some(found);
            }
        }
        None
    }

    fn collect_descendants<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in self.child_elements() {
            if child.name == name {
                out.push(child);
            }
            child.collect_descendants(name, out);
        }
    }

    fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut out = Vec::new();
        self.collect_descendants(name, &mut out);
        out
    }

    fn text_content(&self) -> String {
        let mut out = String::new();
        self.push_text(&mut out);
        out
    }

    fn push_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) => el.push_text(out),
            }
        }
    }
}

fn reader_position<R>(reader: &Reader<R>) -> u64 {
    reader.buffer_position() as u64
}

fn open_element<R>(start: &BytesStart<'_>, reader: &Reader<R>) -> Result<Element, ParseError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParseError::new(reader_position(reader), e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ParseError::new(reader_position(reader), e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
    position: u64,
) -> Result<(), ParseError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(Node::Element(element));
        Ok(())
    } else if root.is_none() {
        *root = Some(element);
        Ok(())
    } else {
        Err(ParseError::new(position, "document has more than one root element"))
    }
}

fn push_text(stack: &mut [Element], text: String, position: u64) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Text(text));
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(ParseError::new(position, "text outside the root element")),
    }
}

fn parse_document(bytes: &[u8]) -> Result<Element, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::new(reader_position(&reader), e.to_string()))?;
        let position = reader_position(&reader);
        match event {
            Event::Start(start) => stack.push(open_element(&start, &reader)?),
            Event::Empty(start) => {
                let element = open_element(&start, &reader)?;
                attach(&mut stack, &mut root, element, position)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ParseError::new(position, "closing tag without an open element"))?;
                attach(&mut stack, &mut root, element, position)?;
            }
            Event::Text(text) => {
                // Unknown entities (e.g. HTML's &nbsp;) keep their raw form.
                let decoded = match text.unescape() {
                    Ok(value) => value.into_owned(),
                    Err(_) => String::from_utf8_lossy(&text).into_owned(),
                };
                push_text(&mut stack, decoded, position)?;
            }
            Event::CData(cdata) => {
                push_text(&mut stack, String::from_utf8_lossy(&cdata).into_owned(), position)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::new(
            reader_position(&reader),
            format!("unexpected end of document inside <{}>", open.name),
        ));
    }
    root.ok_or_else(|| ParseError::new(0, "document has no root element"))
}

fn text_of(listing: &Element, tag: &str) -> String {
    listing
        .first_descendant(tag)
        .map(|el| el.text_content().trim().to_string())
        .unwrap_or_default()
}

fn nested_text_of(listing: &Element, parent: &str, child: &str) -> String {
    listing
        .first_descendant(parent)
        .map(|p| text_of(p, child))
        .unwrap_or_default()
}

fn list_of(listing: &Element, container: &str, item: &str) -> Vec<String> {
    let Some(container) = listing.first_descendant(container) else {
        return Vec::new();
    };
    container
        .descendants(item)
        .into_iter()
        .map(|el| el.text_content().trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn listing_to_record(listing: &Element) -> Option<PropertyRecord> {
    let external_id = text_of(listing, "reference_id");
    if external_id.is_empty() {
        return None;
    }

    let operation = listing
        .first_descendant("price")
        .and_then(|price| price.attribute("operation"));

    Some(PropertyRecord {
        external_id,
        title: text_of(listing, "title"),
        description: text_of(listing, "description"),
        price: text_of(listing, "price"),
        bedrooms: text_of(listing, "bedrooms"),
        bathrooms: text_of(listing, "bathrooms"),
        floor_area: text_of(listing, "floorArea"),
        plot_area: text_of(listing, "plotArea"),
        floor: text_of(listing, "floor"),
        fee: text_of(listing, "communityFeesPrice"),
        property_type: text_of(listing, "propertyType"),
        offer: OfferKind::from_operation(operation),
        address: text_of(listing, "address"),
        postal_code: text_of(listing, "postalCode"),
        latitude: text_of(listing, "latitude"),
        longitude: text_of(listing, "longitude"),
        agent_name: nested_text_of(listing, "contact", "name"),
        agent_email: nested_text_of(listing, "contact", "email"),
        agent_phone: nested_text_of(listing, "contact", "phone"),
        amenities: list_of(listing, "amenities", "amenity"),
        images: list_of(listing, "pictures", "url"),
    })
}

/// Parse a listing feed into records, in document order.
///
/// Listings without a `reference_id` are skipped. Any syntax error fails the
/// whole document.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<PropertyRecord>, ParseError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::new(0, "feed document is empty"));
    }
    let root = parse_document(bytes)?;

    let mut listings = Vec::new();
    if root.name == "listing" {
        listings.push(&root);
    }
    root.collect_descendants("listing", &mut listings);

    Ok(listings.into_iter().filter_map(listing_to_record).collect())
}
