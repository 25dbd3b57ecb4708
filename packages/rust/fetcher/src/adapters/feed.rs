//! RSS 2.0 / RSS 1.0 / Atom feed adapter.

use biothreat_shared::{DocumentCandidate, ForecastError, Result, Source, SourceKind};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use url::Url;

use super::{SourceAdapter, clean_text, collapse_whitespace, external_id, parse_date};

/// Reads RSS or Atom documents served at the source endpoint.
pub struct FeedAdapter;

impl SourceAdapter for FeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn request_url(&self, source: &Source, _max_items: usize) -> Result<Url> {
        Url::parse(source.endpoint.trim()).map_err(|e| {
            ForecastError::validation(format!("invalid feed URL '{}': {e}", source.endpoint))
        })
    }

    fn parse(&self, body: &str) -> Result<Vec<DocumentCandidate>> {
        Ok(parse_feed(body)?
            .into_iter()
            .filter_map(FeedEntry::into_candidate)
            .collect())
    }

    fn name(&self) -> &str {
        "feed"
    }
}

/// One `<item>` or `<entry>` as read from the XML.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    pub id: Option<String>,
    pub title: String,
    pub link: Option<String>,
    /// Raw summary/description/content (may contain HTML).
    pub summary: String,
    pub authors: Vec<String>,
    pub published: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// Entries without a title are dropped.
    pub(crate) fn into_candidate(self) -> Option<DocumentCandidate> {
        let title = collapse_whitespace(&self.title);
        if title.is_empty() {
            return None;
        }
        let body = clean_text(&self.summary);
        Some(DocumentCandidate {
            external_id: external_id(self.id.as_deref(), self.link.as_deref(), &title),
            body: if body.is_empty() { title.clone() } else { body },
            title,
            url: self.link,
            authors: (!self.authors.is_empty()).then(|| self.authors.join(", ")),
            published_at: self.published,
        })
    }
}

/// Text-bearing fields inside an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Id,
    Title,
    Link,
    Summary,
    Content,
    Author,
    Published,
    Updated,
}

fn field_for(name: &[u8], parent_is_entry: bool, parent: &[u8]) -> Option<Field> {
    if !parent_is_entry {
        // Atom <author><name>
        return (parent == b"author" && name == b"name").then_some(Field::Author);
    }
    Some(match name {
        b"guid" | b"id" => Field::Id,
        b"title" => Field::Title,
        b"link" => Field::Link,
        b"description" | b"summary" => Field::Summary,
        b"encoded" | b"content" => Field::Content,
        b"creator" | b"author" => Field::Author,
        b"pubDate" | b"published" | b"date" => Field::Published,
        b"updated" => Field::Updated,
        _ => return None,
    })
}

/// Parse an RSS or Atom document into entries, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut saw_root = false;
    let mut entries = Vec::new();

    // Entry under construction and the stack depth of its element
    let mut current: Option<(FeedEntry, usize)> = None;
    let mut content = String::new();
    let mut updated: Option<DateTime<Utc>> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.local_name().as_ref().to_vec();
                if stack.is_empty() {
                    check_root(&name)?;
                    saw_root = true;
                }
                if current.is_none() && (name == b"item" || name == b"entry") {
                    current = Some((FeedEntry::default(), stack.len()));
                    content.clear();
                    updated = None;
                } else if let Some((entry, depth)) = current.as_mut() {
                    let parent = stack.last().map(Vec::as_slice).unwrap_or_default();
                    field = field_for(&name, stack.len() == *depth + 1, parent);
                    if field == Some(Field::Link) {
                        take_atom_link(entry, e);
                    }
                    text.clear();
                }
                stack.push(name);
            }
            Ok(Event::Empty(ref e)) => {
                if stack.is_empty() {
                    check_root(e.local_name().as_ref())?;
                    saw_root = true;
                }
                if let Some((entry, depth)) = current.as_mut() {
                    if stack.len() == *depth + 1 && e.local_name().as_ref() == b"link" {
                        take_atom_link(entry, e);
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                if field.is_some() {
                    match e.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(_) => text.push_str(&String::from_utf8_lossy(e)),
                    }
                }
            }
            Ok(Event::CData(ref e)) => {
                if field.is_some() {
                    text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
                let closes_entry = current
                    .as_ref()
                    .is_some_and(|(_, depth)| *depth == stack.len());

                if closes_entry {
                    if let Some((mut entry, _)) = current.take() {
                        if entry.summary.trim().is_empty() {
                            entry.summary = std::mem::take(&mut content);
                        }
                        if entry.published.is_none() {
                            entry.published = updated;
                        }
                        entries.push(entry);
                    }
                    field = None;
                } else if let (Some(f), Some((entry, _))) = (field, current.as_mut()) {
                    let value = std::mem::take(&mut text);
                    apply_field(entry, f, value, &mut content, &mut updated);
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ForecastError::parse(format!(
                    "malformed feed XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ForecastError::parse("empty feed document"));
    }
    Ok(entries)
}

fn check_root(name: &[u8]) -> Result<()> {
    match name {
        b"rss" | b"feed" | b"RDF" => Ok(()),
        other => Err(ForecastError::parse(format!(
            "not an RSS or Atom document (root <{}>)",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn apply_field(
    entry: &mut FeedEntry,
    field: Field,
    value: String,
    content: &mut String,
    updated: &mut Option<DateTime<Utc>>,
) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return;
    }
    match field {
        Field::Id => entry.id = Some(trimmed.to_string()),
        Field::Title => entry.title = trimmed.to_string(),
        Field::Link => {
            if entry.link.is_none() {
                entry.link = Some(trimmed.to_string());
            }
        }
        Field::Summary => entry.summary = value,
        Field::Content => *content = value,
        Field::Author => entry.authors.push(collapse_whitespace(trimmed)),
        Field::Published => entry.published = parse_date(trimmed),
        Field::Updated => *updated = parse_date(trimmed),
    }
}

/// Atom links carry the URL in `href`; prefer `rel="alternate"` (or no rel).
fn take_atom_link(entry: &mut FeedEntry, e: &BytesStart<'_>) {
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_default();
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value),
            b"rel" => rel = Some(value),
            _ => {}
        }
    }
    if let Some(href) = href {
        let alternate = rel.as_deref().is_none_or(|r| r == "alternate");
        if alternate && entry.link.is_none() {
            entry.link = Some(href);
        }
    }
}
