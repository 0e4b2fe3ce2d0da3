//! Per-call metadata (request headers).
//!
//! [`CallMetadata`] is an insertion-ordered header map built fresh for every
//! call. [`HeaderBuilder`] assembles it from a caller-supplied base, routing
//! directives and session properties with last-write-wins semantics.

use crate::connection::properties::SessionProperty;
use std::fmt;
use tracing::debug;

/// Header carrying the default schema path.
pub const SCHEMA_HEADER: &str = "schema";
/// Header carrying the routing tag.
pub const ROUTING_TAG_HEADER: &str = "routing_tag";
/// Header carrying the routing queue.
pub const ROUTING_QUEUE_HEADER: &str = "routing_queue";
/// Header carrying the routing engine.
pub const ROUTING_ENGINE_HEADER: &str = "routing_engine";
/// Authorization header.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Insertion-ordered mapping from header name to value.
///
/// Header names are case-insensitive and stored lower-cased. Inserting an
/// existing name replaces its value in place.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    entries: Vec<(String, String)>,
}

impl CallMetadata {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, returning the value it replaced.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();

        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Get a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove a header.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(pos).1)
    }

    /// Check whether a header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every header of `other` into this mapping, overwriting duplicates.
    pub fn merge(&mut self, other: &CallMetadata) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }
}

impl<K, V> FromIterator<(K, V)> for CallMetadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = CallMetadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

// Authorization values are never printed.
impl fmt::Debug for CallMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            if k == AUTHORIZATION_HEADER {
                map.entry(&k, &"<redacted>");
            } else {
                map.entry(&k, &v);
            }
        }
        map.finish()
    }
}

/// A named hint steering server-side query placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDirective {
    /// Default schema path for unqualified object names
    DefaultSchema(String),
    /// Routing tag
    RoutingTag(String),
    /// Routing queue
    RoutingQueue(String),
    /// Routing engine
    RoutingEngine(String),
}

impl RoutingDirective {
    /// Header name this directive is sent under.
    pub fn header_name(&self) -> &'static str {
        match self {
            RoutingDirective::DefaultSchema(_) => SCHEMA_HEADER,
            RoutingDirective::RoutingTag(_) => ROUTING_TAG_HEADER,
            RoutingDirective::RoutingQueue(_) => ROUTING_QUEUE_HEADER,
            RoutingDirective::RoutingEngine(_) => ROUTING_ENGINE_HEADER,
        }
    }

    /// Header value.
    pub fn value(&self) -> &str {
        match self {
            RoutingDirective::DefaultSchema(v)
            | RoutingDirective::RoutingTag(v)
            | RoutingDirective::RoutingQueue(v)
            | RoutingDirective::RoutingEngine(v) => v,
        }
    }
}

/// Builder assembling [`CallMetadata`] for a call.
///
/// The base metadata is copied first, then routing directives, then session
/// properties, each in the order they were added.
///
/// ```
/// use adhoc_flight::query::HeaderBuilder;
///
/// let metadata = HeaderBuilder::new()
///     .default_schema("$scratch")
///     .routing_tag("test-routing-tag")
///     .routing_queue("Low Cost User Queries")
///     .build();
///
/// assert_eq!(metadata.get("schema"), Some("$scratch"));
/// assert_eq!(metadata.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeaderBuilder {
    base: Option<CallMetadata>,
    directives: Vec<RoutingDirective>,
    properties: Vec<SessionProperty>,
}

impl HeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a copy of caller-supplied metadata.
    pub fn base(mut self, base: &CallMetadata) -> Self {
        self.base = Some(base.clone());
        self
    }

    /// Add a routing directive.
    pub fn directive(mut self, directive: RoutingDirective) -> Self {
        self.directives.push(directive);
        self
    }

    /// Set the default schema path.
    pub fn default_schema(self, schema: impl Into<String>) -> Self {
        self.directive(RoutingDirective::DefaultSchema(schema.into()))
    }

    /// Set the routing tag.
    pub fn routing_tag(self, tag: impl Into<String>) -> Self {
        self.directive(RoutingDirective::RoutingTag(tag.into()))
    }

    /// Set the routing queue.
    pub fn routing_queue(self, queue: impl Into<String>) -> Self {
        self.directive(RoutingDirective::RoutingQueue(queue.into()))
    }

    /// Set the routing engine.
    pub fn routing_engine(self, engine: impl Into<String>) -> Self {
        self.directive(RoutingDirective::RoutingEngine(engine.into()))
    }

    /// Add a session property.
    pub fn property(mut self, property: SessionProperty) -> Self {
        self.properties.push(property);
        self
    }

    /// Add session properties in order.
    pub fn properties<I>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = SessionProperty>,
    {
        self.properties.extend(properties);
        self
    }

    /// Build the metadata mapping.
    pub fn build(self) -> CallMetadata {
        let mut metadata = self.base.unwrap_or_default();

        for directive in &self.directives {
            insert_logged(&mut metadata, directive.header_name(), directive.value());
        }
        for property in &self.properties {
            insert_logged(&mut metadata, property.key(), property.value());
        }

        metadata
    }
}

fn insert_logged(metadata: &mut CallMetadata, name: &str, value: &str) {
    if metadata.insert(name, value).is_some() {
        debug!(header = name, "Overwriting call header");
    }
}
