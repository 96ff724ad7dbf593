//! Converter registry for custom tags.
//!
//! A [`Converter`] owns one YAML tag and translates between the tag's
//! serialized form and whatever richer node shape the application wants in
//! the tree.  The registry is process-wide and read-mostly: register
//! everything before opening files.  Each `AsdfFile` captures a
//! [`snapshot`] of the registry when it is created and runs every
//! conversion against that snapshot, so later registrations never change
//! the behavior of an already-open file.
//!
//! Tags without a converter are not an error; their nodes round-trip
//! untouched as [`Node::Tagged`].

use std::sync::{Arc, OnceLock, RwLock};

use crate::error::Result;
use crate::tree::Node;

pub trait Converter: Send + Sync {
    /// The tag this converter owns, without the leading `!`.
    fn tag(&self) -> &str;
    /// Serialize: application node → YAML-native node (the body written
    /// under the tag).
    fn to_tree(&self, node: &Node) -> Result<Node>;
    /// Deserialize: YAML-native node → application node.
    fn from_tree(&self, node: &Node) -> Result<Node>;
}

fn registry() -> &'static RwLock<Vec<Arc<dyn Converter>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<dyn Converter>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

/// Register a converter process-wide.  Later registrations win for a
/// repeated tag.
pub fn register_converter(converter: Arc<dyn Converter>) {
    registry()
        .write()
        .expect("converter registry poisoned")
        .push(converter);
}

/// Capture the registered converters as of now.  `AsdfFile` holds one of
/// these per instance.
pub fn snapshot() -> Vec<Arc<dyn Converter>> {
    registry()
        .read()
        .expect("converter registry poisoned")
        .clone()
}

/// The converter owning `tag` within a snapshot, if any.
pub fn converter_for_tag<'a>(
    converters: &'a [Arc<dyn Converter>],
    tag: &str,
) -> Option<&'a Arc<dyn Converter>> {
    converters.iter().rev().find(|c| c.tag() == tag)
}

/// Registered tags, for diagnostics.
pub fn converter_tags() -> Vec<String> {
    registry()
        .read()
        .expect("converter registry poisoned")
        .iter()
        .map(|c| c.tag().to_string())
        .collect()
}

/// Apply `from_tree` converters to every tagged node, bottom-up.
pub fn apply_from_tree(node: Node, converters: &[Arc<dyn Converter>]) -> Result<Node> {
    transform(node, &|tag, inner| match converter_for_tag(converters, tag) {
        Some(converter) => converter.from_tree(&inner),
        None => Ok(Node::Tagged(tag.to_string(), Box::new(inner))),
    })
}

/// Apply `to_tree` converters to every tagged node, bottom-up.
pub fn apply_to_tree(node: Node, converters: &[Arc<dyn Converter>]) -> Result<Node> {
    transform(node, &|tag, inner| match converter_for_tag(converters, tag) {
        Some(converter) => {
            let body = converter.to_tree(&inner)?;
            Ok(Node::Tagged(tag.to_string(), Box::new(body)))
        }
        None => Ok(Node::Tagged(tag.to_string(), Box::new(inner))),
    })
}

fn transform(
    node: Node,
    on_tagged: &dyn Fn(&str, Node) -> Result<Node>,
) -> Result<Node> {
    Ok(match node {
        Node::Sequence(items) => Node::Sequence(
            items
                .into_iter()
                .map(|item| transform(item, on_tagged))
                .collect::<Result<_>>()?,
        ),
        Node::Mapping(entries) => Node::Mapping(
            entries
                .into_iter()
                .map(|(key, value)| Ok((key, transform(value, on_tagged)?)))
                .collect::<Result<_>>()?,
        ),
        Node::Tagged(tag, inner) => {
            let inner = transform(*inner, on_tagged)?;
            on_tagged(&tag, inner)?
        }
        other => other,
    })
}
