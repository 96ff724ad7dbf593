//! Tree validation at the open/write/update boundaries.
//!
//! Validation is up-front: a tree is checked before any payload work is
//! attempted, and a violation list (not just the first failure) comes
//! back so callers can report everything at once.  The built-in
//! [`StructuralValidator`] covers what the container itself requires of
//! array nodes; richer schema validators plug in through the same trait.

use crate::error::{AsdfError, Result};
use crate::tree::Node;

/// One failed check, anchored to a tree path like `a.b[3]`.
#[derive(Debug, Clone)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub trait Validator {
    fn validate(&self, tree: &Node) -> Vec<Violation>;
}

/// Checks the structural demands the block layer places on array nodes.
pub struct StructuralValidator;

impl Validator for StructuralValidator {
    fn validate(&self, tree: &Node) -> Vec<Violation> {
        let mut violations = Vec::new();
        walk(tree, "$", &mut violations);
        violations
    }
}

fn walk(node: &Node, path: &str, violations: &mut Vec<Violation>) {
    match node {
        Node::Array(array) => {
            if array.streamed {
                if array.shape.is_empty() {
                    violations.push(Violation {
                        path: path.to_string(),
                        message: "streamed array with empty shape".into(),
                    });
                }
                return;
            }
            let expected: u64 =
                array.shape.iter().product::<u64>() * array.dtype.size() as u64;
            // Only memory-backed arrays can be checked without touching
            // the file; block-backed lengths are enforced at load time.
            if let crate::tree::ArraySource::Memory(bytes) = array.source() {
                if bytes.len() as u64 != expected {
                    violations.push(Violation {
                        path: path.to_string(),
                        message: format!(
                            "array of shape {:?} and type {} needs {expected} bytes, has {}",
                            array.shape,
                            array.dtype.name(),
                            bytes.len()
                        ),
                    });
                }
            }
        }
        Node::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{path}[{i}]"), violations);
            }
        }
        Node::Mapping(entries) => {
            for (key, value) in entries {
                walk(value, &format!("{path}.{key}"), violations);
            }
        }
        Node::Tagged(_, inner) => walk(inner, path, violations),
        _ => {}
    }
}

/// Run the structural validator and fail on the first batch of
/// violations.
pub fn validate_tree(tree: &Node) -> Result<()> {
    let violations = StructuralValidator.validate(tree);
    if violations.is_empty() {
        return Ok(());
    }
    let summary = violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Err(AsdfError::Validation(summary))
}
