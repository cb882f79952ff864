use super::artifact::{LayoutNode, SourceDescriptor};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Fields are length-prefixed so that ("ab", "c") and ("a", "bc") differ
fn feed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Same artifact version, same hash
pub fn identity_hash(descriptor: &SourceDescriptor) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, b"identity");
    feed(&mut hasher, descriptor.name.as_bytes());
    feed(&mut hasher, descriptor.revision.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of the tree's shape: node kinds and sorted state-key names,
/// recursively. Literal content and properties are ignored.
pub fn structural_hash(root: &LayoutNode) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, b"structure");
    feed_node(&mut hasher, root);
    hex::encode(hasher.finalize())
}

fn feed_node(hasher: &mut Sha256, node: &LayoutNode) {
    feed(hasher, node.kind.as_bytes());

    let keys: BTreeSet<&str> = node.state_keys.iter().map(String::as_str).collect();
    hasher.update((keys.len() as u64).to_be_bytes());
    for key in keys {
        feed(hasher, key.as_bytes());
    }

    hasher.update((node.children.len() as u64).to_be_bytes());
    for child in &node.children {
        feed_node(hasher, child);
    }
}
