//! Submesh partitions
//!
//! A submesh is a named access-control partition. Edges are only flooded
//! to connections whose peer node is in the core mesh or shares a submesh
//! with one of the edge's endpoints, so nodes in different submeshes never
//! learn that each other exist.

/// Wire and config spelling of "no submesh".
pub const CORE_MESH: &str = "core";

/// Whether a node may see state scoped to the given submesh. Core-mesh
/// nodes see everything; submesh nodes only see their own partition.
pub fn submesh_allows_node(submesh: Option<&str>, node_submesh: Option<&str>) -> bool {
    match (submesh, node_submesh) {
        (_, None) => true,
        (None, _) => true,
        (Some(s), Some(n)) => s == n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_sees_everything() {
        assert!(submesh_allows_node(Some("red"), None));
        assert!(submesh_allows_node(None, None));
    }

    #[test]
    fn test_submesh_isolation() {
        assert!(submesh_allows_node(Some("red"), Some("red")));
        assert!(!submesh_allows_node(Some("red"), Some("blue")));
        assert!(submesh_allows_node(None, Some("blue")));
    }
}
