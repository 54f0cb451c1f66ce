//! Naming and URL map primitives shared by every pool

pub mod namer;
pub mod urlmap;

pub use namer::{truncate, Namer, CLUSTER_NAME_DELIMITER, NAME_LEN_LIMIT};
pub use urlmap::{UrlMap, ANY_HOST, ANY_PATH, DEFAULT_BACKEND_KEY};

/// True when two self links name the same resource. Empty links never match.
pub fn compare_links(a: &str, b: &str) -> bool {
    !a.is_empty() && a == b
}

/// Last path segment of a resource link (`.../instances/n1` -> `n1`).
pub fn link_name(link: &str) -> &str {
    link.rsplit('/').next().unwrap_or(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_links() {
        assert!(compare_links("global/urlMaps/a", "global/urlMaps/a"));
        assert!(!compare_links("global/urlMaps/a", "global/urlMaps/b"));
        assert!(!compare_links("", ""));
    }

    #[test]
    fn test_link_name() {
        assert_eq!(
            link_name("https://compute.googleapis.com/compute/v1/projects/p/zones/z/instances/n1"),
            "n1"
        );
        assert_eq!(link_name("n2"), "n2");
    }
}
