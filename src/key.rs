//! Flat-key to backend-path codec.
//!
//! Configuration keys are flat, dot-separated identifiers with list
//! indices written `[n]` after the owning segment (`db.pool[2].size`).
//! Backends store hierarchical paths. The codec maps each dot boundary
//! to a path separator and gives every `[n]` index its own synthetic
//! segment, so list children stay distinguishable from map children:
//!
//! ```text
//! db.pool[2].size  ->  <namespace>/db/pool/[2]/size
//! ```
//!
//! `decode(encode(key)) == key` holds for every well-formed key.

use std::borrow::Cow;

/// Per-backend path conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// Relative paths, segments stored verbatim (`ns/db/pool/[2]/size`).
    Consul,
    /// Relative paths, segments percent-encoded (`ns/db/pool/%5B2%5D/size`).
    Etcd2,
    /// Absolute paths rooted at `/` (`/ns/db/pool/[2]/size`).
    Zookeeper,
}

/// Translates between flat keys and hierarchical backend paths under a
/// fixed namespace.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    namespace: String,
    style: PathStyle,
}

impl KeyCodec {
    /// Create a codec for the given namespace and path style.
    ///
    /// Leading and trailing separators on the namespace are dropped; the
    /// style decides whether emitted paths carry a root `/`.
    pub fn new(namespace: impl Into<String>, style: PathStyle) -> Self {
        let namespace = namespace.into().trim_matches('/').to_string();
        Self { namespace, style }
    }

    /// The namespace all paths are rooted under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The path style this codec encodes for.
    pub fn style(&self) -> PathStyle {
        self.style
    }

    /// Encode a flat key into a backend path under this namespace.
    pub fn encode(&self, key: &str) -> String {
        let mut path = String::new();
        if self.style == PathStyle::Zookeeper {
            path.push('/');
        }
        path.push_str(&self.namespace);
        for segment in segments(key) {
            path.push('/');
            path.push_str(&self.escape(&segment));
        }
        path
    }

    /// Decode a backend path back into a flat key.
    ///
    /// Returns `None` when the path does not live under this codec's
    /// namespace.
    pub fn decode(&self, path: &str) -> Option<String> {
        let relative = path.strip_prefix('/').unwrap_or(path);
        let rest = relative
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix('/')?;
        if rest.is_empty() {
            return None;
        }
        let segments = rest.split('/').map(|seg| self.unescape(seg).into_owned());
        Some(join_segments(segments))
    }

    /// Undo per-backend escaping on a single child node name, as returned
    /// by a directory listing.
    pub fn decode_child(&self, name: &str) -> String {
        self.unescape(name).into_owned()
    }

    fn escape<'a>(&self, segment: &'a str) -> Cow<'a, str> {
        match self.style {
            PathStyle::Etcd2 => urlencoding::encode(segment),
            PathStyle::Consul | PathStyle::Zookeeper => Cow::Borrowed(segment),
        }
    }

    fn unescape<'a>(&self, segment: &'a str) -> Cow<'a, str> {
        match self.style {
            PathStyle::Etcd2 => {
                urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment))
            }
            PathStyle::Consul | PathStyle::Zookeeper => Cow::Borrowed(segment),
        }
    }
}

/// Split a flat key into path segments, giving each `[n]` index its own
/// segment: `db.pool[2].size` becomes `["db", "pool", "[2]", "size"]`.
pub(crate) fn segments(key: &str) -> Vec<String> {
    key.replace('[', ".[")
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_segments<I: IntoIterator<Item = String>>(segments: I) -> String {
    let joined = segments.into_iter().collect::<Vec<_>>().join(".");
    joined.replace(".[", "[")
}

/// Parse a child node name as a list index. Accepts the synthetic `[n]`
/// form and bare `n` written by external tools.
pub(crate) fn child_index(name: &str) -> Option<usize> {
    let inner = name
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(name);
    inner.parse().ok()
}

/// Length of the contiguous `0, 1, 2, ..` run covered by the given
/// indices. A list with a hole only counts up to the hole.
pub(crate) fn contiguous_run(mut indices: Vec<usize>) -> usize {
    indices.sort_unstable();
    indices.dedup();
    indices
        .into_iter()
        .enumerate()
        .take_while(|(position, index)| position == index)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_split() {
        assert_eq!(segments("db.pool[2].size"), vec!["db", "pool", "[2]", "size"]);
        assert_eq!(segments("simple"), vec!["simple"]);
        assert_eq!(segments("a.b.c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_consul_encoding() {
        let codec = KeyCodec::new("environments/dev/services/config", PathStyle::Consul);
        assert_eq!(
            codec.encode("db.pool[2].size"),
            "environments/dev/services/config/db/pool/[2]/size"
        );
    }

    #[test]
    fn test_etcd_encoding_escapes_brackets() {
        let codec = KeyCodec::new("environments/dev/services/config", PathStyle::Etcd2);
        assert_eq!(
            codec.encode("db.pool[2].size"),
            "environments/dev/services/config/db/pool/%5B2%5D/size"
        );
    }

    #[test]
    fn test_zookeeper_encoding_is_rooted() {
        let codec = KeyCodec::new("environments/dev/services/config", PathStyle::Zookeeper);
        assert_eq!(
            codec.encode("db.pool[2].size"),
            "/environments/dev/services/config/db/pool/[2]/size"
        );
    }

    #[test]
    fn test_round_trip_all_styles() {
        for style in [PathStyle::Consul, PathStyle::Etcd2, PathStyle::Zookeeper] {
            let codec = KeyCodec::new("ns", style);
            for key in ["simple", "a.b.c", "db.pool[2].size", "list[0][1]", "x[10].y[0].z"] {
                let path = codec.encode(key);
                assert_eq!(codec.decode(&path).as_deref(), Some(key), "style {:?}", style);
            }
        }
    }

    #[test]
    fn test_decode_rejects_foreign_paths() {
        let codec = KeyCodec::new("environments/dev/services/config", PathStyle::Consul);
        assert_eq!(codec.decode("environments/prod/services/config/a"), None);
        // Prefix match must end on a segment boundary.
        assert_eq!(codec.decode("environments/dev/services/configx/a"), None);
        // The namespace node itself is not a key.
        assert_eq!(codec.decode("environments/dev/services/config"), None);
    }

    #[test]
    fn test_namespace_is_normalized() {
        let codec = KeyCodec::new("/custom/ns/", PathStyle::Zookeeper);
        assert_eq!(codec.encode("a"), "/custom/ns/a");
        assert_eq!(codec.decode("/custom/ns/a").as_deref(), Some("a"));
    }

    #[test]
    fn test_child_index() {
        assert_eq!(child_index("[0]"), Some(0));
        assert_eq!(child_index("[12]"), Some(12));
        assert_eq!(child_index("7"), Some(7));
        assert_eq!(child_index("name"), None);
        assert_eq!(child_index("[x]"), None);
    }

    #[test]
    fn test_contiguous_run() {
        assert_eq!(contiguous_run(vec![0, 1, 2]), 3);
        assert_eq!(contiguous_run(vec![2, 0, 1]), 3);
        assert_eq!(contiguous_run(vec![0, 2, 3]), 1);
        assert_eq!(contiguous_run(vec![1, 2]), 0);
        assert_eq!(contiguous_run(vec![0, 0, 1]), 2);
        assert_eq!(contiguous_run(Vec::new()), 0);
    }
}
