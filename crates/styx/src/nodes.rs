//! The served namespace: an arena of mountable nodes.
//!
//! A node is an element of the hierarchy a server exports. Directories
//! collect other nodes under path segments; data nodes hold a byte buffer
//! that can be read and written at offsets. Nodes live in an arena owned by
//! the [`Namespace`] and are referred to by [`NodeId`] handles; a handle
//! doubles as the node's qid path, which keeps qids unique without tying
//! identity to memory addresses.
//!
//! The tree is additive: mounting never removes or re-parents nodes, so no
//! cycles can arise.

use std::collections::BTreeMap;

use crate::error::{Error, NamespaceError};
use crate::fcall::{QId, QIdType, Stat, dm};
use crate::res;
use crate::serialize::Encodable;
use crate::utils::Result;

/// Handle of a node within its [`Namespace`] arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A collection of other nodes, keyed by path segment.
///
/// By convention a directory has no content of its own; reading one yields
/// the serialized stat records of its children.
#[derive(Debug, Default)]
pub struct DirNode {
    entries: BTreeMap<String, NodeId>,
}

/// Simple chunk of data.
#[derive(Debug, Default)]
pub struct DataNode {
    bytes: Vec<u8>,
    version: u32,
}

/// The node variants a namespace can serve. New kinds extend this enum.
#[derive(Debug)]
pub enum Node {
    Dir(DirNode),
    Data(DataNode),
}

/// The tree of nodes a server exports, rooted at [`Namespace::root`].
#[derive(Debug)]
pub struct Namespace {
    nodes: Vec<Node>,
}

impl Namespace {
    /// An empty namespace: a root directory with no children
    pub fn new() -> Namespace {
        Namespace {
            nodes: vec![Node::Dir(DirNode::default())],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Add an unattached directory node; bind it with [`Namespace::mount`]
    pub fn add_dir(&mut self) -> NodeId {
        self.push(Node::Dir(DirNode::default()))
    }

    /// Add an unattached data node holding `bytes`
    pub fn add_data(&mut self, bytes: impl Into<Vec<u8>>) -> NodeId {
        self.push(Node::Data(DataNode {
            bytes: bytes.into(),
            version: 0,
        }))
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId((self.nodes.len() - 1) as u32)
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Bind `child` under `segment` within the directory `parent`.
    ///
    /// The segment is a single name, not a hierarchical path.
    pub fn mount(&mut self, parent: NodeId, segment: &str, child: NodeId) -> Result<()> {
        if segment.is_empty() || segment.contains('/') {
            return res!(NamespaceError::NotAllowed);
        }

        match &mut self.nodes[parent.index()] {
            Node::Dir(dir) => {
                if dir.entries.contains_key(segment) {
                    return res!(NamespaceError::AlreadyExists);
                }
                dir.entries.insert(segment.to_owned(), child);
                Ok(())
            }
            Node::Data(_) => res!(NamespaceError::NotADirectory),
        }
    }

    /// Resolve a single path segment within a directory
    pub fn lookup(&self, from: NodeId, segment: &str) -> Result<NodeId> {
        match self.node(from) {
            Node::Dir(dir) => match dir.entries.get(segment) {
                Some(&child) => Ok(child),
                None => res!(NamespaceError::NotFound { walked: 0 }),
            },
            Node::Data(_) => res!(NamespaceError::NotWalkable),
        }
    }

    /// Resolve `wnames` segment by segment starting at `from`.
    ///
    /// The qid of every node reached is appended to `wqids`; on the first
    /// failing segment the error is returned with the qids gathered so far
    /// left in place, a missing segment carrying the count of elements that
    /// did resolve.
    pub fn walk(&self, from: NodeId, wnames: &[String], wqids: &mut Vec<QId>) -> Result<NodeId> {
        let mut current = from;
        for name in wnames {
            current = match self.lookup(current, name) {
                Ok(node) => node,
                Err(Error::Namespace(NamespaceError::NotFound { .. })) => {
                    return res!(NamespaceError::NotFound {
                        walked: wqids.len(),
                    });
                }
                Err(e) => return Err(e),
            };
            wqids.push(self.qid(current));
        }

        Ok(current)
    }

    /// Whether the node can have children
    pub fn is_walkable(&self, id: NodeId) -> bool {
        matches!(self.node(id), Node::Dir(_))
    }

    /// Content version of the node; bumped each time the content changes
    pub fn version(&self, id: NodeId) -> u32 {
        match self.node(id) {
            Node::Dir(_) => 0,
            Node::Data(data) => data.version,
        }
    }

    pub fn qid(&self, id: NodeId) -> QId {
        QId {
            typ: if self.is_walkable(id) {
                QIdType::DIR
            } else {
                QIdType::FILE
            },
            version: self.version(id),
            path: u64::from(id.0),
        }
    }

    /// Stat record describing the node as the directory entry `name`
    pub fn stat(&self, name: &str, id: NodeId) -> Stat {
        let (mode, length) = match self.node(id) {
            Node::Dir(_) => (dm::DIR | 0o755, 0),
            Node::Data(data) => (dm::TMP | 0o644, data.bytes.len() as u64),
        };

        Stat {
            typ: 0,
            dev: 0,
            qid: self.qid(id),
            mode,
            atime: 0,
            mtime: 0,
            length,
            name: name.to_owned(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Open the node for the operations in `mode` on behalf of `uname`.
    pub fn open(&self, _id: NodeId, _uname: &str, _mode: u8) -> Result<()> {
        Ok(())
    }

    /// Read up to `count` bytes starting at `offset` into `buf`.
    ///
    /// A directory serializes its children's stat records. Entries whose
    /// cumulative size falls at or below `offset` are skipped; a record is
    /// encoded only if it fits the remaining room entirely, so no record is
    /// ever split across two reads. A data node reads its buffer; an offset
    /// at or past the end yields zero bytes to signal EOF.
    pub fn read(&self, id: NodeId, count: u32, offset: u64, buf: &mut Vec<u8>) -> Result<()> {
        match self.node(id) {
            Node::Dir(dir) => {
                let mut traversed: u64 = 0;
                let mut encoded: u32 = 0;

                for (name, &child) in &dir.entries {
                    let stat = self.stat(name, child);
                    let size = stat.wire_size();

                    traversed += u64::from(size);
                    if traversed <= offset {
                        continue;
                    }

                    if encoded + size > count {
                        break;
                    }
                    encoded += size;

                    stat.encode(buf)?;
                }

                Ok(())
            }
            Node::Data(data) => {
                if offset >= data.bytes.len() as u64 {
                    return Ok(());
                }

                let start = offset as usize;
                let end = data.bytes.len().min(start + count as usize);
                buf.extend_from_slice(&data.bytes[start..end]);
                Ok(())
            }
        }
    }

    /// Write `data` at `offset`, growing the buffer as needed.
    ///
    /// Returns the number of bytes accepted. Directories reject writes.
    pub fn write(&mut self, id: NodeId, offset: u64, data: &[u8]) -> Result<u32> {
        match &mut self.nodes[id.index()] {
            Node::Dir(_) => res!(NamespaceError::NotAllowed),
            Node::Data(node) => {
                let start = offset as usize;
                let end = start + data.len();
                if node.bytes.len() < end {
                    node.bytes.resize(end, 0);
                }
                node.bytes[start..end].copy_from_slice(data);
                node.version = node.version.wrapping_add(1);
                Ok(data.len() as u32)
            }
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::serialize::Decodable;
    use std::io::Cursor;

    fn sample_tree() -> Namespace {
        let mut ns = Namespace::new();
        let root = ns.root();

        let somewhere = ns.add_data(b"over the rainbow".to_vec());
        ns.mount(root, "pathSomewhere", somewhere).unwrap();

        let dir = ns.add_dir();
        ns.mount(root, "non_empty_dir", dir).unwrap();
        let internal = ns.add_dir();
        ns.mount(dir, "internal", internal).unwrap();

        ns
    }

    fn decode_listing(bytes: &[u8]) -> Vec<Stat> {
        let mut cursor = Cursor::new(bytes);
        let mut stats = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            stats.push(Stat::decode(&mut cursor).unwrap());
        }
        stats
    }

    #[test]
    fn mounting_twice_under_one_segment_fails() {
        let mut ns = Namespace::new();
        let root = ns.root();
        let a = ns.add_dir();
        let b = ns.add_dir();

        ns.mount(root, "a", a).unwrap();
        assert!(matches!(
            ns.mount(root, "a", b),
            Err(Error::Namespace(NamespaceError::AlreadyExists))
        ));
    }

    #[test]
    fn mount_rejects_bad_segments() {
        let mut ns = Namespace::new();
        let root = ns.root();
        let child = ns.add_dir();

        assert!(ns.mount(root, "", child).is_err());
        assert!(ns.mount(root, "a/b", child).is_err());
    }

    #[test]
    fn mounting_under_a_data_node_fails() {
        let mut ns = Namespace::new();
        let root = ns.root();
        let data = ns.add_data(b"x".to_vec());
        ns.mount(root, "data", data).unwrap();
        let child = ns.add_dir();

        assert!(matches!(
            ns.mount(data, "sub", child),
            Err(Error::Namespace(NamespaceError::NotADirectory))
        ));
    }

    #[test]
    fn walk_resolves_each_segment() {
        let ns = sample_tree();
        let mut wqids = Vec::new();
        let names = ["non_empty_dir".to_owned(), "internal".to_owned()];

        let node = ns.walk(ns.root(), &names, &mut wqids).unwrap();
        assert!(ns.is_walkable(node));
        assert_eq!(wqids.len(), 2);
        assert!(wqids.iter().all(|q| q.typ == QIdType::DIR));
    }

    #[test]
    fn partial_walk_reports_the_qids_reached() {
        let ns = sample_tree();
        let mut wqids = Vec::new();
        let names = [
            "non_empty_dir".to_owned(),
            "missing".to_owned(),
            "deeper".to_owned(),
        ];

        let res = ns.walk(ns.root(), &names, &mut wqids);
        assert!(matches!(
            res,
            Err(Error::Namespace(NamespaceError::NotFound { walked: 1 }))
        ));
        assert_eq!(wqids.len(), 1);
    }

    #[test]
    fn walk_through_a_data_node_fails() {
        let ns = sample_tree();
        let mut wqids = Vec::new();
        let names = ["pathSomewhere".to_owned(), "below".to_owned()];

        let res = ns.walk(ns.root(), &names, &mut wqids);
        assert!(matches!(
            res,
            Err(Error::Namespace(NamespaceError::NotWalkable))
        ));
        assert_eq!(wqids.len(), 1);
    }

    #[test]
    fn empty_directory_reads_as_zero_bytes() {
        let ns = Namespace::new();
        let mut buf = Vec::new();
        ns.read(ns.root(), 8192, 0, &mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn directory_read_lists_children_in_segment_order() {
        let ns = sample_tree();
        let mut buf = Vec::new();
        ns.read(ns.root(), 8192, 0, &mut buf).unwrap();

        let stats = decode_listing(&buf);
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["non_empty_dir", "pathSomewhere"]);
        assert!(stats[0].mode & dm::DIR != 0);
        assert_eq!(stats[1].length, 16);
    }

    #[test]
    fn directory_read_never_splits_a_record() {
        let ns = sample_tree();

        let mut full = Vec::new();
        ns.read(ns.root(), 8192, 0, &mut full).unwrap();
        let first_size = decode_listing(&full)[0].wire_size();

        // One byte short of the second record: only the first fits.
        let mut buf = Vec::new();
        ns.read(ns.root(), full.len() as u32 - 1, 0, &mut buf).unwrap();
        assert_eq!(buf.len() as u32, first_size);

        // Not even the first record fits: the read comes back empty.
        let mut buf = Vec::new();
        ns.read(ns.root(), first_size - 1, 0, &mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn directory_reads_concatenate_to_the_full_listing() {
        let ns = sample_tree();

        let mut full = Vec::new();
        ns.read(ns.root(), 8192, 0, &mut full).unwrap();
        let first_size = decode_listing(&full)[0].wire_size();

        let mut assembled = Vec::new();
        ns.read(ns.root(), first_size, 0, &mut assembled).unwrap();
        assert_eq!(assembled.len() as u32, first_size);
        ns.read(ns.root(), 8192, u64::from(first_size), &mut assembled)
            .unwrap();

        assert_eq!(assembled, full);
    }

    #[test]
    fn data_read_honors_offset_count_and_eof() {
        let mut ns = Namespace::new();
        let data = ns.add_data(b"hello".to_vec());
        ns.mount(ns.root(), "greeting", data).unwrap();

        let mut buf = Vec::new();
        ns.read(data, 100, 0, &mut buf).unwrap();
        assert_eq!(buf, b"hello");

        let mut buf = Vec::new();
        ns.read(data, 2, 1, &mut buf).unwrap();
        assert_eq!(buf, b"el");

        let mut buf = Vec::new();
        ns.read(data, 100, 5, &mut buf).unwrap();
        assert!(buf.is_empty());

        let mut buf = Vec::new();
        ns.read(data, 100, 64, &mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn data_write_bumps_the_version() {
        let mut ns = Namespace::new();
        let data = ns.add_data(Vec::new());

        let before = ns.qid(data).version;
        assert_eq!(ns.write(data, 0, b"ABC").unwrap(), 3);
        assert!(ns.qid(data).version > before);

        let mut buf = Vec::new();
        ns.read(data, 100, 0, &mut buf).unwrap();
        assert_eq!(buf, b"ABC");
    }

    #[test]
    fn data_write_beyond_the_end_zero_fills() {
        let mut ns = Namespace::new();
        let data = ns.add_data(b"ab".to_vec());

        ns.write(data, 4, b"cd").unwrap();

        let mut buf = Vec::new();
        ns.read(data, 100, 0, &mut buf).unwrap();
        assert_eq!(buf, b"ab\0\0cd");
    }

    #[test]
    fn directory_write_is_not_allowed() {
        let mut ns = Namespace::new();
        let root = ns.root();
        assert!(matches!(
            ns.write(root, 0, b"nope"),
            Err(Error::Namespace(NamespaceError::NotAllowed))
        ));
    }

    #[test]
    fn qid_identity_follows_the_arena_handle() {
        let ns = sample_tree();
        let a = ns.lookup(ns.root(), "non_empty_dir").unwrap();
        let b = ns.lookup(ns.root(), "pathSomewhere").unwrap();

        assert_ne!(ns.qid(a).path, ns.qid(b).path);
        assert_eq!(ns.qid(a), ns.qid(a));
    }
}
