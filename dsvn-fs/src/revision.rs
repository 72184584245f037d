//! Revision files and commit transactions
//!
//! A revision file is self-describing:
//!
//! ```text
//! <representation>*      new file texts, property lists, directory listings
//! <root record>          PLAIN representation of the bincode node map
//! <root-offset:16 hex> <sha256 of all preceding bytes:64 hex>\n
//! ```
//!
//! Nodes unchanged since the previous revision keep pointing at the
//! representations they already had, so a commit only stores what changed.

use crate::checksum::Checksum;
use crate::config::StoreConfig;
use crate::error::{FsError, Result};
use crate::layout::{Location, ShardLayout};
use crate::properties::PropertySet;
use crate::rep::{self, ContentClass, DeltaBase, EncodingPolicy, RepHandle, RepReader, StoredRep};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

/// Length of the fixed trailer closing every revision file
pub const TRAILER_LEN: usize = 82;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

/// One node of a revision tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeKind,
    /// File text, or the serialized entry list of a directory
    pub content: RepHandle,
    pub props: Option<RepHandle>,
}

/// Flat, sorted `path → node` map of a revision. The root directory is `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRoot {
    nodes: BTreeMap<String, NodeRecord>,
}

impl RevisionRoot {
    pub fn get(&self, path: &str) -> Option<&NodeRecord> {
        self.nodes.get(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &NodeRecord)> {
        self.nodes.iter().map(|(p, r)| (p.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

pub fn encode_listing(entries: &[DirEntry]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(entries)?)
}

pub fn decode_listing(bytes: &[u8]) -> Result<Vec<DirEntry>> {
    Ok(bincode::deserialize(bytes)?)
}

/// Immediate children of `dir` in a sorted path map
fn children<T>(nodes: &BTreeMap<String, T>, dir: &str, kind_of: impl Fn(&T) -> NodeKind) -> Vec<DirEntry> {
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(path, _)| path.starts_with(&prefix))
        .filter_map(|(path, node)| {
            let name = &path[prefix.len()..];
            (!name.is_empty() && !name.contains('/')).then(|| DirEntry {
                name: name.to_string(),
                kind: kind_of(node),
            })
        })
        .collect()
}

/// `<root-offset> <checksum>\n` at the very end of a revision file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub root_offset: u64,
    pub checksum: Checksum,
}

impl Trailer {
    /// Trailer for `body`, the revision bytes that precede it
    pub fn seal(body: &[u8], root_offset: u64) -> Self {
        Self {
            root_offset,
            checksum: Checksum::of(body),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{:016x} {}\n", self.root_offset, self.checksum).into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let bad = || FsError::Corrupt(format!("malformed revision trailer {:?}", String::from_utf8_lossy(bytes)));
        if bytes.len() != TRAILER_LEN || bytes[16] != b' ' || bytes[TRAILER_LEN - 1] != b'\n' {
            return Err(bad());
        }
        let text = std::str::from_utf8(bytes).map_err(|_| bad())?;
        let root_offset = u64::from_str_radix(&text[..16], 16).map_err(|_| bad())?;
        let checksum = Checksum::from_hex(&text[17..TRAILER_LEN - 1]).map_err(|_| bad())?;
        Ok(Self {
            root_offset,
            checksum,
        })
    }

    /// Read the trailer of the revision stored at `location`
    pub fn read(location: &Location) -> Result<Self> {
        let len = location.len()?;
        if len < TRAILER_LEN as u64 {
            return Err(FsError::Corrupt(format!("revision data of {} bytes has no trailer", len)));
        }
        let (mut file, _) = location.open_at(len - TRAILER_LEN as u64)?;
        let mut buf = [0u8; TRAILER_LEN];
        file.read_exact(&mut buf)?;
        Self::parse(&buf)
    }
}

/// Check complete revision bytes against their trailer
pub fn verify_revision_bytes(rev: u64, data: &[u8]) -> Result<Trailer> {
    if data.len() < TRAILER_LEN {
        return Err(FsError::Corrupt(format!("r{} is shorter than its trailer", rev)));
    }
    let (body, tail) = data.split_at(data.len() - TRAILER_LEN);
    let trailer = Trailer::parse(tail)?;
    let actual = Checksum::of(body);
    if actual != trailer.checksum {
        return Err(FsError::checksum_mismatch(format!("r{}", rev), &trailer.checksum, &actual));
    }
    if trailer.root_offset >= body.len() as u64 {
        return Err(FsError::Corrupt(format!("r{} root offset past end of data", rev)));
    }
    Ok(trailer)
}

/// Node map of a stored revision
pub fn load_root(layout: &ShardLayout, rev: u64) -> Result<RevisionRoot> {
    let trailer = layout.read_revision(rev, Trailer::read)?;
    let bytes = RepReader::new(layout).load(RepHandle::new(rev, trailer.root_offset))?;
    RevisionRoot::from_bytes(&bytes)
}

/// Canonical form of a repository path: no leading, trailing or doubled
/// slashes, no `.` or `..` segments. The root is `""`.
pub fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(FsError::InvalidPath(path.to_string()));
        }
    }
    Ok(trimmed.to_string())
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

fn is_within(path: &str, dir: &str) -> bool {
    path.len() > dir.len() + 1 && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

#[derive(Debug)]
struct NodeEdit {
    kind: NodeKind,
    /// Created in this transaction; shares nothing with an earlier node at the path
    fresh: bool,
    content: Option<Vec<u8>>,
    prop_changes: BTreeMap<String, Option<Vec<u8>>>,
}

impl NodeEdit {
    fn new(kind: NodeKind, fresh: bool) -> Self {
        Self {
            kind,
            fresh,
            content: None,
            prop_changes: BTreeMap::new(),
        }
    }
}

/// Staged changes against a base revision
#[derive(Debug)]
pub struct Txn {
    base_rev: u64,
    base: RevisionRoot,
    tree: BTreeMap<String, NodeKind>,
    edits: BTreeMap<String, NodeEdit>,
}

impl Txn {
    pub fn new(base_rev: u64, base: RevisionRoot) -> Self {
        let tree = base.nodes.iter().map(|(p, r)| (p.clone(), r.kind)).collect();
        Self {
            base_rev,
            base,
            tree,
            edits: BTreeMap::new(),
        }
    }

    pub fn base_revision(&self) -> u64 {
        self.base_rev
    }

    /// Kind of the node at `path` as the transaction currently sees it
    pub fn kind_of(&self, path: &str) -> Option<NodeKind> {
        normalize_path(path)
            .ok()
            .and_then(|p| self.tree.get(&p).copied())
    }

    /// Create or replace the text of a file. The parent directory must exist.
    pub fn put_file(&mut self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        let path = normalize_path(path)?;
        let parent = parent_of(&path).ok_or_else(|| FsError::NotAFile("/".to_string()))?;
        self.require_dir(parent)?;
        match self.tree.get(&path) {
            Some(NodeKind::Dir) => return Err(FsError::NotAFile(path)),
            Some(NodeKind::File) => {}
            None => {
                self.tree.insert(path.clone(), NodeKind::File);
                self.edits.insert(path.clone(), NodeEdit::new(NodeKind::File, true));
            }
        }
        self.edit_mut(&path).content = Some(content.into());
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let parent = parent_of(&path).ok_or_else(|| FsError::AlreadyExists("/".to_string()))?;
        self.require_dir(parent)?;
        if self.tree.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.tree.insert(path.clone(), NodeKind::Dir);
        self.edits.insert(path, NodeEdit::new(NodeKind::Dir, true));
        Ok(())
    }

    /// Remove a node and, for a directory, everything below it
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        if path.is_empty() {
            return Err(FsError::InvalidPath("/".to_string()));
        }
        if self.tree.remove(&path).is_none() {
            return Err(self.not_found(&path));
        }
        self.edits.remove(&path);
        self.tree.retain(|p, _| !is_within(p, &path));
        self.edits.retain(|p, _| !is_within(p, &path));
        Ok(())
    }

    /// Set or, with `None`, remove a property of a node
    pub fn set_node_prop(&mut self, path: &str, name: &str, value: Option<&[u8]>) -> Result<()> {
        let path = normalize_path(path)?;
        if !self.tree.contains_key(&path) {
            return Err(self.not_found(&path));
        }
        self.edit_mut(&path)
            .prop_changes
            .insert(name.to_string(), value.map(<[u8]>::to_vec));
        Ok(())
    }

    fn edit_mut(&mut self, path: &str) -> &mut NodeEdit {
        let kind = self.tree.get(path).copied().unwrap_or(NodeKind::File);
        self.edits
            .entry(path.to_string())
            .or_insert_with(|| NodeEdit::new(kind, false))
    }

    fn require_dir(&self, path: &str) -> Result<()> {
        match self.tree.get(path) {
            Some(NodeKind::Dir) => Ok(()),
            Some(NodeKind::File) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(self.not_found(path)),
        }
    }

    fn not_found(&self, path: &str) -> FsError {
        FsError::PathNotFound {
            rev: self.base_rev,
            path: format!("/{}", path),
        }
    }
}

/// Representation reference whose revision may not be assigned yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepRef {
    Existing(RepHandle),
    /// Offset inside the revision being written
    New(u64),
}

impl RepRef {
    fn resolve(self, rev: u64) -> RepHandle {
        match self {
            RepRef::Existing(handle) => handle,
            RepRef::New(offset) => RepHandle::new(rev, offset),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PropsChange {
    Keep,
    Set(Option<RepRef>),
}

#[derive(Debug)]
struct PreparedNode {
    kind: NodeKind,
    fresh: bool,
    /// `None` for directories; listings are built when the revision is finished
    content: Option<RepRef>,
    props: PropsChange,
}

/// A transaction whose new file texts and property lists are already encoded
#[derive(Debug)]
pub struct PreparedCommit {
    base_rev: u64,
    base: RevisionRoot,
    removed: BTreeSet<String>,
    nodes: BTreeMap<String, PreparedNode>,
    body: Vec<u8>,
}

impl PreparedCommit {
    pub fn base_revision(&self) -> u64 {
        self.base_rev
    }
}

#[derive(Debug, Clone, Copy)]
struct DraftNode {
    kind: NodeKind,
    content: Option<RepRef>,
    props: Option<RepRef>,
}

/// What must be unchanged between base and youngest for a touched path
fn signature(record: Option<&NodeRecord>) -> Option<(NodeKind, Option<RepHandle>, Option<RepHandle>)> {
    record.map(|r| {
        let content = (r.kind == NodeKind::File).then_some(r.content);
        (r.kind, content, r.props)
    })
}

/// Turns transactions into revision file bytes
pub struct CommitBuilder<'a> {
    layout: &'a ShardLayout,
    config: &'a StoreConfig,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(layout: &'a ShardLayout, config: &'a StoreConfig) -> Self {
        Self { layout, config }
    }

    /// Encode everything that does not depend on the final revision number.
    /// Runs without the write lock.
    pub fn prepare(&self, txn: Txn) -> Result<PreparedCommit> {
        let Txn {
            base_rev,
            base,
            tree,
            edits,
        } = txn;
        let removed = base
            .nodes
            .keys()
            .filter(|p| !tree.contains_key(*p))
            .cloned()
            .collect();

        let mut body = Vec::new();
        let mut nodes = BTreeMap::new();
        for (path, edit) in edits {
            let previous = if edit.fresh { None } else { base.get(&path).copied() };

            let content = match edit.kind {
                NodeKind::Dir => None,
                NodeKind::File => Some(match (edit.content, previous) {
                    (Some(data), previous) => self.store_rep(
                        &mut body,
                        &data,
                        ContentClass::File,
                        previous.map(|r| r.content),
                    )?,
                    (None, Some(previous)) => RepRef::Existing(previous.content),
                    (None, None) => {
                        return Err(FsError::Corrupt(format!("new file /{} has no content", path)));
                    }
                }),
            };

            let props = if edit.fresh || !edit.prop_changes.is_empty() {
                let base_props = previous.and_then(|r| r.props);
                let mut props = match base_props {
                    Some(handle) => PropertySet::from_bytes(&RepReader::new(self.layout).load(handle)?)?,
                    None => PropertySet::new(),
                };
                for (name, value) in edit.prop_changes {
                    match value {
                        Some(value) => props.set(name, value),
                        None => {
                            props.remove(&name);
                        }
                    }
                }
                if props.is_empty() {
                    PropsChange::Set(None)
                } else {
                    let bytes = props.to_bytes()?;
                    PropsChange::Set(Some(self.store_rep(
                        &mut body,
                        &bytes,
                        ContentClass::Properties,
                        base_props,
                    )?))
                }
            } else {
                PropsChange::Keep
            };

            nodes.insert(
                path,
                PreparedNode {
                    kind: edit.kind,
                    fresh: edit.fresh,
                    content,
                    props,
                },
            );
        }

        Ok(PreparedCommit {
            base_rev,
            base,
            removed,
            nodes,
            body,
        })
    }

    /// Produce the bytes of revision `rev`. `newer` is the youngest tree when
    /// revisions were committed after the transaction's base; the prepared
    /// changes are applied on top of it unless they touch a path that changed.
    pub fn finish(&self, prepared: PreparedCommit, rev: u64, newer: Option<&RevisionRoot>) -> Result<Vec<u8>> {
        let PreparedCommit {
            base,
            removed,
            nodes,
            mut body,
            ..
        } = prepared;
        let youngest = newer.unwrap_or(&base);

        for path in removed.iter().chain(nodes.keys()) {
            if signature(base.get(path)) != signature(youngest.get(path)) {
                return Err(FsError::Conflict(format!("/{}", path)));
            }
        }
        for path in &removed {
            if let Some(added) = youngest
                .nodes
                .keys()
                .find(|p| is_within(p, path) && !removed.contains(*p))
            {
                return Err(FsError::Conflict(format!("/{}", added)));
            }
        }

        let mut merged: BTreeMap<String, DraftNode> = youngest
            .nodes
            .iter()
            .map(|(path, r)| {
                let draft = DraftNode {
                    kind: r.kind,
                    content: Some(RepRef::Existing(r.content)),
                    props: r.props.map(RepRef::Existing),
                };
                (path.clone(), draft)
            })
            .collect();
        let mut dirty: BTreeSet<String> = BTreeSet::new();

        for path in &removed {
            merged.remove(path);
            if let Some(parent) = parent_of(path) {
                dirty.insert(parent.to_string());
            }
        }

        for (path, node) in nodes {
            let previous = if node.fresh { None } else { merged.get(&path).copied() };
            let props = match node.props {
                PropsChange::Keep => previous.and_then(|d| d.props),
                PropsChange::Set(props) => props,
            };
            let content = match node.kind {
                NodeKind::File => node.content,
                NodeKind::Dir => previous.filter(|d| d.kind == NodeKind::Dir).and_then(|d| d.content),
            };
            if node.fresh {
                if let Some(parent) = parent_of(&path) {
                    dirty.insert(parent.to_string());
                }
                if node.kind == NodeKind::Dir {
                    dirty.insert(path.clone());
                }
            }
            merged.insert(
                path,
                DraftNode {
                    kind: node.kind,
                    content,
                    props,
                },
            );
        }

        if !merged.contains_key("") {
            merged.insert(
                String::new(),
                DraftNode {
                    kind: NodeKind::Dir,
                    content: None,
                    props: None,
                },
            );
            dirty.insert(String::new());
        }

        for path in merged.keys() {
            if let Some(parent) = parent_of(path) {
                if merged.get(parent).map(|d| d.kind) != Some(NodeKind::Dir) {
                    return Err(FsError::Conflict(format!("/{}", path)));
                }
            }
        }

        for dir in &dirty {
            if merged.get(dir).map(|d| d.kind) != Some(NodeKind::Dir) {
                continue;
            }
            let listing = encode_listing(&children(&merged, dir, |d| d.kind))?;
            let base_listing = youngest
                .get(dir)
                .filter(|r| r.kind == NodeKind::Dir)
                .map(|r| r.content);
            let content = self.store_rep(&mut body, &listing, ContentClass::Directory, base_listing)?;
            if let Some(draft) = merged.get_mut(dir) {
                draft.content = Some(content);
            }
        }

        let mut root = RevisionRoot::default();
        for (path, draft) in merged {
            let content = draft
                .content
                .ok_or_else(|| FsError::Corrupt(format!("directory /{} has no listing", path)))?;
            root.nodes.insert(
                path,
                NodeRecord {
                    kind: draft.kind,
                    content: content.resolve(rev),
                    props: draft.props.map(|p| p.resolve(rev)),
                },
            );
        }

        let root_offset = body.len() as u64;
        rep::encode(&root.to_bytes()?, &EncodingPolicy::plain(), None)?.write_to(&mut body);
        let trailer = Trailer::seal(&body, root_offset);
        body.extend_from_slice(&trailer.to_bytes());
        Ok(body)
    }

    fn store_rep(&self, body: &mut Vec<u8>, data: &[u8], class: ContentClass, base: Option<RepHandle>) -> Result<RepRef> {
        let policy = EncodingPolicy::new(self.config, self.layout.format(), class);
        let reader = RepReader::new(self.layout);
        let base_data;
        let delta_base = match base {
            Some(handle) => {
                base_data = reader.load(handle)?;
                Some(DeltaBase {
                    handle,
                    checksum: Checksum::of(&base_data),
                    data: &base_data,
                    chain_length: reader.chain_length(handle)?,
                })
            }
            None => None,
        };

        match rep::store(data, &policy, delta_base.as_ref())? {
            StoredRep::Shared(handle) => Ok(RepRef::Existing(handle)),
            StoredRep::New(encoded) => {
                let offset = body.len() as u64;
                encoded.write_to(body);
                Ok(RepRef::New(offset))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatDescriptor;
    use crate::layout::Track;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        layout: ShardLayout,
        config: StoreConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = ShardLayout::new(tmp.path(), FormatDescriptor::new(3, 10).unwrap(), None).unwrap();
            let fx = Self {
                _tmp: tmp,
                layout,
                config: StoreConfig::default(),
            };
            let initial = fx.builder().prepare(Txn::new(0, RevisionRoot::default())).unwrap();
            let bytes = fx.builder().finish(initial, 0, None).unwrap();
            fx.write(0, &bytes);
            fx
        }

        fn builder(&self) -> CommitBuilder<'_> {
            CommitBuilder::new(&self.layout, &self.config)
        }

        fn write(&self, rev: u64, bytes: &[u8]) {
            let path = self.layout.loose_path(Track::Revs, rev);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }

        fn txn(&self, rev: u64) -> Txn {
            Txn::new(rev, load_root(&self.layout, rev).unwrap())
        }

        fn commit(&self, txn: Txn, rev: u64) {
            let prepared = self.builder().prepare(txn).unwrap();
            let bytes = self.builder().finish(prepared, rev, None).unwrap();
            verify_revision_bytes(rev, &bytes).unwrap();
            self.write(rev, &bytes);
        }

        fn read(&self, rev: u64, path: &str) -> Vec<u8> {
            let root = load_root(&self.layout, rev).unwrap();
            RepReader::new(&self.layout)
                .load(root.get(path).unwrap().content)
                .unwrap()
        }

        fn listing(&self, rev: u64, path: &str) -> Vec<String> {
            decode_listing(&self.read(rev, path))
                .unwrap()
                .into_iter()
                .map(|e| e.name)
                .collect()
        }
    }

    #[test]
    fn test_trailer_format() {
        let trailer = Trailer::seal(b"revision body", 0x1f);
        let bytes = trailer.to_bytes();
        assert_eq!(bytes.len(), TRAILER_LEN);
        assert!(bytes.starts_with(b"000000000000001f "));
        assert_eq!(Trailer::parse(&bytes).unwrap(), trailer);
        assert!(Trailer::parse(&bytes[1..]).is_err());
    }

    #[test]
    fn test_verify_detects_flipped_byte() {
        let fx = Fixture::new();
        let mut bytes = fs::read(fx.layout.loose_path(Track::Revs, 0)).unwrap();
        verify_revision_bytes(0, &bytes).unwrap();
        bytes[0] ^= 0x01;
        let err = verify_revision_bytes(0, &bytes).unwrap_err();
        assert!(matches!(err, FsError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "");
        assert_eq!(normalize_path("/trunk/README/").unwrap(), "trunk/README");
        assert!(normalize_path("a//b").is_err());
        assert!(normalize_path("a/../b").is_err());
        assert_eq!(parent_of("a/b/c"), Some("a/b"));
        assert_eq!(parent_of("a"), Some(""));
        assert_eq!(parent_of(""), None);
        assert!(is_within("a/b", "a"));
        assert!(!is_within("ab", "a"));
    }

    #[test]
    fn test_initial_revision_has_empty_root() {
        let fx = Fixture::new();
        let root = load_root(&fx.layout, 0).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root.get("").unwrap().kind, NodeKind::Dir);
        assert!(fx.listing(0, "").is_empty());
    }

    #[test]
    fn test_txn_path_rules() {
        let fx = Fixture::new();
        let mut txn = fx.txn(0);
        assert!(matches!(
            txn.put_file("missing/file", "x"),
            Err(FsError::PathNotFound { .. })
        ));
        txn.put_file("file", "x").unwrap();
        assert!(matches!(
            txn.put_file("file/child", "x"),
            Err(FsError::NotADirectory(_))
        ));
        txn.mkdir("dir").unwrap();
        assert!(matches!(txn.mkdir("dir"), Err(FsError::AlreadyExists(_))));
        assert!(matches!(txn.put_file("dir", "x"), Err(FsError::NotAFile(_))));
        assert!(matches!(txn.delete("/"), Err(FsError::InvalidPath(_))));
        assert!(matches!(
            txn.set_node_prop("nope", "k", Some(b"v")),
            Err(FsError::PathNotFound { .. })
        ));
        assert_eq!(txn.kind_of("/dir"), Some(NodeKind::Dir));
    }

    #[test]
    fn test_commit_and_read_back() {
        let fx = Fixture::new();
        let mut txn = fx.txn(0);
        txn.mkdir("trunk").unwrap();
        txn.put_file("trunk/a.txt", "alpha\n").unwrap();
        txn.put_file("trunk/b.txt", "beta\n").unwrap();
        txn.set_node_prop("trunk/a.txt", "svn:mime-type", Some(b"text/plain")).unwrap();
        fx.commit(txn, 1);

        assert_eq!(fx.read(1, "trunk/a.txt"), b"alpha\n");
        assert_eq!(fx.listing(1, ""), vec!["trunk"]);
        assert_eq!(fx.listing(1, "trunk"), vec!["a.txt", "b.txt"]);

        let root = load_root(&fx.layout, 1).unwrap();
        let props_handle = root.get("trunk/a.txt").unwrap().props.unwrap();
        let props = PropertySet::from_bytes(&RepReader::new(&fx.layout).load(props_handle).unwrap()).unwrap();
        assert_eq!(props.get_str("svn:mime-type"), Some("text/plain"));
    }

    #[test]
    fn test_unchanged_nodes_share_representations() {
        let fx = Fixture::new();
        let mut txn = fx.txn(0);
        txn.mkdir("docs").unwrap();
        txn.put_file("docs/guide", "x".repeat(2000)).unwrap();
        txn.put_file("other", "y").unwrap();
        fx.commit(txn, 1);

        let mut txn = fx.txn(1);
        txn.put_file("other", "z").unwrap();
        // Same bytes as before: shared, not stored again
        txn.put_file("docs/guide", "x".repeat(2000)).unwrap();
        fx.commit(txn, 2);

        let r1 = load_root(&fx.layout, 1).unwrap();
        let r2 = load_root(&fx.layout, 2).unwrap();
        assert_eq!(r1.get("docs/guide"), r2.get("docs/guide"));
        assert_eq!(r1.get("docs"), r2.get("docs"));
        assert_eq!(r2.get("other").unwrap().content.revision, 2);
        assert_eq!(fx.read(2, "other"), b"z");
    }

    #[test]
    fn test_delete_subtree() {
        let fx = Fixture::new();
        let mut txn = fx.txn(0);
        txn.mkdir("a").unwrap();
        txn.mkdir("a/b").unwrap();
        txn.put_file("a/b/c", "c").unwrap();
        txn.put_file("keep", "k").unwrap();
        fx.commit(txn, 1);

        let mut txn = fx.txn(1);
        txn.delete("a").unwrap();
        assert_eq!(txn.kind_of("a/b/c"), None);
        fx.commit(txn, 2);

        let root = load_root(&fx.layout, 2).unwrap();
        assert!(root.get("a/b/c").is_none());
        assert!(root.get("a").is_none());
        assert_eq!(fx.listing(2, ""), vec!["keep"]);
    }

    #[test]
    fn test_finish_rebases_onto_newer_revision() {
        let fx = Fixture::new();
        let mut first = fx.txn(0);
        first.put_file("one", "1").unwrap();
        let mut second = fx.txn(0);
        second.put_file("two", "2").unwrap();

        fx.commit(first, 1);
        let newer = load_root(&fx.layout, 1).unwrap();
        let prepared = fx.builder().prepare(second).unwrap();
        let bytes = fx.builder().finish(prepared, 2, Some(&newer)).unwrap();
        fx.write(2, &bytes);

        assert_eq!(fx.listing(2, ""), vec!["one", "two"]);
        assert_eq!(fx.read(2, "one"), b"1");
        assert_eq!(fx.read(2, "two"), b"2");
    }

    #[test]
    fn test_finish_reports_conflicting_edit() {
        let fx = Fixture::new();
        let mut txn = fx.txn(0);
        txn.put_file("shared", "base").unwrap();
        fx.commit(txn, 1);

        let mut winner = fx.txn(1);
        winner.put_file("shared", "winner").unwrap();
        let mut loser = fx.txn(1);
        loser.put_file("shared", "loser").unwrap();

        fx.commit(winner, 2);
        let newer = load_root(&fx.layout, 2).unwrap();
        let prepared = fx.builder().prepare(loser).unwrap();
        let err = fx.builder().finish(prepared, 3, Some(&newer)).unwrap_err();
        assert!(matches!(err, FsError::Conflict(p) if p == "/shared"));
    }

    #[test]
    fn test_file_edits_build_delta_chain() {
        let fx = Fixture::new();
        let mut text: String = (0..200).map(|i| format!("line {}\n", i)).collect();
        let mut txn = fx.txn(0);
        txn.put_file("log", text.clone()).unwrap();
        fx.commit(txn, 1);

        for rev in 2..=6 {
            text.push_str(&format!("appended in r{}\n", rev));
            let mut txn = fx.txn(rev - 1);
            txn.put_file("log", text.clone()).unwrap();
            fx.commit(txn, rev);
        }

        let handle = load_root(&fx.layout, 6).unwrap().get("log").unwrap().content;
        let reader = RepReader::new(&fx.layout);
        assert_eq!(reader.chain_length(handle).unwrap(), 5);
        assert_eq!(reader.load(handle).unwrap(), text.as_bytes());
    }
}
