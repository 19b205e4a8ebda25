use std::fmt;
use std::sync::Arc;

use crate::name::{Name, Path};

///
/// A workspace-stable opaque identifier for a node, sourced from its `jcr:uuid` property.
///
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniqueId(Arc<str>);

impl UniqueId {
    pub fn new(s: &str) -> UniqueId {
        UniqueId(Arc::from(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// An opaque node identifier as the remote layer understands it: a unique id alone, a path
/// relative to the nearest unique-id-bearing ancestor, or an absolute path when no ancestor
/// carries one.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub unique_id: Option<UniqueId>,
    pub path: Option<Path>,
}

impl NodeId {
    pub fn from_unique_id(unique_id: UniqueId) -> NodeId {
        NodeId {
            unique_id: Some(unique_id),
            path: None,
        }
    }

    pub fn from_path(path: Path) -> NodeId {
        NodeId {
            unique_id: None,
            path: Some(path),
        }
    }

    pub fn relative(unique_id: UniqueId, path: Path) -> NodeId {
        NodeId {
            unique_id: Some(unique_id),
            path: Some(path),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.unique_id, &self.path) {
            (Some(uid), Some(path)) => write!(f, "{uid}:{path}"),
            (Some(uid), None) => write!(f, "{uid}"),
            (None, Some(path)) => write!(f, "{path}"),
            (None, None) => write!(f, "<null-id>"),
        }
    }
}

///
/// A property identifier: the owning node plus the property name.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PropertyId {
    pub parent: NodeId,
    pub name: Name,
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ItemId {
    Node(NodeId),
    Property(PropertyId),
}

impl ItemId {
    pub fn unique_id(&self) -> Option<&UniqueId> {
        match self {
            ItemId::Node(id) => id.unique_id.as_ref(),
            ItemId::Property(id) => id.parent.unique_id.as_ref(),
        }
    }
}

///
/// The resolved payload of a node: its primary type and mixin set. The engine treats the
/// contents opaquely except for the `jcr:mixinTypes` side-effect channel.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeState {
    pub primary_type: Name,
    pub mixin_types: Vec<Name>,
}

impl NodeState {
    pub fn new(primary_type: Name) -> NodeState {
        NodeState {
            primary_type,
            mixin_types: Vec::new(),
        }
    }
}

///
/// The resolved payload of a property.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyState {
    pub values: Vec<String>,
    pub multi_valued: bool,
}

impl PropertyState {
    pub fn single(value: &str) -> PropertyState {
        PropertyState {
            values: vec![value.to_owned()],
            multi_valued: false,
        }
    }

    pub fn multi(values: Vec<String>) -> PropertyState {
        PropertyState {
            values,
            multi_valued: true,
        }
    }

    pub fn empty() -> PropertyState {
        PropertyState {
            values: Vec::new(),
            multi_valued: false,
        }
    }
}

/// The slice of a node-type definition the engine consults when adding child nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeDefinition {
    pub allows_same_name_siblings: bool,
}

impl NodeDefinition {
    pub fn residual() -> NodeDefinition {
        NodeDefinition {
            allows_same_name_siblings: true,
        }
    }
}

/// The slice of a property definition the engine consults when adding properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyDefinition {
    pub multi_valued: bool,
}

///
/// One child position as reported by the remote, in the server's order.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildInfo {
    pub name: Name,
    pub unique_id: Option<UniqueId>,
    pub index: u32,
}

///
/// One materialised step of a deep resolution: the child position plus its resolved state.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: Name,
    pub unique_id: Option<UniqueId>,
    pub index: u32,
    pub state: NodeState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyRemoved,
    PropertyChanged,
}

///
/// An external change observed on the workspace. `path` is the item's absolute workspace path
/// at the time the event was generated.
///
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub id: ItemId,
    pub path: Path,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderError {
    /// The id does not denote an item on the workspace.
    NotFound,
    /// The remote call failed in transit; retryable by the session.
    Transport(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NotFound => write!(f, "item not found on the workspace"),
            ProviderError::Transport(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

///
/// The remote layer the engine shadows. All methods block; callers must not hold the store
/// lock across them.
///
pub trait RemoteProvider: Send + Sync {
    ///
    /// The children of the given node, in the server's order.
    ///
    fn child_infos(&self, id: &NodeId) -> Result<Vec<ChildInfo>, ProviderError>;

    fn node_state(&self, id: &NodeId) -> Result<NodeState, ProviderError>;

    fn property_state(&self, id: &PropertyId) -> Result<PropertyState, ProviderError>;

    ///
    /// Resolves `relative` below the anchor node in one round trip, returning one `NodeInfo`
    /// per segment so the caller can materialise the intermediate entries.
    ///
    fn deep_node_infos(
        &self,
        anchor: &NodeId,
        relative: &Path,
    ) -> Result<Vec<NodeInfo>, ProviderError>;

    ///
    /// The property fallback for a failed deep node resolution: resolves the node chain along
    /// `relative` and then the named property below it.
    ///
    fn deep_property_infos(
        &self,
        anchor: &NodeId,
        relative: &Path,
        name: &Name,
    ) -> Result<(Vec<NodeInfo>, PropertyState), ProviderError>;
}
