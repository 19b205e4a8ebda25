use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::HierarchyError;

/// The namespace URI reserved names like `jcr:uuid` live in.
pub const JCR_NAMESPACE: &str = "http://www.jcp.org/jcr/1.0";

/// The property that carries a node's workspace-stable identifier.
pub static JCR_UUID: Lazy<Name> = Lazy::new(|| Name::namespaced(JCR_NAMESPACE, "uuid"));

/// The property that carries a node's mixin type set.
pub static JCR_MIXIN_TYPES: Lazy<Name> = Lazy::new(|| Name::namespaced(JCR_NAMESPACE, "mixinTypes"));

///
/// A qualified name: an optional namespace URI plus a local part, rendered in the expanded form
/// `{uri}local`. Prefix-to-URI resolution is the session's concern; the engine only ever sees
/// expanded names.
///
/// Cheap to clone: both halves are shared strings.
///
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    ns: Option<Arc<str>>,
    local: Arc<str>,
}

impl Name {
    pub fn new(local: &str) -> Name {
        Name {
            ns: None,
            local: Arc::from(local),
        }
    }

    pub fn namespaced(ns: &str, local: &str) -> Name {
        Name {
            ns: Some(Arc::from(ns)),
            local: Arc::from(local),
        }
    }

    ///
    /// The name of the root entry. The empty local part is not a legal name anywhere else in a
    /// tree, so the sentinel cannot collide with a real child name.
    ///
    pub fn root() -> Name {
        Name {
            ns: None,
            local: Arc::from(""),
        }
    }

    pub fn is_root(&self) -> bool {
        self.ns.is_none() && self.local.is_empty()
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    ///
    /// Parses an expanded-form name: `local` or `{uri}local`.
    ///
    pub fn parse(s: &str) -> Result<Name, HierarchyError> {
        let name = if let Some(rest) = s.strip_prefix('{') {
            let close = rest.find('}').ok_or_else(|| malformed(s))?;
            let (ns, local) = rest.split_at(close);
            let local = &local[1..];
            if ns.is_empty() || local.is_empty() {
                return Err(malformed(s));
            }
            Name::namespaced(ns, local)
        } else {
            if s.is_empty() || s.contains('}') {
                return Err(malformed(s));
            }
            Name::new(s)
        };
        Ok(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{{{}}}{}", ns, self.local),
            None => write!(f, "{}", self.local),
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

///
/// One path segment: a name plus an optional 1-based same-name-sibling index. A missing index
/// denotes index 1 for node resolution; property segments must not carry one.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathElement {
    name: Name,
    index: Option<u32>,
}

impl PathElement {
    pub fn new(name: Name) -> PathElement {
        PathElement { name, index: None }
    }

    pub fn indexed(name: Name, index: u32) -> PathElement {
        assert!(index >= 1, "sibling indices are 1-based");
        PathElement {
            name,
            index: Some(index),
        }
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    ///
    /// The explicit index, if the segment carried one. `denormalized_index` folds the missing
    /// case to 1.
    ///
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn denormalized_index(&self) -> u32 {
        self.index.unwrap_or(1)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match self.index {
            Some(i) if i > 1 => write!(f, "[{i}]"),
            _ => Ok(()),
        }
    }
}

///
/// A path: absolute (`/a/b[2]`) or relative (`b[2]/c`). The root path is absolute with no
/// elements and renders as `/`.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path {
    absolute: bool,
    elements: Vec<PathElement>,
}

impl Path {
    pub fn root() -> Path {
        Path {
            absolute: true,
            elements: Vec::new(),
        }
    }

    pub fn relative(elements: Vec<PathElement>) -> Path {
        Path {
            absolute: false,
            elements,
        }
    }

    pub fn absolute(elements: Vec<PathElement>) -> Path {
        Path {
            absolute: true,
            elements,
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn is_root(&self) -> bool {
        self.absolute && self.elements.is_empty()
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    ///
    /// The path with the final segment dropped. None for the root and for single-segment
    /// relative paths' parents beyond the start.
    ///
    pub fn parent(&self) -> Option<Path> {
        if self.elements.is_empty() {
            return None;
        }
        Some(Path {
            absolute: self.absolute,
            elements: self.elements[..self.elements.len() - 1].to_vec(),
        })
    }

    pub fn join(&self, element: PathElement) -> Path {
        let mut elements = self.elements.clone();
        elements.push(element);
        Path {
            absolute: self.absolute,
            elements,
        }
    }

    ///
    /// The relative path consisting of the segments from `start` onward.
    ///
    pub fn suffix(&self, start: usize) -> Path {
        Path {
            absolute: false,
            elements: self.elements[start..].to_vec(),
        }
    }

    ///
    /// Parses `/a/{uri}b[2]/c` (absolute) or `a/b` (relative). Empty segments and zero indices
    /// are malformed.
    ///
    pub fn parse(s: &str) -> Result<Path, HierarchyError> {
        let (absolute, rest) = match s.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        if rest.is_empty() {
            if absolute {
                return Ok(Path::root());
            }
            return Err(malformed(s));
        }
        let mut elements = Vec::new();
        for segment in rest.split('/') {
            elements.push(parse_element(segment).map_err(|_| malformed(s))?);
        }
        Ok(Path { absolute, elements })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute && self.elements.is_empty() {
            return write!(f, "/");
        }
        for (i, element) in self.elements.iter().enumerate() {
            if self.absolute || i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

fn parse_element(segment: &str) -> Result<PathElement, HierarchyError> {
    if segment.is_empty() {
        return Err(malformed(segment));
    }
    let (name_part, index) = match segment.strip_suffix(']') {
        Some(rest) => {
            let open = rest.rfind('[').ok_or_else(|| malformed(segment))?;
            let index: u32 = rest[open + 1..]
                .parse()
                .map_err(|_| malformed(segment))?;
            if index == 0 {
                return Err(malformed(segment));
            }
            (&rest[..open], Some(index))
        }
        None => (segment, None),
    };
    let name = Name::parse(name_part)?;
    Ok(PathElement { name, index })
}

fn malformed(s: &str) -> HierarchyError {
    HierarchyError::Invalid(format!("malformed name or path: `{s}`"))
}
