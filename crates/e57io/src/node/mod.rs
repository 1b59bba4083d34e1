//! Typed hierarchical node tree.
//!
//! Every element of an E57 container is a node: a terminal value (integer,
//! scaled integer, float, string, blob) or an aggregate (vector, structure,
//! compressed vector). Nodes are created against an open, writable
//! container and become *attached* once they are reachable from the
//! container's root through parent links.
//!
//! Node bodies are reference counted and shared between the tree and any
//! outstanding handles. Parent-to-child links are strong, child-to-parent
//! and node-to-container links are weak, so no cycles can form.

mod aggregate;
mod terminal;

pub use aggregate::{StructureNode, VectorNode};
pub use terminal::{BlobNode, FloatNode, FloatPrecision, IntegerNode, ScaledIntegerNode, StringNode};

use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::{ImageFile, ImageFileBody};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// The variant tag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Structure of named children.
    Structure,
    /// Ordered sequence of children.
    Vector,
    /// Compressed record stream.
    CompressedVector,
    /// Signed 64-bit integer with bounds.
    Integer,
    /// Integer with scale and offset mapping to a physical quantity.
    ScaledInteger,
    /// IEEE-754 floating point value.
    Float,
    /// UTF-8 string.
    Ustring,
    /// Opaque byte run resident in the file.
    Blob,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeType::Structure => "Structure",
            NodeType::Vector => "Vector",
            NodeType::CompressedVector => "CompressedVector",
            NodeType::Integer => "Integer",
            NodeType::ScaledInteger => "ScaledInteger",
            NodeType::Float => "Float",
            NodeType::Ustring => "Ustring",
            NodeType::Blob => "Blob",
        };
        f.write_str(name)
    }
}

/// Shared state of a compressed vector node.
#[derive(Debug)]
pub(crate) struct CvState {
    pub(crate) prototype: Rc<NodeBody>,
    pub(crate) codecs: Rc<NodeBody>,
    pub(crate) record_count: Cell<u64>,
    /// Logical offset of the binary section header, once data exists.
    pub(crate) section_offset: Cell<Option<u64>>,
    pub(crate) write_started: Cell<bool>,
}

/// The tagged payload of a node body.
#[derive(Debug)]
pub(crate) enum Variant {
    Integer {
        value: i64,
        min: i64,
        max: i64,
    },
    ScaledInteger {
        raw: i64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    },
    Float {
        value: f64,
        precision: FloatPrecision,
        min: f64,
        max: f64,
    },
    Ustring {
        value: String,
    },
    Blob {
        logical_offset: u64,
        length: u64,
    },
    Vector {
        allow_hetero: bool,
        children: RefCell<Vec<Rc<NodeBody>>>,
    },
    Structure {
        children: RefCell<Vec<(String, Rc<NodeBody>)>>,
    },
    CompressedVector(CvState),
}

/// Shared node state: container link, tree links, and the variant payload.
#[derive(Debug)]
pub(crate) struct NodeBody {
    pub(crate) file: Weak<ImageFileBody>,
    pub(crate) parent: RefCell<Weak<NodeBody>>,
    pub(crate) element_name: RefCell<String>,
    /// True only for the container's predefined root structure.
    pub(crate) is_file_root: bool,
    pub(crate) variant: Variant,
}

impl NodeBody {
    pub(crate) fn new(file: &Rc<ImageFileBody>, variant: Variant) -> Rc<Self> {
        Rc::new(Self {
            file: Rc::downgrade(file),
            parent: RefCell::new(Weak::new()),
            element_name: RefCell::new(String::new()),
            is_file_root: false,
            variant,
        })
    }

    pub(crate) fn new_root(file: &Weak<ImageFileBody>) -> Rc<Self> {
        Rc::new(Self {
            file: file.clone(),
            parent: RefCell::new(Weak::new()),
            element_name: RefCell::new(String::new()),
            is_file_root: true,
            variant: Variant::Structure {
                children: RefCell::new(Vec::new()),
            },
        })
    }

    pub(crate) fn node_type(&self) -> NodeType {
        match &self.variant {
            Variant::Integer { .. } => NodeType::Integer,
            Variant::ScaledInteger { .. } => NodeType::ScaledInteger,
            Variant::Float { .. } => NodeType::Float,
            Variant::Ustring { .. } => NodeType::Ustring,
            Variant::Blob { .. } => NodeType::Blob,
            Variant::Vector { .. } => NodeType::Vector,
            Variant::Structure { .. } => NodeType::Structure,
            Variant::CompressedVector(_) => NodeType::CompressedVector,
        }
    }

    /// Upgrades the container link and checks it is still usable.
    pub(crate) fn usable_file(&self) -> Result<Rc<ImageFileBody>> {
        let file = self.file.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::ImageFileNotOpen, "image file handle dropped")
        })?;
        file.require_usable()?;
        Ok(file)
    }

    pub(crate) fn parent_body(&self) -> Option<Rc<NodeBody>> {
        self.parent.borrow().upgrade()
    }

    /// A node is a root if it has no parent.
    pub(crate) fn is_root(&self) -> bool {
        self.parent_body().is_none()
    }

    /// A node is attached iff the container root is reachable through
    /// parent links.
    pub(crate) fn is_attached(self: &Rc<Self>) -> bool {
        let mut current = Rc::clone(self);
        loop {
            if current.is_file_root {
                return true;
            }
            match current.parent_body() {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Absolute path of this node from its tree root.
    pub(crate) fn path_name(self: &Rc<Self>) -> String {
        let mut segments = Vec::new();
        let mut current = Rc::clone(self);
        while let Some(parent) = current.parent_body() {
            segments.push(current.element_name.borrow().clone());
            current = parent;
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// True for terminal typed nodes usable as prototype record fields.
    pub(crate) fn is_terminal_field(&self) -> bool {
        matches!(
            self.variant,
            Variant::Integer { .. }
                | Variant::ScaledInteger { .. }
                | Variant::Float { .. }
                | Variant::Ustring { .. }
        )
    }

    /// Structural shape comparison used for homogeneity checks.
    pub(crate) fn shape_eq(a: &Rc<NodeBody>, b: &Rc<NodeBody>) -> bool {
        match (&a.variant, &b.variant) {
            (Variant::Integer { .. }, Variant::Integer { .. })
            | (Variant::ScaledInteger { .. }, Variant::ScaledInteger { .. })
            | (Variant::Float { .. }, Variant::Float { .. })
            | (Variant::Ustring { .. }, Variant::Ustring { .. })
            | (Variant::Blob { .. }, Variant::Blob { .. }) => true,
            (
                Variant::Structure { children: ca },
                Variant::Structure { children: cb },
            ) => {
                let ca = ca.borrow();
                let cb = cb.borrow();
                ca.len() == cb.len()
                    && ca
                        .iter()
                        .zip(cb.iter())
                        .all(|((na, a), (nb, b))| na == nb && Self::shape_eq(a, b))
            }
            (
                Variant::Vector {
                    allow_hetero: ha,
                    children: ca,
                },
                Variant::Vector {
                    allow_hetero: hb,
                    children: cb,
                },
            ) => {
                let ca = ca.borrow();
                let cb = cb.borrow();
                ha == hb
                    && ca.len() == cb.len()
                    && ca.iter().zip(cb.iter()).all(|(a, b)| Self::shape_eq(a, b))
            }
            (Variant::CompressedVector(sa), Variant::CompressedVector(sb)) => {
                Self::shape_eq(&sa.prototype, &sb.prototype)
            }
            _ => false,
        }
    }

    /// True if this node sits underneath a compressed vector whose write
    /// has started (the subtree is sealed).
    pub(crate) fn sealed_by_write(self: &Rc<Self>) -> bool {
        let mut current = Rc::clone(self);
        loop {
            if let Variant::CompressedVector(state) = &current.variant {
                if state.write_started.get() {
                    return true;
                }
            }
            match current.parent_body() {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }
}

/// Validates an element name: a letter or underscore followed by
/// alphanumerics or underscores.
pub(crate) fn validate_element_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::BadPathName,
            format!("invalid element name {name:?}"),
        ))
    }
}

/// Links `child` under `parent` with the given element name. The child must
/// be parentless and declared against the same container as the parent.
pub(crate) fn adopt(
    parent: &Rc<NodeBody>,
    child: &Rc<NodeBody>,
    name: String,
) -> Result<()> {
    let parent_file = parent.file.upgrade();
    let child_file = child.file.upgrade();
    let same_file = match (&parent_file, &child_file) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    };
    if !same_file {
        return Err(Error::new(
            ErrorKind::BadAPIArgument,
            format!("node {:?} was declared against a different image file", name),
        ));
    }
    if child.is_file_root {
        return Err(Error::new(
            ErrorKind::BadAPIArgument,
            "the container root cannot be attached elsewhere",
        ));
    }
    if child.parent_body().is_some() {
        return Err(Error::new(
            ErrorKind::AlreadyHasParent,
            format!("node {:?} already has a parent", name),
        ));
    }
    *child.parent.borrow_mut() = Rc::downgrade(parent);
    *child.element_name.borrow_mut() = name;
    Ok(())
}

/// Resolves a `/`-separated path starting from `start`. A leading `/`
/// resolves from the container root instead.
pub(crate) fn resolve_path(start: &Rc<NodeBody>, path: &str) -> Result<Rc<NodeBody>> {
    let (mut current, rest) = if let Some(rest) = path.strip_prefix('/') {
        let file = start.usable_file()?;
        (file.root_body(), rest)
    } else {
        (Rc::clone(start), path)
    };

    if rest.is_empty() {
        return Ok(current);
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(Error::new(
                ErrorKind::BadPathName,
                format!("empty segment in path {path:?}"),
            ));
        }
        current = match &current.variant {
            Variant::Structure { children } => children
                .borrow()
                .iter()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| Rc::clone(child))
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::PathUndefined,
                        format!("no element {segment:?} in {path:?}"),
                    )
                })?,
            Variant::Vector { children, .. } => {
                let index: usize = segment.parse().map_err(|_| {
                    Error::new(
                        ErrorKind::BadPathName,
                        format!("vector child must be addressed by index, got {segment:?}"),
                    )
                })?;
                children.borrow().get(index).cloned().ok_or_else(|| {
                    Error::new(
                        ErrorKind::PathUndefined,
                        format!("vector index {index} out of range in {path:?}"),
                    )
                })?
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::PathUndefined,
                    format!(
                        "cannot traverse into a {} node at {segment:?} in {path:?}",
                        current.node_type()
                    ),
                ))
            }
        };
    }
    Ok(current)
}

/// Collects `(path, node)` pairs for every terminal field of a prototype,
/// depth first in declaration order. The prototype must be a structure
/// whose interior nodes are structures and whose leaves are terminal typed
/// nodes.
pub(crate) fn collect_terminal_fields(
    prototype: &Rc<NodeBody>,
) -> Result<Vec<(String, Rc<NodeBody>)>> {
    fn walk(
        node: &Rc<NodeBody>,
        prefix: &str,
        out: &mut Vec<(String, Rc<NodeBody>)>,
    ) -> Result<()> {
        match &node.variant {
            Variant::Structure { children } => {
                for (name, child) in children.borrow().iter() {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{prefix}/{name}")
                    };
                    walk(child, &path, out)?;
                }
                Ok(())
            }
            _ if node.is_terminal_field() => {
                out.push((prefix.to_string(), Rc::clone(node)));
                Ok(())
            }
            _ => Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "prototype field {prefix:?} has type {}, expected a terminal typed node",
                    node.node_type()
                ),
            )),
        }
    }

    if !matches!(prototype.variant, Variant::Structure { .. }) {
        return Err(Error::new(
            ErrorKind::BadAPIArgument,
            format!(
                "prototype must be a Structure, got {}",
                prototype.node_type()
            ),
        ));
    }
    let mut fields = Vec::new();
    walk(prototype, "", &mut fields)?;
    Ok(fields)
}

/// Generic handle to any node in the tree.
///
/// Cheap to clone; all clones refer to the same underlying node body.
/// Downcast to a typed handle with `TryFrom`, which fails with
/// `BadNodeDowncast` when the variant tag does not match.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) body: Rc<NodeBody>,
}

impl Node {
    pub(crate) fn from_body(body: Rc<NodeBody>) -> Self {
        Self { body }
    }

    /// The variant tag of this node.
    pub fn node_type(&self) -> NodeType {
        self.body.node_type()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.body.is_root()
    }

    /// The parent node, or this node itself if it is a root.
    pub fn parent(&self) -> Node {
        match self.body.parent_body() {
            Some(parent) => Node::from_body(parent),
            None => self.clone(),
        }
    }

    /// Absolute path name of this node from its tree root.
    pub fn path_name(&self) -> String {
        self.body.path_name()
    }

    /// The name identifying this node in its parent. Empty for roots.
    pub fn element_name(&self) -> String {
        self.body.element_name.borrow().clone()
    }

    /// The image file this node was declared against.
    pub fn dest_image_file(&self) -> Result<ImageFile> {
        let body = self.body.file.upgrade().ok_or_else(|| {
            Error::new(ErrorKind::ImageFileNotOpen, "image file handle dropped")
        })?;
        Ok(ImageFile::from_body(body))
    }

    /// True iff this node is reachable from its container's root.
    pub fn is_attached(&self) -> bool {
        self.body.is_attached()
    }

    /// Resolves a path relative to this node (absolute with a leading `/`).
    pub fn get(&self, path: &str) -> Result<Node> {
        Ok(Node::from_body(resolve_path(&self.body, path)?))
    }

    /// True if both handles refer to the same underlying node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }

    /// Checks the externally visible invariants of this node, optionally
    /// recursing into children. Fails with `InvarianceViolation`.
    pub fn check_invariant(&self, do_recurse: bool) -> Result<()> {
        // If the container is closed the accessors themselves would fail,
        // so there is nothing to check.
        if self.body.usable_file().is_err() {
            return Ok(());
        }

        if let Some(parent) = self.body.parent_body() {
            let listed = match &parent.variant {
                Variant::Structure { children } => children
                    .borrow()
                    .iter()
                    .any(|(_, c)| Rc::ptr_eq(c, &self.body)),
                Variant::Vector { children, .. } => children
                    .borrow()
                    .iter()
                    .any(|c| Rc::ptr_eq(c, &self.body)),
                Variant::CompressedVector(state) => {
                    Rc::ptr_eq(&state.prototype, &self.body)
                        || Rc::ptr_eq(&state.codecs, &self.body)
                }
                _ => false,
            };
            if !listed {
                return Err(Error::new(
                    ErrorKind::InvarianceViolation,
                    format!("{} is not listed among its parent's children", self.path_name()),
                ));
            }
        }

        self.check_local_invariant(do_recurse)
    }

    /// Variant-specific invariants plus optional recursion, without the
    /// parent-link consistency check.
    pub(crate) fn check_local_invariant(&self, do_recurse: bool) -> Result<()> {
        self.check_variant_invariant()?;
        if do_recurse {
            for child in self.child_bodies() {
                Node::from_body(child).check_invariant(true)?;
            }
        }
        Ok(())
    }

    fn check_variant_invariant(&self) -> Result<()> {
        let violation = |context: String| Err(Error::new(ErrorKind::InvarianceViolation, context));
        match &self.body.variant {
            Variant::Integer { value, min, max } => {
                if value < min || value > max {
                    return violation(format!(
                        "integer value {value} outside [{min}, {max}]"
                    ));
                }
            }
            Variant::ScaledInteger { raw, min, max, scale, .. } => {
                if raw < min || raw > max {
                    return violation(format!(
                        "scaled integer raw value {raw} outside [{min}, {max}]"
                    ));
                }
                if *scale == 0.0 {
                    return violation("scaled integer scale is zero".to_string());
                }
            }
            Variant::Float { value, precision, min, max } => {
                if value < min || value > max {
                    return violation(format!("float value {value} outside [{min}, {max}]"));
                }
                if *precision == FloatPrecision::Single
                    && (min < &(f32::MIN as f64) || max > &(f32::MAX as f64))
                {
                    return violation("single precision bounds exceed the f32 domain".to_string());
                }
            }
            Variant::Structure { children } => {
                let children = children.borrow();
                for (i, (name, _)) in children.iter().enumerate() {
                    if validate_element_name(name).is_err() {
                        return violation(format!("invalid element name {name:?}"));
                    }
                    if children[..i].iter().any(|(other, _)| other == name) {
                        return violation(format!("duplicate element name {name:?}"));
                    }
                }
            }
            Variant::Vector { allow_hetero, children } => {
                let children = children.borrow();
                if !allow_hetero {
                    if let Some(first) = children.first() {
                        for child in children.iter().skip(1) {
                            if !NodeBody::shape_eq(first, child) {
                                return violation(
                                    "heterogeneous children in a homogeneous vector".to_string(),
                                );
                            }
                        }
                    }
                }
            }
            Variant::CompressedVector(state) => {
                if collect_terminal_fields(&state.prototype).is_err() {
                    return violation("prototype is not a structure of terminal fields".to_string());
                }
            }
            Variant::Ustring { .. } | Variant::Blob { .. } => {}
        }
        Ok(())
    }

    fn child_bodies(&self) -> Vec<Rc<NodeBody>> {
        match &self.body.variant {
            Variant::Structure { children } => {
                children.borrow().iter().map(|(_, c)| Rc::clone(c)).collect()
            }
            Variant::Vector { children, .. } => children.borrow().iter().cloned().collect(),
            Variant::CompressedVector(state) => {
                vec![Rc::clone(&state.prototype), Rc::clone(&state.codecs)]
            }
            _ => Vec::new(),
        }
    }
}

/// Implements the operations shared by every typed node handle, the upcast
/// into [`Node`], and the tag-checked downcast out of it.
macro_rules! impl_node_common {
    ($ty:ident, $tag:ident) => {
        impl $ty {
            /// True if this node has no parent.
            pub fn is_root(&self) -> bool {
                self.node.is_root()
            }

            /// The parent node, or this node itself if it is a root.
            pub fn parent(&self) -> Node {
                self.node.parent()
            }

            /// Absolute path name of this node from its tree root.
            pub fn path_name(&self) -> String {
                self.node.path_name()
            }

            /// The name identifying this node in its parent. Empty for roots.
            pub fn element_name(&self) -> String {
                self.node.element_name()
            }

            /// The image file this node was declared against.
            pub fn dest_image_file(&self) -> crate::error::Result<crate::imagefile::ImageFile> {
                self.node.dest_image_file()
            }

            /// True iff this node is reachable from its container's root.
            pub fn is_attached(&self) -> bool {
                self.node.is_attached()
            }

            /// Borrows the generic handle underlying this typed handle.
            pub fn node(&self) -> &Node {
                &self.node
            }

            /// Checks this node's class invariant. With `do_upcast`, the
            /// generic node invariants are checked as well; with
            /// `do_recurse`, children are checked recursively. Returns
            /// immediately if the container is closed.
            pub fn check_invariant(
                &self,
                do_recurse: bool,
                do_upcast: bool,
            ) -> crate::error::Result<()> {
                if self.node.body.usable_file().is_err() {
                    return Ok(());
                }
                if do_upcast {
                    self.node.check_invariant(do_recurse)
                } else {
                    self.node.check_local_invariant(do_recurse)
                }
            }
        }

        impl From<$ty> for Node {
            fn from(typed: $ty) -> Node {
                typed.node
            }
        }

        impl TryFrom<Node> for $ty {
            type Error = crate::error::Error;

            fn try_from(node: Node) -> crate::error::Result<Self> {
                if node.node_type() == NodeType::$tag {
                    Ok(Self { node })
                } else {
                    Err(crate::error::Error::new(
                        crate::error::ErrorKind::BadNodeDowncast,
                        format!(
                            "expected {} node, got {}",
                            NodeType::$tag,
                            node.node_type()
                        ),
                    ))
                }
            }
        }
    };
}
pub(crate) use impl_node_common;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_name_validation() {
        assert!(validate_element_name("cartesianX").is_ok());
        assert!(validate_element_name("_tmp9").is_ok());
        assert!(validate_element_name("").is_err());
        assert!(validate_element_name("9lives").is_err());
        assert!(validate_element_name("has space").is_err());
        assert!(validate_element_name("dash-ed").is_err());
    }
}
