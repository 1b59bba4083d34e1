//! Aggregate nodes: structures and vectors.

use super::{
    adopt, impl_node_common, resolve_path, validate_element_name, Node, NodeBody, NodeType,
    Variant,
};
use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::ImageFile;
use std::cell::RefCell;
use std::rc::Rc;

/// An aggregate node mapping element names to children, preserving
/// insertion order for serialization.
#[derive(Debug, Clone)]
pub struct StructureNode {
    node: Node,
}

impl StructureNode {
    /// Creates an empty structure declared against `dest`.
    pub fn new(dest: &ImageFile) -> Result<Self> {
        let file = dest.creation_body()?;
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::Structure {
                    children: RefCell::new(Vec::new()),
                },
            )),
        })
    }

    pub(crate) fn from_body(body: Rc<NodeBody>) -> Self {
        debug_assert!(matches!(body.variant, Variant::Structure { .. }));
        Self {
            node: Node::from_body(body),
        }
    }

    fn children_cell(&self) -> &RefCell<Vec<(String, Rc<NodeBody>)>> {
        match &self.node.body.variant {
            Variant::Structure { children } => children,
            _ => unreachable!("downcast guarantees the Structure variant"),
        }
    }

    /// Number of direct children.
    pub fn child_count(&self) -> Result<usize> {
        self.node.body.usable_file()?;
        Ok(self.children_cell().borrow().len())
    }

    /// True if `path` resolves relative to this structure.
    pub fn is_defined(&self, path: &str) -> Result<bool> {
        self.node.body.usable_file()?;
        match resolve_path(&self.node.body, path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::PathUndefined => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resolves a child by path relative to this structure.
    pub fn get(&self, path: &str) -> Result<Node> {
        self.node.body.usable_file()?;
        Ok(Node::from_body(resolve_path(&self.node.body, path)?))
    }

    /// The direct children with their element names, in insertion order.
    pub fn children(&self) -> Result<Vec<(String, Node)>> {
        self.node.body.usable_file()?;
        Ok(self
            .children_cell()
            .borrow()
            .iter()
            .map(|(name, body)| (name.clone(), Node::from_body(Rc::clone(body))))
            .collect())
    }

    /// Attaches `child` under the given element name.
    ///
    /// # Errors
    ///
    /// `BadPathName` for an invalid or colliding name; `AlreadyHasParent`
    /// if the child is attached elsewhere; `BadAPIArgument` if the child
    /// was declared against another container; `SetTwice` once the
    /// enclosing compressed vector has started writing.
    pub fn set(&self, name: &str, child: impl Into<Node>) -> Result<()> {
        self.node.body.usable_file()?;
        if self.node.body.sealed_by_write() {
            return Err(Error::new(
                ErrorKind::SetTwice,
                format!("cannot add {name:?}: the enclosing compressed vector has been written"),
            ));
        }
        validate_element_name(name)?;
        if self
            .children_cell()
            .borrow()
            .iter()
            .any(|(existing, _)| existing == name)
        {
            return Err(Error::new(
                ErrorKind::BadPathName,
                format!("element {name:?} already exists in {}", self.path_name()),
            ));
        }
        let child = child.into();
        adopt(&self.node.body, &child.body, name.to_string())?;
        self.children_cell()
            .borrow_mut()
            .push((name.to_string(), child.body));
        Ok(())
    }
}

impl_node_common!(StructureNode, Structure);

/// An aggregate node holding an ordered sequence of children.
///
/// When `allow_hetero_children` is false, every child must be structurally
/// identical in shape to the first.
#[derive(Debug, Clone)]
pub struct VectorNode {
    node: Node,
}

impl VectorNode {
    /// Creates an empty vector declared against `dest`.
    pub fn new(dest: &ImageFile, allow_hetero_children: bool) -> Result<Self> {
        let file = dest.creation_body()?;
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::Vector {
                    allow_hetero: allow_hetero_children,
                    children: RefCell::new(Vec::new()),
                },
            )),
        })
    }

    fn parts(&self) -> (bool, &RefCell<Vec<Rc<NodeBody>>>) {
        match &self.node.body.variant {
            Variant::Vector { allow_hetero, children } => (*allow_hetero, children),
            _ => unreachable!("downcast guarantees the Vector variant"),
        }
    }

    /// True if children of differing shapes are permitted.
    pub fn allow_hetero_children(&self) -> Result<bool> {
        self.node.body.usable_file()?;
        Ok(self.parts().0)
    }

    /// Number of children.
    pub fn child_count(&self) -> Result<usize> {
        self.node.body.usable_file()?;
        Ok(self.parts().1.borrow().len())
    }

    /// The child at `index`.
    pub fn get(&self, index: usize) -> Result<Node> {
        self.node.body.usable_file()?;
        self.parts()
            .1
            .borrow()
            .get(index)
            .map(|body| Node::from_body(Rc::clone(body)))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PathUndefined,
                    format!("vector index {index} out of range"),
                )
            })
    }

    /// The children in order.
    pub fn children(&self) -> Result<Vec<Node>> {
        self.node.body.usable_file()?;
        Ok(self
            .parts()
            .1
            .borrow()
            .iter()
            .map(|body| Node::from_body(Rc::clone(body)))
            .collect())
    }

    /// Appends `child` to the end of the vector.
    ///
    /// # Errors
    ///
    /// `AlreadyHasParent` if the child is attached elsewhere;
    /// `BadAPIArgument` for a foreign-container child or a shape mismatch
    /// in a homogeneous vector; `SetTwice` once the enclosing compressed
    /// vector has started writing.
    pub fn append(&self, child: impl Into<Node>) -> Result<()> {
        self.node.body.usable_file()?;
        if self.node.body.sealed_by_write() {
            return Err(Error::new(
                ErrorKind::SetTwice,
                "cannot append: the enclosing compressed vector has been written",
            ));
        }
        let child = child.into();
        let (allow_hetero, children) = self.parts();
        if !allow_hetero {
            if let Some(first) = children.borrow().first() {
                if !NodeBody::shape_eq(first, &child.body) {
                    return Err(Error::new(
                        ErrorKind::BadAPIArgument,
                        "homogeneous vector children must share the first child's shape",
                    ));
                }
            }
        }
        let index = children.borrow().len();
        adopt(&self.node.body, &child.body, index.to_string())?;
        children.borrow_mut().push(child.body);
        Ok(())
    }
}

impl_node_common!(VectorNode, Vector);
