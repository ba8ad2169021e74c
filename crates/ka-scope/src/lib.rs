#![forbid(unsafe_code)]

//! Hierarchical name -> tensor environments.
//!
//! A [`ScopeTree`] owns every scope it creates. Each scope keeps the id of its
//! parent for read fallback only; writes always land in the scope they were
//! issued against, so a child can never mutate its parent.

use std::collections::BTreeMap;

use ka_core::{DDim, Element, LoD, Tensor, TensorError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(usize);

impl ScopeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    #[error("scope {0:?} does not belong to this tree")]
    UnknownScope(ScopeId),
    #[error("variable '{name}' not found in scope {scope:?}")]
    VariableNotFound { scope: ScopeId, name: String },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Default)]
struct ScopeNode {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    vars: BTreeMap<String, Tensor>,
}

#[derive(Debug)]
pub struct ScopeTree {
    nodes: Vec<ScopeNode>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![ScopeNode::default()],
        }
    }

    #[must_use]
    pub const fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn new_scope(&mut self, parent: ScopeId) -> Result<ScopeId, ScopeError> {
        if parent.0 >= self.nodes.len() {
            return Err(ScopeError::UnknownScope(parent));
        }
        let id = ScopeId(self.nodes.len());
        self.nodes.push(ScopeNode {
            parent: Some(parent),
            ..ScopeNode::default()
        });
        self.nodes[parent.0].children.push(id);
        debug!(?parent, child = ?id, "created child scope");
        Ok(id)
    }

    #[must_use]
    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.nodes.get(id.0).and_then(|node| node.parent)
    }

    #[must_use]
    pub fn children(&self, id: ScopeId) -> &[ScopeId] {
        self.nodes
            .get(id.0)
            .map_or(&[], |node| node.children.as_slice())
    }

    /// Returns the local tensor `name`, creating an empty one on first use.
    pub fn new_tensor(&mut self, id: ScopeId, name: &str) -> Result<&mut Tensor, ScopeError> {
        let node = self
            .nodes
            .get_mut(id.0)
            .ok_or(ScopeError::UnknownScope(id))?;
        Ok(node.vars.entry(name.to_owned()).or_default())
    }

    /// Looks `name` up in `id`, then in each ancestor in turn.
    #[must_use]
    pub fn find_tensor(&self, id: ScopeId, name: &str) -> Option<&Tensor> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.nodes.get(current.0)?;
            if let Some(tensor) = node.vars.get(name) {
                return Some(tensor);
            }
            cursor = node.parent;
        }
        None
    }

    #[must_use]
    pub fn find_local_tensor(&self, id: ScopeId, name: &str) -> Option<&Tensor> {
        self.nodes.get(id.0)?.vars.get(name)
    }

    pub fn find_local_tensor_mut(&mut self, id: ScopeId, name: &str) -> Option<&mut Tensor> {
        self.nodes.get_mut(id.0)?.vars.get_mut(name)
    }

    #[must_use]
    pub fn local_var_names(&self, id: ScopeId) -> Vec<&str> {
        self.nodes.get(id.0).map_or_else(Vec::new, |node| {
            node.vars.keys().map(String::as_str).collect()
        })
    }

    /// Moves a local tensor out of its slot so it can be written while other
    /// tensors of the tree are borrowed. Pair with [`ScopeTree::restore_local`].
    pub fn take_local(&mut self, id: ScopeId, name: &str) -> Result<Tensor, ScopeError> {
        self.nodes
            .get_mut(id.0)
            .ok_or(ScopeError::UnknownScope(id))?
            .vars
            .remove(name)
            .ok_or_else(|| ScopeError::VariableNotFound {
                scope: id,
                name: name.to_owned(),
            })
    }

    pub fn restore_local(
        &mut self,
        id: ScopeId,
        name: &str,
        tensor: Tensor,
    ) -> Result<(), ScopeError> {
        self.nodes
            .get_mut(id.0)
            .ok_or(ScopeError::UnknownScope(id))?
            .vars
            .insert(name.to_owned(), tensor);
        Ok(())
    }

    pub fn scope(&self, id: ScopeId) -> Result<ScopeRef<'_>, ScopeError> {
        if id.0 >= self.nodes.len() {
            return Err(ScopeError::UnknownScope(id));
        }
        Ok(ScopeRef { tree: self, id })
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> Result<ScopeMut<'_>, ScopeError> {
        if id.0 >= self.nodes.len() {
            return Err(ScopeError::UnknownScope(id));
        }
        Ok(ScopeMut { tree: self, id })
    }
}

/// Read-only handle on one scope of a tree.
#[derive(Debug, Clone, Copy)]
pub struct ScopeRef<'a> {
    tree: &'a ScopeTree,
    id: ScopeId,
}

impl<'a> ScopeRef<'a> {
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[must_use]
    pub fn find_tensor(&self, name: &str) -> Option<&'a Tensor> {
        self.tree.find_tensor(self.id, name)
    }

    pub fn require_tensor(&self, name: &str) -> Result<&'a Tensor, ScopeError> {
        self.find_tensor(name)
            .ok_or_else(|| ScopeError::VariableNotFound {
                scope: self.id,
                name: name.to_owned(),
            })
    }

    #[must_use]
    pub fn local_var_names(&self) -> Vec<&'a str> {
        self.tree.local_var_names(self.id)
    }
}

/// Mutable handle on one scope. Reads fall back to ancestors; writes stay
/// local.
#[derive(Debug)]
pub struct ScopeMut<'a> {
    tree: &'a mut ScopeTree,
    id: ScopeId,
}

impl ScopeMut<'_> {
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    #[must_use]
    pub fn find_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tree.find_tensor(self.id, name)
    }

    pub fn require_tensor(&self, name: &str) -> Result<&Tensor, ScopeError> {
        self.find_tensor(name)
            .ok_or_else(|| ScopeError::VariableNotFound {
                scope: self.id,
                name: name.to_owned(),
            })
    }

    pub fn find_local_tensor_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.tree.find_local_tensor_mut(self.id, name)
    }

    pub fn require_local_tensor_mut(&mut self, name: &str) -> Result<&mut Tensor, ScopeError> {
        let id = self.id;
        self.tree
            .find_local_tensor_mut(id, name)
            .ok_or_else(|| ScopeError::VariableNotFound {
                scope: id,
                name: name.to_owned(),
            })
    }

    pub fn new_tensor(&mut self, name: &str) -> Result<&mut Tensor, ScopeError> {
        self.tree.new_tensor(self.id, name)
    }

    /// Creates (or overwrites) a host tensor with the given dims, values and
    /// LoD. An empty `lod` leaves the tensor without sequence metadata.
    pub fn set_common_tensor<T: Element>(
        &mut self,
        name: &str,
        dims: impl Into<DDim>,
        values: &[T],
        lod: LoD,
    ) -> Result<&mut Tensor, ScopeError> {
        let tensor = self.tree.new_tensor(self.id, name)?;
        tensor.assign(values, dims)?;
        if !lod.is_empty() {
            tensor.set_lod(lod);
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use ka_core::{TargetType, Tensor};
    use proptest::prelude::*;

    use super::{ScopeError, ScopeId, ScopeTree};

    #[test]
    fn child_reads_fall_back_to_root() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let child = tree.new_scope(root).expect("child scope");
        tree.scope_mut(root)
            .expect("root handle")
            .set_common_tensor("x", [2], &[1.0f32, 2.0], Vec::new())
            .expect("root input");

        let found = tree.find_tensor(child, "x").expect("fallback read");
        assert_eq!(found.data::<f32>().expect("host data"), &[1.0, 2.0]);
        assert!(tree.find_local_tensor(child, "x").is_none());
    }

    #[test]
    fn child_write_shadows_without_touching_parent() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let child = tree.new_scope(root).expect("child scope");
        tree.scope_mut(root)
            .expect("root handle")
            .set_common_tensor("x", [1], &[1i32], Vec::new())
            .expect("root input");

        let shadow = tree.new_tensor(child, "x").expect("shadow tensor");
        shadow.assign(&[5i32], [1]).expect("assign");

        assert_eq!(
            tree.find_tensor(child, "x")
                .expect("child view")
                .data::<i32>()
                .expect("host"),
            &[5]
        );
        assert_eq!(
            tree.find_tensor(root, "x")
                .expect("root view")
                .data::<i32>()
                .expect("host"),
            &[1]
        );
    }

    #[test]
    fn siblings_do_not_alias() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let inst = tree.new_scope(root).expect("inst");
        let base = tree.new_scope(root).expect("base");
        assert_ne!(inst, base);

        tree.new_tensor(inst, "out")
            .expect("inst out")
            .assign(&[1.0f32], [1])
            .expect("assign");
        tree.new_tensor(base, "out").expect("base out");

        assert!(tree.find_local_tensor(base, "out").expect("base out").data::<f32>().is_err());
        assert_eq!(tree.children(root), &[inst, base]);
        assert_eq!(tree.parent(inst), Some(root));
    }

    #[test]
    fn lookups_never_create_variables() {
        let mut tree = ScopeTree::new();
        let child = tree.new_scope(tree.root()).expect("child");
        assert!(tree.find_tensor(child, "missing").is_none());
        assert!(tree.find_local_tensor_mut(child, "missing").is_none());
        assert!(tree.local_var_names(child).is_empty());

        let err = tree
            .scope(child)
            .expect("child handle")
            .require_tensor("missing")
            .expect_err("missing variable must be reported");
        assert!(matches!(err, ScopeError::VariableNotFound { .. }));
    }

    #[test]
    fn new_tensor_returns_existing_slot() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        tree.new_tensor(root, "y").expect("y").resize([3]);
        assert_eq!(tree.new_tensor(root, "y").expect("y again").numel(), 3);
        assert_eq!(tree.local_var_names(root), vec!["y"]);
    }

    #[test]
    fn take_and_restore_keep_the_slot() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        tree.new_tensor(root, "out").expect("out").resize([2]);

        let mut taken = tree.take_local(root, "out").expect("take");
        assert!(tree.find_local_tensor(root, "out").is_none());
        taken.mutable_data::<f32>(TargetType::Host)[1] = 3.0;
        tree.restore_local(root, "out", taken).expect("restore");

        let restored = tree.find_local_tensor(root, "out").expect("restored");
        assert_eq!(restored.data::<f32>().expect("host"), &[0.0, 3.0]);
        assert!(tree.take_local(root, "nope").is_err());
    }

    #[test]
    fn foreign_scope_id_is_rejected() {
        let mut tree = ScopeTree::new();
        let stray = ScopeId(42);
        assert!(matches!(tree.new_scope(stray), Err(ScopeError::UnknownScope(_))));
        assert!(tree.scope(stray).is_err());
        assert!(tree.find_tensor(stray, "x").is_none());
        assert!(tree.children(stray).is_empty());
    }

    #[test]
    fn set_common_tensor_attaches_lod() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        let mut scope = tree.scope_mut(root).expect("root");
        let tensor = scope
            .set_common_tensor("seq", [4, 1], &[1i64, 2, 3, 4], vec![vec![0, 1, 4]])
            .expect("seq tensor");
        assert_eq!(tensor.lod(), &vec![vec![0, 1, 4]]);
        assert_eq!(tensor.target(), TargetType::Host);
    }

    proptest! {
        #[test]
        fn prop_deep_chain_resolves_nearest_definition(
            depth in 1usize..=8,
            define_at in 0usize..=8,
        ) {
            let define_at = define_at.min(depth);
            let mut tree = ScopeTree::new();
            let mut chain = vec![tree.root()];
            for _ in 0..depth {
                let parent = *chain.last().expect("chain is never empty");
                chain.push(tree.new_scope(parent).expect("child"));
            }

            let mut marker = Tensor::new();
            marker.assign(&[define_at as i32], [1]).expect("marker");
            *tree.new_tensor(chain[define_at], "v").expect("slot") = marker;

            let leaf = *chain.last().expect("leaf");
            let seen = tree.find_tensor(leaf, "v").expect("visible from leaf");
            prop_assert_eq!(seen.data::<i32>().expect("host")[0], define_at as i32);

            for id in &chain[..define_at] {
                prop_assert!(tree.find_tensor(*id, "v").is_none());
            }
        }
    }
}
