use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;

use refl::Id;

use crate::incr::Incr;
use crate::kind::NodeGenerics;
use crate::node::{ErasedNode, Input, NodeId};
use crate::scope::{BindScope, Scope};
use crate::{Value, WeakNode};

/// Shared payload of the two nodes a `bind` consists of: the lhs-change
/// sentinel (watches the lhs and rebuilds the rhs) and the main node (copies
/// the current rhs's value).
pub(crate) struct BindNode<T, R>
where
    T: Value,
    R: Value,
{
    pub id_lhs_change: Cell<NodeId>,
    pub lhs_change: RefCell<WeakNode>,
    pub main: RefCell<WeakNode>,
    pub lhs: Input<T>,
    pub mapper: RefCell<Box<dyn FnMut(&T) -> Incr<R>>>,
    pub rhs: RefCell<Option<Input<R>>>,
    pub rhs_scope: RefCell<Scope>,
    pub all_nodes_created_on_rhs: RefCell<Vec<WeakNode>>,
}

impl<T, R> BindScope for BindNode<T, R>
where
    T: Value,
    R: Value,
{
    fn id(&self) -> NodeId {
        self.id_lhs_change.get()
    }
    fn is_valid(&self) -> bool {
        let main_ = self.main.borrow();
        let Some(main) = main_.upgrade() else {
            return false;
        };
        main.is_valid()
    }
    fn is_necessary(&self) -> bool {
        let main_ = self.main.borrow();
        let Some(main) = main_.upgrade() else {
            return false;
        };
        main.is_necessary()
    }
    fn height(&self) -> i32 {
        let lhs_change_ = self.lhs_change.borrow();
        let lhs_change = lhs_change_.upgrade().unwrap();
        lhs_change.height()
    }
    fn add_node(&self, node: WeakNode) {
        tracing::debug!(
            "added node to bind scope {:?}: {:?}",
            self.id(),
            node.upgrade().map(|n| n.id())
        );
        let mut all = self.all_nodes_created_on_rhs.borrow_mut();
        all.push(node);
    }
}

impl<T, R> fmt::Debug for BindNode<T, R>
where
    T: Value,
    R: Value,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BindNode")
            .field("id_lhs_change", &self.id_lhs_change.get())
            .finish()
    }
}

pub(crate) struct BindLhsChangeGen<T, R> {
    _phantom: PhantomData<(T, R)>,
}

impl<T, R> NodeGenerics for BindLhsChangeGen<T, R>
where
    T: Value,
    R: Value,
{
    // the lhs-change node stores (); it is just a sentinel
    type R = ();
    type BindLhs = T;
    type BindRhs = R;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

pub(crate) struct BindMainGen<T, R> {
    _phantom: PhantomData<(T, R)>,
}

impl<T, R> NodeGenerics for BindMainGen<T, R>
where
    T: Value,
    R: Value,
{
    // the main node copies the output of the rhs
    type R = R;
    type BindLhs = T;
    type BindRhs = R;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

/// Witness that a lhs-change node's stored value type is `()`, letting the
/// generic recompute path construct one.
pub(crate) struct BindLhsId<G: NodeGenerics> {
    pub(crate) r_unit: Id<(), G::R>,
}

impl<G: NodeGenerics> fmt::Debug for BindLhsId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindLhsId").finish()
    }
}

/// Witness that a bind main node's stored value type equals its rhs type.
pub(crate) struct BindMainId<G: NodeGenerics> {
    pub(crate) rhs_r: Id<G::BindRhs, G::R>,
}

impl<G: NodeGenerics> fmt::Debug for BindMainId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindMainId").finish()
    }
}
