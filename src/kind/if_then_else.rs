use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use refl::Id;

use crate::kind::NodeGenerics;
use crate::node::Input;
use crate::{Value, WeakNode};

/// Shared payload of `if_then_else`: a test-change sentinel watching the
/// boolean test, and a main node tracking only the selected branch. The
/// unselected branch is not a child at all, so it is neither recomputed nor
/// able to invalidate the main node.
pub(crate) struct IfThenElseNode<T>
where
    T: Value,
{
    pub test: Input<bool>,
    pub then_: Input<T>,
    pub else_: Input<T>,
    pub test_change: RefCell<WeakNode>,
    pub main: RefCell<WeakNode>,
    pub current_branch: RefCell<Option<Input<T>>>,
}

impl<T: Value> fmt::Debug for IfThenElseNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IfThenElseNode").finish()
    }
}

pub(crate) struct IfTestChangeGen<T> {
    _phantom: PhantomData<T>,
}

impl<T> NodeGenerics for IfTestChangeGen<T>
where
    T: Value,
{
    type R = ();
    type BindLhs = bool;
    type BindRhs = T;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

pub(crate) struct IfMainGen<T> {
    _phantom: PhantomData<T>,
}

impl<T> NodeGenerics for IfMainGen<T>
where
    T: Value,
{
    type R = T;
    type BindLhs = bool;
    type BindRhs = T;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

pub(crate) struct IfTestChangeId<G: NodeGenerics> {
    pub(crate) r_unit: Id<(), G::R>,
}

impl<G: NodeGenerics> fmt::Debug for IfTestChangeId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfTestChangeId").finish()
    }
}

pub(crate) struct IfMainId<G: NodeGenerics> {
    pub(crate) branch_r: Id<G::BindRhs, G::R>,
}

impl<G: NodeGenerics> fmt::Debug for IfMainId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfMainId").finish()
    }
}
