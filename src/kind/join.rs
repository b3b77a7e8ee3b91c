use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use refl::Id;

use crate::incr::Incr;
use crate::kind::NodeGenerics;
use crate::node::Input;
use crate::{Value, WeakNode};

/// Shared payload of `join` (flattening an `Incr<Incr<T>>`): a lhs-change
/// sentinel watching the outer incremental, and a main node tracking whatever
/// inner incremental the outer one currently holds.
pub(crate) struct JoinNode<T>
where
    T: Value,
{
    pub lhs: Input<Incr<T>>,
    pub lhs_change: RefCell<WeakNode>,
    pub main: RefCell<WeakNode>,
    pub rhs: RefCell<Option<Input<T>>>,
}

impl<T: Value> fmt::Debug for JoinNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JoinNode").finish()
    }
}

pub(crate) struct JoinLhsChangeGen<T> {
    _phantom: PhantomData<T>,
}

impl<T> NodeGenerics for JoinLhsChangeGen<T>
where
    T: Value,
{
    type R = ();
    type BindLhs = Incr<T>;
    type BindRhs = T;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

pub(crate) struct JoinMainGen<T> {
    _phantom: PhantomData<T>,
}

impl<T> NodeGenerics for JoinMainGen<T>
where
    T: Value,
{
    type R = T;
    type BindLhs = Incr<T>;
    type BindRhs = T;
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}

pub(crate) struct JoinLhsId<G: NodeGenerics> {
    pub(crate) r_unit: Id<(), G::R>,
}

impl<G: NodeGenerics> fmt::Debug for JoinLhsId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinLhsId").finish()
    }
}

pub(crate) struct JoinMainId<G: NodeGenerics> {
    pub(crate) rhs_r: Id<G::BindRhs, G::R>,
}

impl<G: NodeGenerics> fmt::Debug for JoinMainId<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinMainId").finish()
    }
}
