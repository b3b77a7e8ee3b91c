use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use crate::kind::NodeGenerics;
use crate::node::Input;
use crate::Value;

/// Tracks a child until `only_freeze_when` accepts its value, then the node
/// is restructured into a `Constant` of that value and detached from the
/// child forever.
///
/// Freeze nodes are necessary from the moment they are created (they must
/// see the child's values even with no observer yet), which is why
/// `is_necessary` special-cases this kind.
pub(crate) struct FreezeNode<T>
where
    T: Value,
{
    pub child: Input<T>,
    pub only_freeze_when: RefCell<Box<dyn FnMut(&T) -> bool>>,
}

impl<T: Value> fmt::Debug for FreezeNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FreezeNode").finish()
    }
}

pub(crate) struct FreezeGen<T> {
    _phantom: PhantomData<T>,
}

impl<T> NodeGenerics for FreezeGen<T>
where
    T: Value,
{
    type R = T;
    crate::kind::node_generics_default! { BindLhs, BindRhs }
    crate::kind::node_generics_default! { I1, I2, I3, I4, I5, I6, I7, I8, I9 }
    crate::kind::node_generics_default! { Fold, Update }
}
