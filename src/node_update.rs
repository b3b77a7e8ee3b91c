use std::cell::Cell;

use crate::node::ErasedNode;
use crate::stabilisation_num::StabilisationNum;

pub(crate) type BoxedUpdateFn<T> = Box<dyn FnMut(NodeUpdate<&T>)>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
enum Previously {
    NeverBeenUpdated,
    Necessary,
    Changed,
    Invalidated,
    Unnecessary,
}

/// What happened to a node, recorded at the end of a stabilisation and
/// dispatched to handlers once the value snapshots can be read safely.
#[derive(Copy, Clone, Debug)]
pub(crate) enum NodeUpdateDelayed {
    Necessary,
    Changed,
    Invalidated,
    Unnecessary,
}

/// The payload delivered to an on-update handler.
#[derive(Debug)]
pub enum NodeUpdate<T> {
    /// The node became necessary and computed its first visible value.
    Necessary(T),
    /// The node's value changed. `old` is the pre-stabilisation value, if the
    /// node had one.
    Changed { old: Option<T>, new: T },
    /// The node was invalidated; it will never produce a value again.
    Invalidated,
    /// The node fell out of the necessary part of the graph.
    Unnecessary,
}

pub(crate) type ErasedOnUpdateHandler = Box<dyn HandleUpdate>;

pub(crate) trait HandleUpdate {
    fn run(&mut self, node: &dyn ErasedNode, node_update: NodeUpdateDelayed, now: StabilisationNum);
}

pub(crate) struct OnUpdateHandler<T> {
    handler_fn: BoxedUpdateFn<T>,
    previous_update_kind: Cell<Previously>,
    created_at: StabilisationNum,
}

impl<T: 'static> OnUpdateHandler<T> {
    pub(crate) fn new(created_at: StabilisationNum, handler_fn: BoxedUpdateFn<T>) -> Self {
        OnUpdateHandler {
            handler_fn,
            created_at,
            previous_update_kind: Previously::NeverBeenUpdated.into(),
        }
    }

    fn really_run_downcast(&mut self, node: &dyn ErasedNode, node_update: NodeUpdateDelayed) {
        self.previous_update_kind.set(match &node_update {
            NodeUpdateDelayed::Changed => Previously::Changed,
            NodeUpdateDelayed::Necessary => Previously::Necessary,
            NodeUpdateDelayed::Invalidated => Previously::Invalidated,
            NodeUpdateDelayed::Unnecessary => Previously::Unnecessary,
        });
        match node_update {
            NodeUpdateDelayed::Changed => {
                let new_any = node.value_as_any().unwrap();
                let new = new_any.downcast_ref::<T>().expect("downcast_ref failed");
                let old_any = node.old_value_as_any();
                let old = old_any.as_ref().and_then(|r| r.downcast_ref::<T>());
                (self.handler_fn)(NodeUpdate::Changed { old, new });
            }
            NodeUpdateDelayed::Necessary => {
                let new_any = node.value_as_any().unwrap();
                let new = new_any.downcast_ref::<T>().expect("downcast_ref failed");
                (self.handler_fn)(NodeUpdate::Necessary(new));
            }
            NodeUpdateDelayed::Invalidated => (self.handler_fn)(NodeUpdate::Invalidated),
            NodeUpdateDelayed::Unnecessary => (self.handler_fn)(NodeUpdate::Unnecessary),
        }
    }
}

impl<T: 'static> HandleUpdate for OnUpdateHandler<T> {
    fn run(
        &mut self,
        node: &dyn ErasedNode,
        node_update: NodeUpdateDelayed,
        now: StabilisationNum,
    ) {
        /* We only run the handler if it was created in an earlier stabilisation
        cycle. If the handler was created by another on-update handler during
        the running of on-update handlers in the current stabilisation, we
        treat the added handler as if it were added after this stabilisation
        finished. We will run it at the next stabilisation, because the node
        with the handler was pushed on [state.handle_after_stabilisation]. */
        if self.created_at < now {
            match (self.previous_update_kind.get(), node_update) {
                /* Once a node is invalidated, there will never be further
                information to provide, since an invalid node cannot become
                valid again. */
                (Previously::Invalidated, _) => (),
                /* These cases can happen if a node is handled after
                stabilisation due to another handler. There is no new
                information to provide. */
                (Previously::Changed, NodeUpdateDelayed::Necessary)
                | (Previously::Necessary, NodeUpdateDelayed::Necessary)
                | (Previously::Unnecessary, NodeUpdateDelayed::Unnecessary) => (),
                /* If this handler hasn't yet seen the node, a change reads as
                an initialisation. */
                (
                    Previously::NeverBeenUpdated | Previously::Unnecessary,
                    NodeUpdateDelayed::Changed,
                ) => self.really_run_downcast(node, NodeUpdateDelayed::Necessary),
                (_, node_update) => self.really_run_downcast(node, node_update),
            }
        }
    }
}
