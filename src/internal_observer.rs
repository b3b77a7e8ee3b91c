use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Display};
use std::rc::{Rc, Weak};

use crate::incr::Incr;
use crate::node::{ErasedNode, Incremental};
use crate::node_update::{HandleUpdate, NodeUpdateDelayed, OnUpdateHandler};
use crate::stabilisation_num::StabilisationNum;
use crate::state::{IncrStatus, State};
use crate::{CellIncrement, NodeRef, Value};

pub(crate) type StrongObserver = Rc<dyn ErasedObserver>;
pub(crate) type WeakObserver = Weak<dyn ErasedObserver>;

/// Observer lifecycle. Transitions are owned by the observer/state modules;
/// a node's observer table only ever contains `InUse` and `Disallowed`
/// observers.
///
/// `Created -> InUse` happens when the next stabilisation picks the observer
/// up; `InUse -> Disallowed` when use is disallowed (or the last public
/// handle is dropped); `Disallowed -> Unlinked` when the following
/// stabilisation removes it from the observed node. `Created -> Unlinked`
/// covers observers abandoned before they were ever linked in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ObserverState {
    Created,
    InUse,
    Disallowed,
    Unlinked,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

impl ObserverId {
    fn next() -> Self {
        thread_local! {
            static OBSERVER_ID: Cell<usize> = Cell::new(0);
        }
        OBSERVER_ID.with(|x| {
            let next = x.get() + 1;
            x.set(next);
            ObserverId(next)
        })
    }
}

impl Debug for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

/// Identifies one subscription (one update handler) on one observer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionToken {
    observer_id: ObserverId,
    subscription: usize,
}

impl SubscriptionToken {
    pub(crate) fn observer_id(&self) -> ObserverId {
        self.observer_id
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum ObserverError {
    CurrentlyStabilising,
    NeverStabilised,
    Disallowed,
    ObservingInvalid,
}

impl Display for ObserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CurrentlyStabilising => write!(
                f,
                "the graph is currently stabilising; observer values cannot be read from inside a map or bind function"
            ),
            Self::NeverStabilised => write!(
                f,
                "the graph has never stabilised, so this observer does not have a value yet"
            ),
            Self::Disallowed => write!(f, "observer has been disallowed"),
            Self::ObservingInvalid => write!(f, "observing an invalid incremental"),
        }
    }
}

impl std::error::Error for ObserverError {}

pub(crate) trait ErasedObserver: Debug {
    fn id(&self) -> ObserverId;
    fn state(&self) -> &Cell<ObserverState>;
    fn observing_erased(&self) -> &dyn ErasedNode;
    fn observing_packed(&self) -> NodeRef;
    fn num_handlers(&self) -> i32;
    fn add_to_observed_node(&self);
    fn remove_from_observed_node(&self);
    fn run_all(&self, node: &dyn ErasedNode, node_update: NodeUpdateDelayed, now: StabilisationNum);
    fn disallow_future_use(&self, state: &State);
    fn unsubscribe_erased(&self, token: SubscriptionToken);
}

pub struct InternalObserver<T: Value> {
    id: ObserverId,
    pub(crate) state: Cell<ObserverState>,
    observing: Incr<T>,
    /// Newest first: subscriptions are prepended and dispatched from the
    /// front, so within one observer the most recent handler runs first.
    on_update_handlers: RefCell<Vec<(SubscriptionToken, OnUpdateHandler<T>)>>,
    next_subscription: Cell<usize>,
    weak_self: RefCell<WeakObserver>,
}

impl<T: Value> Debug for InternalObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalObserver")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl<T: Value> InternalObserver<T> {
    pub(crate) fn new(observing: Incr<T>) -> Rc<Self> {
        let rc = Rc::new(Self {
            id: ObserverId::next(),
            state: Cell::new(ObserverState::Created),
            observing,
            on_update_handlers: RefCell::new(vec![]),
            next_subscription: Cell::new(0),
            weak_self: RefCell::new(Weak::<Self>::new() as WeakObserver),
        });
        *rc.weak_self.borrow_mut() = Rc::downgrade(&rc) as WeakObserver;
        rc
    }

    pub(crate) fn incr_state(&self) -> Option<Rc<State>> {
        self.observing.node.state_opt()
    }

    pub(crate) fn try_get_value(&self) -> Result<T, ObserverError> {
        match self.state.get() {
            ObserverState::Created => Err(ObserverError::NeverStabilised),
            ObserverState::InUse => {
                let t = self
                    .incr_state()
                    .ok_or(ObserverError::ObservingInvalid)?;
                if t.status.get() == IncrStatus::Stabilising {
                    return Err(ObserverError::CurrentlyStabilising);
                }
                self.observing
                    .node
                    .value_opt()
                    .ok_or(ObserverError::ObservingInvalid)
            }
            ObserverState::Disallowed | ObserverState::Unlinked => Err(ObserverError::Disallowed),
        }
    }

    pub(crate) fn subscribe(
        &self,
        handler: OnUpdateHandler<T>,
    ) -> Result<SubscriptionToken, ObserverError> {
        match self.state.get() {
            ObserverState::Disallowed | ObserverState::Unlinked => Err(ObserverError::Disallowed),
            ObserverState::Created | ObserverState::InUse => {
                let subscription = self.next_subscription.get();
                self.next_subscription.set(subscription + 1);
                let token = SubscriptionToken {
                    observer_id: self.id,
                    subscription,
                };
                let mut handlers = self.on_update_handlers.borrow_mut();
                handlers.insert(0, (token, handler));
                drop(handlers);
                if self.state.get() == ObserverState::InUse {
                    // a Created observer's handlers are counted when it is
                    // linked into the node
                    self.observing.node.num_on_update_handlers().increment();
                }
                Ok(token)
            }
        }
    }

    pub(crate) fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), ObserverError> {
        let mut handlers = self.on_update_handlers.borrow_mut();
        let Some(index) = handlers.iter().position(|(t, _)| *t == token) else {
            // already unsubscribed (or never existed); nothing to undo
            return Ok(());
        };
        handlers.remove(index);
        drop(handlers);
        if self.state.get() == ObserverState::InUse {
            self.observing.node.num_on_update_handlers().decrement();
        }
        Ok(())
    }
}

impl<T: Value> ErasedObserver for InternalObserver<T> {
    fn id(&self) -> ObserverId {
        self.id
    }
    fn state(&self) -> &Cell<ObserverState> {
        &self.state
    }
    fn observing_erased(&self) -> &dyn ErasedNode {
        self.observing.node.erased()
    }
    fn observing_packed(&self) -> NodeRef {
        self.observing.node.packed()
    }
    fn num_handlers(&self) -> i32 {
        self.on_update_handlers.borrow().len() as i32
    }
    fn add_to_observed_node(&self) {
        let node = &self.observing.node;
        node.add_observer(self.id, self.weak_self.borrow().clone());
        node.num_on_update_handlers()
            .update_val(|x| x + self.num_handlers());
    }
    fn remove_from_observed_node(&self) {
        let node = &self.observing.node;
        node.remove_observer(self.id);
        node.num_on_update_handlers()
            .update_val(|x| x - self.num_handlers());
    }
    fn run_all(
        &self,
        node: &dyn ErasedNode,
        node_update: NodeUpdateDelayed,
        now: StabilisationNum,
    ) {
        // Freeze the current handler list: handlers subscribed during this
        // dispatch must not run until the next one.
        let mut frozen = std::mem::take(&mut *self.on_update_handlers.borrow_mut());
        for (_token, handler) in frozen.iter_mut() {
            // Re-read the state before every invocation: a prior handler (on
            // this or any observer) may have disallowed this observer.
            match self.state.get() {
                ObserverState::InUse => handler.run(node, node_update, now),
                ObserverState::Disallowed => break,
                ObserverState::Created | ObserverState::Unlinked => {
                    panic!("running handlers of an observer that is not linked to its node")
                }
            }
        }
        let mut handlers = self.on_update_handlers.borrow_mut();
        // anything subscribed during the dispatch stays in front
        handlers.extend(frozen);
    }
    fn unsubscribe_erased(&self, token: SubscriptionToken) {
        let _ = self.unsubscribe(token);
    }
    fn disallow_future_use(&self, state: &State) {
        match self.state.get() {
            ObserverState::Disallowed | ObserverState::Unlinked => {}
            ObserverState::Created => {
                state.num_active_observers.decrement();
                self.state.set(ObserverState::Unlinked);
                self.on_update_handlers.borrow_mut().clear();
            }
            ObserverState::InUse => {
                state.num_active_observers.decrement();
                self.state.set(ObserverState::Disallowed);
                let mut disallowed = state.disallowed_observers.borrow_mut();
                disallowed.push(self.weak_self.borrow().clone());
            }
        }
    }
}
