use std::cell::RefCell;
use std::rc::Rc;

use recalc::{IncrState, Invariant, ObserverError, Update};

#[test]
fn subscription_sees_initialisation_then_changes() {
    let incr = IncrState::new();
    let v = incr.var(5);
    let obs = v.watch().observe();
    let updates: Rc<RefCell<Vec<Update<i32>>>> = Rc::new(RefCell::new(vec![]));
    let updates_ = updates.clone();
    obs.subscribe(move |u| updates_.borrow_mut().push(u.cloned()));

    incr.stabilise();
    assert_eq!(&*updates.borrow(), &[Update::Initialised(5)]);

    v.set(6);
    incr.stabilise();
    assert_eq!(
        &*updates.borrow(),
        &[
            Update::Initialised(5),
            Update::Changed {
                old: Some(5),
                new: 6
            }
        ]
    );

    // a cutoff change produces no update at all
    v.set(6);
    incr.stabilise();
    assert_eq!(updates.borrow().len(), 2);
    incr.invariant();
}

#[test]
fn direct_handlers_run_newest_first() {
    let incr = IncrState::new();
    let v = incr.var(0);
    let m = v.watch().map(|x| *x);
    let obs = m.observe();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));
    let log1 = log.clone();
    m.on_update(move |_| log1.borrow_mut().push("first"));
    let log2 = log.clone();
    m.on_update(move |_| log2.borrow_mut().push("second"));

    incr.stabilise();
    // prepended, drained from the front: the later handler runs first
    assert_eq!(&*log.borrow(), &["second", "first"]);

    log.borrow_mut().clear();
    v.set(1);
    incr.stabilise();
    assert_eq!(&*log.borrow(), &["second", "first"]);
    assert_eq!(obs.value(), 1);
    incr.invariant();
}

#[test]
fn handlers_added_during_a_drain_wait_for_the_next_one() {
    let incr = IncrState::new();
    let v = incr.var(0);
    let m = v.watch().map(|x| *x);
    let _obs = m.observe();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));
    let log_a = log.clone();
    m.on_update(move |_| log_a.borrow_mut().push("a"));
    // attached last, so it runs first
    let log_adder = log.clone();
    let m_ = m.clone();
    let log_late = log.clone();
    let added = Rc::new(RefCell::new(false));
    m.on_update(move |_| {
        log_adder.borrow_mut().push("adder");
        if !*added.borrow() {
            *added.borrow_mut() = true;
            let log_late = log_late.clone();
            m_.on_update(move |_| log_late.borrow_mut().push("late"));
        }
    });

    incr.stabilise();
    // "late" was attached mid-drain and must not have run yet
    assert_eq!(&*log.borrow(), &["adder", "a"]);

    log.borrow_mut().clear();
    v.set(1);
    incr.stabilise();
    // now it runs, and in front (it is the newest)
    assert_eq!(&*log.borrow(), &["late", "adder", "a"]);
    incr.invariant();
}

#[test]
fn disabling_an_observer_mid_dispatch_skips_its_later_handlers() {
    let incr = IncrState::new();
    let v = incr.var(0);
    let obs = v.watch().observe();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));
    let log_first = log.clone();
    obs.subscribe(move |_| log_first.borrow_mut().push("first"));
    // subscribed later, so this one runs first and disables the observer
    let log_disabler = log.clone();
    let obs_ = obs.clone();
    obs.subscribe(move |_| {
        log_disabler.borrow_mut().push("disabler");
        obs_.disallow_future_use();
    });

    incr.stabilise();
    assert_eq!(&*log.borrow(), &["disabler"]);

    // the observer is now disallowed entirely
    assert_eq!(obs.try_get_value(), Err(ObserverError::Disallowed));
    log.borrow_mut().clear();
    v.set(1);
    incr.stabilise();
    assert!(log.borrow().is_empty());
    incr.invariant();
}

#[test]
fn unsubscribe_stops_updates() {
    let incr = IncrState::new();
    let v = incr.var(0);
    let obs = v.watch().observe();
    let count = Rc::new(RefCell::new(0));
    let count_ = count.clone();
    let token = obs.subscribe(move |_| *count_.borrow_mut() += 1);

    incr.stabilise();
    assert_eq!(*count.borrow(), 1);

    obs.unsubscribe(token).unwrap();
    incr.invariant();
    v.set(1);
    incr.stabilise();
    assert_eq!(*count.borrow(), 1);
    assert_eq!(obs.value(), 1);
    incr.invariant();
}

#[test]
fn observer_value_errors() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let obs = v.watch().observe();
    // never stabilised yet
    assert_eq!(obs.try_get_value(), Err(ObserverError::NeverStabilised));
    incr.stabilise();
    assert_eq!(obs.try_get_value(), Ok(1));

    obs.disallow_future_use();
    assert_eq!(obs.try_get_value(), Err(ObserverError::Disallowed));
    incr.stabilise();
    assert_eq!(obs.try_get_value(), Err(ObserverError::Disallowed));
    assert!(!v.watch().is_necessary());
    incr.invariant();
}

#[test]
fn subscription_sees_invalidation() {
    let incr = IncrState::new();
    let flag = incr.var(true);
    let x = incr.var(1);
    let captured: Rc<RefCell<Option<recalc::Incr<i32>>>> = Rc::new(RefCell::new(None));
    let xw = x.watch();
    let captured_ = captured.clone();
    let bound = flag.watch().binds(move |state, &f| {
        if f {
            let inner = xw.map(|v| *v);
            *captured_.borrow_mut() = Some(inner.clone());
            inner
        } else {
            state.constant(0)
        }
    });
    let obs = bound.observe();
    incr.stabilise();

    let inner = captured.borrow().clone().unwrap();
    let obs_inner = inner.observe();
    let saw: Rc<RefCell<Vec<Update<i32>>>> = Rc::new(RefCell::new(vec![]));
    let saw_ = saw.clone();
    obs_inner.subscribe(move |u| saw_.borrow_mut().push(u.cloned()));
    incr.stabilise();
    assert_eq!(&*saw.borrow(), &[Update::Initialised(1)]);

    flag.set(false);
    incr.stabilise();
    assert_eq!(obs.value(), 0);
    assert_eq!(
        &*saw.borrow(),
        &[Update::Initialised(1), Update::Invalidated]
    );
    incr.invariant();
}

#[test]
fn dropping_the_observer_releases_the_graph() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let m = v.watch().map(|x| x + 1);
    let obs = m.observe();
    incr.stabilise();
    assert!(m.is_necessary());

    drop(obs);
    incr.stabilise();
    assert!(!m.is_necessary());
    assert!(!v.watch().is_necessary());
    incr.invariant();
}
