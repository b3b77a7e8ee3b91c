use std::cell::RefCell;
use std::rc::Rc;

use recalc::{BeforeOrAfter, IncrState, Invariant, Timestamp};

#[test]
fn at_crosses_its_trigger_time() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(0));
    let at = clock.at(Timestamp(10));
    let obs = at.observe();
    incr.stabilise();
    assert_eq!(obs.value(), BeforeOrAfter::Before);

    clock.advance_to(Timestamp(5));
    incr.stabilise();
    assert_eq!(obs.value(), BeforeOrAfter::Before);

    clock.advance_to(Timestamp(10));
    incr.stabilise();
    assert_eq!(obs.value(), BeforeOrAfter::After);

    // moving backwards is a no-op
    clock.advance_to(Timestamp(3));
    assert_eq!(clock.now(), Timestamp(10));
    incr.invariant();
}

#[test]
fn at_in_the_past_is_after_immediately() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(100));
    let at = clock.at(Timestamp(10));
    let obs = at.observe();
    incr.stabilise();
    assert_eq!(obs.value(), BeforeOrAfter::After);
}

#[test]
fn at_intervals_ticks() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(0));
    let ticks = clock.at_intervals(10);
    let count = Rc::new(RefCell::new(0));
    let count_ = count.clone();
    let counted = ticks.map(move |_| {
        *count_.borrow_mut() += 1;
    });
    let _obs = counted.observe();

    incr.stabilise();
    assert_eq!(*count.borrow(), 1);

    // one alarm fires per advance, however far it jumps
    clock.advance_to(Timestamp(25));
    incr.stabilise();
    assert_eq!(*count.borrow(), 2);

    clock.advance_to(Timestamp(30));
    incr.stabilise();
    assert_eq!(*count.borrow(), 3);

    // no interval boundary crossed, no tick
    clock.advance_to(Timestamp(31));
    incr.stabilise();
    assert_eq!(*count.borrow(), 3);
    incr.invariant();
}

#[test]
fn snapshot_freezes_at_its_time() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(0));
    let v = incr.var(10);
    let snap = clock.snapshot(&v.watch(), Timestamp(10), 0);
    let obs = snap.observe();

    incr.stabilise();
    assert_eq!(obs.value(), 0);
    // before its time, the snapshot does not even depend on the input
    assert!(!v.watch().is_necessary());

    v.set(42);
    clock.advance_to(Timestamp(10));
    incr.stabilise();
    assert_eq!(obs.value(), 42);
    // the snapshot captured and became constant
    assert!(snap.is_const());
    incr.invariant();

    v.set(50);
    incr.stabilise();
    assert_eq!(obs.value(), 42);
    assert!(!v.watch().is_necessary());
    incr.invariant();
}

#[test]
#[should_panic(expected = "future")]
fn snapshot_requires_a_future_time() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(10));
    let v = incr.var(1);
    let _ = clock.snapshot(&v.watch(), Timestamp(10), 0);
}

#[test]
fn step_function_walks_its_steps() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(0));
    let sf = clock.step_function(0, vec![(Timestamp(10), 1), (Timestamp(20), 2)]);
    let obs = sf.observe();

    incr.stabilise();
    assert_eq!(obs.value(), 0);

    clock.advance_to(Timestamp(10));
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    clock.advance_to(Timestamp(15));
    incr.stabilise();
    assert_eq!(obs.value(), 1);

    clock.advance_to(Timestamp(20));
    incr.stabilise();
    assert_eq!(obs.value(), 2);

    clock.advance_to(Timestamp(1000));
    incr.stabilise();
    assert_eq!(obs.value(), 2);
    incr.invariant();
}

#[test]
fn step_function_jumping_past_several_steps() {
    let incr = IncrState::new();
    let clock = incr.clock(Timestamp(0));
    let sf = clock.step_function(0, vec![(Timestamp(10), 1), (Timestamp(20), 2)]);
    let obs = sf.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 0);

    // a single advance over both steps lands on the latest one
    clock.advance_to(Timestamp(25));
    incr.stabilise();
    assert_eq!(obs.value(), 2);
    incr.invariant();
}

#[test]
fn freeze_takes_the_first_value() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let frozen = v.watch().freeze();
    incr.stabilise();

    v.set(2);
    incr.stabilise();
    let obs = frozen.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);
    assert!(frozen.is_const());
    // once frozen, the input is released
    assert!(!v.watch().is_necessary());
    incr.invariant();
}

#[test]
fn freeze_when_waits_for_the_predicate() {
    let incr = IncrState::new();
    let v = incr.var(1);
    let frozen = v.watch().freeze_when(|x| *x >= 3);
    let obs = frozen.observe();
    incr.stabilise();
    assert_eq!(obs.value(), 1);
    assert!(!frozen.is_const());

    v.set(2);
    incr.stabilise();
    assert_eq!(obs.value(), 2);

    v.set(3);
    incr.stabilise();
    assert_eq!(obs.value(), 3);
    assert!(frozen.is_const());

    v.set(4);
    incr.stabilise();
    assert_eq!(obs.value(), 3);
    incr.invariant();
}
