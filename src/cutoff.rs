/// Decides whether a freshly computed value should be treated as equal to the
/// previous one, suppressing propagation to parent nodes.
///
/// The default for every node is [Cutoff::PartialEq].
#[derive(Clone)]
#[non_exhaustive]
pub enum Cutoff<T: ?Sized> {
    /// Always cut off: parents never see changes from this node.
    Always,
    /// Never cut off: every recomputation counts as a change.
    Never,
    /// Cut off when the old and new values compare equal.
    PartialEq,
    /// A plain function pointer comparator returning "should cut off".
    Fn(fn(&T, &T) -> bool),
    /// A boxed closure comparator, for comparators that capture state.
    FnBoxed(Box<dyn CutoffClosure<T>>),
}

pub trait CutoffClosure<T: ?Sized>: FnMut(&T, &T) -> bool {
    fn clone_box(&self) -> Box<dyn CutoffClosure<T>>;
}

impl<T: ?Sized, F> CutoffClosure<T> for F
where
    F: FnMut(&T, &T) -> bool + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn CutoffClosure<T>> {
        Box::new(self.clone())
    }
}

impl<T> Clone for Box<dyn CutoffClosure<T>> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl<T: ?Sized> Cutoff<T>
where
    T: PartialEq,
{
    pub fn should_cutoff(&mut self, a: &T, b: &T) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::PartialEq => a.eq(b),
            Self::Fn(comparator) => comparator(a, b),
            Self::FnBoxed(comparator) => comparator(a, b),
        }
    }
}

impl<T> std::fmt::Debug for Cutoff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Always => "Always",
            Self::Never => "Never",
            Self::PartialEq => "PartialEq",
            Self::Fn(_) => "Fn",
            Self::FnBoxed(_) => "FnBoxed",
        };
        write!(f, "Cutoff::{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::Cutoff;

    #[test]
    fn partial_eq_is_the_default_meaning() {
        let mut c = Cutoff::<i32>::PartialEq;
        assert!(c.should_cutoff(&1, &1));
        assert!(!c.should_cutoff(&1, &2));
    }

    #[test]
    fn closures_can_capture() {
        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let count_ = count.clone();
        let mut c = Cutoff::FnBoxed(Box::new(move |a: &i32, b: &i32| {
            count_.set(count_.get() + 1);
            a == b
        }));
        assert!(c.should_cutoff(&3, &3));
        assert!(!c.should_cutoff(&3, &4));
        assert_eq!(count.get(), 2);
    }
}
