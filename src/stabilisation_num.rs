/// The index of a stabilisation pass. `-1` is the "never" sentinel, used for
/// nodes that have not yet been recomputed (or changed).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct StabilisationNum(pub i32);

impl StabilisationNum {
    pub const NEVER: Self = Self(-1);

    pub fn init() -> Self {
        Self::NEVER
    }

    pub fn add1(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_never(&self) -> bool {
        *self == Self::NEVER
    }
}
