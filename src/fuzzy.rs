use std::fmt::{self, Display, Formatter};
use std::ops;

/// Four-state boolean for predicates evaluated outside a lock.
///
/// `True` and `False` are stable answers: the observing thread is the only
/// one which could change them. `WasTrue` and `WasFalse` record what the
/// predicate returned at the moment it was computed, while another thread
/// may have changed it since. Callers which act on a `Was*` value commit to
/// re-evaluating the predicate inside the relevant critical section.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Fuzzy {
    False,
    WasFalse,
    WasTrue,
    True,
}

impl Fuzzy {
    /// Stable-or-momentary constructor for a value read from shared state.
    pub fn momentary(value: bool) -> Fuzzy {
        if value {
            Fuzzy::WasTrue
        } else {
            Fuzzy::WasFalse
        }
    }

    pub fn is_true(self) -> bool { self == Fuzzy::True }
    pub fn is_false(self) -> bool { self == Fuzzy::False }
    pub fn is_momentary_true(self) -> bool { matches!(self, Fuzzy::True | Fuzzy::WasTrue) }
    pub fn is_momentary_false(self) -> bool { matches!(self, Fuzzy::False | Fuzzy::WasFalse) }
    pub fn is_transitory_true(self) -> bool { self == Fuzzy::WasTrue }
    pub fn is_transitory_false(self) -> bool { self == Fuzzy::WasFalse }
}

impl From<bool> for Fuzzy {
    fn from(value: bool) -> Self {
        if value {
            Fuzzy::True
        } else {
            Fuzzy::False
        }
    }
}

impl ops::Not for Fuzzy {
    type Output = Fuzzy;

    fn not(self) -> Fuzzy {
        match self {
            Fuzzy::False => Fuzzy::True,
            Fuzzy::WasFalse => Fuzzy::WasTrue,
            Fuzzy::WasTrue => Fuzzy::WasFalse,
            Fuzzy::True => Fuzzy::False,
        }
    }
}

impl Display for Fuzzy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Fuzzy::False => f.write_str("false"),
            Fuzzy::WasFalse => f.write_str("was-false"),
            Fuzzy::WasTrue => f.write_str("was-true"),
            Fuzzy::True => f.write_str("true"),
        }
    }
}

/// A predicate paired with the value it had when the caller computed it.
///
/// The cached value expresses the caller's optimistic view; the closure is
/// re-invoked under the device state lock to linearize the decision.
pub struct FuzzyCondition {
    compute: Box<dyn Fn() -> Fuzzy + Send>,
    cached: Fuzzy,
}

impl FuzzyCondition {
    pub fn new(compute: impl Fn() -> Fuzzy + Send + 'static) -> FuzzyCondition {
        let cached = compute();
        FuzzyCondition {
            compute: Box::new(compute),
            cached,
        }
    }

    /// The value observed when the condition was constructed.
    pub fn cached(&self) -> Fuzzy { self.cached }

    /// Re-evaluate the predicate; called with the state lock held.
    pub fn recompute(&self) -> Fuzzy { (self.compute)() }
}

impl Display for FuzzyCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(&self.cached, f) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn fuzzy_classes() {
        assert!(Fuzzy::True.is_momentary_true());
        assert!(Fuzzy::WasTrue.is_momentary_true());
        assert!(Fuzzy::WasTrue.is_transitory_true());
        assert!(!Fuzzy::True.is_transitory_true());
        assert!(Fuzzy::WasFalse.is_momentary_false());
        assert_eq!(!Fuzzy::WasTrue, Fuzzy::WasFalse);
        assert_eq!(Fuzzy::from(true), Fuzzy::True);
        assert_eq!(Fuzzy::momentary(false), Fuzzy::WasFalse);
    }

    #[test]
    fn condition_recomputes() {
        let flag = Arc::new(AtomicBool::new(true));
        let probe = flag.clone();
        let cond = FuzzyCondition::new(move || Fuzzy::momentary(probe.load(Ordering::Relaxed)));
        assert_eq!(cond.cached(), Fuzzy::WasTrue);
        flag.store(false, Ordering::Relaxed);
        assert_eq!(cond.cached(), Fuzzy::WasTrue, "cached value must not change");
        assert_eq!(cond.recompute(), Fuzzy::WasFalse);
    }
}
