//! Combinators building derived flows from a single flow.

use crate::derived::Derived;
use crate::flow::{Flow, FlowValue};

/// Extension methods available on every [`Flow`].
pub trait FlowExt: Flow {
    /// Derive a flow by applying `f` to every value.
    ///
    /// Errors of `self` pass through unchanged.
    ///
    /// ```
    /// use reflow::{Flow, FlowExt, Source};
    ///
    /// let celsius = Source::new(20.0);
    /// let fahrenheit = celsius.map(|c| c * 9.0 / 5.0 + 32.0);
    /// assert_eq!(fahrenheit.snapshot().unwrap(), 68.0);
    /// ```
    fn map<U, F>(&self, f: F) -> Derived<U>
    where
        U: FlowValue,
        F: Fn(Self::Output) -> U + Send + Sync + 'static,
    {
        let flow = self.clone();
        Derived::new(move |ctx| Ok(f(ctx.get(&flow)?)))
    }

    /// Derive a flow holding the values accepted by `predicate`.
    ///
    /// A rejected value keeps the previously accepted one. If no value was
    /// accepted yet, the flow fails with `FlowError::Cancelled`.
    ///
    /// ```
    /// use reflow::{Flow, FlowExt, Source};
    ///
    /// let input = Source::new(2);
    /// let even = input.filter(|n| n % 2 == 0);
    /// assert_eq!(even.snapshot().unwrap(), 2);
    /// input.emit(3).unwrap();
    /// assert_eq!(even.snapshot().unwrap(), 2);
    /// ```
    fn filter<P>(&self, predicate: P) -> Derived<Self::Output>
    where
        P: Fn(&Self::Output) -> bool + Send + Sync + 'static,
    {
        let flow = self.clone();
        Derived::new(move |ctx| {
            let value = ctx.get(&flow)?;
            if predicate(&value) {
                Ok(value)
            } else {
                ctx.skip()
            }
        })
    }
}

impl<F: Flow> FlowExt for F {}
