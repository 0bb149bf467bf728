//! The asynchronous computation primitive underlying the activity combinators.
//!
//! An [`Atom`] wraps a unit of asynchronous work that can be charged (executed)
//! with an optional untyped input and produces a typed output. Atoms compose
//! through [`bind`](Atom::bind), the universal composition law: run the source,
//! feed its result to a selector producing the next atom, run that, and project
//! both results into a final value. [`then`](Atom::then) and [`map`](Atom::map)
//! are specializations of `bind`.
//!
//! Composition is associative and executes components in left-to-right
//! dependency order exactly once each; the first failure aborts the whole
//! chain and surfaces to the caller.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

/// Failure raised while charging an atom.
#[derive(Debug, Error, Diagnostic)]
pub enum AtomError {
    /// The wrapped work raised an error.
    #[error("atom raised: {message}")]
    #[diagnostic(code(duraflow::atom::raised))]
    Raised { message: String },

    /// JSON conversion of an input or output failed.
    #[error(transparent)]
    #[diagnostic(code(duraflow::atom::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl AtomError {
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised {
            message: message.into(),
        }
    }
}

type ChargeFn<T> =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<T, AtomError>> + Send + Sync>;

/// A composable asynchronous computation producing a `T`.
///
/// Atoms are cheaply clonable handles; charging the same atom twice executes
/// the wrapped work twice.
pub struct Atom<T> {
    charge: ChargeFn<T>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            charge: Arc::clone(&self.charge),
        }
    }
}

impl<T: Send + 'static> Atom<T> {
    /// Wrap an asynchronous closure that ignores the charge input.
    ///
    /// Synchronous work wraps the same way by returning a ready future, so
    /// both compose uniformly.
    pub fn of<F, Fut>(work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AtomError>> + Send + 'static,
    {
        Self {
            charge: Arc::new(move |_input| Box::pin(work())),
        }
    }

    /// Wrap an asynchronous closure that consumes the optional charge input.
    pub fn from_input<F, Fut>(work: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AtomError>> + Send + 'static,
    {
        Self {
            charge: Arc::new(move |input| Box::pin(work(input))),
        }
    }

    /// An atom that resolves immediately to a fixed value.
    pub fn value(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::of(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Execute this atom with no input.
    pub async fn charge(&self) -> Result<T, AtomError> {
        (self.charge)(None).await
    }

    /// Execute this atom with an explicit input payload.
    pub async fn charge_with(&self, input: Option<Value>) -> Result<T, AtomError> {
        (self.charge)(input).await
    }

    /// The universal composition law.
    ///
    /// Charges `self`, passes its result to `selector` to obtain a second
    /// atom, charges that, and combines both results with `projector`.
    /// A failure in either step aborts the bound computation.
    pub fn bind<U, V, S, P>(self, selector: S, projector: P) -> Atom<V>
    where
        U: Send + 'static,
        V: Send + 'static,
        S: Fn(&T) -> Atom<U> + Send + Sync + 'static,
        P: Fn(T, U) -> V + Send + Sync + 'static,
    {
        let selector = Arc::new(selector);
        let projector = Arc::new(projector);
        let source = self.charge;
        Atom {
            charge: Arc::new(move |input| {
                let source = Arc::clone(&source);
                let selector = Arc::clone(&selector);
                let projector = Arc::clone(&projector);
                Box::pin(async move {
                    let first = source(input).await?;
                    let second = selector(&first).charge().await?;
                    Ok(projector(first, second))
                })
            }),
        }
    }

    /// Sequence another atom after this one, discarding this atom's result.
    pub fn then<U>(self, next: Atom<U>) -> Atom<U>
    where
        U: Send + 'static,
    {
        self.bind(move |_| next.clone(), |_, second| second)
    }

    /// Transform this atom's result.
    pub fn map<U, F>(self, f: F) -> Atom<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let unit = Atom::of(|| async { Ok(()) });
        self.bind(move |_| unit.clone(), move |first, ()| f(first))
    }
}
