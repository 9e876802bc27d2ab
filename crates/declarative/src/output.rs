//! Asynchronously resolved values
//!
//! An [`Output`] is a single-assignment cell that is settled exactly once,
//! either with a value or with an [`OutputError`]. Derived outputs are built
//! with [`Output::map`], [`Output::combine`] and [`Output::all`]; their
//! continuations run when the source settles, or immediately if it already
//! has. Every output remembers which resources it was derived from, which is
//! how the stack infers dependency edges.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// Errors
// ============================================================================

/// Why an output has no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    /// Upstream materialization failed
    Failed {
        cause: String,
        /// Resources the failure travelled through, origin first
        chain: Vec<String>,
    },
    /// The value only exists after apply (preview only)
    Unknown,
}

impl OutputError {
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed {
            cause: cause.into(),
            chain: Vec::new(),
        }
    }

    /// Record that the failure reached `node`.
    pub fn within(self, node: &str) -> Self {
        match self {
            Self::Failed { cause, mut chain } => {
                if chain.last().is_none_or(|last| last != node) {
                    chain.push(node.to_string());
                }
                Self::Failed { cause, chain }
            }
            Self::Unknown => Self::Unknown,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { cause, chain } if chain.is_empty() => write!(f, "{cause}"),
            Self::Failed { cause, chain } => write!(f, "{cause} (via {})", chain.join(" -> ")),
            Self::Unknown => write!(f, "value is not known until apply"),
        }
    }
}

impl std::error::Error for OutputError {}

// ============================================================================
// Shared Cell
// ============================================================================

type Settled<T> = Result<T, OutputError>;
type Continuation<T> = Box<dyn FnOnce(&Settled<T>) + Send>;

enum Slot<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Settled<T>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    settled: watch::Sender<bool>,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            slot: Mutex::new(Slot::Pending(Vec::new())),
            settled,
        }
    }

    fn settle(&self, result: Settled<T>) -> bool {
        let waiting = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Settled(_) => return false,
                Slot::Pending(waiting) => {
                    let waiting = std::mem::take(waiting);
                    *slot = Slot::Settled(result.clone());
                    waiting
                }
            }
        };
        self.settled.send_replace(true);
        // Continuations may settle other outputs, so they run unlocked
        for continuation in waiting {
            continuation(&result);
        }
        true
    }

    fn on_settle(&self, continuation: Continuation<T>) {
        let settled = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Pending(waiting) => {
                    waiting.push(continuation);
                    return;
                }
                Slot::Settled(result) => result.clone(),
            }
        };
        continuation(&settled);
    }

    fn peek(&self) -> Option<Settled<T>> {
        match &*self.slot.lock() {
            Slot::Pending(_) => None,
            Slot::Settled(result) => Some(result.clone()),
        }
    }
}

// ============================================================================
// Output
// ============================================================================

/// A value that becomes available once the resources it derives from exist.
pub struct Output<T> {
    shared: Arc<Shared<T>>,
    deps: BTreeSet<String>,
    secret: bool,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            deps: self.deps.clone(),
            secret: self.secret,
        }
    }
}

/// Write half of a pending [`Output`].
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.shared.settle(Ok(value))
    }

    /// Settle with an error. Returns `false` if already settled.
    pub fn fail(&self, error: OutputError) -> bool {
        self.shared.settle(Err(error))
    }
}

impl<T: Clone + Send + 'static> Output<T> {
    /// A pending output derived from the given resources, plus its writer.
    pub fn pending<I, S>(deps: I) -> (Self, Resolver<T>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::pending_with(deps.into_iter().map(Into::into).collect(), false)
    }

    fn pending_with(deps: BTreeSet<String>, secret: bool) -> (Self, Resolver<T>) {
        let shared = Arc::new(Shared::new());
        let resolver = Resolver {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                deps,
                secret,
            },
            resolver,
        )
    }

    /// An output that is already known and depends on nothing.
    pub fn resolved(value: T) -> Self {
        let (output, resolver) = Self::pending_with(BTreeSet::new(), false);
        resolver.resolve(value);
        output
    }

    /// An output that has already failed.
    pub fn failed(error: OutputError) -> Self {
        let (output, resolver) = Self::pending_with(BTreeSet::new(), false);
        resolver.fail(error);
        output
    }

    /// Names of the resources this value derives from.
    pub fn deps(&self) -> &BTreeSet<String> {
        &self.deps
    }

    pub fn is_secret(&self) -> bool {
        self.secret
    }

    /// Mark this value as sensitive. Derived outputs inherit the flag.
    pub fn into_secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// The settled result, if any, without waiting.
    pub fn try_get(&self) -> Option<Result<T, OutputError>> {
        self.shared.peek()
    }

    /// Wait until the output settles. Repeated calls return the cached result.
    pub async fn resolve(&self) -> Result<T, OutputError> {
        let mut settled = self.shared.settled.subscribe();
        if settled.wait_for(|done| *done).await.is_err() {
            return Err(OutputError::failed("output was dropped before settling"));
        }
        self.shared
            .peek()
            .unwrap_or_else(|| Err(OutputError::failed("output settled without a value")))
    }

    /// Transform the value once it resolves. `f` never runs if the source fails.
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (output, resolver) = Output::pending_with(self.deps.clone(), self.secret);
        self.shared.on_settle(Box::new(move |result| match result {
            Ok(value) => {
                resolver.resolve(f(value.clone()));
            }
            Err(err) => {
                resolver.fail(err.clone());
            }
        }));
        output
    }

    /// Like [`map`](Self::map), for transformations that can reject the value.
    pub fn try_map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, String> + Send + 'static,
    {
        let (output, resolver) = Output::pending_with(self.deps.clone(), self.secret);
        self.shared.on_settle(Box::new(move |result| match result {
            Ok(value) => match f(value.clone()) {
                Ok(mapped) => {
                    resolver.resolve(mapped);
                }
                Err(cause) => {
                    resolver.fail(OutputError::failed(cause));
                }
            },
            Err(err) => {
                resolver.fail(err.clone());
            }
        }));
        output
    }

    /// Pair this value with another. Fails with the first failure observed.
    pub fn combine<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + 'static,
    {
        let deps = self.deps.union(&other.deps).cloned().collect();
        let (output, resolver) = Output::pending_with(deps, self.secret || other.secret);

        let right = Arc::clone(&other.shared);
        let on_left = resolver.clone();
        self.shared.on_settle(Box::new(move |left| match left {
            Ok(a) => {
                let a = a.clone();
                right.on_settle(Box::new(move |r| match r {
                    Ok(b) => {
                        on_left.resolve((a, b.clone()));
                    }
                    Err(err) => {
                        on_left.fail(err.clone());
                    }
                }));
            }
            Err(err) => {
                on_left.fail(err.clone());
            }
        }));
        other.shared.on_settle(Box::new(move |r| {
            if let Err(err) = r {
                resolver.fail(err.clone());
            }
        }));
        output
    }

    /// Gather many outputs into one, preserving order.
    pub fn all(outputs: impl IntoIterator<Item = Output<T>>) -> Output<Vec<T>> {
        outputs
            .into_iter()
            .fold(Output::resolved(Vec::new()), |acc, next| {
                acc.combine(&next).map(|(mut values, value)| {
                    values.push(value);
                    values
                })
            })
    }

    /// Run an async transformation on the current tokio runtime.
    pub fn then_async<U, F, Fut>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, OutputError>> + Send + 'static,
    {
        let (output, resolver) = Output::pending_with(self.deps.clone(), self.secret);
        self.shared.on_settle(Box::new(move |result| match result {
            Ok(value) => {
                let value = value.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            match f(value).await {
                                Ok(mapped) => resolver.resolve(mapped),
                                Err(err) => resolver.fail(err),
                            }
                        });
                    }
                    Err(_) => {
                        resolver.fail(OutputError::failed("no async runtime to resolve value"));
                    }
                }
            }
            Err(err) => {
                resolver.fail(err.clone());
            }
        }));
        output
    }
}

impl<T: fmt::Debug> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Output");
        out.field("deps", &self.deps);
        if self.secret {
            out.field("value", &"[secret]");
        } else {
            match &*self.shared.slot.lock() {
                Slot::Pending(_) => out.field("value", &"<pending>"),
                Slot::Settled(Ok(value)) => out.field("value", value),
                Slot::Settled(Err(err)) => out.field("error", err),
            };
        }
        out.finish()
    }
}
