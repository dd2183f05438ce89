//! Hierarchical, one-shot cancellation.
//!
//! Each [Scope] is a handle to a node in a cancellation tree. Cancelling a node resolves its
//! [Done] signal and cancels every live descendant with the same [Cause]. Cancellation never flows
//! upward: a child can be cancelled without affecting its parent or siblings.
//!
//! # Example
//!
//! ```rust
//! use commonware_conn::{Cause, Scope};
//!
//! let listener = Scope::root();
//! let connection = listener.child();
//!
//! // Cancelling the parent cancels the child exactly once
//! assert!(listener.cancel(Cause::Cancelled));
//! assert!(!listener.cancel(Cause::Closed));
//! assert_eq!(connection.cause(), Some(Cause::Cancelled));
//! ```

use futures::{
    channel::oneshot,
    future::{FutureExt as _, Shared},
};
use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll},
};

/// Why a [Scope] was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The owner of the scope (or of one of its ancestors) cancelled it.
    Cancelled,
    /// The connection bound to the scope was closed explicitly.
    Closed,
    /// The underlying transport failed.
    Transport,
    /// The remote peer failed to prove its identity.
    Authentication,
    /// The handshake exchange was malformed or inconsistent.
    Handshake,
    /// A message failed integrity verification after the handshake.
    Integrity,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cause::Cancelled => "cancelled",
            Cause::Closed => "closed",
            Cause::Transport => "transport",
            Cause::Authentication => "authentication",
            Cause::Handshake => "handshake",
            Cause::Integrity => "integrity",
        };
        f.write_str(s)
    }
}

struct Inner {
    cause: Option<Cause>,
    children: Vec<Weak<Node>>,
    signaler: Option<oneshot::Sender<()>>,
}

impl Inner {
    fn register_child(&mut self, child: &Arc<Node>) {
        // Reap dropped children so long-lived parents do not grow without bound.
        self.children.retain(|weak| weak.strong_count() > 0);
        self.children.push(Arc::downgrade(child));
    }

    /// Transition to cancelled, returning what must be notified outside of the lock.
    fn capture(&mut self, cause: Cause) -> Option<(oneshot::Sender<()>, Vec<Weak<Node>>)> {
        if self.cause.is_some() {
            return None;
        }
        self.cause = Some(cause);
        let signaler = self.signaler.take()?;
        Some((signaler, mem::take(&mut self.children)))
    }
}

struct Node {
    parent: Option<Weak<Node>>,
    cancelled: AtomicBool,
    inner: Mutex<Inner>,
    signal: Shared<oneshot::Receiver<()>>,
}

impl Node {
    fn new(parent: Option<Weak<Node>>) -> Arc<Self> {
        let (signaler, signal) = oneshot::channel();
        Arc::new(Self {
            parent,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                cause: None,
                children: Vec::new(),
                signaler: Some(signaler),
            }),
            signal: signal.shared(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave `Inner` half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel(&self, cause: Cause) -> bool {
        let captured = {
            let mut inner = self.lock();
            let captured = inner.capture(cause);
            if captured.is_some() {
                self.cancelled.store(true, Ordering::Release);
            }
            captured
        };
        let Some((signaler, children)) = captured else {
            return false;
        };
        let _ = signaler.send(());

        // Children were drained, so the subtree cannot be cancelled twice.
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(cause);
            }
        }
        true
    }

    fn reap(&self) {
        self.lock().children.retain(|weak| weak.strong_count() > 0);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.reap();
        }
    }
}

/// A handle to a node in a cancellation tree.
///
/// Cloning a [Scope] returns another handle to the same node. Use [Scope::child] to derive a
/// node that is cancelled whenever this one is.
#[derive(Clone)]
pub struct Scope {
    node: Arc<Node>,
}

impl Scope {
    /// Create a scope without a parent.
    pub fn root() -> Self {
        Self {
            node: Node::new(None),
        }
    }

    /// Create a scope that is cancelled (with the same cause) when `self` is cancelled.
    ///
    /// If `self` is already cancelled, the child is returned already cancelled.
    pub fn child(&self) -> Self {
        let child = Node::new(Some(Arc::downgrade(&self.node)));
        let inherited = {
            let mut inner = self.node.lock();
            if inner.cause.is_none() {
                inner.register_child(&child);
            }
            inner.cause
        };
        if let Some(cause) = inherited {
            child.cancel(cause);
        }
        Self { node: child }
    }

    /// Cancel the scope and all of its descendants.
    ///
    /// Returns `true` if this call performed the cancellation and `false` if the scope was
    /// already cancelled (in which case the original cause is kept).
    pub fn cancel(&self, cause: Cause) -> bool {
        self.node.cancel(cause)
    }

    /// Returns `true` once the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// The cause of the cancellation, if the scope has been cancelled.
    pub fn cause(&self) -> Option<Cause> {
        self.node.lock().cause
    }

    /// A future that resolves once the scope is cancelled.
    pub fn done(&self) -> Done {
        Done {
            signal: self.node.signal.clone(),
            _node: self.node.clone(),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cause", &self.cause())
            .finish()
    }
}

/// Resolves once the [Scope] it was created from is cancelled.
///
/// Holding a [Done] keeps its node alive, so it only ever resolves because of a cancellation.
#[derive(Clone)]
pub struct Done {
    signal: Shared<oneshot::Receiver<()>>,
    _node: Arc<Node>,
}

impl Future for Done {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.signal).poll(cx).map(|_| ())
    }
}
