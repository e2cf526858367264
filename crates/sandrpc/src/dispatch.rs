//! # Action Dispatcher
//!
//! The interception layer. Wraps a [`Manager`] so that naming one of its declared
//! actions turns into an asynchronous round trip over the manager's channel:
//!
//! 1. a one-shot subscription is armed on `invoke-result:{id}`;
//! 2. `invoke` is published with `{id, action, arguments}`;
//! 3. the returned [`PendingCall`] completes when the correlated reply fires.
//!
//! Resolution order for a member name: a real member of the manager (answered
//! locally, no hop), then a declared action (remoted), otherwise undefined.
//!
//! ## Correlation
//!
//! Every call takes a fresh id from a process-wide counter, so concurrent calls to
//! the same action never share a reply subscription, and a late reply addressed to
//! a previous context generation cannot reach a newer call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::sync::oneshot;

use crate::channel::Channel;
use crate::channel::Subscription;
use crate::channel::lock;
use crate::envelope::INVOKE_EVENT;
use crate::envelope::InvokeReply;
use crate::envelope::RemoteError;
use crate::envelope::reply_event;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors of a local (non-remoted) member call.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberError {
    /// The manager has no member of that name.
    NotFound(String),
    /// Arguments did not match what the member expects.
    InvalidArguments(String),
    /// The member ran and failed.
    Failed(String),
}

impl fmt::Display for MemberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "Member '{}' not found", name),
            Self::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
            Self::Failed(msg) => write!(f, "Member failed: {}", msg),
        }
    }
}

impl std::error::Error for MemberError {}

/// Outcome of a remote call that did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// The other side reported a failure.
    Remote(RemoteError),
    /// The reply subscription was torn down (reset, channel replaced or closed).
    Abandoned,
    /// Rejected through the call's [`CancelHandle`].
    Cancelled,
    /// No reply within the caller's deadline.
    Timeout,
    /// The reply payload could not be decoded.
    Malformed(String),
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "Remote failure: {}", e),
            Self::Abandoned => write!(f, "Call abandoned before a reply arrived"),
            Self::Cancelled => write!(f, "Call cancelled"),
            Self::Timeout => write!(f, "Call timed out"),
            Self::Malformed(msg) => write!(f, "Malformed reply: {}", msg),
        }
    }
}

impl std::error::Error for InvokeError {}

/// Errors of [`ActionDispatcher::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Neither a member nor a declared action.
    Undefined(String),
    Member(MemberError),
    Invoke(InvokeError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined(name) => write!(f, "'{}' is undefined", name),
            Self::Member(e) => write!(f, "{}", e),
            Self::Invoke(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<MemberError> for CallError {
    fn from(e: MemberError) -> Self {
        Self::Member(e)
    }
}

impl From<InvokeError> for CallError {
    fn from(e: InvokeError) -> Self {
        Self::Invoke(e)
    }
}

/// A stateful capability unit owning exactly one channel.
pub trait Manager: Send + Sync + 'static {
    fn channel(&self) -> &Channel;

    /// Names that are remoted through `invoke`.
    fn actions(&self) -> &[&'static str];

    /// Whether `name` is a real member answered locally.
    fn has_member(&self, _name: &str) -> bool {
        false
    }

    fn call_member(&self, name: &str, _args: Vec<Value>) -> Result<Value, MemberError> {
        Err(MemberError::NotFound(name.to_string()))
    }
}

/// What a member name resolves to.
pub enum Member {
    /// A real member of the manager.
    Local(String),
    /// A declared action, forwarded over the channel.
    Action(RemoteAction),
}

/// Call-forwarding facade around a manager.
pub struct ActionDispatcher<M: Manager + ?Sized> {
    manager: Arc<M>,
}

impl<M: Manager + ?Sized> Clone for ActionDispatcher<M> {
    fn clone(&self) -> Self {
        Self { manager: self.manager.clone() }
    }
}

impl<M: Manager + ?Sized> ActionDispatcher<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    /// Resolves `name`: local member first, then declared action, else `None`.
    pub fn resolve(&self, name: &str) -> Option<Member> {
        if self.manager.has_member(name) {
            return Some(Member::Local(name.to_string()));
        }

        if self.manager.actions().iter().any(|action| *action == name) {
            return Some(Member::Action(RemoteAction {
                channel: self.manager.channel().clone(),
                action: name.to_string(),
            }));
        }

        None
    }

    /// Resolves and runs `name` with `args`, awaiting the reply of remoted actions.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        match self.resolve(name) {
            Some(Member::Local(member)) => Ok(self.manager.call_member(&member, args)?),
            Some(Member::Action(action)) => Ok(action.invoke(args).await?),
            None => Err(CallError::Undefined(name.to_string())),
        }
    }
}

/// A declared action bound to its manager's channel.
#[derive(Clone, Debug)]
pub struct RemoteAction {
    channel: Channel,
    action: String,
}

impl RemoteAction {
    pub fn new(channel: Channel, action: impl Into<String>) -> Self {
        Self { channel, action: action.into() }
    }

    pub fn name(&self) -> &str {
        &self.action
    }

    /// Starts the round trip. The reply subscription is armed before `invoke` is
    /// published, so a synchronous responder cannot outrun it.
    pub fn invoke(&self, arguments: Vec<Value>) -> PendingCall {
        let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));

        let subscription = self.channel.subscribe_once(reply_event(id), move |payload| {
            if let Some(tx) = lock(&slot).take() {
                let _ = tx.send(payload.clone());
            }
        });

        let payload = json!({
            "id": id,
            "action": self.action,
            "arguments": arguments,
        });

        tracing::debug!(channel = %self.channel.key(), action = %self.action, id, "invoke");
        self.channel.publish(INVOKE_EVENT, payload);

        PendingCall {
            id,
            action: self.action.clone(),
            arguments,
            reply: rx,
            cancel: None,
            subscription: Some(subscription),
        }
    }
}

/// An in-flight remote call.
///
/// Resolves with the reply value, or an [`InvokeError`]. Without a cancel handle or
/// a timeout it may stay pending forever, for example if the other side never
/// answers. Dropping the call withdraws its reply subscription.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    action: String,
    arguments: Vec<Value>,
    reply: oneshot::Receiver<Value>,
    cancel: Option<oneshot::Receiver<()>>,
    subscription: Option<Subscription>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Returns a handle that rejects this call with [`InvokeError::Cancelled`].
    pub fn cancel_handle(&mut self) -> CancelHandle {
        let (tx, rx) = oneshot::channel();
        self.cancel = Some(rx);
        CancelHandle { tx }
    }

    /// Awaits the reply for at most `duration`.
    pub async fn timeout(self, duration: Duration) -> Result<Value, InvokeError> {
        match tokio::time::timeout(duration, self).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout),
        }
    }

    fn decode(id: u64, payload: Value) -> Result<Value, InvokeError> {
        let reply: InvokeReply = serde_json::from_value(payload)
            .map_err(|e| InvokeError::Malformed(e.to_string()))?;

        if reply.id != id {
            return Err(InvokeError::Malformed(format!(
                "Correlation mismatch: expected {}, received {}",
                id, reply.id
            )));
        }

        reply.into_result().map_err(InvokeError::Remote)
    }
}

impl Future for PendingCall {
    type Output = Result<Value, InvokeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(cancel) = self.cancel.as_mut() {
            match Pin::new(cancel).poll(cx) {
                Poll::Ready(Ok(())) => return Poll::Ready(Err(InvokeError::Cancelled)),
                // handle dropped without cancelling
                Poll::Ready(Err(_)) => self.cancel = None,
                Poll::Pending => {}
            }
        }

        let id = self.id;
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(payload)) => Poll::Ready(Self::decode(id, payload)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(InvokeError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// Externally rejects a [`PendingCall`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {
        let _ = self.tx.send(());
    }
}
